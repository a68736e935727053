//! Builders for each group of resources in the deployment template.

use super::{get_att, ref_, sub, DeploymentParams, Output, Resource, Template};
use serde_json::{json, Value};

pub const VPC_CIDR: &str = "10.0.0.0/22";
const PUBLIC_SUBNETS: [&str; 2] = ["10.0.0.0/24", "10.0.1.0/24"];
const PRIVATE_SUBNETS: [&str; 2] = ["10.0.2.0/24", "10.0.3.0/24"];
const LOG_RETENTION_DAYS: u32 = 7;
const TASK_CPU: &str = "256";
const TASK_MEMORY_MIB: &str = "512";
const CONTAINER_NAME: &str = "ECSContainer";

fn az(index: usize) -> Value {
    json!({ "Fn::Select": [index, { "Fn::GetAZs": "" }] })
}

fn tags(name: &str) -> Value {
    json!([{ "Key": "Name", "Value": name }])
}

/// VPC with one public and one private /24 per AZ and a single NAT gateway.
pub fn add_network(template: &mut Template, params: &DeploymentParams) {
    let id = &params.construct_id;
    template.add(
        "Vpc",
        Resource::new(
            "AWS::EC2::VPC",
            json!({
                "CidrBlock": VPC_CIDR,
                "EnableDnsHostnames": true,
                "EnableDnsSupport": true,
                "Tags": tags(&format!("{id}VPC")),
            }),
        ),
    );
    template.add(
        "InternetGateway",
        Resource::new("AWS::EC2::InternetGateway", json!({ "Tags": tags(&format!("{id}IGW")) })),
    );
    template.add(
        "VpcGatewayAttachment",
        Resource::new(
            "AWS::EC2::VPCGatewayAttachment",
            json!({ "VpcId": ref_("Vpc"), "InternetGatewayId": ref_("InternetGateway") }),
        ),
    );

    template.add(
        "PublicRouteTable",
        Resource::new("AWS::EC2::RouteTable", json!({ "VpcId": ref_("Vpc") })),
    );
    template.add(
        "PublicDefaultRoute",
        Resource::new(
            "AWS::EC2::Route",
            json!({
                "RouteTableId": ref_("PublicRouteTable"),
                "DestinationCidrBlock": "0.0.0.0/0",
                "GatewayId": ref_("InternetGateway"),
            }),
        )
        .depends_on("VpcGatewayAttachment"),
    );

    for (i, cidr) in PUBLIC_SUBNETS.iter().enumerate() {
        let subnet = format!("PublicSubnet{}", i + 1);
        template.add(
            &subnet,
            Resource::new(
                "AWS::EC2::Subnet",
                json!({
                    "VpcId": ref_("Vpc"),
                    "CidrBlock": cidr,
                    "AvailabilityZone": az(i),
                    "MapPublicIpOnLaunch": true,
                    "Tags": tags(&format!("{id}/Public{}", i + 1)),
                }),
            ),
        );
        template.add(
            &format!("{subnet}RouteTableAssociation"),
            Resource::new(
                "AWS::EC2::SubnetRouteTableAssociation",
                json!({ "SubnetId": ref_(&subnet), "RouteTableId": ref_("PublicRouteTable") }),
            ),
        );
    }

    template.add("NatEip", Resource::new("AWS::EC2::EIP", json!({ "Domain": "vpc" })));
    template.add(
        "NatGateway",
        Resource::new(
            "AWS::EC2::NatGateway",
            json!({
                "AllocationId": get_att("NatEip", "AllocationId"),
                "SubnetId": ref_("PublicSubnet1"),
            }),
        )
        .depends_on("VpcGatewayAttachment"),
    );
    template.add(
        "PrivateRouteTable",
        Resource::new("AWS::EC2::RouteTable", json!({ "VpcId": ref_("Vpc") })),
    );
    template.add(
        "PrivateDefaultRoute",
        Resource::new(
            "AWS::EC2::Route",
            json!({
                "RouteTableId": ref_("PrivateRouteTable"),
                "DestinationCidrBlock": "0.0.0.0/0",
                "NatGatewayId": ref_("NatGateway"),
            }),
        ),
    );

    for (i, cidr) in PRIVATE_SUBNETS.iter().enumerate() {
        let subnet = format!("PrivateSubnet{}", i + 1);
        template.add(
            &subnet,
            Resource::new(
                "AWS::EC2::Subnet",
                json!({
                    "VpcId": ref_("Vpc"),
                    "CidrBlock": cidr,
                    "AvailabilityZone": az(i),
                    "MapPublicIpOnLaunch": false,
                    "Tags": tags(&format!("{id}/Private{}", i + 1)),
                }),
            ),
        );
        template.add(
            &format!("{subnet}RouteTableAssociation"),
            Resource::new(
                "AWS::EC2::SubnetRouteTableAssociation",
                json!({ "SubnetId": ref_(&subnet), "RouteTableId": ref_("PrivateRouteTable") }),
            ),
        );
    }

    template.output("VpcId", Output::new("VPC hosting the bot", ref_("Vpc")));
}

pub fn add_conversation_table(template: &mut Template, params: &DeploymentParams) {
    template.add(
        "ConversationTable",
        Resource::new(
            "AWS::DynamoDB::Table",
            json!({
                "TableName": params.table_name(),
                "AttributeDefinitions": [
                    { "AttributeName": "SessionId", "AttributeType": "S" }
                ],
                "KeySchema": [
                    { "AttributeName": "SessionId", "KeyType": "HASH" }
                ],
                "BillingMode": "PAY_PER_REQUEST",
                "SSESpecification": { "SSEEnabled": true },
                "PointInTimeRecoverySpecification": { "PointInTimeRecoveryEnabled": true },
                "StreamSpecification": { "StreamViewType": "NEW_IMAGE" },
            }),
        ),
    );
    template.output(
        "ConversationTableName",
        Output::new("Conversation history table", ref_("ConversationTable")),
    );
}

fn assume_role_policy(service: &str) -> Value {
    json!({
        "Version": "2012-10-17",
        "Statement": [{
            "Effect": "Allow",
            "Principal": { "Service": service },
            "Action": "sts:AssumeRole",
        }]
    })
}

fn secret_arn(params: &DeploymentParams) -> Value {
    sub(&format!(
        "arn:${{AWS::Partition}}:secretsmanager:{}:${{AWS::AccountId}}:secret:{}-*",
        params.secret_region_expr(),
        params.dingtalk_app_credential_secret_name
    ))
}

/// ECS cluster, Fargate task and service, plus the task role's grants.
pub fn add_service(template: &mut Template, params: &DeploymentParams) {
    let id = &params.construct_id;

    template.add(
        "EcsCluster",
        Resource::new(
            "AWS::ECS::Cluster",
            json!({
                "ClusterSettings": [{ "Name": "containerInsights", "Value": "enabled" }],
            }),
        ),
    );
    template.add(
        "TaskLogGroup",
        Resource::new(
            "AWS::Logs::LogGroup",
            json!({ "RetentionInDays": LOG_RETENTION_DAYS }),
        ),
    );
    template.add(
        "TaskExecutionRole",
        Resource::new(
            "AWS::IAM::Role",
            json!({
                "AssumeRolePolicyDocument": assume_role_policy("ecs-tasks.amazonaws.com"),
                "ManagedPolicyArns": [
                    sub("arn:${AWS::Partition}:iam::aws:policy/service-role/AmazonECSTaskExecutionRolePolicy")
                ],
            }),
        ),
    );
    template.add(
        "TaskRole",
        Resource::new(
            "AWS::IAM::Role",
            json!({ "AssumeRolePolicyDocument": assume_role_policy("ecs-tasks.amazonaws.com") }),
        ),
    );
    template.add(
        "TaskRolePolicy",
        Resource::new(
            "AWS::IAM::Policy",
            json!({
                "PolicyName": format!("{id}TaskRolePolicy"),
                "Roles": [ref_("TaskRole")],
                "PolicyDocument": {
                    "Version": "2012-10-17",
                    "Statement": [
                        {
                            "Effect": "Allow",
                            "Action": [
                                "bedrock:InvokeModel",
                                "bedrock:InvokeModelWithResponseStream"
                            ],
                            "Resource": [
                                sub("arn:${AWS::Partition}:bedrock:${AWS::Region}::foundation-model/*"),
                                sub("arn:${AWS::Partition}:bedrock:${AWS::Region}:${AWS::AccountId}:guardrail/*")
                            ],
                        },
                        {
                            "Effect": "Allow",
                            "Action": [
                                "dynamodb:Scan",
                                "dynamodb:Query",
                                "dynamodb:GetItem",
                                "dynamodb:PutItem",
                                "dynamodb:UpdateItem",
                                "dynamodb:DeleteItem",
                                "dynamodb:BatchWriteItem",
                                "dynamodb:BatchGetItem",
                                "dynamodb:DescribeTable",
                                "dynamodb:List*"
                            ],
                            "Resource": [get_att("ConversationTable", "Arn")],
                        },
                        {
                            "Effect": "Allow",
                            "Action": [
                                "secretsmanager:GetSecretValue",
                                "secretsmanager:DescribeSecret"
                            ],
                            "Resource": [secret_arn(params)],
                        }
                    ]
                },
            }),
        ),
    );

    let environment = json!([
        { "Name": "DINGTALK_SETTING", "Value": params.dingtalk_app_credential_secret_name },
        { "Name": "DINGTALK_SETTING_REGION", "Value": params.secret_region_value() },
        { "Name": "DDB_TABLE_NAME", "Value": ref_("ConversationTable") },
        { "Name": "BEDROCK_MODEL_ID", "Value": params.bedrock_model_id },
        {
            "Name": "INPUT_HISTORY_CONVERSATION_COUNT",
            "Value": params.input_history_conversation_count.to_string()
        },
    ]);
    template.add(
        "TaskDefinition",
        Resource::new(
            "AWS::ECS::TaskDefinition",
            json!({
                "RequiresCompatibilities": ["FARGATE"],
                "NetworkMode": "awsvpc",
                "Cpu": TASK_CPU,
                "Memory": TASK_MEMORY_MIB,
                "ExecutionRoleArn": get_att("TaskExecutionRole", "Arn"),
                "TaskRoleArn": get_att("TaskRole", "Arn"),
                "ContainerDefinitions": [{
                    "Name": CONTAINER_NAME,
                    "Image": ref_("ContainerImage"),
                    "Essential": true,
                    "Cpu": 256,
                    "Memory": 512,
                    "DockerLabels": { "docker_name": id },
                    "Environment": environment,
                    "LogConfiguration": {
                        "LogDriver": "awslogs",
                        "Options": {
                            "awslogs-group": ref_("TaskLogGroup"),
                            "awslogs-stream-prefix": "dingtalk_app",
                            "awslogs-region": ref_("AWS::Region"),
                        }
                    },
                }],
            }),
        ),
    );
    template.add(
        "ServiceSecurityGroup",
        Resource::new(
            "AWS::EC2::SecurityGroup",
            json!({
                "GroupDescription": format!("{id} service egress"),
                "VpcId": ref_("Vpc"),
                "SecurityGroupEgress": [{ "IpProtocol": "-1", "CidrIp": "0.0.0.0/0" }],
            }),
        ),
    );
    template.add(
        "FargateService",
        Resource::new(
            "AWS::ECS::Service",
            json!({
                "Cluster": ref_("EcsCluster"),
                "TaskDefinition": ref_("TaskDefinition"),
                "DesiredCount": 1,
                "CapacityProviderStrategy": [{ "CapacityProvider": "FARGATE", "Weight": 1 }],
                "DeploymentConfiguration": {
                    "DeploymentCircuitBreaker": { "Enable": true, "Rollback": true },
                    "MaximumPercent": 200,
                    "MinimumHealthyPercent": 50,
                },
                "NetworkConfiguration": {
                    "AwsvpcConfiguration": {
                        "AssignPublicIp": "DISABLED",
                        "Subnets": [ref_("PrivateSubnet1"), ref_("PrivateSubnet2")],
                        "SecurityGroups": [get_att("ServiceSecurityGroup", "GroupId")],
                    }
                },
            }),
        )
        .depends_on("TaskRolePolicy")
        .depends_on("PrivateDefaultRoute"),
    );

    template.output("ClusterName", Output::new("ECS cluster", ref_("EcsCluster")));
}

/// Account-wide Bedrock invocation logging targets.
pub fn add_bedrock_logging(template: &mut Template) {
    let source_conditions = json!({
        "StringEquals": { "aws:SourceAccount": ref_("AWS::AccountId") },
        "ArnLike": { "aws:SourceArn": sub("arn:aws:bedrock:${AWS::Region}:${AWS::AccountId}:*") },
    });

    template.add(
        "BedrockLogBucket",
        Resource::new(
            "AWS::S3::Bucket",
            json!({
                "BucketName": sub("amazon-bedrock-log-${AWS::AccountId}-${AWS::Region}"),
                "BucketEncryption": {
                    "ServerSideEncryptionConfiguration": [{
                        "ServerSideEncryptionByDefault": { "SSEAlgorithm": "AES256" }
                    }]
                },
                "PublicAccessBlockConfiguration": {
                    "BlockPublicAcls": true,
                    "BlockPublicPolicy": true,
                    "IgnorePublicAcls": true,
                    "RestrictPublicBuckets": true,
                },
                "LifecycleConfiguration": {
                    "Rules": [{ "Status": "Enabled", "ExpirationInDays": 7 }]
                },
            }),
        )
        .with_deletion_policy("Delete"),
    );
    template.add(
        "BedrockLogBucketPolicy",
        Resource::new(
            "AWS::S3::BucketPolicy",
            json!({
                "Bucket": ref_("BedrockLogBucket"),
                "PolicyDocument": {
                    "Version": "2012-10-17",
                    "Statement": [
                        {
                            "Sid": "AllowSSLRequestsOnly",
                            "Effect": "Deny",
                            "Principal": "*",
                            "Action": "s3:*",
                            "Condition": { "Bool": { "aws:SecureTransport": "false" } },
                            "Resource": [
                                get_att("BedrockLogBucket", "Arn"),
                                sub("${BedrockLogBucket.Arn}/*")
                            ],
                        },
                        {
                            "Sid": "bedrock_only",
                            "Effect": "Allow",
                            "Principal": { "Service": "bedrock.amazonaws.com" },
                            "Action": "s3:PutObject",
                            "Condition": source_conditions.clone(),
                            "Resource": sub("${BedrockLogBucket.Arn}/AWSLogs/${AWS::AccountId}/BedrockModelInvocationLogs/*"),
                        }
                    ]
                },
            }),
        ),
    );
    template.add(
        "BedrockLogGroup",
        Resource::new(
            "AWS::Logs::LogGroup",
            json!({ "LogGroupName": "/aws/bedrock", "RetentionInDays": LOG_RETENTION_DAYS }),
        )
        .with_deletion_policy("Delete"),
    );
    template.add(
        "BedrockLogRole",
        Resource::new(
            "AWS::IAM::Role",
            json!({
                "AssumeRolePolicyDocument": {
                    "Version": "2012-10-17",
                    "Statement": [{
                        "Effect": "Allow",
                        "Principal": { "Service": "bedrock.amazonaws.com" },
                        "Action": "sts:AssumeRole",
                        "Condition": source_conditions,
                    }]
                },
                "Policies": [{
                    "PolicyName": "bedrock-log-policy",
                    "PolicyDocument": {
                        "Version": "2012-10-17",
                        "Statement": [{
                            "Effect": "Allow",
                            "Action": ["logs:CreateLogStream", "logs:PutLogEvents"],
                            "Resource": sub("arn:aws:logs:${AWS::Region}:${AWS::AccountId}:log-group:/aws/bedrock:log-stream:aws/bedrock/modelinvocations"),
                        }]
                    },
                }],
            }),
        ),
    );

    template.output(
        "BucketOutput",
        Output::new("Bedrock Log Bucket", ref_("BedrockLogBucket")),
    );
    template.output(
        "LogGroupOutput",
        Output::new("Bedrock Log Group", ref_("BedrockLogGroup")),
    );
    template.output(
        "RoleArnOutput",
        Output::new("Bedrock Log Role ARN", get_att("BedrockLogRole", "Arn")),
    );
}
