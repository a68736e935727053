//! Deployment graph for the bot, rendered as a CloudFormation template.
//!
//! The graph is a VPC with public and private subnets, the conversation
//! table, an ECS Fargate service running the bot, and optionally the
//! account's Bedrock invocation logging targets.

pub mod resources;

use anyhow::Context;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::Path;

pub const DEFAULT_PARAMS_FILE: &str = "params-config.json";
const DEFAULT_CONTAINER_IMAGE: &str = "dingbot:latest";

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ProvisionError {
    #[error("construct_id must be non-empty and start with a letter, got {0:?}")]
    InvalidConstructId(String),
    #[error("input_history_conversation_count must be a positive integer")]
    InvalidHistoryCount,
    #[error("dingtalk_app_credential_secret_name is empty")]
    MissingSecretName,
    #[error("bedrock_model_id {0} is not supported")]
    UnsupportedModel(String),
}

/// Contents of `params-config.json`.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct DeploymentParams {
    pub construct_id: String,
    pub dingtalk_app_credential_secret_name: String,
    pub bedrock_model_id: String,
    #[serde(deserialize_with = "count_from_string_or_number")]
    pub input_history_conversation_count: u32,
    #[serde(default)]
    pub enable_bedrock_log: bool,
    /// Region the DingTalk secret lives in. Defaults to the stack's region.
    #[serde(default)]
    pub region: Option<String>,
}

fn count_from_string_or_number<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(i64),
        Text(String),
    }

    let value = match Raw::deserialize(deserializer)? {
        Raw::Number(n) => n,
        Raw::Text(s) => s.trim().parse::<i64>().map_err(serde::de::Error::custom)?,
    };
    // Zero and negatives are rejected by validate() with a clearer message.
    Ok(u32::try_from(value).unwrap_or(0))
}

impl DeploymentParams {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let params: Self = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        params.validate()?;
        Ok(params)
    }

    pub fn validate(&self) -> Result<(), ProvisionError> {
        let id = self.construct_id.trim();
        let valid_id = id.chars().next().is_some_and(|c| c.is_ascii_alphabetic())
            && id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid_id {
            return Err(ProvisionError::InvalidConstructId(self.construct_id.clone()));
        }
        if self.input_history_conversation_count == 0 {
            return Err(ProvisionError::InvalidHistoryCount);
        }
        if self.dingtalk_app_credential_secret_name.trim().is_empty() {
            return Err(ProvisionError::MissingSecretName);
        }
        if crate::model::model_family(&self.bedrock_model_id).is_none() {
            return Err(ProvisionError::UnsupportedModel(self.bedrock_model_id.clone()));
        }
        Ok(())
    }

    pub fn table_name(&self) -> String {
        format!("{}_conversation_table", self.construct_id)
    }

    fn secret_region_value(&self) -> Value {
        match &self.region {
            Some(region) => Value::String(region.clone()),
            None => ref_("AWS::Region"),
        }
    }

    /// Region as it appears inside an `Fn::Sub` string.
    fn secret_region_expr(&self) -> String {
        self.region
            .clone()
            .unwrap_or_else(|| "${AWS::Region}".to_string())
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Resource {
    #[serde(rename = "Type")]
    pub kind: String,
    #[serde(rename = "Properties")]
    pub properties: Value,
    #[serde(rename = "DependsOn", skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    #[serde(rename = "DeletionPolicy", skip_serializing_if = "Option::is_none")]
    pub deletion_policy: Option<String>,
}

impl Resource {
    pub fn new(kind: &str, properties: Value) -> Self {
        Self {
            kind: kind.to_string(),
            properties,
            depends_on: Vec::new(),
            deletion_policy: None,
        }
    }

    pub fn depends_on(mut self, logical_id: &str) -> Self {
        self.depends_on.push(logical_id.to_string());
        self
    }

    pub fn with_deletion_policy(mut self, policy: &str) -> Self {
        self.deletion_policy = Some(policy.to_string());
        self
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Output {
    #[serde(rename = "Description")]
    pub description: String,
    #[serde(rename = "Value")]
    pub value: Value,
}

impl Output {
    pub fn new(description: &str, value: Value) -> Self {
        Self {
            description: description.to_string(),
            value,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Template {
    #[serde(rename = "AWSTemplateFormatVersion")]
    pub format_version: String,
    #[serde(rename = "Description")]
    pub description: String,
    #[serde(rename = "Parameters")]
    pub parameters: BTreeMap<String, Value>,
    #[serde(rename = "Resources")]
    pub resources: BTreeMap<String, Resource>,
    #[serde(rename = "Outputs")]
    pub outputs: BTreeMap<String, Output>,
}

impl Template {
    fn new(description: String) -> Self {
        Self {
            format_version: "2010-09-09".into(),
            description,
            parameters: BTreeMap::new(),
            resources: BTreeMap::new(),
            outputs: BTreeMap::new(),
        }
    }

    pub fn add(&mut self, logical_id: &str, resource: Resource) {
        self.resources.insert(logical_id.to_string(), resource);
    }

    pub fn output(&mut self, name: &str, output: Output) {
        self.outputs.insert(name.to_string(), output);
    }

    pub fn resource(&self, logical_id: &str) -> Option<&Resource> {
        self.resources.get(logical_id)
    }

    pub fn to_json_pretty(&self) -> anyhow::Result<String> {
        serde_json::to_string_pretty(self).context("failed to serialize template")
    }
}

pub(crate) fn ref_(logical_id: &str) -> Value {
    json!({ "Ref": logical_id })
}

pub(crate) fn get_att(logical_id: &str, attribute: &str) -> Value {
    json!({ "Fn::GetAtt": [logical_id, attribute] })
}

pub(crate) fn sub(template: &str) -> Value {
    json!({ "Fn::Sub": template })
}

/// Build the full deployment graph for `params`.
pub fn render(params: &DeploymentParams) -> Result<Template, ProvisionError> {
    params.validate()?;

    let mut template = Template::new(format!(
        "DingTalk chatbot {} backed by Bedrock {}",
        params.construct_id, params.bedrock_model_id
    ));
    template.parameters.insert(
        "ContainerImage".into(),
        json!({
            "Type": "String",
            "Default": DEFAULT_CONTAINER_IMAGE,
            "Description": "Image URI of the dingbot container",
        }),
    );

    resources::add_network(&mut template, params);
    resources::add_conversation_table(&mut template, params);
    resources::add_service(&mut template, params);
    if params.enable_bedrock_log {
        resources::add_bedrock_logging(&mut template);
    }

    tracing::info!(
        construct_id = %params.construct_id,
        resources = template.resources.len(),
        bedrock_log = params.enable_bedrock_log,
        "Rendered deployment template"
    );
    Ok(template)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> DeploymentParams {
        serde_json::from_value(json!({
            "construct_id": "dingbot",
            "dingtalk_app_credential_secret_name": "dingtalk_app_credential",
            "bedrock_model_id": "anthropic.claude-v2",
            "input_history_conversation_count": "10",
            "enable_bedrock_log": false,
        }))
        .unwrap()
    }

    fn env_value<'a>(template: &'a Template, name: &str) -> &'a Value {
        let task = template.resource("TaskDefinition").unwrap();
        let env = task.properties["ContainerDefinitions"][0]["Environment"]
            .as_array()
            .unwrap();
        &env.iter().find(|e| e["Name"] == name).unwrap()["Value"]
    }

    #[test]
    fn history_count_accepts_string_or_number() {
        assert_eq!(params().input_history_conversation_count, 10);

        let numeric: DeploymentParams = serde_json::from_value(json!({
            "construct_id": "dingbot",
            "dingtalk_app_credential_secret_name": "s",
            "bedrock_model_id": "anthropic.claude-v2",
            "input_history_conversation_count": 4,
        }))
        .unwrap();
        assert_eq!(numeric.input_history_conversation_count, 4);
        assert!(!numeric.enable_bedrock_log);
    }

    #[test]
    fn validation_rejects_bad_params() {
        let mut p = params();
        p.construct_id = "  ".into();
        assert!(matches!(render(&p), Err(ProvisionError::InvalidConstructId(_))));

        let mut p = params();
        p.input_history_conversation_count = 0;
        assert_eq!(render(&p).unwrap_err(), ProvisionError::InvalidHistoryCount);

        let negative: DeploymentParams = serde_json::from_value(json!({
            "construct_id": "dingbot",
            "dingtalk_app_credential_secret_name": "s",
            "bedrock_model_id": "anthropic.claude-v2",
            "input_history_conversation_count": "-3",
        }))
        .unwrap();
        assert_eq!(negative.validate(), Err(ProvisionError::InvalidHistoryCount));

        let mut p = params();
        p.bedrock_model_id = "amazon.titan-text".into();
        assert!(matches!(render(&p), Err(ProvisionError::UnsupportedModel(_))));
    }

    #[test]
    fn table_is_keyed_by_session_id_and_named_after_construct() {
        let template = render(&params()).unwrap();
        let table = template.resource("ConversationTable").unwrap();

        assert_eq!(table.kind, "AWS::DynamoDB::Table");
        assert_eq!(table.properties["TableName"], "dingbot_conversation_table");
        assert_eq!(table.properties["KeySchema"][0]["AttributeName"], "SessionId");
        assert_eq!(table.properties["BillingMode"], "PAY_PER_REQUEST");
        assert_eq!(
            table.properties["PointInTimeRecoverySpecification"]["PointInTimeRecoveryEnabled"],
            true
        );
    }

    #[test]
    fn service_container_receives_runtime_settings() {
        let template = render(&params()).unwrap();

        assert_eq!(env_value(&template, "BEDROCK_MODEL_ID"), "anthropic.claude-v2");
        assert_eq!(env_value(&template, "INPUT_HISTORY_CONVERSATION_COUNT"), "10");
        assert_eq!(env_value(&template, "DINGTALK_SETTING"), "dingtalk_app_credential");
        assert_eq!(env_value(&template, "DDB_TABLE_NAME"), &ref_("ConversationTable"));
        assert_eq!(env_value(&template, "DINGTALK_SETTING_REGION"), &ref_("AWS::Region"));

        let service = template.resource("FargateService").unwrap();
        assert_eq!(service.properties["DesiredCount"], 1);
        assert_eq!(
            service.properties["DeploymentConfiguration"]["DeploymentCircuitBreaker"]["Rollback"],
            true
        );
        assert!(service.depends_on.contains(&"TaskRolePolicy".to_string()));
    }

    #[test]
    fn task_role_grants_bedrock_and_table_access() {
        let template = render(&params()).unwrap();
        let policy = template.resource("TaskRolePolicy").unwrap();
        let statements = policy.properties["PolicyDocument"]["Statement"]
            .as_array()
            .unwrap();

        let actions: Vec<&str> = statements
            .iter()
            .flat_map(|s| s["Action"].as_array().unwrap())
            .filter_map(Value::as_str)
            .collect();
        assert!(actions.contains(&"bedrock:InvokeModelWithResponseStream"));
        assert!(actions.contains(&"dynamodb:UpdateItem"));
        assert!(actions.contains(&"secretsmanager:GetSecretValue"));
        assert_eq!(
            statements[1]["Resource"][0],
            get_att("ConversationTable", "Arn")
        );
    }

    #[test]
    fn network_spans_two_zones_behind_one_nat() {
        let template = render(&params()).unwrap();

        assert_eq!(
            template.resource("Vpc").unwrap().properties["CidrBlock"],
            resources::VPC_CIDR
        );
        for id in ["PublicSubnet1", "PublicSubnet2", "PrivateSubnet1", "PrivateSubnet2"] {
            assert!(template.resource(id).is_some(), "missing {id}");
        }
        let nat_count = template
            .resources
            .values()
            .filter(|r| r.kind == "AWS::EC2::NatGateway")
            .count();
        assert_eq!(nat_count, 1);
        assert!(template.outputs.contains_key("VpcId"));
    }

    #[test]
    fn bedrock_logging_is_optional() {
        let template = render(&params()).unwrap();
        assert!(template.resource("BedrockLogBucket").is_none());
        assert!(!template.outputs.contains_key("BucketOutput"));

        let mut p = params();
        p.enable_bedrock_log = true;
        p.region = Some("us-east-1".into());
        let template = render(&p).unwrap();

        let bucket = template.resource("BedrockLogBucket").unwrap();
        assert_eq!(
            bucket.properties["LifecycleConfiguration"]["Rules"][0]["ExpirationInDays"],
            7
        );
        let group = template.resource("BedrockLogGroup").unwrap();
        assert_eq!(group.properties["LogGroupName"], "/aws/bedrock");
        for name in ["BucketOutput", "LogGroupOutput", "RoleArnOutput"] {
            assert!(template.outputs.contains_key(name), "missing {name}");
        }
        assert_eq!(env_value(&template, "DINGTALK_SETTING_REGION"), "us-east-1");
    }

    #[test]
    fn rendered_json_has_cloudformation_shape() {
        let json = render(&params()).unwrap().to_json_pretty().unwrap();
        let value: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["AWSTemplateFormatVersion"], "2010-09-09");
        assert_eq!(value["Resources"]["EcsCluster"]["Type"], "AWS::ECS::Cluster");
        assert!(value["Resources"]["Vpc"].get("DependsOn").is_none());
    }

    #[test]
    fn load_reads_params_file() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join(DEFAULT_PARAMS_FILE);
        std::fs::write(
            &path,
            r#"{
  "construct_id": "bot-prod",
  "dingtalk_app_credential_secret_name": "dingtalk_app_credential",
  "bedrock_model_id": "anthropic.claude-v2",
  "input_history_conversation_count": "5",
  "enable_bedrock_log": true
}"#,
        )?;
        let params = DeploymentParams::load(&path)?;
        assert_eq!(params.table_name(), "bot-prod_conversation_table");
        assert!(params.enable_bedrock_log);
        Ok(())
    }
}
