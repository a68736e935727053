use super::{regional_endpoint, AwsError, AwsJsonClient, CredentialsProvider, JsonProtocol};
use serde::Deserialize;
use std::fmt;
use std::sync::Arc;

/// DingTalk application key pair as stored in Secrets Manager.
#[derive(Clone, PartialEq, Eq, Deserialize)]
pub struct DingTalkCredential {
    #[serde(rename = "AppKey")]
    pub app_key: String,
    #[serde(rename = "AppSecret")]
    pub app_secret: String,
}

impl fmt::Debug for DingTalkCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DingTalkCredential")
            .field("app_key", &self.app_key)
            .field("app_secret", &"<redacted>")
            .finish()
    }
}

pub struct SecretsClient {
    client: AwsJsonClient,
}

impl SecretsClient {
    pub fn new(credentials: Arc<CredentialsProvider>, region: &str) -> Self {
        Self::with_endpoint(credentials, region, regional_endpoint("secretsmanager", region))
    }

    pub fn with_endpoint(
        credentials: Arc<CredentialsProvider>,
        region: &str,
        endpoint: impl Into<String>,
    ) -> Self {
        Self {
            client: AwsJsonClient::new(
                credentials,
                endpoint,
                region,
                "secretsmanager",
                "secretsmanager",
                JsonProtocol::V1_1,
            ),
        }
    }

    pub async fn secret_string(&self, secret_id: &str) -> Result<String, AwsError> {
        let resp = self
            .client
            .call(
                "GetSecretValue",
                &serde_json::json!({ "SecretId": secret_id }),
            )
            .await?;
        resp.get("SecretString")
            .and_then(serde_json::Value::as_str)
            .map(ToOwned::to_owned)
            .ok_or_else(|| AwsError::Decode(format!("secret {secret_id} has no SecretString")))
    }

    /// Load the `{"AppKey": ..., "AppSecret": ...}` secret.
    pub async fn dingtalk_credential(&self, secret_id: &str) -> Result<DingTalkCredential, AwsError> {
        let raw = self.secret_string(secret_id).await?;
        parse_dingtalk_credential(&raw)
    }
}

pub fn parse_dingtalk_credential(raw: &str) -> Result<DingTalkCredential, AwsError> {
    let credential: DingTalkCredential = serde_json::from_str(raw)
        .map_err(|e| AwsError::Decode(format!("DingTalk secret is not an AppKey/AppSecret object: {e}")))?;
    if credential.app_key.trim().is_empty() || credential.app_secret.trim().is_empty() {
        return Err(AwsError::Decode("DingTalk secret has an empty AppKey or AppSecret".into()));
    }
    Ok(credential)
}
