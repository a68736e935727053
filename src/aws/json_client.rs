use super::sigv4::{self, SignableRequest, SigningParams};
use super::{AwsError, CredentialsProvider};
use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;

/// Wire flavour of the AWS JSON protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JsonProtocol {
    /// `application/x-amz-json-1.0` (DynamoDB).
    V1_0,
    /// `application/x-amz-json-1.1` (Secrets Manager).
    V1_1,
}

impl JsonProtocol {
    fn content_type(self) -> &'static str {
        match self {
            Self::V1_0 => "application/x-amz-json-1.0",
            Self::V1_1 => "application/x-amz-json-1.1",
        }
    }
}

/// Client for services speaking the AWS JSON protocol: every operation is a
/// signed `POST /` with an `X-Amz-Target` header.
#[derive(Clone)]
pub struct AwsJsonClient {
    http: reqwest::Client,
    credentials: Arc<CredentialsProvider>,
    endpoint: String,
    region: String,
    signing_name: String,
    target_prefix: String,
    protocol: JsonProtocol,
}

impl AwsJsonClient {
    pub fn new(
        credentials: Arc<CredentialsProvider>,
        endpoint: impl Into<String>,
        region: impl Into<String>,
        signing_name: impl Into<String>,
        target_prefix: impl Into<String>,
        protocol: JsonProtocol,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            credentials,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            region: region.into(),
            signing_name: signing_name.into(),
            target_prefix: target_prefix.into(),
            protocol,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub async fn call(&self, operation: &str, input: &Value) -> Result<Value, AwsError> {
        let body = serde_json::to_vec(input).map_err(|e| AwsError::Decode(e.to_string()))?;
        let url = format!("{}/", self.endpoint);
        let host = host_header(&url)?;
        let target = format!("{}.{operation}", self.target_prefix);

        let credentials = self.credentials.credentials().await?;
        let unsigned = vec![
            ("content-type".to_string(), self.protocol.content_type().to_string()),
            ("host".to_string(), host),
            ("x-amz-target".to_string(), target.clone()),
        ];
        let request = SignableRequest {
            method: "POST",
            path: "/",
            query: &[],
            headers: unsigned.clone(),
            body: &body,
        };
        let signed = sigv4::sign(
            &request,
            &SigningParams {
                credentials: &credentials,
                region: &self.region,
                service: &self.signing_name,
                time: Utc::now(),
            },
        );

        let mut builder = self.http.post(&url).body(body);
        for (name, value) in unsigned.iter().chain(signed.iter()) {
            if name == "host" {
                continue;
            }
            builder = builder.header(name.as_str(), value.as_str());
        }

        let resp = builder.send().await?;
        let status = resp.status();
        let text = resp
            .text()
            .await
            .unwrap_or_else(|e| format!("<failed to read response body: {e}>"));

        if !status.is_success() {
            let err = parse_service_error(status.as_u16(), &text);
            tracing::debug!(target = %target, error = %err, "AWS JSON call failed");
            return Err(err);
        }

        if text.trim().is_empty() {
            return Ok(Value::Object(serde_json::Map::new()));
        }
        serde_json::from_str(&text).map_err(|e| AwsError::Decode(format!("{target}: {e}")))
    }
}

pub(crate) fn host_header(url: &str) -> Result<String, AwsError> {
    let parsed =
        reqwest::Url::parse(url).map_err(|e| AwsError::Decode(format!("bad endpoint {url}: {e}")))?;
    let host = parsed
        .host_str()
        .ok_or_else(|| AwsError::Decode(format!("endpoint {url} has no host")))?;
    Ok(match parsed.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    })
}

/// Error bodies carry `__type` as either `Code` or `namespace#Code`.
pub(crate) fn parse_service_error(status: u16, body: &str) -> AwsError {
    let payload: Value = serde_json::from_str(body).unwrap_or_default();
    let code = payload
        .get("__type")
        .and_then(Value::as_str)
        .map(|t| t.rsplit('#').next().unwrap_or(t).to_string())
        .unwrap_or_else(|| format!("HTTP{status}"));
    let message = payload
        .get("message")
        .or_else(|| payload.get("Message"))
        .and_then(Value::as_str)
        .map(ToOwned::to_owned)
        .unwrap_or_else(|| body.chars().take(512).collect());
    AwsError::Service {
        status,
        code,
        message,
    }
}
