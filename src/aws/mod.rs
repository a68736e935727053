//! Minimal AWS plumbing shared by the history table, the model client and the
//! credential lookup.
//!
//! Requests are signed with SigV4 and sent with `reqwest`; only the JSON
//! protocol (DynamoDB, Secrets Manager) and the binary event-stream framing
//! used by Bedrock response streaming are implemented.

pub mod credentials;
pub mod eventstream;
pub mod json_client;
pub mod secrets;
pub mod sigv4;

pub use credentials::{AwsCredentials, CredentialsProvider};
pub use json_client::{AwsJsonClient, JsonProtocol};

/// Region used when neither config nor environment names one.
pub const DEFAULT_REGION: &str = "us-west-2";

#[derive(Debug, thiserror::Error)]
pub enum AwsError {
    #[error("no AWS credentials found in environment or container metadata")]
    NoCredentials,
    #[error("failed to load AWS credentials: {0}")]
    Credentials(String),
    #[error("AWS request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("{code} ({status}): {message}")]
    Service {
        status: u16,
        code: String,
        message: String,
    },
    #[error("failed to decode AWS response: {0}")]
    Decode(String),
}

impl AwsError {
    /// Service error code with any `namespace#` prefix removed.
    pub fn code(&self) -> Option<&str> {
        match self {
            Self::Service { code, .. } => Some(code.as_str()),
            _ => None,
        }
    }
}

/// Regional endpoint for a service, e.g. `https://dynamodb.us-west-2.amazonaws.com`.
pub fn regional_endpoint(service_prefix: &str, region: &str) -> String {
    let suffix = if region.starts_with("cn-") {
        "amazonaws.com.cn"
    } else {
        "amazonaws.com"
    };
    format!("https://{service_prefix}.{region}.{suffix}")
}
