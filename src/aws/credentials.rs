use super::AwsError;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::Deserialize;
use std::fmt;

const CONTAINER_CREDENTIALS_HOST: &str = "http://169.254.170.2";
const REFRESH_MARGIN_SECS: i64 = 300;

#[derive(Clone, PartialEq, Eq)]
pub struct AwsCredentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: Option<String>,
}

impl AwsCredentials {
    pub fn new(
        access_key_id: impl Into<String>,
        secret_access_key: impl Into<String>,
        session_token: Option<String>,
    ) -> Self {
        Self {
            access_key_id: access_key_id.into(),
            secret_access_key: secret_access_key.into(),
            session_token,
        }
    }

    fn from_env_lookup(lookup: impl Fn(&str) -> Option<String>) -> Option<Self> {
        let access_key_id = lookup("AWS_ACCESS_KEY_ID").filter(|v| !v.trim().is_empty())?;
        let secret_access_key =
            lookup("AWS_SECRET_ACCESS_KEY").filter(|v| !v.trim().is_empty())?;
        let session_token = lookup("AWS_SESSION_TOKEN").filter(|v| !v.trim().is_empty());
        Some(Self::new(access_key_id, secret_access_key, session_token))
    }
}

impl fmt::Debug for AwsCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AwsCredentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .field(
                "session_token",
                &self.session_token.as_ref().map(|_| "<redacted>"),
            )
            .finish()
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ContainerCredentials {
    access_key_id: String,
    secret_access_key: String,
    token: Option<String>,
    expiration: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
struct CachedCredentials {
    credentials: AwsCredentials,
    expires_at: Option<DateTime<Utc>>,
}

impl CachedCredentials {
    fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        self.expires_at
            .is_none_or(|at| at - Duration::seconds(REFRESH_MARGIN_SECS) > now)
    }
}

enum Source {
    Fixed(AwsCredentials),
    Chain,
}

/// Resolves credentials from the environment first, then from the ECS
/// container credentials endpoint. Container credentials are cached until
/// shortly before they expire.
pub struct CredentialsProvider {
    source: Source,
    http: reqwest::Client,
    cached: Mutex<Option<CachedCredentials>>,
}

impl CredentialsProvider {
    pub fn from_environment() -> Self {
        Self {
            source: Source::Chain,
            http: reqwest::Client::new(),
            cached: Mutex::new(None),
        }
    }

    pub fn fixed(credentials: AwsCredentials) -> Self {
        Self {
            source: Source::Fixed(credentials),
            http: reqwest::Client::new(),
            cached: Mutex::new(None),
        }
    }

    pub async fn credentials(&self) -> Result<AwsCredentials, AwsError> {
        match &self.source {
            Source::Fixed(credentials) => Ok(credentials.clone()),
            Source::Chain => self.resolve_chain().await,
        }
    }

    async fn resolve_chain(&self) -> Result<AwsCredentials, AwsError> {
        if let Some(credentials) = AwsCredentials::from_env_lookup(|name| std::env::var(name).ok())
        {
            return Ok(credentials);
        }

        if let Some(cached) = self.cached.lock().clone() {
            if cached.is_fresh(Utc::now()) {
                return Ok(cached.credentials);
            }
        }

        let Some(url) = container_credentials_url() else {
            return Err(AwsError::NoCredentials);
        };
        let fetched = self.fetch_container_credentials(&url).await?;
        let credentials = fetched.credentials.clone();
        *self.cached.lock() = Some(fetched);
        Ok(credentials)
    }

    async fn fetch_container_credentials(&self, url: &str) -> Result<CachedCredentials, AwsError> {
        let mut request = self.http.get(url);
        if let Ok(token) = std::env::var("AWS_CONTAINER_AUTHORIZATION_TOKEN") {
            request = request.header(reqwest::header::AUTHORIZATION, token);
        }

        let resp = request.send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(AwsError::Credentials(format!(
                "container credentials endpoint returned {status}"
            )));
        }
        let body: ContainerCredentials = resp
            .json()
            .await
            .map_err(|e| AwsError::Credentials(format!("invalid credentials payload: {e}")))?;

        tracing::debug!(
            expires_at = ?body.expiration,
            "Loaded AWS credentials from container endpoint"
        );
        Ok(CachedCredentials {
            credentials: AwsCredentials::new(
                body.access_key_id,
                body.secret_access_key,
                body.token,
            ),
            expires_at: body.expiration,
        })
    }
}

fn container_credentials_url() -> Option<String> {
    if let Ok(relative) = std::env::var("AWS_CONTAINER_CREDENTIALS_RELATIVE_URI") {
        let relative = relative.trim();
        if !relative.is_empty() {
            return Some(format!("{CONTAINER_CREDENTIALS_HOST}{relative}"));
        }
    }
    std::env::var("AWS_CONTAINER_CREDENTIALS_FULL_URI")
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn env_lookup_requires_key_and_secret() {
        let mut vars = HashMap::new();
        vars.insert("AWS_ACCESS_KEY_ID", "AKID".to_string());
        assert!(AwsCredentials::from_env_lookup(|k| vars.get(k).cloned()).is_none());

        vars.insert("AWS_SECRET_ACCESS_KEY", "secret".to_string());
        vars.insert("AWS_SESSION_TOKEN", "  ".to_string());
        let creds = AwsCredentials::from_env_lookup(|k| vars.get(k).cloned()).unwrap();
        assert_eq!(creds.access_key_id, "AKID");
        assert_eq!(creds.session_token, None);
    }

    #[test]
    fn debug_output_redacts_secrets() {
        let creds = AwsCredentials::new("AKID", "very-secret", Some("tok".into()));
        let rendered = format!("{creds:?}");
        assert!(rendered.contains("AKID"));
        assert!(!rendered.contains("very-secret"));
        assert!(!rendered.contains("tok\""));
    }

    #[test]
    fn cached_credentials_refresh_before_expiry() {
        let now = Utc::now();
        let creds = AwsCredentials::new("a", "b", None);
        let fresh = CachedCredentials {
            credentials: creds.clone(),
            expires_at: Some(now + Duration::hours(1)),
        };
        let stale = CachedCredentials {
            credentials: creds.clone(),
            expires_at: Some(now + Duration::seconds(60)),
        };
        let forever = CachedCredentials {
            credentials: creds,
            expires_at: None,
        };
        assert!(fresh.is_fresh(now));
        assert!(!stale.is_fresh(now));
        assert!(forever.is_fresh(now));
    }

    #[tokio::test]
    async fn fixed_provider_returns_configured_credentials() {
        let provider = CredentialsProvider::fixed(AwsCredentials::new("k", "s", None));
        let creds = provider.credentials().await.unwrap();
        assert_eq!(creds.access_key_id, "k");
    }
}
