use super::traits::{CardRef, ConversationType, ReplyChannel, ReplyTarget};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

pub const DEFAULT_API_BASE: &str = "https://api.dingtalk.com";
const CARD_TEMPLATE_ID: &str = "StandardCard";
const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(300);
const HTTP_TIMEOUT: Duration = Duration::from_secs(60);

struct CachedToken {
    value: String,
    expires_at: Instant,
}

/// DingTalk open-API replier: plain text through the per-message session
/// webhook, streamed replies as robot interactive cards.
pub struct DingTalkChannel {
    http: reqwest::Client,
    app_key: String,
    app_secret: String,
    api_base: String,
    token: Mutex<Option<CachedToken>>,
}

impl DingTalkChannel {
    pub fn new(app_key: String, app_secret: String) -> Self {
        Self::with_api_base(app_key, app_secret, DEFAULT_API_BASE)
    }

    pub fn with_api_base(app_key: String, app_secret: String, api_base: &str) -> Self {
        let http = reqwest::Client::builder()
            .connect_timeout(HTTP_TIMEOUT)
            .timeout(HTTP_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            http,
            app_key,
            app_secret,
            api_base: api_base.trim_end_matches('/').to_string(),
            token: Mutex::new(None),
        }
    }

    /// Robot code used when sending cards; equals the app key for
    /// enterprise-internal robots.
    pub fn robot_code(&self) -> &str {
        &self.app_key
    }

    async fn access_token(&self) -> anyhow::Result<String> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            if Instant::now() < token.expires_at {
                return Ok(token.value.clone());
            }
        }

        let resp = self
            .http
            .post(format!("{}/v1.0/oauth2/accessToken", self.api_base))
            .json(&json!({ "appKey": self.app_key, "appSecret": self.app_secret }))
            .send()
            .await?;
        let body = read_json(resp, "oauth2/accessToken").await?;
        let value = body
            .get("accessToken")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow::anyhow!("DingTalk accessToken missing in response"))?
            .to_string();
        let expire_in = body.get("expireIn").and_then(Value::as_u64).unwrap_or(7200);
        let lifetime = Duration::from_secs(expire_in).saturating_sub(TOKEN_REFRESH_MARGIN);

        tracing::debug!("DingTalk access token refreshed, valid for {expire_in}s");
        *cached = Some(CachedToken {
            value: value.clone(),
            expires_at: Instant::now() + lifetime,
        });
        Ok(value)
    }
}

async fn read_json(resp: reqwest::Response, api: &str) -> anyhow::Result<Value> {
    let status = resp.status();
    let body = resp
        .text()
        .await
        .unwrap_or_else(|e| format!("<failed to read response body: {e}>"));
    if !status.is_success() {
        anyhow::bail!("DingTalk {api} failed ({status}): {body}");
    }
    if body.trim().is_empty() {
        return Ok(Value::Null);
    }
    Ok(serde_json::from_str(&body)?)
}

/// StandardCard payload holding one markdown block.
pub fn render_card(block_id: &str, content: &str) -> Value {
    json!({
        "config": { "autoLayout": true, "enableForward": true },
        "contents": [
            { "type": "markdown", "text": content, "id": block_id }
        ]
    })
}

/// Block ids are `text_<centiseconds since epoch>`.
pub fn new_block_id() -> String {
    format!("text_{}", chrono::Utc::now().timestamp_millis() / 10)
}

#[async_trait]
impl ReplyChannel for DingTalkChannel {
    fn name(&self) -> &str {
        "dingtalk"
    }

    async fn send_text(&self, target: &ReplyTarget, text: &str) -> anyhow::Result<()> {
        if target.session_webhook.is_empty() {
            anyhow::bail!(
                "no session webhook for conversation {}",
                target.conversation_id
            );
        }
        let resp = self
            .http
            .post(&target.session_webhook)
            .json(&json!({ "msgtype": "text", "text": { "content": text } }))
            .send()
            .await?;
        let body = read_json(resp, "session webhook").await?;
        if let Some(code) = body.get("errcode").and_then(Value::as_i64) {
            if code != 0 {
                let msg = body.get("errmsg").and_then(Value::as_str).unwrap_or("unknown");
                anyhow::bail!("DingTalk session webhook failed: {code} {msg}");
            }
        }
        Ok(())
    }

    async fn post_card(&self, target: &ReplyTarget, content: &str) -> anyhow::Result<CardRef> {
        let card = CardRef {
            biz_id: uuid::Uuid::new_v4().to_string(),
            block_id: new_block_id(),
        };
        let mut body = json!({
            "cardTemplateId": CARD_TEMPLATE_ID,
            "cardBizId": card.biz_id,
            "robotCode": self.robot_code(),
            "cardData": render_card(&card.block_id, content).to_string(),
            "sendOptions": {},
            "pullStrategy": false,
        });
        match target.conversation_type {
            ConversationType::Group => {
                body["openConversationId"] = json!(target.conversation_id);
            }
            ConversationType::Single => {
                body["singleChatReceiver"] =
                    json!(json!({ "userId": target.sender_staff_id }).to_string());
            }
        }

        let token = self.access_token().await?;
        let resp = self
            .http
            .post(format!(
                "{}/v1.0/im/v1.0/robot/interactiveCards/send",
                self.api_base
            ))
            .header("x-acs-dingtalk-access-token", token)
            .json(&body)
            .send()
            .await?;
        read_json(resp, "interactiveCards/send").await?;

        tracing::debug!(
            conversation_id = %target.conversation_id,
            card_biz_id = %card.biz_id,
            "Posted DingTalk card"
        );
        Ok(card)
    }

    async fn update_card(&self, card: &CardRef, content: &str) -> anyhow::Result<()> {
        let token = self.access_token().await?;
        let resp = self
            .http
            .put(format!("{}/v1.0/im/robots/interactiveCards", self.api_base))
            .header("x-acs-dingtalk-access-token", token)
            .json(&json!({
                "cardBizId": card.biz_id,
                "cardData": render_card(&card.block_id, content).to_string(),
                "updateOptions": { "updateCardDataByKey": false },
            }))
            .send()
            .await?;
        read_json(resp, "interactiveCards update").await?;
        Ok(())
    }
}
