//! DingTalk stream-mode gateway client.
//!
//! The bot registers a connection over HTTPS, receives a websocket endpoint
//! plus a one-time ticket, and then gets every callback as a JSON text frame.
//! Each frame must be acknowledged with a frame carrying the same message id.

use super::traits::{Ack, ConversationType, InboundEvent, InboundMessage};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message as WsMessage;

pub const BOT_MESSAGE_TOPIC: &str = "/v1.0/im/bot/messages/get";
const RECONNECT_DELAY: Duration = Duration::from_secs(5);
const ACK_STATUS_SYSTEM_ERROR: u16 = 500;
const USER_AGENT: &str = concat!("dingbot/", env!("CARGO_PKG_VERSION"));

type WsSink = Arc<
    tokio::sync::Mutex<
        SplitSink<
            tokio_tungstenite::WebSocketStream<
                tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
            >,
            WsMessage,
        >,
    >,
>;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameHeaders {
    #[serde(default)]
    pub app_id: Option<String>,
    #[serde(default)]
    pub connection_id: Option<String>,
    #[serde(default)]
    pub content_type: Option<String>,
    #[serde(default)]
    pub message_id: Option<String>,
    #[serde(default)]
    pub time: Option<String>,
    #[serde(default)]
    pub topic: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StreamFrame {
    #[serde(rename = "specVersion", default)]
    pub spec_version: Option<String>,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub headers: FrameHeaders,
    #[serde(default)]
    pub data: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct AckHeaders {
    content_type: &'static str,
    message_id: String,
}

#[derive(Debug, Clone, Serialize)]
struct AckFrame {
    code: u16,
    headers: AckHeaders,
    message: String,
    data: String,
}

/// Serialized acknowledgement for the frame with `message_id`.
pub fn ack_frame(message_id: &str, ack: &Ack, data: &str) -> String {
    let frame = AckFrame {
        code: ack.status,
        headers: AckHeaders {
            content_type: "application/json",
            message_id: message_id.to_string(),
        },
        message: ack.message.clone(),
        data: data.to_string(),
    };
    serde_json::to_string(&frame).unwrap_or_default()
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChatbotText {
    #[serde(default)]
    content: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChatbotPayload {
    #[serde(default)]
    msg_id: String,
    conversation_id: String,
    #[serde(default)]
    conversation_type: String,
    #[serde(default)]
    sender_id: String,
    #[serde(default)]
    sender_staff_id: String,
    #[serde(default)]
    sender_nick: String,
    #[serde(default)]
    text: Option<ChatbotText>,
    #[serde(default)]
    session_webhook: String,
    #[serde(default)]
    robot_code: String,
}

/// Parse the `data` of a bot-message callback. Non-text messages carry no
/// `text` and come through with empty text.
pub fn parse_chatbot_message(data: &str) -> anyhow::Result<InboundMessage> {
    let payload: ChatbotPayload = serde_json::from_str(data)?;
    Ok(InboundMessage {
        message_id: payload.msg_id,
        conversation_id: payload.conversation_id.trim().to_string(),
        conversation_type: ConversationType::from_code(&payload.conversation_type),
        sender_id: payload.sender_id,
        sender_staff_id: payload.sender_staff_id,
        sender_nick: payload.sender_nick,
        text: payload.text.unwrap_or_default().content,
        session_webhook: payload.session_webhook,
        robot_code: payload.robot_code,
    })
}

/// What the connection loop should do with one decoded frame.
#[derive(Debug)]
pub enum FrameAction {
    /// Write this frame back right away.
    Reply(String),
    /// Hand the message to the bot and ack once it has been handled.
    Dispatch {
        message_id: String,
        message: InboundMessage,
    },
    /// Server asked us to drop this connection.
    Reconnect,
    Ignore,
}

pub fn classify_frame(raw: &str) -> FrameAction {
    let frame: StreamFrame = match serde_json::from_str(raw) {
        Ok(frame) => frame,
        Err(e) => {
            tracing::warn!("DingTalk stream: undecodable frame: {e}");
            return FrameAction::Ignore;
        }
    };
    let message_id = frame.headers.message_id.clone().unwrap_or_default();
    let topic = frame.headers.topic.as_deref().unwrap_or("");

    match frame.kind.as_str() {
        "SYSTEM" => match topic {
            "ping" => FrameAction::Reply(ack_frame(&message_id, &Ack::ok(), &frame.data)),
            "disconnect" => FrameAction::Reconnect,
            other => {
                tracing::debug!("DingTalk stream: ignoring system topic {other}");
                FrameAction::Ignore
            }
        },
        "EVENT" => {
            let data = json!({ "status": "SUCCESS", "message": "success" }).to_string();
            FrameAction::Reply(ack_frame(&message_id, &Ack::ok(), &data))
        }
        "CALLBACK" if topic == BOT_MESSAGE_TOPIC => match parse_chatbot_message(&frame.data) {
            Ok(message) => FrameAction::Dispatch {
                message_id,
                message,
            },
            Err(e) => {
                tracing::warn!("DingTalk stream: malformed bot message {message_id}: {e}");
                let ack = Ack {
                    status: ACK_STATUS_SYSTEM_ERROR,
                    message: e.to_string(),
                };
                FrameAction::Reply(ack_frame(&message_id, &ack, "{}"))
            }
        },
        "CALLBACK" => {
            tracing::debug!("DingTalk stream: no handler for callback topic {topic}");
            FrameAction::Reply(ack_frame(
                &message_id,
                &Ack {
                    status: 404,
                    message: "no handler".into(),
                },
                "{}",
            ))
        }
        other => {
            tracing::debug!("DingTalk stream: unknown frame type {other}");
            FrameAction::Ignore
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct ConnectionTicket {
    endpoint: String,
    ticket: String,
}

pub struct DingTalkStreamClient {
    http: reqwest::Client,
    app_key: String,
    app_secret: String,
    api_base: String,
    ack_deadline: Duration,
}

impl DingTalkStreamClient {
    pub fn new(app_key: String, app_secret: String, api_base: &str, ack_deadline: Duration) -> Self {
        Self {
            http: reqwest::Client::new(),
            app_key,
            app_secret,
            api_base: api_base.trim_end_matches('/').to_string(),
            ack_deadline,
        }
    }

    /// Register for bot callbacks and return the websocket URL to dial.
    pub async fn open_connection(&self) -> anyhow::Result<String> {
        let resp = self
            .http
            .post(format!("{}/v1.0/gateway/connections/open", self.api_base))
            .json(&json!({
                "clientId": self.app_key,
                "clientSecret": self.app_secret,
                "subscriptions": [
                    { "type": "CALLBACK", "topic": BOT_MESSAGE_TOPIC }
                ],
                "ua": USER_AGENT,
            }))
            .send()
            .await?;
        let status = resp.status();
        let body = resp
            .text()
            .await
            .unwrap_or_else(|e| format!("<failed to read response body: {e}>"));
        if !status.is_success() {
            anyhow::bail!("DingTalk connections/open failed ({status}): {body}");
        }
        let ticket: ConnectionTicket = serde_json::from_str(&body)?;
        let url = reqwest::Url::parse_with_params(&ticket.endpoint, &[("ticket", &ticket.ticket)])?;
        Ok(url.to_string())
    }

    /// Keep a connection open until `tx` is closed, reconnecting after
    /// failures and server-requested disconnects.
    pub async fn run_forever(&self, tx: mpsc::Sender<InboundEvent>) {
        tracing::info!("DingTalk: starting stream-mode connection");
        loop {
            match self.run_connection(&tx).await {
                Ok(()) => tracing::info!("DingTalk stream: server requested reconnect"),
                Err(e) => tracing::warn!("DingTalk stream disconnected: {e}"),
            }
            if tx.is_closed() {
                tracing::info!("DingTalk stream: dispatcher gone, stopping");
                return;
            }
            tracing::info!("DingTalk: reconnecting in {}s...", RECONNECT_DELAY.as_secs());
            tokio::time::sleep(RECONNECT_DELAY).await;
        }
    }

    async fn run_connection(&self, tx: &mpsc::Sender<InboundEvent>) -> anyhow::Result<()> {
        let ws_url = self.open_connection().await?;
        let (ws_stream, _) = tokio_tungstenite::connect_async(ws_url.as_str()).await?;
        tracing::info!("DingTalk stream: connected");

        let (write, mut read) = ws_stream.split();
        let write: WsSink = Arc::new(tokio::sync::Mutex::new(write));

        while let Some(msg) = read.next().await {
            match msg? {
                WsMessage::Text(text) => match classify_frame(text.as_str()) {
                    FrameAction::Reply(frame) => send_frame(&write, frame).await,
                    FrameAction::Dispatch {
                        message_id,
                        message,
                    } => {
                        tracing::info!(
                            message_id = %message_id,
                            conversation_id = %message.conversation_id,
                            sender = %message.sender_nick,
                            "DingTalk bot message received"
                        );
                        match enqueue(tx, message) {
                            Enqueued::Accepted(ack_rx) => {
                                tokio::spawn(write_ack_when_handled(
                                    write.clone(),
                                    message_id,
                                    ack_rx,
                                    self.ack_deadline,
                                ));
                            }
                            Enqueued::Busy(ack) => {
                                tracing::warn!(
                                    message_id = %message_id,
                                    "DingTalk stream: dispatch queue full, rejecting message"
                                );
                                send_frame(&write, ack_frame(&message_id, &ack, "{}")).await;
                            }
                            Enqueued::Closed => anyhow::bail!("dispatcher channel closed"),
                        }
                    }
                    FrameAction::Reconnect => return Ok(()),
                    FrameAction::Ignore => {}
                },
                WsMessage::Ping(data) => {
                    let mut w = write.lock().await;
                    if let Err(e) = w.send(WsMessage::Pong(data)).await {
                        tracing::warn!("DingTalk stream: pong send failed: {e}");
                    }
                }
                WsMessage::Close(_) => anyhow::bail!("WebSocket closed by server"),
                _ => {}
            }
        }
        anyhow::bail!("WebSocket stream ended")
    }
}

async fn send_frame(write: &WsSink, frame: String) {
    let mut w = write.lock().await;
    if let Err(e) = w.send(WsMessage::Text(frame.into())).await {
        tracing::warn!("DingTalk stream: failed to send frame: {e}");
    }
}

#[derive(Debug)]
pub enum Enqueued {
    Accepted(oneshot::Receiver<Ack>),
    /// Queue full; ack right away so the reader keeps serving pings.
    Busy(Ack),
    Closed,
}

/// Hand `message` to the dispatcher without waiting for queue space.
pub fn enqueue(tx: &mpsc::Sender<InboundEvent>, message: InboundMessage) -> Enqueued {
    let (ack_tx, ack_rx) = oneshot::channel();
    match tx.try_send(InboundEvent {
        message,
        ack: ack_tx,
    }) {
        Ok(()) => Enqueued::Accepted(ack_rx),
        Err(mpsc::error::TrySendError::Full(_)) => Enqueued::Busy(Ack {
            status: ACK_STATUS_SYSTEM_ERROR,
            message: "dispatch queue full".into(),
        }),
        Err(mpsc::error::TrySendError::Closed(_)) => Enqueued::Closed,
    }
}

/// Long replies outlive the platform's redelivery window, so past the
/// deadline the event is acked as accepted and handling continues.
async fn write_ack_when_handled(
    write: WsSink,
    message_id: String,
    ack_rx: oneshot::Receiver<Ack>,
    deadline: Duration,
) {
    let ack = resolve_ack(ack_rx, deadline).await;
    send_frame(&write, ack_frame(&message_id, &ack, "{}")).await;
}

pub async fn resolve_ack(ack_rx: oneshot::Receiver<Ack>, deadline: Duration) -> Ack {
    match tokio::time::timeout(deadline, ack_rx).await {
        Ok(Ok(ack)) => ack,
        Ok(Err(_)) => Ack {
            status: ACK_STATUS_SYSTEM_ERROR,
            message: "handler dropped the event".into(),
        },
        Err(_) => {
            tracing::debug!("DingTalk stream: ack deadline passed, acking early");
            Ack::ok()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn callback_frame(data: &Value) -> String {
        json!({
            "specVersion": "1.0",
            "type": "CALLBACK",
            "headers": {
                "appId": "app",
                "connectionId": "conn",
                "contentType": "application/json",
                "messageId": "msg-1",
                "time": "1700000000000",
                "topic": BOT_MESSAGE_TOPIC
            },
            "data": data.to_string()
        })
        .to_string()
    }

    fn bot_payload() -> Value {
        json!({
            "conversationId": " cidAbc== ",
            "conversationType": "2",
            "msgId": "msgXYZ",
            "senderId": "$:LWCP_v1:$abc",
            "senderStaffId": "staff-1",
            "senderNick": "Alice",
            "sessionWebhook": "https://oapi.dingtalk.com/robot/sendBySession?session=s",
            "robotCode": "dingbot",
            "msgtype": "text",
            "text": { "content": " hello " }
        })
    }

    #[test]
    fn ping_is_answered_with_echoed_data() {
        let raw = json!({
            "specVersion": "1.0",
            "type": "SYSTEM",
            "headers": {"messageId": "p-1", "topic": "ping", "contentType": "application/json"},
            "data": "{\"opaque\":\"abc\"}"
        })
        .to_string();
        let FrameAction::Reply(reply) = classify_frame(&raw) else {
            panic!("expected reply");
        };
        let reply: Value = serde_json::from_str(&reply).unwrap();
        assert_eq!(reply["code"], 200);
        assert_eq!(reply["headers"]["messageId"], "p-1");
        assert_eq!(reply["headers"]["contentType"], "application/json");
        assert_eq!(reply["message"], "OK");
        assert_eq!(reply["data"], "{\"opaque\":\"abc\"}");
    }

    #[test]
    fn disconnect_requests_reconnect() {
        let raw = json!({"type": "SYSTEM", "headers": {"topic": "disconnect"}, "data": ""}).to_string();
        assert!(matches!(classify_frame(&raw), FrameAction::Reconnect));
    }

    #[test]
    fn bot_callback_is_dispatched() {
        let FrameAction::Dispatch {
            message_id,
            message,
        } = classify_frame(&callback_frame(&bot_payload()))
        else {
            panic!("expected dispatch");
        };
        assert_eq!(message_id, "msg-1");
        assert_eq!(message.conversation_id, "cidAbc==");
        assert_eq!(message.conversation_type, ConversationType::Group);
        assert_eq!(message.sender_staff_id, "staff-1");
        assert_eq!(message.text, " hello ");
        assert_eq!(message.robot_code, "dingbot");
    }

    #[test]
    fn non_text_message_has_empty_text() {
        let mut payload = bot_payload();
        payload["msgtype"] = json!("picture");
        payload.as_object_mut().unwrap().remove("text");
        let message = parse_chatbot_message(&payload.to_string()).unwrap();
        assert_eq!(message.text, "");
    }

    #[test]
    fn malformed_bot_message_is_acked_with_error() {
        let raw = callback_frame(&json!({"nope": true}));
        let FrameAction::Reply(reply) = classify_frame(&raw) else {
            panic!("expected reply");
        };
        let reply: Value = serde_json::from_str(&reply).unwrap();
        assert_eq!(reply["code"], 500);
    }

    #[test]
    fn garbage_is_ignored() {
        assert!(matches!(classify_frame("not json"), FrameAction::Ignore));
    }

    #[tokio::test]
    async fn ack_comes_from_handler_or_deadline() {
        let (tx, rx) = oneshot::channel();
        tx.send(Ack::ok()).unwrap();
        assert_eq!(resolve_ack(rx, Duration::from_secs(1)).await, Ack::ok());

        let (tx, rx) = oneshot::channel::<Ack>();
        drop(tx);
        assert_eq!(resolve_ack(rx, Duration::from_secs(1)).await.status, 500);

        let (_tx, rx) = oneshot::channel::<Ack>();
        assert_eq!(resolve_ack(rx, Duration::from_millis(10)).await, Ack::ok());
    }

    #[tokio::test]
    async fn full_queue_rejects_instead_of_blocking() {
        let message = || parse_chatbot_message(&bot_payload().to_string()).unwrap();
        let (tx, mut rx) = mpsc::channel(1);

        let Enqueued::Accepted(ack_rx) = enqueue(&tx, message()) else {
            panic!("expected accepted");
        };
        let Enqueued::Busy(ack) = enqueue(&tx, message()) else {
            panic!("expected busy");
        };
        assert_eq!(ack.status, 500);

        let event = rx.recv().await.unwrap();
        event.ack.send(Ack::ok()).unwrap();
        assert_eq!(ack_rx.await.unwrap(), Ack::ok());

        drop(rx);
        assert!(matches!(enqueue(&tx, message()), Enqueued::Closed));
    }

    #[tokio::test]
    async fn open_connection_builds_ticket_url() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1.0/gateway/connections/open"))
            .and(body_partial_json(json!({
                "clientId": "key",
                "subscriptions": [{"type": "CALLBACK", "topic": BOT_MESSAGE_TOPIC}]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "endpoint": "wss://wss-open-connection.dingtalk.com:443/connect",
                "ticket": "t/1+2"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = DingTalkStreamClient::new(
            "key".into(),
            "secret".into(),
            &server.uri(),
            Duration::from_secs(5),
        );
        let url = client.open_connection().await.unwrap();
        assert_eq!(
            url,
            "wss://wss-open-connection.dingtalk.com/connect?ticket=t%2F1%2B2"
        );
    }
}
