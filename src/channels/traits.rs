use async_trait::async_trait;
use tokio::sync::oneshot;

/// Handle to a card posted earlier in the same reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CardRef {
    pub biz_id: String,
    pub block_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversationType {
    Single,
    Group,
}

impl ConversationType {
    /// DingTalk encodes single chats as `"1"` and group chats as `"2"`.
    pub fn from_code(code: &str) -> Self {
        if code.trim() == "2" {
            Self::Group
        } else {
            Self::Single
        }
    }
}

/// Where replies to one inbound message go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyTarget {
    pub conversation_id: String,
    pub conversation_type: ConversationType,
    pub sender_staff_id: String,
    pub session_webhook: String,
}

/// A chat message addressed to the bot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub message_id: String,
    pub conversation_id: String,
    pub conversation_type: ConversationType,
    pub sender_id: String,
    pub sender_staff_id: String,
    pub sender_nick: String,
    pub text: String,
    pub session_webhook: String,
    pub robot_code: String,
}

impl InboundMessage {
    pub fn reply_target(&self) -> ReplyTarget {
        ReplyTarget {
            conversation_id: self.conversation_id.clone(),
            conversation_type: self.conversation_type,
            sender_staff_id: self.sender_staff_id.clone(),
            session_webhook: self.session_webhook.clone(),
        }
    }
}

pub const ACK_STATUS_OK: u16 = 200;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ack {
    pub status: u16,
    pub message: String,
}

impl Ack {
    pub fn ok() -> Self {
        Self {
            status: ACK_STATUS_OK,
            message: "OK".to_string(),
        }
    }
}

/// Inbound message plus the channel to acknowledge it on once handled.
#[derive(Debug)]
pub struct InboundEvent {
    pub message: InboundMessage,
    pub ack: oneshot::Sender<Ack>,
}

/// Outbound reply primitives of a chat platform.
#[async_trait]
pub trait ReplyChannel: Send + Sync {
    fn name(&self) -> &str;

    async fn send_text(&self, target: &ReplyTarget, text: &str) -> anyhow::Result<()>;

    async fn post_card(&self, target: &ReplyTarget, content: &str) -> anyhow::Result<CardRef>;

    async fn update_card(&self, card: &CardRef, content: &str) -> anyhow::Result<()>;
}
