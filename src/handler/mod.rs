//! Routes one inbound chat message: help, reset, or a streamed model reply.

use crate::channels::{Ack, InboundMessage, ReplyChannel, ReplyTarget};
use crate::history::{ChatMessage, HistoryStore};
use crate::model::{ModelClient, ModelRequest};
use crate::reply::{ReplyError, ReplyPipeline, ReplySummary};
use std::sync::Arc;

pub const WELCOME_MESSAGE: &str = "我是某某聊天机器人:
==========================
♻️ 重置 👉 重置带上下文聊天
❓ 帮助 👉 显示帮助信息
==========================
🚜 例：@我发送 空 或 帮助 将返回此帮助信息
";
pub const RESET_CONFIRMATION: &str = "会话已重置";
pub const FALLBACK_MESSAGE: &str = "上下文过多,请输入'重置'清理后再尝试";

const HELP_TOKENS: &[&str] = &["", "帮助", "help"];
const RESET_TOKENS: &[&str] = &["重置", "reset"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Help,
    Reset,
    Chat(String),
}

impl Command {
    pub fn parse(text: &str) -> Self {
        let text = text.trim();
        if HELP_TOKENS.contains(&text) {
            Self::Help
        } else if RESET_TOKENS.contains(&text) {
            Self::Reset
        } else {
            Self::Chat(text.to_string())
        }
    }
}

pub struct MessageHandler {
    model: Arc<dyn ModelClient>,
    history: Arc<HistoryStore>,
    channel: Arc<dyn ReplyChannel>,
    pipeline: ReplyPipeline,
    history_limit: usize,
}

impl MessageHandler {
    /// `history_limit` is the number of stored messages fed back as context.
    pub fn new(
        model: Arc<dyn ModelClient>,
        history: Arc<HistoryStore>,
        channel: Arc<dyn ReplyChannel>,
        pipeline: ReplyPipeline,
        history_limit: usize,
    ) -> Self {
        Self {
            model,
            history,
            channel,
            pipeline,
            history_limit,
        }
    }

    /// Every handled message is acknowledged as OK, including failed ones,
    /// so the platform never redelivers.
    pub async fn handle(&self, message: &InboundMessage) -> Ack {
        let target = message.reply_target();
        let conversation_id = message.conversation_id.trim();

        match Command::parse(&message.text) {
            Command::Help => {
                self.reply_text(&target, WELCOME_MESSAGE).await;
            }
            Command::Reset => {
                self.history.reset(conversation_id).await;
                tracing::info!("message_history for {conversation_id} cleared.");
                self.reply_text(&target, RESET_CONFIRMATION).await;
            }
            Command::Chat(text) => {
                if let Err(e) = self.chat(message, conversation_id, &text, &target).await {
                    tracing::error!(
                        conversation_id,
                        model_id = self.model.model_id(),
                        "Reply failed: {e}"
                    );
                    self.reply_text(&target, FALLBACK_MESSAGE).await;
                }
            }
        }
        Ack::ok()
    }

    async fn chat(
        &self,
        message: &InboundMessage,
        conversation_id: &str,
        text: &str,
        target: &ReplyTarget,
    ) -> Result<ReplySummary, ReplyError> {
        let history = self
            .history
            .read_recent(conversation_id, self.history_limit)
            .await;
        let fragments = self
            .model
            .stream(ModelRequest {
                prompt: text.to_string(),
                role: message.sender_staff_id.clone(),
                conversation_id: message.conversation_id.clone(),
                history,
            })
            .await?;
        let summary = self
            .pipeline
            .run(fragments, self.channel.as_ref(), target)
            .await?;
        if summary.text.trim().is_empty() {
            return Err(ReplyError::Empty);
        }

        self.history
            .append(conversation_id, &ChatMessage::human(text))
            .await;
        self.history
            .append(conversation_id, &ChatMessage::ai(summary.text.as_str()))
            .await;
        Ok(summary)
    }

    async fn reply_text(&self, target: &ReplyTarget, text: &str) {
        if let Err(e) = self.channel.send_text(target, text).await {
            tracing::warn!(
                conversation_id = %target.conversation_id,
                channel = self.channel.name(),
                "Failed to send text reply: {e:#}"
            );
        }
    }
}
