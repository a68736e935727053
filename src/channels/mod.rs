pub mod dingtalk;
pub mod dingtalk_stream;
pub mod traits;

pub use dingtalk::DingTalkChannel;
pub use dingtalk_stream::DingTalkStreamClient;
pub use traits::{
    Ack, CardRef, ConversationType, InboundEvent, InboundMessage, ReplyChannel, ReplyTarget,
};

#[cfg(test)]
pub(crate) mod testing {
    //! Recording reply channel shared by pipeline and handler tests.

    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Delivery {
        Text(String),
        Post(String),
        Update(String, String),
    }

    #[derive(Default)]
    pub struct RecordingChannel {
        pub deliveries: Mutex<Vec<Delivery>>,
        pub fail_updates: bool,
    }

    impl RecordingChannel {
        pub fn snapshot(&self) -> Vec<Delivery> {
            self.deliveries.lock().clone()
        }

        pub fn posts(&self) -> Vec<String> {
            self.snapshot()
                .into_iter()
                .filter_map(|d| match d {
                    Delivery::Post(content) => Some(content),
                    _ => None,
                })
                .collect()
        }

        pub fn updates(&self) -> Vec<String> {
            self.snapshot()
                .into_iter()
                .filter_map(|d| match d {
                    Delivery::Update(_, content) => Some(content),
                    _ => None,
                })
                .collect()
        }

        pub fn texts(&self) -> Vec<String> {
            self.snapshot()
                .into_iter()
                .filter_map(|d| match d {
                    Delivery::Text(content) => Some(content),
                    _ => None,
                })
                .collect()
        }
    }

    #[async_trait]
    impl ReplyChannel for RecordingChannel {
        fn name(&self) -> &str {
            "recording"
        }

        async fn send_text(&self, _target: &ReplyTarget, text: &str) -> anyhow::Result<()> {
            self.deliveries.lock().push(Delivery::Text(text.to_string()));
            Ok(())
        }

        async fn post_card(&self, _target: &ReplyTarget, content: &str) -> anyhow::Result<CardRef> {
            let mut deliveries = self.deliveries.lock();
            let id = format!("card-{}", deliveries.len());
            deliveries.push(Delivery::Post(content.to_string()));
            Ok(CardRef {
                biz_id: id,
                block_id: "text_0".into(),
            })
        }

        async fn update_card(&self, card: &CardRef, content: &str) -> anyhow::Result<()> {
            if self.fail_updates {
                anyhow::bail!("update rejected");
            }
            self.deliveries
                .lock()
                .push(Delivery::Update(card.biz_id.clone(), content.to_string()));
            Ok(())
        }
    }

    pub fn target() -> ReplyTarget {
        ReplyTarget {
            conversation_id: "cid".into(),
            conversation_type: ConversationType::Single,
            sender_staff_id: "staff-1".into(),
            session_webhook: "https://example.invalid/hook".into(),
        }
    }
}
