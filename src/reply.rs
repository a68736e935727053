//! Streams model output into an interactive card.
//!
//! Fragments accumulate in a buffer. Every `flush_every` fragments the card
//! is posted (first time) or updated with the whole buffer. When the stream
//! ends, a short reply that never reached a boundary is posted as one card,
//! and a posted card whose last fragment missed a boundary gets one final
//! update. A stream that produced no visible text posts nothing and fails
//! with [`ReplyError::Empty`].

use crate::channels::{CardRef, ReplyChannel, ReplyTarget};
use crate::model::{FragmentStream, ModelError};
use futures_util::StreamExt;

pub const DEFAULT_FLUSH_EVERY: usize = 50;

#[derive(Debug, thiserror::Error)]
pub enum ReplyError {
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error("card delivery failed: {0:#}")]
    Delivery(anyhow::Error),
    #[error("model returned an empty reply")]
    Empty,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplySummary {
    pub text: String,
    pub fragments: usize,
    pub posts: usize,
    pub updates: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct ReplyPipeline {
    flush_every: usize,
}

impl Default for ReplyPipeline {
    fn default() -> Self {
        Self::new(DEFAULT_FLUSH_EVERY)
    }
}

impl ReplyPipeline {
    /// A zero cadence is treated as 1.
    pub fn new(flush_every: usize) -> Self {
        Self {
            flush_every: flush_every.max(1),
        }
    }

    pub fn flush_every(&self) -> usize {
        self.flush_every
    }

    pub async fn run(
        &self,
        mut fragments: FragmentStream,
        channel: &dyn ReplyChannel,
        target: &ReplyTarget,
    ) -> Result<ReplySummary, ReplyError> {
        let mut buffer = String::new();
        let mut count = 0usize;
        let mut card: Option<CardRef> = None;
        let mut posts = 0usize;
        let mut updates = 0usize;

        while let Some(fragment) = fragments.next().await {
            buffer.push_str(&fragment?);
            count += 1;
            if count % self.flush_every != 0 {
                continue;
            }
            match &card {
                None => {
                    card = Some(
                        channel
                            .post_card(target, &buffer)
                            .await
                            .map_err(ReplyError::Delivery)?,
                    );
                    posts += 1;
                }
                Some(posted) => {
                    channel
                        .update_card(posted, &buffer)
                        .await
                        .map_err(ReplyError::Delivery)?;
                    updates += 1;
                }
            }
        }

        match &card {
            None if buffer.trim().is_empty() => return Err(ReplyError::Empty),
            None => {
                channel
                    .post_card(target, &buffer)
                    .await
                    .map_err(ReplyError::Delivery)?;
                posts += 1;
            }
            Some(posted) if count % self.flush_every != 0 => {
                channel
                    .update_card(posted, &buffer)
                    .await
                    .map_err(ReplyError::Delivery)?;
                updates += 1;
            }
            Some(_) => {}
        }

        tracing::debug!(
            conversation_id = %target.conversation_id,
            fragments = count,
            posts,
            updates,
            "Reply streamed"
        );
        Ok(ReplySummary {
            text: buffer,
            fragments: count,
            posts,
            updates,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::testing::{target, RecordingChannel};
    use futures_util::stream;

    fn fragments(n: usize) -> FragmentStream {
        stream::iter((0..n).map(|i| Ok(format!("{} ", i)))).boxed()
    }

    fn expected_text(n: usize) -> String {
        (0..n).map(|i| format!("{} ", i)).collect()
    }

    #[tokio::test]
    async fn hundred_twenty_fragments_post_once_and_update_twice() {
        let channel = RecordingChannel::default();
        let summary = ReplyPipeline::new(50)
            .run(fragments(120), &channel, &target())
            .await
            .unwrap();

        assert_eq!((summary.posts, summary.updates), (1, 2));
        assert_eq!(channel.posts(), vec![expected_text(50)]);
        assert_eq!(
            channel.updates(),
            vec![expected_text(100), expected_text(120)]
        );
        assert_eq!(summary.text, expected_text(120));
    }

    #[tokio::test]
    async fn short_stream_posts_one_card_at_the_end() {
        let channel = RecordingChannel::default();
        let summary = ReplyPipeline::default()
            .run(fragments(10), &channel, &target())
            .await
            .unwrap();

        assert_eq!(channel.posts(), vec![expected_text(10)]);
        assert!(channel.updates().is_empty());
        assert_eq!(summary.fragments, 10);
    }

    #[tokio::test]
    async fn exact_boundary_needs_no_final_update() {
        let channel = RecordingChannel::default();
        let summary = ReplyPipeline::new(50)
            .run(fragments(100), &channel, &target())
            .await
            .unwrap();
        assert_eq!((summary.posts, summary.updates), (1, 1));
    }

    #[tokio::test]
    async fn empty_stream_posts_nothing_and_fails() {
        let channel = RecordingChannel::default();
        let err = ReplyPipeline::default()
            .run(fragments(0), &channel, &target())
            .await
            .unwrap_err();
        assert!(matches!(err, ReplyError::Empty));
        assert!(channel.posts().is_empty());
        assert!(channel.updates().is_empty());
    }

    #[tokio::test]
    async fn whitespace_only_stream_counts_as_empty() {
        let items: Vec<Result<String, ModelError>> = vec![Ok(" ".into()), Ok("\n".into())];
        let channel = RecordingChannel::default();
        let err = ReplyPipeline::default()
            .run(stream::iter(items).boxed(), &channel, &target())
            .await
            .unwrap_err();
        assert!(matches!(err, ReplyError::Empty));
        assert!(channel.posts().is_empty());
    }

    #[tokio::test]
    async fn upstream_error_aborts_without_further_delivery() {
        let items: Vec<Result<String, ModelError>> = (0..60)
            .map(|i| Ok(format!("{i}")))
            .chain(std::iter::once(Err(ModelError::Upstream("boom".into()))))
            .chain((0..60).map(|i| Ok(format!("{i}"))))
            .collect();
        let channel = RecordingChannel::default();
        let err = ReplyPipeline::new(50)
            .run(stream::iter(items).boxed(), &channel, &target())
            .await
            .unwrap_err();

        assert!(matches!(err, ReplyError::Model(ModelError::Upstream(_))));
        assert_eq!(channel.posts().len(), 1);
        assert!(channel.updates().is_empty());
    }

    #[tokio::test]
    async fn delivery_failure_is_reported() {
        let channel = RecordingChannel {
            fail_updates: true,
            ..Default::default()
        };
        let err = ReplyPipeline::new(5)
            .run(fragments(12), &channel, &target())
            .await
            .unwrap_err();
        assert!(matches!(err, ReplyError::Delivery(_)));
    }

    #[test]
    fn zero_cadence_is_clamped() {
        assert_eq!(ReplyPipeline::new(0).flush_every(), 1);
    }
}
