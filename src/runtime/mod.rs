//! Process wiring: builds every component from [`Config`] and runs the
//! gateway connection alongside a bounded pool of message handlers.

use crate::aws::secrets::{DingTalkCredential, SecretsClient};
use crate::aws::CredentialsProvider;
use crate::channels::{Ack, DingTalkChannel, DingTalkStreamClient, InboundEvent, InboundMessage};
use crate::config::{Config, HistoryBackendKind};
use crate::handler::MessageHandler;
use crate::history::{
    ChaChaCipher, DynamoDbTable, HistoryStore, JsonMessageCodec, MemoryTable, MessageCodec,
    SealedCodec, SqliteTable, TableBackend,
};
use crate::model::{BedrockClient, GenerationParams, ModelClient};
use crate::reply::ReplyPipeline;
use anyhow::Context;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;

#[async_trait]
pub trait EventHandler: Send + Sync + 'static {
    async fn handle(&self, message: &InboundMessage) -> Ack;
}

#[async_trait]
impl EventHandler for MessageHandler {
    async fn handle(&self, message: &InboundMessage) -> Ack {
        MessageHandler::handle(self, message).await
    }
}

/// Pull events off `rx` and handle each on its own task, at most
/// `max_in_flight` at a time. Returns once `rx` is closed and every worker
/// has finished.
pub async fn run_dispatch_loop<H: EventHandler>(
    mut rx: mpsc::Receiver<InboundEvent>,
    handler: Arc<H>,
    max_in_flight: usize,
) {
    let semaphore = Arc::new(Semaphore::new(max_in_flight.max(1)));
    let mut workers = JoinSet::new();

    while let Some(event) = rx.recv().await {
        let permit = match Arc::clone(&semaphore).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => break,
        };
        let handler = Arc::clone(&handler);
        workers.spawn(async move {
            let _permit = permit;
            let InboundEvent { message, ack } = event;
            let result = handler.handle(&message).await;
            if ack.send(result).is_err() {
                tracing::debug!(message_id = %message.message_id, "Ack receiver already gone");
            }
        });

        while let Some(result) = workers.try_join_next() {
            log_worker_join_result(result);
        }
    }

    while let Some(result) = workers.join_next().await {
        log_worker_join_result(result);
    }
}

fn log_worker_join_result(result: Result<(), tokio::task::JoinError>) {
    if let Err(e) = result {
        tracing::error!("Message worker crashed: {e}");
    }
}

pub fn build_codec(config: &Config) -> anyhow::Result<Arc<dyn MessageCodec>> {
    Ok(match &config.history.encryption_key {
        Some(key) => {
            let cipher = ChaChaCipher::from_hex(key).context("invalid history encryption key")?;
            Arc::new(SealedCodec::new(JsonMessageCodec, cipher))
        }
        None => Arc::new(JsonMessageCodec),
    })
}

pub fn build_history(
    config: &Config,
    credentials: Arc<CredentialsProvider>,
) -> anyhow::Result<HistoryStore> {
    let backend: Arc<dyn TableBackend> = match config.history.backend {
        HistoryBackendKind::Dynamodb => {
            let region = config.history_region();
            let endpoint = config
                .history
                .endpoint
                .clone()
                .unwrap_or_else(|| crate::aws::regional_endpoint("dynamodb", &region));
            Arc::new(DynamoDbTable::with_endpoint(
                credentials,
                &region,
                endpoint,
                &config.history.table_name,
                &config.history.primary_key,
            ))
        }
        HistoryBackendKind::Sqlite => {
            let path = SqliteTable::default_db_path(&config.history.sqlite_dir);
            Arc::new(
                SqliteTable::open(&path)
                    .with_context(|| format!("failed to open {}", path.display()))?,
            )
        }
        HistoryBackendKind::Memory => Arc::new(MemoryTable::new()),
    };
    tracing::info!(
        backend = backend.name(),
        table = %config.history.table_name,
        "History store ready"
    );
    Ok(HistoryStore::new(backend, build_codec(config)?))
}

pub fn build_model(config: &Config, credentials: Arc<CredentialsProvider>) -> BedrockClient {
    let params = GenerationParams {
        max_tokens: config.model.max_tokens,
        temperature: config.model.temperature,
        top_p: config.model.top_p,
    };
    let region = config.model_region();
    match &config.model.endpoint {
        Some(endpoint) => BedrockClient::with_endpoint(
            credentials,
            &region,
            endpoint.as_str(),
            &config.model.model_id,
            params,
        ),
        None => BedrockClient::new(credentials, &region, &config.model.model_id, params),
    }
}

/// App key pair from config/env when present, otherwise from Secrets Manager.
pub async fn resolve_dingtalk_credential(
    config: &Config,
    credentials: Arc<CredentialsProvider>,
) -> anyhow::Result<DingTalkCredential> {
    if let (Some(app_key), Some(app_secret)) = (&config.dingtalk.app_key, &config.dingtalk.app_secret)
    {
        return Ok(DingTalkCredential {
            app_key: app_key.clone(),
            app_secret: app_secret.clone(),
        });
    }
    SecretsClient::new(credentials, &config.dingtalk.secret_region)
        .dingtalk_credential(&config.dingtalk.secret_name)
        .await
        .with_context(|| {
            format!(
                "failed to load DingTalk credential {} in {}",
                config.dingtalk.secret_name, config.dingtalk.secret_region
            )
        })
}

pub async fn run(config: Config) -> anyhow::Result<()> {
    let aws_credentials = Arc::new(CredentialsProvider::from_environment());

    let model = build_model(&config, Arc::clone(&aws_credentials));
    model
        .ensure_supported()
        .context("refusing to start with an unsupported model")?;
    let history = Arc::new(build_history(&config, Arc::clone(&aws_credentials))?);
    let dingtalk = resolve_dingtalk_credential(&config, Arc::clone(&aws_credentials)).await?;

    let channel = Arc::new(DingTalkChannel::with_api_base(
        dingtalk.app_key.clone(),
        dingtalk.app_secret.clone(),
        &config.dingtalk.api_base,
    ));
    let model: Arc<dyn ModelClient> = Arc::new(model);
    let handler = Arc::new(MessageHandler::new(
        model,
        history,
        channel,
        ReplyPipeline::new(config.runtime.flush_every),
        config.history_limit(),
    ));
    let gateway = DingTalkStreamClient::new(
        dingtalk.app_key,
        dingtalk.app_secret,
        &config.dingtalk.api_base,
        Duration::from_secs(config.dingtalk.ack_deadline_secs),
    );

    let workers = config.worker_count();
    tracing::info!(
        model_id = %config.model.model_id,
        workers,
        history_limit = config.history_limit(),
        "dingbot starting"
    );

    let (tx, rx) = mpsc::channel(config.runtime.queue_capacity);
    let dispatcher = tokio::spawn(run_dispatch_loop(rx, handler, workers));

    tokio::select! {
        () = gateway.run_forever(tx) => {
            tracing::warn!("DingTalk gateway stopped");
        }
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for shutdown signal")?;
            tracing::info!("Shutdown requested, draining in-flight messages");
        }
    }

    if let Err(e) = dispatcher.await {
        tracing::error!("Dispatcher crashed: {e}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::ConversationType;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::oneshot;

    struct SlowHandler {
        active: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl EventHandler for SlowHandler {
        async fn handle(&self, _message: &InboundMessage) -> Ack {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            Ack::ok()
        }
    }

    fn message(i: usize) -> InboundMessage {
        InboundMessage {
            message_id: format!("m{i}"),
            conversation_id: format!("c{i}"),
            conversation_type: ConversationType::Single,
            sender_id: "s".into(),
            sender_staff_id: "staff".into(),
            sender_nick: "n".into(),
            text: "hi".into(),
            session_webhook: String::new(),
            robot_code: String::new(),
        }
    }

    #[tokio::test]
    async fn dispatch_loop_bounds_concurrency_and_acks_every_event() {
        let handler = Arc::new(SlowHandler {
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let (tx, rx) = mpsc::channel(32);
        let loop_handle = tokio::spawn(run_dispatch_loop(rx, Arc::clone(&handler), 2));

        let mut acks = Vec::new();
        for i in 0..8 {
            let (ack_tx, ack_rx) = oneshot::channel();
            tx.send(InboundEvent {
                message: message(i),
                ack: ack_tx,
            })
            .await
            .unwrap();
            acks.push(ack_rx);
        }
        drop(tx);

        for ack in acks {
            assert_eq!(ack.await.unwrap(), Ack::ok());
        }
        loop_handle.await.unwrap();
        assert!(handler.peak.load(Ordering::SeqCst) <= 2);
        assert!(handler.peak.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn memory_backend_is_selectable() {
        let mut config = Config::default();
        config.history.backend = HistoryBackendKind::Memory;
        let store = build_history(
            &config,
            Arc::new(CredentialsProvider::fixed(crate::aws::AwsCredentials::new(
                "a", "b", None,
            ))),
        )
        .unwrap();
        assert_eq!(store.backend_name(), "memory");
    }

    #[test]
    fn sealed_codec_is_selected_when_a_key_is_configured() {
        let mut config = Config::default();
        config.history.encryption_key = Some("11".repeat(32));
        let codec = build_codec(&config).unwrap();
        let entry = codec
            .encode(&crate::history::ChatMessage::human("x"))
            .unwrap();
        assert_eq!(entry["type"], "sealed");
    }

    #[tokio::test]
    async fn configured_app_key_skips_secrets_manager() {
        let mut config = Config::default();
        config.dingtalk.app_key = Some("key".into());
        config.dingtalk.app_secret = Some("secret".into());
        let credential = resolve_dingtalk_credential(
            &config,
            Arc::new(CredentialsProvider::fixed(crate::aws::AwsCredentials::new(
                "a", "b", None,
            ))),
        )
        .await
        .unwrap();
        assert_eq!(credential.app_key, "key");
        assert_eq!(credential.app_secret, "secret");
    }
}
