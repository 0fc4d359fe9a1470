//! `AuditPipeline`: the single owned struct that wires together C1-C10 and
//! exposes the library's public surface (`init`, `wrap_llm`, `decrypt_bundle`,
//! `metrics_registry`, `shutdown`). Kept as a single struct passed around by
//! `Arc` handle rather than process-global statics, so multiple independent
//! pipelines (e.g. in tests) never share state.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::batcher::Batcher;
use crate::chain::HashChain;
use crate::encryptor::Encryptor;
use crate::error::{AuditError, Result};
use crate::keyring::{build_keyring, Keyring};
use crate::metrics::PipelineMetrics;
use crate::outbox::Outbox;
use crate::record::{EncryptedBundle, Record};
use crate::ring_buffer::RingBuffer;
use crate::shutdown::{ShutdownCoordinator, ShutdownState};
use crate::transport::Transport;
use crate::config::PipelineConfig;

const SDK_NAME: &str = "traceprompt-audit";
const SDK_VERSION: &str = env!("CARGO_PKG_VERSION");
const DRAIN_DEADLINE: Duration = Duration::from_secs(30);

pub struct AuditPipeline {
    pub(crate) config: PipelineConfig,
    pub(crate) chain: HashChain,
    pub(crate) encryptor: Encryptor,
    pub(crate) keyring: Box<dyn Keyring>,
    outbox: Arc<Outbox>,
    batcher: Arc<Batcher>,
    pub(crate) metrics: Arc<PipelineMetrics>,
    shutdown: Arc<ShutdownCoordinator>,
    /// `Some(e)` once the shutdown drain gives up with records still
    /// outstanding (the data-loss case); `None` while running and if the
    /// drain completed cleanly. Read by `shutdown()` to decide whether to
    /// return `Err` so embedders can map it to a non-zero exit code.
    drain_outcome: Mutex<Option<AuditError>>,
}

impl AuditPipeline {
    /// Build and start a pipeline from an already-validated config: opens
    /// the outbox, builds the keyring, spawns the periodic flush loop and
    /// OS signal watcher. Idempotent per `AuditPipeline` instance — call it
    /// once per embedder process and share the returned handle.
    pub async fn init(config: PipelineConfig) -> Result<Arc<Self>> {
        config.validate()?;

        let metrics = PipelineMetrics::new();
        let outbox = Arc::new(Outbox::open(&config.data_dir, metrics.clone()).await?);
        let ring = Arc::new(RingBuffer::new(2 * config.batch_size, metrics.clone()));
        let transport = Arc::new(Transport::new(
            config.ingest_url.clone(),
            config.api_key.clone(),
            SDK_NAME,
            SDK_VERSION,
        )?);
        let batcher = Batcher::new(
            config.tenant_id.clone(),
            config.batch_size,
            ring,
            outbox.clone(),
            transport,
            metrics.clone(),
        );

        let kms_client = if config.cmk_arn == "local-dev" {
            None
        } else {
            let aws_cfg = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
            Some(aws_sdk_kms::Client::new(&aws_cfg))
        };
        let keyring = build_keyring(&config.cmk_arn, kms_client)?;

        let pipeline = Arc::new(Self {
            chain: HashChain::new(),
            encryptor: Encryptor::new(metrics.clone()),
            keyring,
            outbox,
            batcher,
            metrics,
            shutdown: ShutdownCoordinator::new(),
            drain_outcome: Mutex::new(None),
            config,
        });

        tokio::spawn(pipeline.clone().watch_os_signals());
        tokio::spawn(pipeline.clone().flush_loop());

        Ok(pipeline)
    }

    async fn watch_os_signals(self: Arc<Self>) {
        self.shutdown.clone().watch_os_signals().await;
    }

    /// Periodic flush timer and drain-on-shutdown loop (the "coordinator
    /// task" a shutdown event is dispatched to).
    async fn flush_loop(self: Arc<Self>) {
        let mut rx = self.shutdown.subscribe();
        let mut ticker = tokio::time::interval(Duration::from_millis(self.config.flush_interval_ms));

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.batcher.flush_once().await {
                        tracing::warn!(error = %e, "periodic flush failed");
                    }
                }
                changed = rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    if *rx.borrow() == ShutdownState::Draining {
                        break;
                    }
                }
            }
        }

        tracing::info!("draining outstanding records before shutdown");
        if let Err(e) = self.batcher.drain_to_empty(self.config.max_retries, DRAIN_DEADLINE).await {
            tracing::error!(error = %e, "drain did not complete before deadline, records may be lost");
            *self.drain_outcome.lock() = Some(e);
        }
        self.shutdown.mark_stopped();
    }

    /// Durably append a record to the outbox, then hand it to the batcher
    /// for delivery. Rejects once shutdown has begun.
    pub(crate) async fn enqueue(&self, record: Record) -> Result<()> {
        if self.shutdown.is_draining_or_stopped() {
            return Err(AuditError::Shutdown);
        }
        self.outbox.append(&record).await?;
        self.batcher.enqueue(record);
        Ok(())
    }

    /// Decrypt a previously captured bundle. For audit tooling use, not the
    /// ingest hot path.
    pub async fn decrypt_bundle(&self, bundle: &EncryptedBundle) -> Result<Vec<u8>> {
        self.encryptor.decrypt(self.keyring.as_ref(), bundle).await
    }

    /// Process-wide Prometheus registry handle for embedders to scrape or
    /// merge into their own registry.
    pub fn metrics_registry(&self) -> &prometheus::Registry {
        self.metrics.registry()
    }

    /// Begin graceful shutdown: stop accepting new records, drain the
    /// outbox and ring buffer, and wait (up to a fixed deadline) for the
    /// `Stopped` state. Safe to call more than once.
    ///
    /// Returns `Err` if the drain gave up with records still outstanding
    /// (data loss) so the embedder can map that to a non-zero exit code, per
    /// spec.md §4.10/§7 ("exit code 0 if drain completed, 1 otherwise").
    pub async fn shutdown(&self) -> Result<()> {
        self.shutdown.begin_drain();
        let mut rx = self.shutdown.subscribe();
        while *rx.borrow() != ShutdownState::Stopped {
            if rx.changed().await.is_err() {
                break;
            }
        }
        match self.drain_outcome.lock().clone() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    #[cfg(test)]
    pub(crate) fn shutdown_state(&self) -> ShutdownState {
        self.shutdown.state()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::CallMeta;
    use crate::record::ModelVendor;
    use serde_json::json;
    use tempfile::tempdir;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn test_config(server: &MockServer, dir: &tempfile::TempDir) -> PipelineConfig {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        std::env::set_var("LOCAL_DEV_KEK", hex::encode([5u8; 32]));
        PipelineConfig {
            data_dir: dir.path().to_path_buf(),
            tenant_id: "tenant-a".into(),
            api_key: "key".into(),
            ingest_url: url::Url::parse(&server.uri()).unwrap(),
            cmk_arn: "local-dev".into(),
            batch_size: 10,
            flush_interval_ms: 50,
            static_meta: Default::default(),
            log_level: "info".into(),
            max_retries: 3,
        }
    }

    #[tokio::test]
    async fn wrap_llm_captures_and_delivers_a_successful_call() {
        let server = MockServer::start().await;
        Mock::given(method("POST")).and(path("/v1/ingest")).respond_with(ResponseTemplate::new(200)).mount(&server).await;
        let dir = tempdir().unwrap();

        let pipeline = AuditPipeline::init(test_config(&server, &dir).await).await.unwrap();

        let meta = CallMeta {
            model_vendor: ModelVendor::Openai,
            model_name: "gpt-test".into(),
            user_id: None,
            prompt_tokens: 3,
            response_tokens: 4,
        };
        let result: Result<serde_json::Value> = pipeline
            .wrap_llm(json!({"q": "hi"}), meta, || async { Ok(json!({"a": "hello"})) })
            .await;
        assert_eq!(result.unwrap(), json!({"a": "hello"}));

        pipeline.shutdown().await.unwrap();
        assert_eq!(pipeline.shutdown_state(), ShutdownState::Stopped);
    }

    #[tokio::test]
    async fn enqueue_after_shutdown_is_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("POST")).and(path("/v1/ingest")).respond_with(ResponseTemplate::new(200)).mount(&server).await;
        let dir = tempdir().unwrap();

        let pipeline = AuditPipeline::init(test_config(&server, &dir).await).await.unwrap();
        pipeline.shutdown().await.unwrap();

        let record = Record {
            id: uuid::Uuid::new_v4(),
            tenant_id: "tenant-a".into(),
            model_vendor: ModelVendor::Openai,
            model_name: "gpt".into(),
            user_id: None,
            ts_client: chrono::Utc::now(),
            latency_ms: 1.0,
            prompt_tokens: 1,
            response_tokens: 1,
            static_meta: Default::default(),
            enc: EncryptedBundle { ciphertext: "c".into(), encrypted_data_key: "k".into(), suite_id: 1 },
            prev_hash: None,
            leaf_hash: "h".into(),
        };
        let err = pipeline.enqueue(record).await.unwrap_err();
        assert!(matches!(err, AuditError::Shutdown));
    }
}
