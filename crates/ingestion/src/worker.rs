//! Partition worker — a Tokio task that consumes one partition's subject,
//! processes messages strictly in order, retries transient failures with
//! jittered backoff, and dead-letters poison on first occurrence.

use std::sync::Arc;

use chrono::Utc;
use rand::Rng;
use sendflow_core::config::IngestionConfig;
use sendflow_core::error::{SendFlowError, SendFlowResult};
use sendflow_core::types::DeadLetter;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tracing::{error, info, warn};

use crate::processor::IngestProcessor;

pub struct IngestWorker {
    pub worker_id: String,
    partition: u32,
    processor: Arc<IngestProcessor>,
    dlq_subject: String,
    config: IngestionConfig,
}

impl IngestWorker {
    pub fn new(
        worker_id: String,
        partition: u32,
        processor: Arc<IngestProcessor>,
        dlq_subject: String,
        config: IngestionConfig,
    ) -> Self {
        Self {
            worker_id,
            partition,
            processor,
            dlq_subject,
            config,
        }
    }

    /// Spawn this worker as a Tokio task consuming its partition subject.
    /// Work within the partition is strictly serial.
    pub fn spawn(self, nats_client: async_nats::Client, subject: String) -> JoinHandle<()> {
        let worker_id = self.worker_id.clone();

        tokio::spawn(async move {
            info!(
                worker_id = %worker_id,
                partition = self.partition,
                subject = %subject,
                "ingest worker started"
            );

            let subscriber = match nats_client.subscribe(subject.clone()).await {
                Ok(sub) => sub,
                Err(e) => {
                    error!(worker_id = %worker_id, error = %e, "failed to subscribe to NATS");
                    return;
                }
            };

            self.run(nats_client, subscriber).await;
        })
    }

    async fn run(self, nats_client: async_nats::Client, mut subscriber: async_nats::Subscriber) {
        // Core NATS carries no offsets; a per-worker counter stands in so
        // DLQ payloads remain traceable to a position in the partition.
        let mut offset: u64 = 0;

        while let Some(msg) = subscriber.next().await {
            offset += 1;
            match self.process_with_retry(&msg.payload).await {
                Ok(()) => {}
                Err(e) => {
                    self.dead_letter(&nats_client, &msg.payload, offset, &e).await;
                }
            }
        }

        warn!(worker_id = %self.worker_id, "NATS subscription ended");
    }

    /// Retryable failures back off exponentially with jitter up to the
    /// configured attempt limit; poison fails immediately.
    async fn process_with_retry(&self, payload: &[u8]) -> SendFlowResult<()> {
        let mut attempt = 0u32;
        loop {
            match self.processor.process_payload(payload).await {
                Ok(_) => return Ok(()),
                Err(e) if e.is_retryable() && attempt < self.config.max_retries => {
                    attempt += 1;
                    metrics::counter!("ingest.retries").increment(1);
                    let delay = backoff_delay(attempt, &self.config);
                    warn!(
                        worker_id = %self.worker_id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "retrying transient ingest failure"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn dead_letter(
        &self,
        nats_client: &async_nats::Client,
        payload: &[u8],
        offset: u64,
        error: &SendFlowError,
    ) {
        metrics::counter!("ingest.dlq").increment(1);
        let letter = DeadLetter {
            error: format!("{}: {}", error.code(), error),
            original_key: None,
            original_value: String::from_utf8_lossy(payload).to_string(),
            partition: self.partition,
            offset,
            ingested_at: Utc::now(),
        };
        let body = match serde_json::to_vec(&letter) {
            Ok(body) => body,
            Err(e) => {
                error!(worker_id = %self.worker_id, error = %e, "failed to serialize dead letter");
                return;
            }
        };
        if let Err(e) = nats_client
            .publish(self.dlq_subject.clone(), body.into())
            .await
        {
            error!(worker_id = %self.worker_id, error = %e, "failed to publish dead letter");
        } else {
            warn!(
                worker_id = %self.worker_id,
                partition = self.partition,
                offset,
                "message dead-lettered"
            );
        }
    }
}

/// Exponential backoff with uniform jitter, capped at the configured
/// maximum.
pub(crate) fn backoff_delay(attempt: u32, config: &IngestionConfig) -> std::time::Duration {
    let exp = config
        .retry_base_ms
        .saturating_mul(1u64 << attempt.min(16))
        .min(config.retry_max_ms);
    let jitter = rand::thread_rng().gen_range(0..=config.retry_base_ms);
    std::time::Duration::from_millis(exp + jitter)
}
