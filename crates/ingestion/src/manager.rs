//! Ingest manager — connects to NATS and supervises one worker per log
//! partition.

use std::sync::Arc;

use sendflow_core::config::{IngestionConfig, NatsConfig};
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::processor::IngestProcessor;
use crate::worker::IngestWorker;

pub struct IngestManager {
    nats: NatsConfig,
    ingestion: IngestionConfig,
    node_id: String,
    processor: Arc<IngestProcessor>,
    handles: Vec<JoinHandle<()>>,
}

impl IngestManager {
    pub fn new(
        nats: NatsConfig,
        ingestion: IngestionConfig,
        node_id: String,
        processor: Arc<IngestProcessor>,
    ) -> Self {
        Self {
            nats,
            ingestion,
            node_id,
            processor,
            handles: Vec::new(),
        }
    }

    /// Connect to NATS and spawn one worker per partition.
    pub async fn start(&mut self) -> anyhow::Result<()> {
        let nats_url = self
            .nats
            .urls
            .first()
            .cloned()
            .unwrap_or_else(|| "nats://localhost:4222".to_string());

        info!(url = %nats_url, "Connecting to NATS");

        let nats_client = async_nats::ConnectOptions::new()
            .max_reconnects(Some(self.nats.max_reconnects))
            .connect(&nats_url)
            .await?;

        info!("NATS connection established");

        for partition in 0..self.nats.partitions {
            let worker_id = format!("{}-ingest-{:02}", self.node_id, partition);
            let worker = IngestWorker::new(
                worker_id.clone(),
                partition,
                self.processor.clone(),
                self.nats.dlq_subject.clone(),
                self.ingestion.clone(),
            );
            let handle = worker.spawn(nats_client.clone(), self.nats.partition_subject(partition));
            self.handles.push(handle);
            info!(worker_id = %worker_id, "ingest worker spawned");
        }

        info!(
            count = self.nats.partitions,
            node = %self.node_id,
            "all ingest workers started"
        );
        Ok(())
    }

    /// Wait for all workers to complete (blocks until shutdown).
    pub async fn wait(&mut self) {
        for handle in self.handles.drain(..) {
            if let Err(e) = handle.await {
                error!(error = %e, "ingest worker task panicked");
            }
        }
    }

    pub fn worker_count(&self) -> usize {
        self.handles.len()
    }
}
