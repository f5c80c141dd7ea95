//! One signature-type pipeline: processor, broker manager, fan-out and
//! metadata reporter wired together with an ordered shutdown.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, Instrument};

use publisher_signer::{SignatureType, Signer};

use crate::config::AgentConfig;
use crate::error::AgentError;
use crate::manager::{BrokerTable, ConnectionManager};
use crate::metadata::{PublisherMetadata, PublisherMetadataReporter};
use crate::model::{SignedPriceUpdateBatch, ValueUpdate};
use crate::processor::{ProcessorConfig, ValueUpdateProcessor, SIGN_QUEUE_CAPACITY};
use crate::registry::BrokerRegistry;

/// Depth of each pipeline's value update input channel
pub const VALUE_UPDATE_CHANNEL_CAPACITY: usize = 4096;

pub struct PublisherAgentRunner {
    signer: Arc<dyn Signer>,
    processor_config: ProcessorConfig,
    manager: Arc<ConnectionManager>,
    registry_refresh_interval: Duration,
    metadata: Option<PublisherMetadataReporter>,
    value_tx: mpsc::Sender<ValueUpdate>,
    value_rx: mpsc::Receiver<ValueUpdate>,
}

impl PublisherAgentRunner {
    pub fn new(
        config: &AgentConfig,
        signer: Arc<dyn Signer>,
        registry: Arc<dyn BrokerRegistry>,
    ) -> Result<Self, AgentError> {
        let signature_type = signer.signature_type();
        let publisher_key = signer.publisher_key().to_string();

        let processor_config = ProcessorConfig {
            oracle_id: config.keys.oracle_id.clone(),
            num_pipelines: config.signature_types.len(),
            clock_period: config.clock_period,
            delta_check_period: config.delta_check_period,
            change_threshold_proportion: config.change_threshold_proportion,
            sign_every_update: config.sign_every_update,
        };
        let manager = Arc::new(ConnectionManager::new(
            registry,
            publisher_key.clone(),
            Some(config.keys.registry_auth.clone()),
            config.broker_reconnect_delay,
        ));
        let metadata = PublisherMetadataReporter::new(
            &config.publisher_metadata_base_url,
            config.keys.registry_auth.clone(),
            PublisherMetadata::current(publisher_key, signature_type),
            config.publisher_metadata_refresh_interval,
        )?;
        let (value_tx, value_rx) = mpsc::channel(VALUE_UPDATE_CHANNEL_CAPACITY);

        Ok(Self {
            signer,
            processor_config,
            manager,
            registry_refresh_interval: config.registry_refresh_interval,
            metadata: Some(metadata),
            value_tx,
            value_rx,
        })
    }

    /// Skip publisher metadata reports
    pub fn without_metadata(mut self) -> Self {
        self.metadata = None;
        self
    }

    pub fn signature_type(&self) -> SignatureType {
        self.signer.signature_type()
    }

    /// Input side of this pipeline. The pipeline also stops once every
    /// sender is dropped.
    pub fn value_sender(&self) -> mpsc::Sender<ValueUpdate> {
        self.value_tx.clone()
    }

    pub fn broker_table(&self) -> Arc<BrokerTable> {
        self.manager.table()
    }

    /// Run until `shutdown` fires or the input closes. Shutdown order:
    /// input stops, the processor drains and flushes its last batch, the
    /// fan-out forwards it, then broker connections close.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), AgentError> {
        let span = info_span!("pipeline", signature_type = %self.signer.signature_type());
        self.run_pipeline(shutdown).instrument(span).await
    }

    async fn run_pipeline(self, shutdown: CancellationToken) -> Result<(), AgentError> {
        let Self {
            signer,
            processor_config,
            manager,
            registry_refresh_interval,
            metadata,
            value_tx,
            value_rx,
        } = self;
        drop(value_tx);
        info!(publisher_key = %signer.publisher_key(), "Starting publisher agent pipeline");

        // also stops the background loops when the input closes on its own
        let background = shutdown.child_token();
        let (batch_tx, batch_rx) = mpsc::channel::<SignedPriceUpdateBatch>(SIGN_QUEUE_CAPACITY);

        let refresher = tokio::spawn({
            let manager = Arc::clone(&manager);
            let stop = background.clone();
            async move { manager.run_refresher(registry_refresh_interval, stop).await }
                .in_current_span()
        });
        let fan_out = tokio::spawn({
            let manager = Arc::clone(&manager);
            async move { manager.run_fan_out(batch_rx).await }.in_current_span()
        });
        let reporter = metadata.map(|reporter| {
            let stop = background.clone();
            tokio::spawn(async move { reporter.run(stop).await }.in_current_span())
        });

        let processor = ValueUpdateProcessor::new(signer, processor_config);
        let result = processor.run(value_rx, batch_tx, shutdown).await;

        if let Err(e) = fan_out.await {
            error!(error = %e, "Fan-out task failed");
        }
        background.cancel();
        if let Err(e) = refresher.await {
            error!(error = %e, "Broker refresher task failed");
        }
        if let Some(reporter) = reporter {
            if let Err(e) = reporter.await {
                error!(error = %e, "Metadata reporter task failed");
            }
        }
        manager.shutdown().await;

        info!("Pipeline stopped");
        result
    }
}

impl std::fmt::Debug for PublisherAgentRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PublisherAgentRunner")
            .field("signature_type", &self.signer.signature_type())
            .field("processor", &self.processor_config)
            .field("manager", &self.manager)
            .finish()
    }
}
