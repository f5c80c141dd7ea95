//! Trigger engine, signing pool and batcher
//!
//! The event loop is the only owner of per-asset state, so the latest value
//! and delta-baseline maps need no locking. Signing is CPU bound and runs on
//! dedicated `std::thread`s pulling from one bounded queue; a single async
//! batcher folds their output into per-window batches.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::{interval, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use publisher_signer::{Signer, SignerError};

use crate::error::AgentError;
use crate::model::{
    AssetId, OracleId, SignedPrice, SignedPriceUpdate, SignedPriceUpdateBatch, TriggerType,
    ValueUpdate, ValueUpdateWithTrigger,
};
use crate::quantize::quantize;

/// Depth of the signing queue and of the signed-result channel
pub const SIGN_QUEUE_CAPACITY: usize = 4096;

/// Flush period for signed batches
pub const SIGNED_BATCH_PERIOD: Duration = Duration::from_millis(1);

#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    pub oracle_id: OracleId,
    /// Signature-type pipelines sharing this host's CPUs
    pub num_pipelines: usize,
    /// Zero disables clock triggers
    pub clock_period: Duration,
    pub delta_check_period: Duration,
    /// Relative change (0-1) that makes an update significant
    pub change_threshold_proportion: f64,
    /// Sign every raw update instead of running delta checks
    pub sign_every_update: bool,
}

pub struct ValueUpdateProcessor {
    signer: Arc<dyn Signer>,
    config: ProcessorConfig,
    latest_values: HashMap<AssetId, ValueUpdate>,
    last_reported: HashMap<AssetId, f64>,
}

impl ValueUpdateProcessor {
    pub fn new(signer: Arc<dyn Signer>, config: ProcessorConfig) -> Self {
        Self {
            signer,
            config,
            latest_values: HashMap::new(),
            last_reported: HashMap::new(),
        }
    }

    /// Store the newest value for its asset. In sign-every-update mode the
    /// update is also returned for immediate signing.
    pub fn record_update(&mut self, update: ValueUpdate) -> Option<ValueUpdateWithTrigger> {
        let immediate = self.config.sign_every_update.then(|| ValueUpdateWithTrigger {
            update: update.clone(),
            trigger: TriggerType::Unspecified,
        });
        self.latest_values.insert(update.asset.clone(), update);
        immediate
    }

    /// Assets whose value moved past the threshold since last reported.
    /// The first observation of an asset always counts. Emitted values
    /// become the new baseline.
    pub fn delta_update(&mut self) -> Vec<ValueUpdateWithTrigger> {
        let threshold = self.config.change_threshold_proportion;
        let mut significant = Vec::new();

        for (asset, update) in &self.latest_values {
            let current = as_f64(&update.value);
            let is_significant = match self.last_reported.get(asset) {
                None => true,
                Some(&last) => exceeds_threshold(last, current, threshold),
            };
            if is_significant {
                self.last_reported.insert(asset.clone(), current);
                significant.push(ValueUpdateWithTrigger {
                    update: update.clone(),
                    trigger: TriggerType::Delta,
                });
            }
        }
        significant
    }

    /// Every tracked asset re-stamped with the current wall-clock time.
    /// Leaves the delta baseline alone.
    pub fn clock_update(&self) -> Vec<ValueUpdateWithTrigger> {
        let now_ns = chrono::Utc::now()
            .timestamp_nanos_opt()
            .unwrap_or(i64::MAX);

        self.latest_values
            .values()
            .map(|update| ValueUpdateWithTrigger {
                update: ValueUpdate {
                    publish_timestamp_ns: now_ns,
                    ..update.clone()
                },
                trigger: TriggerType::Clock,
            })
            .collect()
    }

    pub fn tracked_assets(&self) -> usize {
        self.latest_values.len()
    }

    /// Run until `shutdown` fires or `value_rx` closes, then drain the
    /// signing queue and flush the final batch before returning.
    pub async fn run(
        mut self,
        mut value_rx: mpsc::Receiver<ValueUpdate>,
        batch_tx: mpsc::Sender<SignedPriceUpdateBatch>,
        shutdown: CancellationToken,
    ) -> Result<(), AgentError> {
        let (sign_tx, sign_rx) = mpsc::channel(SIGN_QUEUE_CAPACITY);
        let (signed_tx, signed_rx) = mpsc::channel(SIGN_QUEUE_CAPACITY);

        let worker_count = signing_worker_count(self.config.num_pipelines);
        info!(workers = worker_count, "Starting signing workers");
        let workers = spawn_signing_workers(
            worker_count,
            sign_rx,
            signed_tx,
            Arc::clone(&self.signer),
            self.config.oracle_id.clone(),
        )?;
        let batcher = tokio::spawn(run_batcher(signed_rx, batch_tx));

        let mut clock = ticker(self.config.clock_period);
        let mut delta = if self.config.sign_every_update {
            None
        } else {
            ticker(self.config.delta_check_period)
        };

        let result = loop {
            let to_sign: Vec<ValueUpdateWithTrigger> = tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Shutdown requested, draining signing queue");
                    break Ok(());
                }
                maybe = value_rx.recv() => match maybe {
                    Some(update) => self.record_update(update).into_iter().collect(),
                    None => {
                        info!("Value update channel closed, draining signing queue");
                        break Ok(());
                    }
                },
                _ = next_tick(&mut clock) => self.clock_update(),
                _ = next_tick(&mut delta) => self.delta_update(),
            };

            if let Err(e) = enqueue(&sign_tx, to_sign).await {
                break Err(e);
            }
        };

        // closing the queue lets workers exit once it is empty, which in
        // turn closes the signed channel and triggers the final flush
        drop(sign_tx);
        match tokio::task::spawn_blocking(move || {
            workers
                .into_iter()
                .map(|handle| handle.join())
                .filter(|joined| joined.is_err())
                .count()
        })
        .await
        {
            Ok(0) => {}
            Ok(panicked) => error!(panicked, "Signing workers panicked"),
            Err(e) => error!(error = %e, "Failed to join signing workers"),
        }
        if let Err(e) = batcher.await {
            error!(error = %e, "Batcher task failed");
        }

        info!("Processor stopped");
        result
    }
}

async fn enqueue(
    sign_tx: &mpsc::Sender<ValueUpdateWithTrigger>,
    updates: Vec<ValueUpdateWithTrigger>,
) -> Result<(), AgentError> {
    for update in updates {
        sign_tx
            .send(update)
            .await
            .map_err(|_| AgentError::Task("signing workers exited".to_string()))?;
    }
    Ok(())
}

/// Relative-change test with zero handling: from zero, any nonzero value is
/// significant and zero never is.
pub fn exceeds_threshold(last: f64, current: f64, threshold: f64) -> bool {
    if last == 0.0 {
        return current != 0.0;
    }
    ((current - last) / last).abs() > threshold
}

// float imprecision is fine for change detection
fn as_f64(value: &Decimal) -> f64 {
    value.to_f64().unwrap_or(0.0)
}

fn ticker(period: Duration) -> Option<Interval> {
    if period.is_zero() {
        return None;
    }
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    Some(ticker)
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// CPUs divided across concurrently running pipelines, at least one
pub fn signing_worker_count(num_pipelines: usize) -> usize {
    let cpus = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    (cpus / num_pipelines.max(1)).max(1)
}

fn spawn_signing_workers(
    count: usize,
    sign_rx: mpsc::Receiver<ValueUpdateWithTrigger>,
    signed_tx: mpsc::Sender<SignedPriceUpdate>,
    signer: Arc<dyn Signer>,
    oracle_id: OracleId,
) -> Result<Vec<JoinHandle<()>>, AgentError> {
    let queue = Arc::new(Mutex::new(sign_rx));
    let mut handles = Vec::with_capacity(count);

    for worker in 0..count {
        let queue = Arc::clone(&queue);
        let signed_tx = signed_tx.clone();
        let signer = Arc::clone(&signer);
        let oracle_id = oracle_id.clone();
        let span = tracing::Span::current();

        let handle = std::thread::Builder::new()
            .name(format!("signer-{}", worker))
            .spawn(move || {
                let _entered = span.enter();
                run_signing_worker(worker, &queue, &signed_tx, signer.as_ref(), &oracle_id);
            })?;
        handles.push(handle);
    }
    Ok(handles)
}

fn run_signing_worker(
    worker: usize,
    queue: &Mutex<mpsc::Receiver<ValueUpdateWithTrigger>>,
    signed_tx: &mpsc::Sender<SignedPriceUpdate>,
    signer: &dyn Signer,
    oracle_id: &str,
) {
    loop {
        let next = match queue.lock() {
            Ok(mut rx) => rx.blocking_recv(),
            Err(poisoned) => poisoned.into_inner().blocking_recv(),
        };
        let Some(item) = next else {
            break;
        };

        let started = Instant::now();
        let asset = item.update.asset.clone();
        let publish_ts = item.update.publish_timestamp_ns;

        match sign_update(signer, oracle_id, item) {
            Ok(signed) => {
                if signed_tx.blocking_send(signed).is_err() {
                    break;
                }
                let now_ns = chrono::Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX);
                debug!(
                    worker,
                    asset = %asset,
                    elapsed_us = started.elapsed().as_micros() as u64,
                    age_ms = now_ns.saturating_sub(publish_ts) / 1_000_000,
                    "Signed update"
                );
            }
            // dropped without retry; a fresher value will follow
            Err(e) => error!(worker, asset = %asset, error = %e, "Failed to sign update"),
        }
    }
    debug!(worker, "Signing worker exiting");
}

/// Quantize and sign one selected update
pub fn sign_update(
    signer: &dyn Signer,
    oracle_id: &str,
    item: ValueUpdateWithTrigger,
) -> Result<SignedPriceUpdate, SignerError> {
    let quantized = quantize(&item.update.value);
    let signature = signer.sign_publisher_price(
        item.update.publish_timestamp_ns,
        &item.update.asset,
        quantized.as_str(),
    )?;

    Ok(SignedPriceUpdate {
        oracle_id: oracle_id.to_string(),
        asset_id: item.update.asset,
        trigger: item.trigger,
        signed_price: SignedPrice {
            publisher_key: signer.publisher_key().to_string(),
            external_asset_id: signature.external_asset_id,
            signature_type: signer.signature_type(),
            quantized_price: quantized,
            timestamped_signature: signature.timestamped_signature,
            metadata: item.update.metadata,
        },
    })
}

/// Fold signed updates into one batch per flush window. Within a window the
/// last completed signing of an asset wins; with several workers that order
/// is not deterministic.
async fn run_batcher(
    mut signed_rx: mpsc::Receiver<SignedPriceUpdate>,
    batch_tx: mpsc::Sender<SignedPriceUpdateBatch>,
) {
    let mut flush = interval(SIGNED_BATCH_PERIOD);
    flush.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut batch = SignedPriceUpdateBatch::new();

    loop {
        tokio::select! {
            maybe = signed_rx.recv() => match maybe {
                Some(update) => {
                    batch.insert(update.asset_id.clone(), update);
                }
                None => break,
            },
            _ = flush.tick() => {
                if !batch.is_empty() && batch_tx.send(std::mem::take(&mut batch)).await.is_err() {
                    warn!("Batch consumer gone, stopping batcher");
                    return;
                }
            }
        }
    }

    if !batch.is_empty() && batch_tx.send(batch).await.is_err() {
        warn!("Batch consumer gone before final flush");
    }
    debug!("Batcher stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use publisher_signer::{
        PriceSignature, SignatureType, StarkSignature, Signature, TimestampedSignature,
    };
    use std::str::FromStr;

    struct FixedSigner;

    impl Signer for FixedSigner {
        fn sign_publisher_price(
            &self,
            timestamp_ns: i64,
            asset: &str,
            quantized_price: &str,
        ) -> Result<PriceSignature, SignerError> {
            if asset == "BROKEN" {
                return Err(SignerError::Signing("refused".into()));
            }
            Ok(PriceSignature {
                timestamped_signature: TimestampedSignature {
                    signature: Signature::Stark(StarkSignature {
                        r: "0x1".into(),
                        s: quantized_price.to_string(),
                    }),
                    timestamp: timestamp_ns,
                    msg_hash: "0x0".into(),
                },
                external_asset_id: format!("ext-{}", asset),
            })
        }

        fn publisher_key(&self) -> &str {
            "0xpublisher"
        }

        fn signature_type(&self) -> SignatureType {
            SignatureType::Stark
        }
    }

    fn processor(sign_every_update: bool) -> ValueUpdateProcessor {
        ValueUpdateProcessor::new(
            Arc::new(FixedSigner),
            ProcessorConfig {
                oracle_id: "czowx".into(),
                num_pipelines: 1,
                clock_period: Duration::ZERO,
                delta_check_period: Duration::from_millis(10),
                change_threshold_proportion: 0.001,
                sign_every_update,
            },
        )
    }

    fn update(ts: i64, asset: &str, value: &str) -> ValueUpdate {
        ValueUpdate {
            publish_timestamp_ns: ts,
            asset: asset.to_string(),
            value: Decimal::from_str(value).unwrap(),
            metadata: None,
        }
    }

    #[test]
    fn test_first_observation_always_reported() {
        let mut p = processor(false);
        assert!(p.record_update(update(1, "BTCUSD", "60000")).is_none());
        p.record_update(update(1, "ETHUSD", "3000"));

        let mut reported: Vec<_> = p.delta_update().into_iter().map(|u| u.update.asset).collect();
        reported.sort();
        assert_eq!(reported, vec!["BTCUSD", "ETHUSD"]);
        assert!(p.delta_update().is_empty());
    }

    #[test]
    fn test_delta_requires_threshold() {
        let mut p = processor(false);
        p.record_update(update(1, "X", "100"));
        assert_eq!(p.delta_update().len(), 1);

        // 0.05% move stays under a 0.1% threshold
        p.record_update(update(2, "X", "100.05"));
        assert!(p.delta_update().is_empty());

        // 0.2% move crosses it
        p.record_update(update(3, "X", "100.2"));
        let emitted = p.delta_update();
        assert_eq!(emitted.len(), 1);
        assert_eq!(emitted[0].trigger, TriggerType::Delta);
        assert_eq!(emitted[0].update.publish_timestamp_ns, 3);
    }

    #[test]
    fn test_zero_crossing() {
        assert!(exceeds_threshold(0.0, 1.0, 0.001));
        assert!(exceeds_threshold(0.0, -0.5, 0.001));
        assert!(!exceeds_threshold(0.0, 0.0, 0.001));
        assert!(exceeds_threshold(1.0, 0.0, 0.001));
    }

    #[test]
    fn test_clock_update_keeps_baseline() {
        let mut p = processor(false);
        p.record_update(update(5, "X", "1.0"));
        assert_eq!(p.delta_update().len(), 1);

        let clocked = p.clock_update();
        assert_eq!(clocked.len(), 1);
        assert_eq!(clocked[0].trigger, TriggerType::Clock);
        assert_eq!(clocked[0].update.value, Decimal::from_str("1.0").unwrap());
        assert!(clocked[0].update.publish_timestamp_ns > 5);

        // baseline is still 1.0, so 1.0005 is under threshold and 1.5 is over
        p.record_update(update(6, "X", "1.0005"));
        assert!(p.delta_update().is_empty());
        p.record_update(update(7, "X", "1.5"));
        assert_eq!(p.delta_update().len(), 1);
    }

    #[test]
    fn test_clock_update_covers_every_asset() {
        let mut p = processor(false);
        assert!(p.clock_update().is_empty());
        p.record_update(update(1, "A", "1"));
        p.record_update(update(1, "B", "2"));
        p.record_update(update(2, "A", "3"));
        assert_eq!(p.tracked_assets(), 2);

        let clocked = p.clock_update();
        assert_eq!(clocked.len(), 2);
        let a = clocked.iter().find(|u| u.update.asset == "A").unwrap();
        assert_eq!(a.update.value, Decimal::from(3));
    }

    #[test]
    fn test_sign_every_update_returns_unspecified() {
        let mut p = processor(true);
        let immediate = p.record_update(update(9, "X", "2")).unwrap();
        assert_eq!(immediate.trigger, TriggerType::Unspecified);
        assert_eq!(immediate.update.publish_timestamp_ns, 9);
    }

    #[test]
    fn test_sign_update_fills_signed_price() {
        let item = ValueUpdateWithTrigger {
            update: update(42, "BTCUSD", "1.5"),
            trigger: TriggerType::Clock,
        };
        let signed = sign_update(&FixedSigner, "czowx", item).unwrap();
        assert_eq!(signed.oracle_id, "czowx");
        assert_eq!(signed.asset_id, "BTCUSD");
        assert_eq!(signed.trigger, TriggerType::Clock);
        assert_eq!(signed.signed_price.quantized_price.as_str(), "1500000000000000000");
        assert_eq!(signed.signed_price.external_asset_id, "ext-BTCUSD");
        assert_eq!(signed.signed_price.publisher_key, "0xpublisher");
        assert_eq!(signed.signed_price.signature_type, SignatureType::Stark);
        assert_eq!(signed.signed_price.timestamped_signature.timestamp, 42);
    }

    #[test]
    fn test_worker_count_at_least_one() {
        assert!(signing_worker_count(1) >= 1);
        assert_eq!(signing_worker_count(usize::MAX), 1);
        assert!(signing_worker_count(0) >= 1);
    }

    #[tokio::test]
    async fn test_signing_failure_drops_single_update() {
        let (value_tx, value_rx) = mpsc::channel(16);
        let (batch_tx, mut batch_rx) = mpsc::channel(16);
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(processor(true).run(value_rx, batch_tx, shutdown.clone()));

        value_tx.send(update(1, "BROKEN", "1")).await.unwrap();
        value_tx.send(update(2, "GOOD", "1")).await.unwrap();

        let batch = tokio::time::timeout(Duration::from_secs(1), batch_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(batch.contains_key("GOOD"));
        assert!(!batch.contains_key("BROKEN"));

        shutdown.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_flushes_pending_updates() {
        let (value_tx, value_rx) = mpsc::channel(16);
        let (batch_tx, mut batch_rx) = mpsc::channel(16);
        let task = tokio::spawn(processor(true).run(value_rx, batch_tx, CancellationToken::new()));

        value_tx.send(update(1, "X", "1")).await.unwrap();
        drop(value_tx);
        task.await.unwrap().unwrap();

        let mut seen = Vec::new();
        while let Some(batch) = batch_rx.recv().await {
            seen.extend(batch.into_keys());
        }
        assert_eq!(seen, vec!["X".to_string()]);
    }
}
