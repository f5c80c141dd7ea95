use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use publisher_agent_lib::model::TriggerType;
use publisher_agent_lib::{ProcessorConfig, SignedPriceUpdateBatch, ValueUpdate, ValueUpdateProcessor};
use publisher_signer::EvmSigner;

mod common;
use common::{EVM_PRIVATE_KEY, ORACLE_ID};

struct Harness {
    value_tx: mpsc::Sender<ValueUpdate>,
    batch_rx: mpsc::Receiver<SignedPriceUpdateBatch>,
    shutdown: CancellationToken,
    task: tokio::task::JoinHandle<()>,
}

fn start_delta_only(threshold: f64) -> Harness {
    let signer = Arc::new(EvmSigner::new(EVM_PRIVATE_KEY).unwrap());
    let processor = ValueUpdateProcessor::new(
        signer,
        ProcessorConfig {
            oracle_id: ORACLE_ID.to_string(),
            num_pipelines: 1,
            clock_period: Duration::ZERO,
            delta_check_period: Duration::from_millis(10),
            change_threshold_proportion: threshold,
            sign_every_update: false,
        },
    );
    let (value_tx, value_rx) = mpsc::channel(16);
    let (batch_tx, batch_rx) = mpsc::channel(16);
    let shutdown = CancellationToken::new();
    let token = shutdown.clone();
    let task = tokio::spawn(async move {
        processor.run(value_rx, batch_tx, token).await.unwrap();
    });
    Harness {
        value_tx,
        batch_rx,
        shutdown,
        task,
    }
}

fn update(asset: &str, value: &str, publish_timestamp_ns: i64) -> ValueUpdate {
    ValueUpdate {
        publish_timestamp_ns,
        asset: asset.to_string(),
        value: value.parse::<Decimal>().unwrap(),
        metadata: None,
    }
}

async fn next_batch(rx: &mut mpsc::Receiver<SignedPriceUpdateBatch>, wait: Duration) -> Option<SignedPriceUpdateBatch> {
    tokio::time::timeout(wait, rx.recv()).await.ok().flatten()
}

#[tokio::test]
async fn test_delta_trigger_signs_first_and_significant_changes_only() {
    let mut h = start_delta_only(0.001);

    h.value_tx.send(update("ETHUSD", "1.0", 10_000_000)).await.unwrap();
    let batch = next_batch(&mut h.batch_rx, Duration::from_secs(5)).await.unwrap();
    let signed = &batch["ETHUSD"];
    assert_eq!(signed.trigger, TriggerType::Delta);
    assert_eq!(signed.oracle_id, ORACLE_ID);
    assert_eq!(signed.signed_price.quantized_price.as_str(), "1000000000000000000");
    assert_eq!(signed.signed_price.timestamped_signature.timestamp, 10_000_000);
    assert!(signed
        .signed_price
        .publisher_key
        .eq_ignore_ascii_case(common::EVM_PUBLIC_KEY));

    // unchanged value, new timestamp: below threshold
    h.value_tx.send(update("ETHUSD", "1.0", 20_000_000)).await.unwrap();
    assert!(next_batch(&mut h.batch_rx, Duration::from_millis(300)).await.is_none());

    h.value_tx.send(update("ETHUSD", "2.0", 30_000_000)).await.unwrap();
    let batch = next_batch(&mut h.batch_rx, Duration::from_secs(5)).await.unwrap();
    let signed = &batch["ETHUSD"];
    assert_eq!(signed.signed_price.quantized_price.as_str(), "2000000000000000000");
    assert_eq!(signed.signed_price.timestamped_signature.timestamp, 30_000_000);

    h.shutdown.cancel();
    h.task.await.unwrap();
}

#[tokio::test]
async fn test_zero_price_transitions() {
    let mut h = start_delta_only(0.001);

    h.value_tx.send(update("BTCUSD", "0", 1)).await.unwrap();
    let batch = next_batch(&mut h.batch_rx, Duration::from_secs(5)).await.unwrap();
    assert_eq!(batch["BTCUSD"].signed_price.quantized_price.as_str(), "0");

    h.value_tx.send(update("BTCUSD", "0", 2)).await.unwrap();
    assert!(next_batch(&mut h.batch_rx, Duration::from_millis(300)).await.is_none());

    h.value_tx.send(update("BTCUSD", "0.5", 3)).await.unwrap();
    let batch = next_batch(&mut h.batch_rx, Duration::from_secs(5)).await.unwrap();
    assert_eq!(
        batch["BTCUSD"].signed_price.quantized_price.as_str(),
        "500000000000000000"
    );

    h.shutdown.cancel();
    h.task.await.unwrap();
}

#[tokio::test]
async fn test_closing_input_stops_processor_and_batch_channel() {
    let mut h = start_delta_only(0.001);
    drop(h.value_tx);
    tokio::time::timeout(Duration::from_secs(5), h.task).await.unwrap().unwrap();
    assert!(h.batch_rx.recv().await.is_none());
}
