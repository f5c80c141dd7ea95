use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use publisher_agent_lib::model::{AssetFilter, BrokerUrl};
use publisher_agent_lib::{BrokerRegistry, ConnectionManager, RegistryError, SignedPriceUpdateBatch};

mod common;
use common::{wait_for, TestBroker};

#[derive(Default)]
struct StaticRegistry {
    brokers: Mutex<HashMap<BrokerUrl, AssetFilter>>,
}

impl StaticRegistry {
    fn set(&self, urls: &[&str]) {
        let mut brokers = self.brokers.lock().unwrap();
        *brokers = urls
            .iter()
            .map(|url| (url.to_string(), HashSet::from(["*".to_string()])))
            .collect();
    }
}

#[async_trait]
impl BrokerRegistry for StaticRegistry {
    async fn get_brokers_for_publisher(
        &self,
        _publisher_key: &str,
    ) -> Result<HashMap<BrokerUrl, AssetFilter>, RegistryError> {
        Ok(self.brokers.lock().unwrap().clone())
    }
}

fn batch(asset: &str) -> SignedPriceUpdateBatch {
    let frame = serde_json::json!({
        "oracle_id": "czowx",
        "asset_id": asset,
        "trigger": "clock",
        "signed_price": {
            "publisher_key": "0xabc",
            "external_asset_id": asset,
            "signature_type": "stark",
            "price": "1000000000000000000",
            "timestamped_signature": {
                "signature": { "r": "0x1", "s": "0x2" },
                "timestamp": 1,
                "msg_hash": "0x3"
            }
        }
    });
    HashMap::from([(asset.to_string(), serde_json::from_value(frame).unwrap())])
}

#[tokio::test]
async fn test_reconcile_keeps_surviving_broker_connected() {
    let a = TestBroker::start().await;
    let mut b = TestBroker::start().await;
    let mut c = TestBroker::start().await;

    let registry = Arc::new(StaticRegistry::default());
    let manager = Arc::new(ConnectionManager::new(
        registry.clone(),
        "0xabc".to_string(),
        Some("c2VjcmV0".to_string()),
        Duration::from_millis(100),
    ));
    let table = manager.table();

    registry.set(&[&a.url, &b.url]);
    let summary = manager.update_broker_connections().await.unwrap();
    assert_eq!(summary.started.len(), 2);
    wait_for("A and B connected", || {
        let table = Arc::clone(&table);
        let (a, b) = (a.url.clone(), b.url.clone());
        async move { table.contains(&a) && table.contains(&b) }
    })
    .await;

    registry.set(&[&b.url, &c.url]);
    let summary = manager.update_broker_connections().await.unwrap();
    assert_eq!(summary.started, vec![c.url.clone()]);
    assert_eq!(summary.removed, vec![a.url.clone()]);
    wait_for("C connected and A gone", || {
        let table = Arc::clone(&table);
        let (a, c) = (a.url.clone(), c.url.clone());
        async move { table.contains(&c) && !table.contains(&a) }
    })
    .await;
    assert_eq!(b.accept_count(), 1);

    let (batch_tx, batch_rx) = mpsc::channel(4);
    let fan_out = tokio::spawn({
        let manager = Arc::clone(&manager);
        async move { manager.run_fan_out(batch_rx).await }
    });
    batch_tx.send(batch("ETHUSD")).await.unwrap();
    drop(batch_tx);
    fan_out.await.unwrap();

    for broker in [&mut b, &mut c] {
        let frame = broker.next_json(Duration::from_secs(5)).await.unwrap();
        assert_eq!(frame["type"], "signed_prices");
        assert!(frame["data"].get("ETHUSD").is_some());
    }

    manager.shutdown().await;
    assert!(table.is_empty());
}

#[tokio::test]
async fn test_unreachable_broker_does_not_block_others() {
    let mut live = TestBroker::start().await;
    let dead = "ws://127.0.0.1:1/".to_string();

    let registry = Arc::new(StaticRegistry::default());
    registry.set(&[&live.url, &dead]);
    let manager = Arc::new(ConnectionManager::new(
        registry,
        "0xabc".to_string(),
        None,
        Duration::from_millis(50),
    ));
    manager.update_broker_connections().await.unwrap();

    let table = manager.table();
    wait_for("live broker connected", || {
        let table = Arc::clone(&table);
        let url = live.url.clone();
        async move { table.contains(&url) }
    })
    .await;
    assert!(!table.contains(&dead));

    let (batch_tx, batch_rx) = mpsc::channel(4);
    let fan_out = tokio::spawn({
        let manager = Arc::clone(&manager);
        async move { manager.run_fan_out(batch_rx).await }
    });
    batch_tx.send(batch("BTCUSD")).await.unwrap();
    let frame = live.next_json(Duration::from_secs(5)).await.unwrap();
    assert!(frame["data"].get("BTCUSD").is_some());

    drop(batch_tx);
    fan_out.await.unwrap();
    manager.shutdown().await;
}
