//! Broker reconciliation and fan-out
//!
//! `ConnectionManager` keeps one lifecycle task per broker url the registry
//! last returned. A lifecycle dials, registers its live socket in the shared
//! [`BrokerTable`], runs the writer and reconnects after a fixed delay until
//! the broker is removed. The fan-out task reads the table under its read
//! lock and never blocks on a subscriber.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::error::RegistryError;
use crate::model::{AssetFilter, AuthToken, BrokerUrl, SignedPriceUpdateBatch};
use crate::outgoing::{
    replace_filter, run_writer, shared_filter, OutgoingConnection, SharedAssetFilter, SharedBatch,
};
use crate::registry::BrokerRegistry;
use crate::websocket::{dial, next_connection_id, ConnectionHandle};

/// Live broker sockets keyed by url
#[derive(Debug, Default)]
pub struct BrokerTable {
    connections: RwLock<HashMap<BrokerUrl, Arc<OutgoingConnection>>>,
}

/// Result of offering one batch to every live connection
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BroadcastOutcome {
    pub delivered: usize,
    /// Brokers whose queue was full
    pub dropped: Vec<BrokerUrl>,
}

impl BrokerTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, conn: Arc<OutgoingConnection>) {
        let url = conn.broker_url().to_string();
        let mut connections = match self.connections.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        connections.insert(url, conn);
    }

    /// Remove `url` only if it still maps to connection `id`, so a stale
    /// close never evicts a newer socket for the same broker.
    pub fn remove(&self, url: &str, id: u64) -> bool {
        let mut connections = match self.connections.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        match connections.get(url) {
            Some(conn) if conn.handle().id() == id => {
                connections.remove(url);
                true
            }
            _ => false,
        }
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, url: &str) -> bool {
        self.read().contains_key(url)
    }

    pub fn snapshot(&self) -> Vec<Arc<OutgoingConnection>> {
        self.read().values().cloned().collect()
    }

    /// Offer `batch` to every live connection without blocking
    pub fn broadcast(&self, batch: &SharedBatch) -> BroadcastOutcome {
        let connections = self.read();
        let mut outcome = BroadcastOutcome::default();
        for conn in connections.values() {
            match conn.try_send(Arc::clone(batch)) {
                Ok(()) => outcome.delivered += 1,
                Err(TrySendError::Full(_)) => {
                    if conn.full_queue_log_ready() {
                        error!(broker = %conn.broker_url(), "Broker queue full, dropping signed batch");
                    }
                    outcome.dropped.push(conn.broker_url().to_string());
                }
                // writer already gone; its close callback evicts it
                Err(TrySendError::Closed(_)) => {}
            }
        }
        outcome
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<BrokerUrl, Arc<OutgoingConnection>>> {
        match self.connections.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// What one reconciliation pass changed
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileSummary {
    pub started: Vec<BrokerUrl>,
    pub removed: Vec<BrokerUrl>,
    pub updated: Vec<BrokerUrl>,
}

impl ReconcileSummary {
    pub fn is_noop(&self) -> bool {
        self.started.is_empty() && self.removed.is_empty()
    }
}

struct BrokerLifecycle {
    assets: SharedAssetFilter,
    removed: CancellationToken,
    task: JoinHandle<()>,
}

pub struct ConnectionManager {
    registry: Arc<dyn BrokerRegistry>,
    publisher_key: String,
    auth: Option<AuthToken>,
    reconnect_delay: Duration,
    table: Arc<BrokerTable>,
    lifecycles: Mutex<HashMap<BrokerUrl, BrokerLifecycle>>,
    tasks: TaskTracker,
    shutdown: CancellationToken,
}

impl ConnectionManager {
    pub fn new(
        registry: Arc<dyn BrokerRegistry>,
        publisher_key: impl Into<String>,
        auth: Option<AuthToken>,
        reconnect_delay: Duration,
    ) -> Self {
        Self {
            registry,
            publisher_key: publisher_key.into(),
            auth: auth.filter(|a| !a.is_empty()),
            reconnect_delay,
            table: Arc::new(BrokerTable::new()),
            lifecycles: Mutex::new(HashMap::new()),
            tasks: TaskTracker::new(),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn table(&self) -> Arc<BrokerTable> {
        Arc::clone(&self.table)
    }

    /// Brokers with a lifecycle, connected or in backoff
    pub fn tracked_brokers(&self) -> Vec<BrokerUrl> {
        let mut urls: Vec<_> = self.lock_lifecycles().keys().cloned().collect();
        urls.sort();
        urls
    }

    /// Query the registry and reconcile against its answer. On error the
    /// current connections are left untouched.
    pub async fn update_broker_connections(&self) -> Result<ReconcileSummary, RegistryError> {
        debug!("Running broker connection updater");
        let desired = self
            .registry
            .get_brokers_for_publisher(&self.publisher_key)
            .await?;
        let summary = self.reconcile(desired);
        if !summary.is_noop() {
            info!(
                started = ?summary.started,
                removed = ?summary.removed,
                "Reconciled broker connections"
            );
        }
        Ok(summary)
    }

    /// Start lifecycles for new brokers, update filters of known ones in
    /// place and remove brokers missing from `desired`.
    pub fn reconcile(&self, desired: HashMap<BrokerUrl, AssetFilter>) -> ReconcileSummary {
        let mut summary = ReconcileSummary::default();
        let mut lifecycles = self.lock_lifecycles();

        for (url, assets) in &desired {
            match lifecycles.get(url) {
                Some(existing) if !existing.task.is_finished() => {
                    replace_filter(&existing.assets, assets.clone());
                    summary.updated.push(url.clone());
                }
                _ => {
                    let lifecycle = self.spawn_lifecycle(url.clone(), assets.clone());
                    lifecycles.insert(url.clone(), lifecycle);
                    summary.started.push(url.clone());
                }
            }
        }

        let stale: Vec<BrokerUrl> = lifecycles
            .keys()
            .filter(|url| !desired.contains_key(*url))
            .cloned()
            .collect();
        for url in stale {
            if let Some(lifecycle) = lifecycles.remove(&url) {
                info!(broker = %url, "Broker no longer in registry, removing");
                lifecycle.removed.cancel();
            }
            summary.removed.push(url);
        }

        summary.started.sort();
        summary.removed.sort();
        summary.updated.sort();
        summary
    }

    fn spawn_lifecycle(&self, url: BrokerUrl, assets: AssetFilter) -> BrokerLifecycle {
        let assets = shared_filter(assets);
        let removed = self.shutdown.child_token();
        let task = self.tasks.spawn(run_broker_lifecycle(
            url,
            self.auth.clone(),
            Arc::clone(&assets),
            Arc::clone(&self.table),
            self.reconnect_delay,
            removed.clone(),
        ));
        BrokerLifecycle {
            assets,
            removed,
            task,
        }
    }

    /// Reconcile now and then every `period` until `shutdown` fires
    pub async fn run_refresher(&self, period: Duration, shutdown: CancellationToken) {
        if period.is_zero() {
            self.refresh_once().await;
            shutdown.cancelled().await;
            return;
        }

        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => self.refresh_once().await,
            }
        }
        debug!("Broker refresher stopped");
    }

    async fn refresh_once(&self) {
        if let Err(e) = self.update_broker_connections().await {
            error!(error = %e, "Failed to get broker connections from registry");
        }
    }

    /// Forward every batch to every live connection until `batch_rx` closes
    pub async fn run_fan_out(&self, mut batch_rx: mpsc::Receiver<SignedPriceUpdateBatch>) {
        while let Some(batch) = batch_rx.recv().await {
            self.table.broadcast(&Arc::new(batch));
        }
        debug!("Fan-out stopped");
    }

    /// Close every broker connection and wait for all lifecycles to exit
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.lock_lifecycles().clear();
        self.tasks.close();
        self.tasks.wait().await;
        info!("All broker connections closed");
    }

    fn lock_lifecycles(&self) -> MutexGuard<'_, HashMap<BrokerUrl, BrokerLifecycle>> {
        match self.lifecycles.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("publisher_key", &self.publisher_key)
            .field("auth", &self.auth.as_ref().map(|_| "<redacted>"))
            .field("reconnect_delay", &self.reconnect_delay)
            .field("live_connections", &self.table.len())
            .finish()
    }
}

/// Connecting -> Connected -> backoff -> Connecting, until `removed` fires
async fn run_broker_lifecycle(
    url: BrokerUrl,
    auth: Option<AuthToken>,
    assets: SharedAssetFilter,
    table: Arc<BrokerTable>,
    reconnect_delay: Duration,
    removed: CancellationToken,
) {
    loop {
        debug!(broker = %url, "Connecting to broker");
        let dialed = tokio::select! {
            _ = removed.cancelled() => break,
            dialed = dial(&url, auth.as_deref()) => dialed,
        };

        match dialed {
            Ok(ws) => {
                let id = next_connection_id();
                let handle = {
                    let table = Arc::clone(&table);
                    let url = url.clone();
                    ConnectionHandle::new(id, move || {
                        if table.remove(&url, id) {
                            info!(broker = %url, connection_id = id, "Removed broker connection");
                        }
                    })
                };
                let (conn, rx) = OutgoingConnection::new(url.clone(), handle.clone());
                table.insert(Arc::new(conn));
                info!(broker = %url, connection_id = id, "Connected to broker");

                let writer = run_writer(ws, &url, handle.clone(), Arc::clone(&assets), rx);
                tokio::pin!(writer);
                tokio::select! {
                    _ = &mut writer => {}
                    _ = removed.cancelled() => {
                        handle.close();
                        writer.await;
                    }
                }
                handle.close();
            }
            Err(e) => error!(broker = %url, error = %e, "Failed to connect to broker"),
        }

        if removed.is_cancelled() {
            break;
        }
        warn!(
            broker = %url,
            delay_ms = reconnect_delay.as_millis() as u64,
            "Broker connection lost, reconnecting after delay"
        );
        tokio::select! {
            _ = removed.cancelled() => break,
            _ = tokio::time::sleep(reconnect_delay) => {}
        }
    }
    info!(broker = %url, "Broker removed, not reconnecting");
}
