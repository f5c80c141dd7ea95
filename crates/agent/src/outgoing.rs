//! Broker-facing writer
//!
//! Each live broker socket owns a bounded queue of shared batches. The
//! writer filters every batch down to the broker's configured assets before
//! serializing it.

use futures_util::StreamExt;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard};
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, warn};

use crate::model::{
    AssetFilter, BrokerUrl, SignedPriceUpdate, SignedPriceUpdateBatch, WebsocketMessage,
    WILDCARD_ASSET,
};
use crate::websocket::{
    close_socket, log_send_error, send_text, ConnectionHandle, LogThrottle, CLOSE_FRAME_TIMEOUT,
    CONNECTION_QUEUE_CAPACITY, OUTGOING_WRITE_TIMEOUT,
};

pub const SIGNED_PRICES_MESSAGE_TYPE: &str = "signed_prices";

pub type SharedBatch = Arc<SignedPriceUpdateBatch>;

/// Asset filter shared between a broker's lifecycle and its current socket.
/// Survives reconnects so registry updates apply to the next socket too.
pub type SharedAssetFilter = Arc<RwLock<AssetFilter>>;

pub fn shared_filter(assets: AssetFilter) -> SharedAssetFilter {
    Arc::new(RwLock::new(assets))
}

pub fn read_filter(assets: &SharedAssetFilter) -> RwLockReadGuard<'_, AssetFilter> {
    match assets.read() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

pub fn replace_filter(assets: &SharedAssetFilter, next: AssetFilter) {
    match assets.write() {
        Ok(mut guard) => *guard = next,
        Err(poisoned) => *poisoned.into_inner() = next,
    }
}

/// Producer side of one broker socket
pub struct OutgoingConnection {
    broker_url: BrokerUrl,
    handle: ConnectionHandle,
    tx: mpsc::Sender<SharedBatch>,
    full_queue_log: Mutex<LogThrottle>,
}

impl OutgoingConnection {
    pub fn new(
        broker_url: impl Into<BrokerUrl>,
        handle: ConnectionHandle,
    ) -> (Self, mpsc::Receiver<SharedBatch>) {
        let (tx, rx) = mpsc::channel(CONNECTION_QUEUE_CAPACITY);
        (
            Self {
                broker_url: broker_url.into(),
                handle,
                tx,
                full_queue_log: Mutex::new(LogThrottle::default()),
            },
            rx,
        )
    }

    pub fn broker_url(&self) -> &str {
        &self.broker_url
    }

    pub fn handle(&self) -> &ConnectionHandle {
        &self.handle
    }

    /// Non-blocking enqueue; a full queue hands the batch back
    pub fn try_send(&self, batch: SharedBatch) -> Result<(), TrySendError<SharedBatch>> {
        self.tx.try_send(batch)
    }

    /// Rate limit for this connection's dropped-batch log
    pub fn full_queue_log_ready(&self) -> bool {
        match self.full_queue_log.lock() {
            Ok(mut throttle) => throttle.ready(),
            Err(poisoned) => poisoned.into_inner().ready(),
        }
    }
}

impl std::fmt::Debug for OutgoingConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutgoingConnection")
            .field("broker_url", &self.broker_url)
            .field("handle", &self.handle)
            .finish()
    }
}

/// Subset of `batch` the broker subscribed to. The wildcard asset passes
/// everything through.
pub fn filter_batch<'a>(
    batch: &'a SignedPriceUpdateBatch,
    assets: &AssetFilter,
) -> HashMap<&'a str, &'a SignedPriceUpdate> {
    let all = assets.contains(WILDCARD_ASSET);
    batch
        .iter()
        .filter(|(asset, _)| all || assets.contains(asset.as_str()))
        .map(|(asset, update)| (asset.as_str(), update))
        .collect()
}

/// Filter and serialize one batch. `None` when nothing is subscribed.
fn render_batch(
    batch: &SignedPriceUpdateBatch,
    assets: &SharedAssetFilter,
) -> Result<Option<String>, serde_json::Error> {
    let filter = read_filter(assets);
    let filtered = filter_batch(batch, &filter);
    if filtered.is_empty() {
        return Ok(None);
    }
    serde_json::to_string(&WebsocketMessage::data(SIGNED_PRICES_MESSAGE_TYPE, filtered)).map(Some)
}

/// Drain `rx` into the socket until the handle closes, the queue closes or
/// the socket fails. Failures close the handle; the socket is closed on
/// every exit path.
pub async fn run_writer<S>(
    mut ws: WebSocketStream<S>,
    broker_url: &str,
    handle: ConnectionHandle,
    assets: SharedAssetFilter,
    mut rx: mpsc::Receiver<SharedBatch>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    debug!(broker = %broker_url, connection_id = handle.id(), "Writer started");

    loop {
        let batch = tokio::select! {
            _ = handle.closed() => {
                flush_queued(&mut ws, broker_url, &assets, &mut rx).await;
                break;
            }
            maybe = rx.recv() => match maybe {
                Some(batch) => batch,
                None => break,
            },
            // brokers never send data, but reading surfaces closes and keeps
            // control frames flowing
            incoming = ws.next() => match incoming {
                Some(Ok(Message::Close(_))) | None => {
                    debug!(broker = %broker_url, "Broker closed connection");
                    handle.close();
                    break;
                }
                Some(Err(e)) => {
                    warn!(broker = %broker_url, error = %e, "Broker connection failed");
                    handle.close();
                    break;
                }
                Some(Ok(_)) => continue,
            },
        };

        let text = match render_batch(&batch, &assets) {
            Ok(Some(text)) => text,
            Ok(None) => continue,
            Err(e) => {
                warn!(broker = %broker_url, error = %e, "Failed to serialize batch");
                continue;
            }
        };
        if let Err(e) = send_text(&mut ws, text, OUTGOING_WRITE_TIMEOUT).await {
            log_send_error(&e, broker_url);
            handle.close();
            break;
        }
    }

    close_socket(&mut ws).await;
    debug!(broker = %broker_url, connection_id = handle.id(), "Writer stopped");
}

/// Best-effort write of batches already queued when the connection was
/// closed from outside, bounded by `CLOSE_FRAME_TIMEOUT`
async fn flush_queued<S>(
    ws: &mut WebSocketStream<S>,
    broker_url: &str,
    assets: &SharedAssetFilter,
    rx: &mut mpsc::Receiver<SharedBatch>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let deadline = Instant::now() + CLOSE_FRAME_TIMEOUT;
    while let Ok(batch) = rx.try_recv() {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            debug!(broker = %broker_url, "Dropping queued batches on close");
            break;
        }
        let Ok(Some(text)) = render_batch(&batch, assets) else {
            continue;
        };
        if let Err(e) = send_text(ws, text, remaining).await {
            log_send_error(&e, broker_url);
            break;
        }
    }
}
