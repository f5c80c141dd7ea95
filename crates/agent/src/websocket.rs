//! Socket primitives shared by the incoming and outgoing sides
//!
//! A [`ConnectionHandle`] carries the close state of one socket. Whoever owns
//! the socket selects on [`ConnectionHandle::closed`] and tears the socket
//! down once it fires; every other holder only ever calls `close()`.

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{HeaderValue, AUTHORIZATION};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use url::Url;

use crate::error::{ConnectionError, ReadError, SendError};
use crate::model::WebsocketMessage;

pub const FULL_QUEUE_LOG_FREQUENCY: Duration = Duration::from_secs(10);
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
pub const OUTGOING_WRITE_TIMEOUT: Duration = Duration::from_secs(10);
pub const CLOSE_FRAME_TIMEOUT: Duration = Duration::from_secs(1);

/// Per-connection outbound queue depth
pub const CONNECTION_QUEUE_CAPACITY: usize = 4096;

pub type ClientStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

pub fn next_connection_id() -> u64 {
    NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed)
}

type OnClose = Box<dyn FnOnce() + Send>;

struct HandleInner {
    id: u64,
    closed: CancellationToken,
    on_close: Mutex<Option<OnClose>>,
}

/// Cloneable close state for one socket
#[derive(Clone)]
pub struct ConnectionHandle {
    inner: Arc<HandleInner>,
}

impl ConnectionHandle {
    pub fn new(id: u64, on_close: impl FnOnce() + Send + 'static) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                id,
                closed: CancellationToken::new(),
                on_close: Mutex::new(Some(Box::new(on_close))),
            }),
        }
    }

    /// Handle with no cleanup callback
    pub fn detached() -> Self {
        Self::new(next_connection_id(), || {})
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Signal `closed` and run the cleanup callback. Only the first call has
    /// any effect.
    pub fn close(&self) {
        let on_close = match self.inner.on_close.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(on_close) = on_close {
            self.inner.closed.cancel();
            on_close();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled()
    }

    /// Resolves once `close()` has been called
    pub async fn closed(&self) {
        self.inner.closed.cancelled().await
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.inner.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Allows one log line per period
#[derive(Debug)]
pub struct LogThrottle {
    period: Duration,
    last: Option<Instant>,
}

impl LogThrottle {
    pub fn new(period: Duration) -> Self {
        Self { period, last: None }
    }

    /// True if the caller should log now
    pub fn ready(&mut self) -> bool {
        let now = Instant::now();
        match self.last {
            Some(last) if now.duration_since(last) < self.period => false,
            _ => {
                self.last = Some(now);
                true
            }
        }
    }
}

impl Default for LogThrottle {
    fn default() -> Self {
        Self::new(FULL_QUEUE_LOG_FREQUENCY)
    }
}

/// Dial a websocket, attaching `Authorization: Basic <token>` when a token is set
pub async fn dial(url: &str, auth: Option<&str>) -> Result<ClientStream, ConnectionError> {
    let parsed = Url::parse(url).map_err(|e| ConnectionError::InvalidUrl {
        url: url.to_string(),
        reason: e.to_string(),
    })?;
    let mut request =
        parsed
            .as_str()
            .into_client_request()
            .map_err(|e| ConnectionError::InvalidUrl {
                url: url.to_string(),
                reason: e.to_string(),
            })?;

    if let Some(token) = auth.filter(|t| !t.is_empty()) {
        let value = HeaderValue::from_str(&format!("Basic {}", token))
            .map_err(|e| ConnectionError::InvalidHeader(e.to_string()))?;
        request.headers_mut().insert(AUTHORIZATION, value);
    }

    let (ws, response) = tokio::time::timeout(HANDSHAKE_TIMEOUT, connect_async(request))
        .await
        .map_err(|_| ConnectionError::HandshakeTimeout(HANDSHAKE_TIMEOUT))??;
    debug!(url = %url, status = ?response.status(), "Websocket connected");
    Ok(ws)
}

/// Serialize `msg` and write it as one text frame within `timeout`
pub async fn send_message<S, T>(
    sink: &mut S,
    msg: &WebsocketMessage<T>,
    timeout: Duration,
) -> Result<(), SendError>
where
    S: Sink<Message, Error = tungstenite::Error> + Unpin,
    T: Serialize,
{
    let text = serde_json::to_string(msg)?;
    send_text(sink, text, timeout).await
}

/// Write an already serialized text frame within `timeout`
pub async fn send_text<S>(sink: &mut S, text: String, timeout: Duration) -> Result<(), SendError>
where
    S: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    match tokio::time::timeout(timeout, sink.send(Message::Text(text))).await {
        Err(_) => Err(SendError::Timeout(timeout)),
        Ok(Err(e)) => Err(classify_send_error(e)),
        Ok(Ok(())) => Ok(()),
    }
}

fn classify_send_error(e: tungstenite::Error) -> SendError {
    use std::io::ErrorKind;
    match &e {
        tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
            SendError::Reset(e.to_string())
        }
        tungstenite::Error::Io(io)
            if matches!(
                io.kind(),
                ErrorKind::ConnectionReset | ErrorKind::BrokenPipe | ErrorKind::ConnectionAborted
            ) =>
        {
            SendError::Reset(e.to_string())
        }
        _ => SendError::Other(e.to_string()),
    }
}

/// Log a send failure at a level matching its kind
pub fn log_send_error(err: &SendError, peer: &str) {
    match err {
        SendError::Timeout(_) => warn!(peer = %peer, error = %err, "Timed out writing websocket message"),
        SendError::Reset(_) => warn!(peer = %peer, error = %err, "Websocket connection closed while writing"),
        SendError::Other(_) | SendError::Serialize(_) => {
            error!(peer = %peer, error = %err, "Failed to write websocket message")
        }
    }
}

/// Wait for the next text frame. Ping and pong frames are skipped; anything
/// else ends the read loop.
pub async fn next_text<S>(stream: &mut S, read_timeout: Option<Duration>) -> Result<String, ReadError>
where
    S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    loop {
        let next = match read_timeout {
            Some(limit) if !limit.is_zero() => tokio::time::timeout(limit, stream.next())
                .await
                .map_err(|_| ReadError::Timeout(limit))?,
            _ => stream.next().await,
        };

        match next {
            None => return Err(ReadError::Closed),
            Some(Err(tungstenite::Error::ConnectionClosed)) => return Err(ReadError::Closed),
            Some(Err(e)) => return Err(ReadError::Transport(e)),
            Some(Ok(Message::Text(text))) => return Ok(text),
            Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
            Some(Ok(Message::Close(_))) => return Err(ReadError::Closed),
            Some(Ok(Message::Binary(_))) | Some(Ok(Message::Frame(_))) => {
                return Err(ReadError::NonText)
            }
        }
    }
}

/// Log why a read loop ended
pub fn log_read_exit(err: &ReadError, peer: &str) {
    match err {
        ReadError::Closed => debug!(peer = %peer, "Websocket connection closed, exiting read loop"),
        ReadError::Timeout(limit) => warn!(
            peer = %peer,
            timeout_secs = limit.as_secs_f64(),
            "Timed out waiting for next message, exiting read loop"
        ),
        ReadError::NonText => warn!(peer = %peer, "Non-text websocket message received, exiting read loop"),
        ReadError::Transport(e) => warn!(peer = %peer, error = %e, "Network error on websocket connection, exiting read loop"),
    }
}

/// Best-effort close frame
pub async fn close_socket<S>(ws: &mut WebSocketStream<S>)
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    if let Ok(Err(e)) = tokio::time::timeout(CLOSE_FRAME_TIMEOUT, ws.close(None)).await {
        if !matches!(
            e,
            tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed
        ) {
            debug!(error = %e, "Failed to send close frame");
        }
    }
}
