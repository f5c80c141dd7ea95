//! Push-based upstream feed
//!
//! Data providers connect to `/publish` and stream `prices` envelopes. Every
//! decoded update is offered to each signature-type pipeline with a
//! non-blocking send.

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::{accept_hdr_async, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::error::AgentError;
use crate::model::{ValueUpdate, ValueUpdatePushWebsocket, WebsocketMessage};
use crate::websocket::{
    close_socket, log_read_exit, log_send_error, next_text, send_message, ConnectionHandle,
    LogThrottle, HANDSHAKE_TIMEOUT, OUTGOING_WRITE_TIMEOUT,
};

pub const PUBLISH_PATH: &str = "/publish";
pub const PRICES_MESSAGE_TYPE: &str = "prices";
const PARSE_ERROR_REPLY: &str = "failed to parse price update";

/// One input channel per active signature-type pipeline
pub type ValueUpdateSenders = Arc<[mpsc::Sender<ValueUpdate>]>;

/// Offer `update` to every pipeline. Full channels drop it; returns how many
/// pipelines missed it.
pub fn fan_in(
    senders: &[mpsc::Sender<ValueUpdate>],
    update: ValueUpdate,
    throttle: &mut LogThrottle,
) -> usize {
    let mut dropped = 0;
    for tx in senders {
        match tx.try_send(update.clone()) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                dropped += 1;
                if throttle.ready() {
                    error!(asset = %update.asset, "Dropped incoming price update, pipeline queue full");
                }
            }
            Err(TrySendError::Closed(_)) => {
                dropped += 1;
                debug!(asset = %update.asset, "Pipeline closed, dropping incoming price update");
            }
        }
    }
    dropped
}

/// Read loop for one upstream client. Malformed frames get an error reply
/// and are skipped; transport errors end the loop and close the connection.
pub async fn run_reader<S>(
    mut ws: WebSocketStream<S>,
    peer: &str,
    handle: ConnectionHandle,
    senders: ValueUpdateSenders,
    shutdown: CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut throttle = LogThrottle::default();

    loop {
        let text = tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = handle.closed() => break,
            next = next_text(&mut ws, None) => match next {
                Ok(text) => text,
                Err(e) => {
                    log_read_exit(&e, peer);
                    break;
                }
            },
        };

        let msg: WebsocketMessage<Vec<ValueUpdatePushWebsocket>> = match serde_json::from_str(&text)
        {
            Ok(msg) => msg,
            Err(e) => {
                warn!(peer = %peer, error = %e, "Failed to decode incoming message");
                if !reply_parse_error(&mut ws, peer).await {
                    break;
                }
                continue;
            }
        };
        if msg.msg_type != PRICES_MESSAGE_TYPE {
            debug!(peer = %peer, msg_type = %msg.msg_type, "Ignoring incoming message");
            continue;
        }

        let mut failed = false;
        for raw in msg.data.unwrap_or_default() {
            match ValueUpdate::try_from(raw) {
                Ok(update) => {
                    fan_in(&senders, update, &mut throttle);
                }
                Err(e) => {
                    warn!(peer = %peer, error = %e, "Failed to convert incoming price update");
                    failed = true;
                    break;
                }
            }
        }
        if failed && !reply_parse_error(&mut ws, peer).await {
            break;
        }
    }

    handle.close();
    close_socket(&mut ws).await;
}

async fn reply_parse_error<S>(ws: &mut WebSocketStream<S>, peer: &str) -> bool
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let reply: WebsocketMessage<()> = WebsocketMessage::error("error", PARSE_ERROR_REPLY);
    match send_message(ws, &reply, OUTGOING_WRITE_TIMEOUT).await {
        Ok(()) => true,
        Err(e) => {
            log_send_error(&e, peer);
            false
        }
    }
}

#[allow(clippy::result_large_err)]
fn check_publish_path(req: &Request, resp: Response) -> Result<Response, ErrorResponse> {
    if req.uri().path() == PUBLISH_PATH {
        return Ok(resp);
    }
    let mut err = ErrorResponse::new(Some("not found".to_string()));
    *err.status_mut() = StatusCode::NOT_FOUND;
    Err(err)
}

/// Accept upstream clients on `listener` until `shutdown` fires, then wait
/// for their readers to finish.
pub async fn serve(listener: TcpListener, senders: ValueUpdateSenders, shutdown: CancellationToken) {
    let readers = TaskTracker::new();

    loop {
        let (stream, addr) = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "Failed to accept incoming connection");
                    continue;
                }
            },
        };

        let senders = Arc::clone(&senders);
        let shutdown = shutdown.clone();
        readers.spawn(async move {
            let ws = match tokio::time::timeout(
                HANDSHAKE_TIMEOUT,
                accept_hdr_async(stream, check_publish_path),
            )
            .await
            {
                Ok(Ok(ws)) => ws,
                Ok(Err(e)) => {
                    debug!(peer = %addr, error = %e, "Incoming websocket handshake failed");
                    return;
                }
                Err(_) => {
                    warn!(peer = %addr, "Incoming websocket handshake timed out");
                    return;
                }
            };

            let peer = addr.to_string();
            info!(peer = %peer, "Incoming websocket connected");
            run_reader(ws, &peer, ConnectionHandle::detached(), senders, shutdown).await;
            info!(peer = %peer, "Incoming websocket disconnected");
        });
    }

    readers.close();
    readers.wait().await;
    debug!("Incoming websocket server stopped");
}

/// Bind the push-based server on all interfaces
pub async fn bind_incoming_server(port: u16) -> Result<(TcpListener, SocketAddr), AgentError> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    let addr = listener.local_addr()?;
    info!(addr = %addr, path = PUBLISH_PATH, "Incoming websocket server listening");
    Ok((listener, addr))
}
