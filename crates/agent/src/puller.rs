//! Pull-based upstream feed: the agent dials a data provider and reads
//! `{type, data: [{t, a, p, m}]}` frames, reconnecting forever.

use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::ConnectionError;
use crate::incoming::{fan_in, ValueUpdateSenders};
use crate::model::{AuthToken, PriceUpdatePullWebsocket, ValueUpdate, WebsocketMessage};
use crate::websocket::{
    close_socket, dial, log_read_exit, next_text, send_text, LogThrottle, OUTGOING_WRITE_TIMEOUT,
};

#[derive(Debug, Clone)]
pub struct PullerConfig {
    pub url: String,
    pub auth: Option<AuthToken>,
    pub subscription_request: Option<String>,
    pub reconnect_delay: Duration,
    /// Zero waits forever
    pub read_timeout: Duration,
}

pub struct IncomingWebsocketPuller {
    config: PullerConfig,
    senders: ValueUpdateSenders,
}

impl IncomingWebsocketPuller {
    pub fn new(config: PullerConfig, senders: ValueUpdateSenders) -> Self {
        Self { config, senders }
    }

    pub async fn run(&self, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                result = self.pull_once() => {
                    if let Err(e) = result {
                        error!(url = %self.config.url, error = %e, "Pull-based websocket session failed");
                    }
                }
            }

            info!(
                url = %self.config.url,
                delay_ms = self.config.reconnect_delay.as_millis() as u64,
                "Waiting to reconnect to pull-based websocket"
            );
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.config.reconnect_delay) => {}
            }
        }
        debug!(url = %self.config.url, "Puller stopped");
    }

    /// One connect-subscribe-read session. Returns once the session ends.
    async fn pull_once(&self) -> Result<(), ConnectionError> {
        let url = self.config.url.as_str();
        debug!(url = %url, "Connecting to pull-based websocket");
        let mut ws = dial(url, self.config.auth.as_deref()).await?;
        let read_timeout = Some(self.config.read_timeout);

        // providers open with a greeting frame
        match next_text(&mut ws, read_timeout).await {
            Ok(greeting) => debug!(url = %url, greeting = %greeting, "Received connection message"),
            Err(e) => warn!(url = %url, error = %e, "Failed to read connection message"),
        }

        if let Some(request) = self.config.subscription_request.as_ref().filter(|r| !r.is_empty()) {
            debug!(url = %url, request = %request, "Sending subscription request");
            send_text(&mut ws, request.clone(), OUTGOING_WRITE_TIMEOUT).await?;
            let response = next_text(&mut ws, read_timeout).await?;
            debug!(url = %url, response = %response, "Received subscription response");
        }

        let mut throttle = LogThrottle::default();
        loop {
            let text = match next_text(&mut ws, read_timeout).await {
                Ok(text) => text,
                Err(e) => {
                    log_read_exit(&e, url);
                    break;
                }
            };

            let updates = match parse_pull_message(&text) {
                Ok(updates) => updates,
                Err(e) => {
                    error!(url = %url, error = %e, message = %text, "Failed to decode pull-based message");
                    break;
                }
            };
            for update in updates {
                fan_in(&self.senders, update, &mut throttle);
            }
        }

        close_socket(&mut ws).await;
        Ok(())
    }
}

pub fn parse_pull_message(text: &str) -> Result<Vec<ValueUpdate>, serde_json::Error> {
    let msg: WebsocketMessage<Vec<PriceUpdatePullWebsocket>> = serde_json::from_str(text)?;
    Ok(msg
        .data
        .unwrap_or_default()
        .into_iter()
        .filter_map(|raw| match ValueUpdate::try_from(raw) {
            Ok(update) => Some(update),
            Err(e) => {
                warn!(error = %e, "Skipping pull-based price update");
                None
            }
        })
        .collect())
}
