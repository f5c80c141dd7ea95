#![allow(dead_code)]

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

pub const EVM_PRIVATE_KEY: &str =
    "0x8b558d5fc31eb64bb51d44b4b28658180e96764d5d5ac68e6d124f86f576d9de";
pub const EVM_PUBLIC_KEY: &str = "0x99e295e85cb07c16b7bb62a44df532a7f2620237";
pub const ORACLE_ID: &str = "czowx";

/// Local broker endpoint recording every accepted connection and text frame
pub struct TestBroker {
    pub url: String,
    pub accepts: Arc<AtomicUsize>,
    pub frames: mpsc::UnboundedReceiver<String>,
}

impl TestBroker {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/", listener.local_addr().unwrap());
        let accepts = Arc::new(AtomicUsize::new(0));
        let (tx, frames) = mpsc::unbounded_channel();

        let counter = Arc::clone(&accepts);
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let tx = tx.clone();
                let counter = Arc::clone(&counter);
                tokio::spawn(async move {
                    let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
                        return;
                    };
                    counter.fetch_add(1, Ordering::SeqCst);
                    while let Some(Ok(msg)) = ws.next().await {
                        if let Message::Text(text) = msg {
                            let _ = tx.send(text);
                        }
                    }
                });
            }
        });

        Self { url, accepts, frames }
    }

    pub fn accept_count(&self) -> usize {
        self.accepts.load(Ordering::SeqCst)
    }

    /// Next frame parsed as JSON, or `None` after `wait`
    pub async fn next_json(&mut self, wait: Duration) -> Option<serde_json::Value> {
        let text = tokio::time::timeout(wait, self.frames.recv()).await.ok()??;
        Some(serde_json::from_str(&text).unwrap())
    }
}

/// Poll `check` until it holds, panicking after five seconds
pub async fn wait_for<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check().await {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
