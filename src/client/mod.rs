// Operator-side connection to the bridge that survives drops
//
// A background task keeps reconnecting with a growing delay and reports
// `Open`, `Message` and `Closed` events. `send` only delivers while a
// connection is up; anything sent while disconnected is dropped.

pub mod backoff;

use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, warn};

pub use backoff::BackoffDelay;

#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    Open,
    Message(String),
    Closed,
}

pub struct ReconnectingClient {
    outgoing: mpsc::UnboundedSender<String>,
    connected: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl ReconnectingClient {
    /// Start connecting to `url` (e.g. `ws://robot.local:8777`)
    pub fn connect(url: impl Into<String>) -> (Self, mpsc::UnboundedReceiver<ClientEvent>) {
        Self::with_backoff(url, BackoffDelay::default())
    }

    pub fn with_backoff(
        url: impl Into<String>,
        backoff: BackoffDelay,
    ) -> (Self, mpsc::UnboundedReceiver<ClientEvent>) {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let connected = Arc::new(AtomicBool::new(false));

        let task = tokio::spawn(connection_loop(
            url.into(),
            backoff,
            out_rx,
            event_tx,
            connected.clone(),
        ));

        let client = Self {
            outgoing: out_tx,
            connected,
            task,
        };
        (client, event_rx)
    }

    pub fn is_open(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Best-effort send; returns false when the message was dropped
    pub fn send<T: Serialize>(&self, info: &T) -> bool {
        if !self.is_open() {
            return false;
        }

        match serde_json::to_string(info) {
            Ok(text) => self.outgoing.send(text).is_ok(),
            Err(e) => {
                warn!("Failed to encode message: {}", e);
                false
            }
        }
    }
}

impl Drop for ReconnectingClient {
    fn drop(&mut self) {
        self.task.abort();
    }
}

enum Ended {
    /// Transport went away; reconnect
    Closed,
    /// Nobody is listening anymore; stop for good
    OwnerGone,
}

async fn connection_loop(
    url: String,
    mut backoff: BackoffDelay,
    mut outgoing: mpsc::UnboundedReceiver<String>,
    events: mpsc::UnboundedSender<ClientEvent>,
    connected: Arc<AtomicBool>,
) {
    loop {
        match connect_async(url.as_str()).await {
            Ok((ws, _)) => {
                info!("Connected to {}", url);
                backoff.reset();

                // Anything queued while down is stale
                while outgoing.try_recv().is_ok() {}

                connected.store(true, Ordering::Release);
                let ended = match events.send(ClientEvent::Open) {
                    Ok(()) => pump(ws, &mut outgoing, &events).await,
                    Err(_) => Ended::OwnerGone,
                };
                connected.store(false, Ordering::Release);

                if let Ended::OwnerGone = ended {
                    return;
                }
                info!("Connection to {} closed", url);
                if events.send(ClientEvent::Closed).is_err() {
                    return;
                }
            }
            Err(e) => warn!("Connection to {} failed: {}", url, e),
        }

        let delay = backoff.get();
        debug!("Reconnecting in {}ms", delay.as_millis());
        sleep(delay).await;
    }
}

async fn pump(
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    outgoing: &mut mpsc::UnboundedReceiver<String>,
    events: &mpsc::UnboundedSender<ClientEvent>,
) -> Ended {
    let (mut sink, mut stream) = ws.split();

    loop {
        tokio::select! {
            inbound = stream.next() => match inbound {
                Some(Ok(Message::Text(text))) => {
                    if events.send(ClientEvent::Message(text.as_str().to_owned())).is_err() {
                        return Ended::OwnerGone;
                    }
                }
                Some(Ok(Message::Close(_))) | None => return Ended::Closed,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!("Connection error: {}", e);
                    return Ended::Closed;
                }
            },

            out = outgoing.recv() => match out {
                Some(text) => {
                    if let Err(e) = sink.send(Message::text(text)).await {
                        warn!("Send failed: {}", e);
                        return Ended::Closed;
                    }
                }
                None => {
                    let _ = sink.close().await;
                    return Ended::OwnerGone;
                }
            },
        }
    }
}
