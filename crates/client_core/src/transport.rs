use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex as StdMutex,
};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use futures::{SinkExt, StreamExt};
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

use shared::{
    domain::UserId,
    protocol::{ClientSignal, ServerSignal},
};

pub(crate) const RECONNECT_DELAY: Duration = Duration::from_secs(2);

/// Typed publish/subscribe over the persistent socket. Subscriptions
/// survive reconnects: the broadcast sender outlives any single connection,
/// so handlers never need to re-register.
pub trait SignalTransport: Send + Sync {
    fn connected(&self) -> bool;
    /// Fire-and-forget. A signal sent while the socket is down is dropped
    /// with a debug log; scoped operations are no-ops, not errors.
    fn send(&self, signal: ClientSignal);
    fn subscribe(&self) -> broadcast::Receiver<ServerSignal>;
    fn subscribe_status(&self) -> watch::Receiver<bool>;
}

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

pub struct SocketTransport {
    ws_url: String,
    events: broadcast::Sender<ServerSignal>,
    status: watch::Sender<bool>,
    outbound: StdMutex<Option<mpsc::UnboundedSender<ClientSignal>>>,
    shutdown: AtomicBool,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl SocketTransport {
    pub fn new(server_url: &str, user_id: UserId) -> Result<Arc<Self>> {
        let ws_url = ws_url_from_server_url(server_url, user_id)?;
        let (events, _) = broadcast::channel(256);
        let (status, _) = watch::channel(false);
        Ok(Arc::new(Self {
            ws_url,
            events,
            status,
            outbound: StdMutex::new(None),
            shutdown: AtomicBool::new(false),
            supervisor: Mutex::new(None),
        }))
    }

    /// Dials the socket. A failure of the initial dial is returned to the
    /// caller; after that the connection task reconnects on its own until
    /// [`disconnect`](Self::disconnect).
    pub async fn connect(self: &Arc<Self>) -> Result<()> {
        self.shutdown.store(false, Ordering::SeqCst);
        let (stream, _) = connect_async(&self.ws_url)
            .await
            .with_context(|| format!("failed to connect websocket: {}", self.ws_url))?;

        let transport = Arc::clone(self);
        let task = tokio::spawn(async move {
            let mut stream = Some(stream);
            loop {
                match stream.take() {
                    Some(live) => transport.pump(live).await,
                    None => match connect_async(&transport.ws_url).await {
                        Ok((live, _)) => {
                            info!("websocket reconnected");
                            transport.pump(live).await;
                        }
                        Err(err) => warn!("websocket reconnect failed: {err}"),
                    },
                }
                if transport.shutdown.load(Ordering::SeqCst) {
                    break;
                }
                tokio::time::sleep(RECONNECT_DELAY).await;
                if transport.shutdown.load(Ordering::SeqCst) {
                    break;
                }
            }
        });

        let mut guard = self.supervisor.lock().await;
        if let Some(previous) = guard.replace(task) {
            previous.abort();
        }
        Ok(())
    }

    pub async fn disconnect(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(task) = self.supervisor.lock().await.take() {
            task.abort();
        }
        *self.outbound.lock().unwrap_or_else(|e| e.into_inner()) = None;
        let _ = self.status.send(false);
    }

    /// Drives one live connection: drains queued outbound signals into the
    /// sink and fans parsed inbound signals out to subscribers. Returns when
    /// the connection dies.
    async fn pump(&self, stream: WsStream) {
        let (mut sink, mut reader) = stream.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<ClientSignal>();
        *self.outbound.lock().unwrap_or_else(|e| e.into_inner()) = Some(tx);
        let _ = self.status.send(true);

        loop {
            tokio::select! {
                outgoing = rx.recv() => {
                    let Some(signal) = outgoing else { break };
                    match serde_json::to_string(&signal) {
                        Ok(text) => {
                            if sink.send(Message::Text(text)).await.is_err() {
                                break;
                            }
                        }
                        Err(err) => warn!("failed to encode client signal: {err}"),
                    }
                }
                incoming = reader.next() => {
                    match incoming {
                        Some(Ok(Message::Text(text))) => {
                            match serde_json::from_str::<ServerSignal>(&text) {
                                Ok(signal) => {
                                    let _ = self.events.send(signal);
                                }
                                Err(err) => warn!("invalid server signal: {err}"),
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(_)) => {}
                        Some(Err(err)) => {
                            warn!("websocket receive failed: {err}");
                            break;
                        }
                    }
                }
            }
        }

        *self.outbound.lock().unwrap_or_else(|e| e.into_inner()) = None;
        let _ = self.status.send(false);
    }
}

impl SignalTransport for SocketTransport {
    fn connected(&self) -> bool {
        *self.status.borrow()
    }

    fn send(&self, signal: ClientSignal) {
        let guard = self.outbound.lock().unwrap_or_else(|e| e.into_inner());
        match guard.as_ref() {
            Some(tx) => {
                if tx.send(signal).is_err() {
                    debug!("dropping client signal: connection task gone");
                }
            }
            None => debug!(?signal, "dropping client signal while disconnected"),
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<ServerSignal> {
        self.events.subscribe()
    }

    fn subscribe_status(&self) -> watch::Receiver<bool> {
        self.status.subscribe()
    }
}

fn ws_url_from_server_url(server_url: &str, user_id: UserId) -> Result<String> {
    Url::parse(server_url).with_context(|| format!("invalid server url: {server_url}"))?;
    let ws = if server_url.starts_with("https://") {
        server_url.replacen("https://", "wss://", 1)
    } else if server_url.starts_with("http://") {
        server_url.replacen("http://", "ws://", 1)
    } else {
        return Err(anyhow!("server_url must start with http:// or https://"));
    };
    Ok(format!("{ws}/ws?user_id={}", user_id.0))
}

#[cfg(test)]
#[path = "tests/transport_tests.rs"]
mod tests;
