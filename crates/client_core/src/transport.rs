use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::{anyhow, Result};
use futures::{SinkExt, StreamExt};
use shared::protocol::{ClientCommand, ServerEvent};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, warn};

use crate::config::ClientSettings;

/// Everything the transport hands to its single registered handler, one item
/// at a time, in arrival order.
#[derive(Debug)]
pub enum SocketEvent {
    Connected,
    Event(ServerEvent),
    Closed,
}

type OutboundSlot = Arc<Mutex<Option<mpsc::UnboundedSender<ClientCommand>>>>;

/// Handle onto the live channel. Sends are best-effort by contract: a command
/// issued while the connection is down is dropped, not queued.
#[derive(Clone)]
pub struct SocketHandle {
    outbound: OutboundSlot,
    shutdown: Arc<watch::Sender<bool>>,
}

impl SocketHandle {
    pub fn send(&self, command: ClientCommand) {
        let Ok(slot) = self.outbound.lock() else {
            return;
        };
        match slot.as_ref() {
            Some(tx) => {
                if tx.send(command).is_err() {
                    debug!("live channel writer already gone; dropping command");
                }
            }
            None => debug!("live channel not open; dropping command"),
        }
    }

    /// Stops the reconnect loop and drops the writer. Subsequent sends become
    /// no-ops immediately.
    pub fn shutdown(&self) {
        if let Ok(mut slot) = self.outbound.lock() {
            *slot = None;
        }
        let _ = self.shutdown.send(true);
    }

    /// A handle that is never connected. Useful for driving the engine
    /// without a server; every send takes the drop path.
    pub fn detached() -> Self {
        let (shutdown, _) = watch::channel(true);
        Self {
            outbound: Arc::new(Mutex::new(None)),
            shutdown: Arc::new(shutdown),
        }
    }

    /// A handle whose outbound commands are captured instead of transmitted.
    #[cfg(test)]
    pub(crate) fn capture() -> (Self, mpsc::UnboundedReceiver<ClientCommand>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (shutdown, _) = watch::channel(false);
        (
            Self {
                outbound: Arc::new(Mutex::new(Some(tx))),
                shutdown: Arc::new(shutdown),
            },
            rx,
        )
    }
}

/// Connects the live channel and keeps it connected with exponential backoff.
/// Inbound frames and connection transitions are forwarded to `events`.
pub fn spawn(
    settings: &ClientSettings,
    token: &str,
    events: mpsc::UnboundedSender<SocketEvent>,
) -> Result<SocketHandle> {
    let endpoint = socket_endpoint(settings, token)?;
    let outbound: OutboundSlot = Arc::new(Mutex::new(None));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = SocketHandle {
        outbound: Arc::clone(&outbound),
        shutdown: Arc::new(shutdown_tx),
    };
    tokio::spawn(run_connection_loop(
        endpoint,
        outbound,
        events,
        shutdown_rx,
        settings.reconnect_base(),
        settings.reconnect_cap(),
    ));
    Ok(handle)
}

pub fn socket_endpoint(settings: &ClientSettings, token: &str) -> Result<String> {
    let base = match &settings.socket_url {
        Some(socket_url) => socket_url.clone(),
        None => {
            if let Some(rest) = settings.server_url.strip_prefix("https://") {
                format!("wss://{rest}")
            } else if let Some(rest) = settings.server_url.strip_prefix("http://") {
                format!("ws://{rest}")
            } else {
                return Err(anyhow!("server_url must start with http:// or https://"));
            }
        }
    };
    let mut url = url::Url::parse(&format!("{}/chat", base.trim_end_matches('/')))?;
    url.query_pairs_mut().append_pair("token", token);
    Ok(url.into())
}

async fn run_connection_loop(
    endpoint: String,
    outbound: OutboundSlot,
    events: mpsc::UnboundedSender<SocketEvent>,
    mut shutdown: watch::Receiver<bool>,
    backoff_base: Duration,
    backoff_cap: Duration,
) {
    let mut backoff = backoff_base;
    loop {
        if *shutdown.borrow() {
            return;
        }

        match connect_async(&endpoint).await {
            Ok((stream, _)) => {
                backoff = backoff_base;
                let (mut writer, mut reader) = stream.split();
                let (tx, mut rx) = mpsc::unbounded_channel::<ClientCommand>();
                if let Ok(mut slot) = outbound.lock() {
                    *slot = Some(tx);
                }
                if events.send(SocketEvent::Connected).is_err() {
                    return;
                }

                let write_task = tokio::spawn(async move {
                    while let Some(command) = rx.recv().await {
                        let frame = match serde_json::to_string(&command) {
                            Ok(text) => Message::Text(text),
                            Err(err) => {
                                warn!("failed to encode outbound command: {err}");
                                continue;
                            }
                        };
                        if writer.send(frame).await.is_err() {
                            break;
                        }
                    }
                });

                let mut handler_gone = false;
                loop {
                    tokio::select! {
                        changed = shutdown.changed() => {
                            if changed.is_err() || *shutdown.borrow() {
                                handler_gone = true;
                                break;
                            }
                        }
                        frame = reader.next() => {
                            match frame {
                                Some(Ok(Message::Text(text))) => {
                                    match serde_json::from_str::<ServerEvent>(&text) {
                                        Ok(event) => {
                                            if events.send(SocketEvent::Event(event)).is_err() {
                                                handler_gone = true;
                                                break;
                                            }
                                        }
                                        Err(err) => {
                                            warn!("discarding malformed server frame: {err}");
                                        }
                                    }
                                }
                                Some(Ok(Message::Close(_))) | None => break,
                                Some(Ok(_)) => {}
                                Some(Err(err)) => {
                                    warn!("live channel receive failed: {err}");
                                    break;
                                }
                            }
                        }
                    }
                }

                if let Ok(mut slot) = outbound.lock() {
                    *slot = None;
                }
                write_task.abort();
                if handler_gone {
                    return;
                }
                if events.send(SocketEvent::Closed).is_err() {
                    return;
                }
            }
            Err(err) => {
                warn!("live channel connect failed: {err}");
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(backoff) => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return;
                }
            }
        }
        backoff = (backoff * 2).min(backoff_cap);
    }
}
