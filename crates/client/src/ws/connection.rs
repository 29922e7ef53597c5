//! WebSocket connection with state reporting and auto-reconnect.

use std::sync::Arc;

use futures_channel::mpsc::{unbounded, UnboundedReceiver, UnboundedSender};
use futures_util::{SinkExt, StreamExt};
use parlor_shared::{ClientCommand, ServerEvent, TransportError, WsEnvelope};
use tokio::sync::watch;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use crate::config::ReconnectConfig;

/// Connection state of the broadcasting transport. Transitions are driven by
/// transport callbacks only; application code never sets these directly.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Errored { reason: String },
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

/// Connection state plus the transport's textual detail, for display only.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    pub detail: String,
}

impl ConnectionStatus {
    pub fn disconnected(detail: impl Into<String>) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            detail: detail.into(),
        }
    }
}

/// Handle for sending commands through a connection. Commands sent while the
/// socket is down are queued and flushed once a connection is established.
#[derive(Clone)]
pub struct WsHandle {
    sender: UnboundedSender<WsEnvelope<ClientCommand>>,
}

impl WsHandle {
    pub(crate) fn new(sender: UnboundedSender<WsEnvelope<ClientCommand>>) -> Self {
        Self { sender }
    }

    pub fn send(&self, cmd: ClientCommand) -> Result<(), TransportError> {
        debug!(?cmd, "ws send");
        self.sender
            .unbounded_send(WsEnvelope::new(cmd))
            .map_err(|e| TransportError(format!("failed to queue command: {e}")))
    }

    pub fn subscribe(&self, channel: &str, auth: Option<String>) -> Result<(), TransportError> {
        self.send(ClientCommand::Subscribe {
            channel: channel.to_string(),
            auth,
        })
    }

    pub fn unsubscribe(&self, channel: &str) -> Result<(), TransportError> {
        self.send(ClientCommand::Unsubscribe {
            channel: channel.to_string(),
        })
    }
}

/// A managed WebSocket connection to the broadcasting service.
pub struct WsConnection {
    sender: UnboundedSender<WsEnvelope<ClientCommand>>,
    status: watch::Receiver<ConnectionStatus>,
}

impl WsConnection {
    /// Create the connection and start its management loop.
    ///
    /// `url_builder` is evaluated on every connect attempt so rotated auth
    /// tokens are picked up on reconnect. Returning `None` means "cannot
    /// connect right now" (e.g. logged out); the loop waits and retries.
    pub fn new(
        url_builder: impl Fn() -> Option<String> + Send + Sync + 'static,
        on_event: impl Fn(WsEnvelope<ServerEvent>) + Send + Sync + 'static,
        reconnect: ReconnectConfig,
    ) -> Self {
        let (sender, receiver) = unbounded();
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::disconnected("new"));

        start_connection_loop(
            status_tx,
            receiver,
            Arc::new(url_builder),
            Arc::new(on_event),
            reconnect,
        );

        Self {
            sender,
            status: status_rx,
        }
    }

    pub fn handle(&self) -> WsHandle {
        WsHandle::new(self.sender.clone())
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status.borrow().clone()
    }

    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.clone()
    }
}

/// Start the connection management loop in a background tokio task.
fn start_connection_loop(
    status: watch::Sender<ConnectionStatus>,
    receiver: UnboundedReceiver<WsEnvelope<ClientCommand>>,
    url_builder: Arc<dyn Fn() -> Option<String> + Send + Sync>,
    on_event: Arc<dyn Fn(WsEnvelope<ServerEvent>) + Send + Sync>,
    reconnect: ReconnectConfig,
) {
    tokio::spawn(async move {
        // The command receiver is shared across write tasks of successive
        // connection attempts.
        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));
        let mut attempt = 0u32;

        loop {
            if status.is_closed() {
                debug!("connection owner dropped, stopping loop");
                break;
            }

            let Some(url) = url_builder() else {
                let _ = status.send(ConnectionStatus::disconnected("waiting for credentials"));
                tokio::time::sleep(tokio::time::Duration::from_millis(1000)).await;
                continue;
            };

            let detail = if attempt == 0 {
                "connecting".to_string()
            } else {
                format!("reconnecting (attempt {attempt})")
            };
            let _ = status.send(ConnectionStatus {
                state: ConnectionState::Connecting,
                detail,
            });

            match connect_async(url.as_str()).await {
                Ok((ws_stream, _response)) => {
                    let _ = status.send(ConnectionStatus {
                        state: ConnectionState::Connected,
                        detail: "connected".to_string(),
                    });
                    attempt = 0;
                    info!("broadcasting connection established");

                    let (mut write, mut read) = ws_stream.split();

                    // Channel to learn when either half of the connection dies.
                    let (close_tx, mut close_rx) = tokio::sync::mpsc::unbounded_channel::<()>();

                    // Read task
                    let on_event_clone = on_event.clone();
                    let close_tx_for_read = close_tx.clone();
                    let read_task = tokio::spawn(async move {
                        while let Some(msg_result) = read.next().await {
                            match msg_result {
                                Ok(Message::Text(text)) => {
                                    match serde_json::from_str::<WsEnvelope<ServerEvent>>(
                                        text.as_str(),
                                    ) {
                                        Ok(event) => on_event_clone(event),
                                        Err(e) => {
                                            warn!("failed to parse server event: {e}");
                                        }
                                    }
                                }
                                Ok(Message::Close(_)) => {
                                    info!("broadcasting connection closed by server");
                                    break;
                                }
                                Ok(Message::Ping(_)) => {
                                    // Pong is handled by tungstenite.
                                }
                                Ok(_) => {
                                    // Ignore binary, pong, etc.
                                }
                                Err(e) => {
                                    error!("broadcasting read error: {e}");
                                    break;
                                }
                            }
                        }
                        let _ = close_tx_for_read.send(());
                    });

                    // Write task
                    let receiver_for_write = receiver.clone();
                    let write_task = tokio::spawn(async move {
                        loop {
                            let msg = {
                                let mut rx = receiver_for_write.lock().await;
                                rx.next().await
                            };

                            match msg {
                                Some(cmd) => match serde_json::to_string(&cmd) {
                                    Ok(json) => {
                                        debug!("ws write: {json}");
                                        if let Err(e) = write.send(Message::Text(json.into())).await
                                        {
                                            error!("broadcasting send failed: {e}");
                                            break;
                                        }
                                    }
                                    Err(e) => {
                                        error!("failed to serialize command: {e}");
                                    }
                                },
                                None => {
                                    debug!("command sender dropped, stopping write task");
                                    break;
                                }
                            }
                        }
                        let _ = close_tx.send(());
                    });

                    // Wait for the connection to die, then reap both halves.
                    close_rx.recv().await;
                    read_task.abort();
                    write_task.abort();
                    let _ = status.send(ConnectionStatus::disconnected("connection closed"));
                }
                Err(e) => {
                    error!("broadcasting connect error: {e}");
                    let _ = status.send(ConnectionStatus {
                        state: ConnectionState::Errored {
                            reason: e.to_string(),
                        },
                        detail: format!("connect error: {e}"),
                    });

                    if reconnect.max_attempts > 0 && attempt >= reconnect.max_attempts {
                        let _ = status.send(ConnectionStatus {
                            state: ConnectionState::Errored {
                                reason: format!(
                                    "max reconnect attempts ({}) exceeded",
                                    reconnect.max_attempts
                                ),
                            },
                            detail: "gave up reconnecting".to_string(),
                        });
                        break;
                    }

                    let delay = reconnect.delay_for_attempt(attempt);
                    info!("reconnecting in {delay}ms (attempt {})", attempt + 1);
                    tokio::time::sleep(tokio::time::Duration::from_millis(delay as u64)).await;
                    attempt += 1;
                }
            }
        }
    });
}
