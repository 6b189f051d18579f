//! WebSocket listener and per-connection session loop.
//!
//! ```text
//!            accept ──► accept_async ──► Gateway::connect (ConnectionId)
//!                                             │
//!        ┌────────────── reader loop ─────────┴──── writer task ─────────┐
//!        │ Text   → Gateway::handle_text          outbound queue ─► sink │
//!        │ Binary → Gateway::handle_binary        (results, broadcasts)  │
//!        │ Ping   → Pong                                                 │
//!        │ Close / error / shutdown → Gateway::disconnect (flush room)   │
//!        └───────────────────────────────────────────────────────────────┘
//! ```

use futures_util::{SinkExt, StreamExt};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::Message;

use crate::config::ServerConfig;
use crate::error::GatewayError;
use crate::gateway::Gateway;
use crate::health;

/// How long a closing session waits for its writer to drain.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Cloneable trigger that stops a running [`SqlRoomServer`].
#[derive(Clone)]
pub struct ShutdownHandle {
    sender: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    pub fn trigger(&self) {
        let _ = self.sender.send(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.sender.borrow()
    }
}

pub struct SqlRoomServer {
    gateway: Arc<Gateway>,
    shutdown: ShutdownHandle,
}

impl SqlRoomServer {
    pub fn new(gateway: Arc<Gateway>) -> Self {
        let (sender, _) = watch::channel(false);
        Self {
            gateway,
            shutdown: ShutdownHandle {
                sender: Arc::new(sender),
            },
        }
    }

    /// Open the engine and rooms described by `config`.
    pub fn open(config: ServerConfig) -> Result<Self, GatewayError> {
        Ok(Self::new(Gateway::open(config)?))
    }

    pub fn gateway(&self) -> &Arc<Gateway> {
        &self.gateway
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Bind the configured addresses and serve until shutdown is triggered.
    pub async fn run(&self) -> Result<(), GatewayError> {
        let config = self.gateway.config();
        let listener = TcpListener::bind(&config.bind_addr).await?;
        log::info!("SQL room server listening on ws://{}", listener.local_addr()?);

        if let Some(addr) = &config.health_addr {
            let health_listener = TcpListener::bind(addr).await?;
            log::info!("Health endpoints on http://{}", health_listener.local_addr()?);
            let gateway = self.gateway.clone();
            let stopped = wait_for_trigger(self.shutdown.sender.subscribe());
            tokio::spawn(async move {
                if let Err(e) = health::serve(health_listener, gateway, stopped).await {
                    log::error!("Health server failed: {e}");
                }
            });
        }

        self.serve(listener).await
    }

    /// Accept connections on `listener` until shutdown, then shut the
    /// gateway down.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), GatewayError> {
        let mut stop = self.shutdown.sender.subscribe();
        loop {
            if *stop.borrow_and_update() {
                break;
            }
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, addr) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            log::warn!("Accept failed: {e}");
                            continue;
                        }
                    };
                    log::debug!("New TCP connection from {addr}");
                    let gateway = self.gateway.clone();
                    let stop = self.shutdown.sender.subscribe();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(gateway, stream, addr, stop).await {
                            log::error!("Connection error from {addr}: {e}");
                        }
                    });
                }
                _ = stop.changed() => {}
            }
        }

        log::info!("Shutting down");
        self.gateway.shutdown().await;
        Ok(())
    }
}

async fn wait_for_trigger(mut stop: watch::Receiver<bool>) {
    while !*stop.borrow_and_update() {
        if stop.changed().await.is_err() {
            return;
        }
    }
}

/// Drive one WebSocket session from handshake to disconnect.
async fn handle_connection(
    gateway: Arc<Gateway>,
    stream: TcpStream,
    addr: SocketAddr,
    stop: watch::Receiver<bool>,
) -> Result<(), GatewayError> {
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let (handle, mut outbound) = gateway.connect().await;
    let id = handle.id();
    log::info!("WebSocket connection {id} established from {addr}");

    let writer_handle = handle.clone();
    let mut writer = tokio::spawn(async move {
        while let Some(message) = outbound.recv().await {
            let closing = message.is_close();
            let sent = ws_sender.send(message).await;
            writer_handle.mark_written();
            if let Err(e) = sent {
                log::debug!("Write to {} failed: {e}", writer_handle.id());
                break;
            }
            if closing {
                break;
            }
        }
        let _ = ws_sender.close().await;
    });

    let stopped = wait_for_trigger(stop);
    tokio::pin!(stopped);

    let result = loop {
        tokio::select! {
            incoming = ws_receiver.next() => match incoming {
                Some(Ok(Message::Text(text))) => gateway.handle_text(id, text.as_str()).await,
                Some(Ok(Message::Binary(data))) => gateway.handle_binary(id, data.into()).await,
                Some(Ok(Message::Ping(payload))) => {
                    handle.send(Message::Pong(payload));
                }
                Some(Ok(Message::Close(_))) | None => break Ok(()),
                Some(Ok(_)) => {}
                Some(Err(e)) => break Err(GatewayError::from(e)),
            },
            _ = &mut stopped => break Ok(()),
        }
    };

    handle.send(Message::Close(None));
    gateway.disconnect(id).await;
    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer).await.is_err() {
        writer.abort();
    }
    result
}

/// Resolve when Ctrl-C or SIGTERM arrives.
pub fn shutdown_signal() -> impl Future<Output = ()> {
    async {
        let ctrl_c = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                log::error!("Unable to install Ctrl-C handler: {e}");
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            use tokio::signal::unix::{signal, SignalKind};
            match signal(SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                }
                Err(e) => {
                    log::error!("Unable to install SIGTERM handler: {e}");
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => log::info!("Received Ctrl-C"),
            _ = terminate => log::info!("Received SIGTERM"),
        }
    }
}
