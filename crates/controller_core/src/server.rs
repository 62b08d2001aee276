//! Network front end of the controller.
//!
//! [`ControllerServer`] binds the listening socket, upgrades every accepted
//! TCP connection to a WebSocket, and hands the resulting raw connection to
//! the [`LinkRegistry`]. It holds no session state of its own.

use crate::config::ControllerConfig;
use crate::error::{CloseCode, ServerError};
use crate::handlers::HandlerTable;
use crate::collaborators::Collaborators;
use crate::registry::LinkRegistry;
use crate::socket::spawn_websocket;
use crate::token::TokenSigner;
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_tungstenite::accept_async;
use tracing::{debug, error, info, warn};

/// How long shutdown waits for sessions to acknowledge their close.
const DRAIN_LIMIT: Duration = Duration::from_secs(10);

/// The controller's listening server.
///
/// # Lifecycle
///
/// 1. [`ControllerServer::new`] builds the registry around the collaborators
///    and handler table
/// 2. [`ControllerServer::start`] binds and runs the accept loop until
///    [`ControllerServer::shutdown`] is called
/// 3. Shutdown stops new registrations, closes every live session with
///    "shutting down" and waits briefly for them to finish
pub struct ControllerServer {
    config: ControllerConfig,
    registry: Arc<LinkRegistry>,
    shutdown_sender: broadcast::Sender<()>,
    open_connections: Arc<AtomicUsize>,
}

impl ControllerServer {
    pub fn new(
        config: ControllerConfig,
        signer: TokenSigner,
        collaborators: Collaborators,
        handlers: HandlerTable,
    ) -> Result<Self, ServerError> {
        config.validate().map_err(ServerError::Config)?;
        let (shutdown_sender, _) = broadcast::channel(1);
        let registry = LinkRegistry::new(config.clone(), signer, collaborators, handlers);

        Ok(Self {
            config,
            registry,
            shutdown_sender,
            open_connections: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn registry(&self) -> Arc<LinkRegistry> {
        self.registry.clone()
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    /// Number of raw connections currently open.
    pub fn open_connections(&self) -> usize {
        self.open_connections.load(Ordering::Relaxed)
    }

    /// Binds the configured address and serves until shutdown.
    pub async fn start(&self) -> Result<(), ServerError> {
        let listener = bind_listener(self.config.bind_address)?;
        self.serve(listener).await
    }

    /// Serves connections from an already bound listener until shutdown.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        let local_addr = listener
            .local_addr()
            .map_err(|e| ServerError::Network(format!("Listener has no address: {e}")))?;
        info!("🚀 Controller listening on {}", local_addr);

        let mut shutdown_receiver = self.shutdown_sender.subscribe();
        let accept_loop = async {
            loop {
                match listener.accept().await {
                    Ok((stream, addr)) => {
                        let registry = self.registry.clone();
                        let open_connections = self.open_connections.clone();
                        let max_connections = self.config.max_connections;
                        tokio::spawn(async move {
                            handle_connection(stream, addr, registry, open_connections, max_connections).await;
                        });
                    }
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                        break;
                    }
                }
            }
        };

        let result = tokio::select! {
            _ = accept_loop => Err(ServerError::Network("Accept loop stopped".into())),
            _ = shutdown_receiver.recv() => {
                info!("Shutdown signal received");
                Ok(())
            }
        };

        info!("🧹 Closing live sessions...");
        self.registry.shutdown().await;
        if !self.registry.drained(DRAIN_LIMIT).await {
            warn!(
                "{} session(s) did not close within {:?}",
                self.registry.session_count(),
                DRAIN_LIMIT
            );
        }
        info!("Server stopped");
        result
    }

    /// Asks a running [`ControllerServer::serve`] to stop.
    pub fn shutdown(&self) {
        let _ = self.shutdown_sender.send(());
    }
}

/// Creates the listening socket the way the controller wants it.
pub fn bind_listener(bind_address: SocketAddr) -> Result<TcpListener, ServerError> {
    let domain = if bind_address.is_ipv6() {
        Domain::IPV6
    } else {
        Domain::IPV4
    };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))
        .map_err(|e| ServerError::Network(format!("Socket creation failed: {e}")))?;
    socket.set_reuse_address(true).ok();

    socket
        .bind(&bind_address.into())
        .map_err(|e| ServerError::Network(format!("Bind failed: {e}")))?;
    socket
        .listen(1024)
        .map_err(|e| ServerError::Network(format!("Listen failed: {e}")))?;

    let std_listener: StdTcpListener = socket.into();
    std_listener
        .set_nonblocking(true)
        .map_err(|e| ServerError::Network(format!("Non-blocking mode failed: {e}")))?;
    TcpListener::from_std(std_listener)
        .map_err(|e| ServerError::Network(format!("Tokio listener creation failed: {e}")))
}

/// Decrements the open connection count when the connection task ends.
struct ConnectionSlot(Arc<AtomicUsize>);

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    registry: Arc<LinkRegistry>,
    open_connections: Arc<AtomicUsize>,
    max_connections: usize,
) {
    let _ = stream.set_nodelay(true);
    let ws = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            debug!("WebSocket handshake failed for {}: {}", addr, e);
            return;
        }
    };

    let open = open_connections.fetch_add(1, Ordering::Relaxed) + 1;
    let _slot = ConnectionSlot(open_connections);
    let (socket, inbound) = spawn_websocket(ws, addr.to_string());

    if open > max_connections {
        warn!("Rejecting {}: {} connections already open", addr, max_connections);
        registry.metrics().handshake_rejected();
        socket.close(CloseCode::ControllerFull, "Controller full");
        socket.closed().await;
        return;
    }

    registry.serve(socket.clone(), inbound).await;
    socket.closed().await;
    debug!("Connection from {} finished", addr);
}
