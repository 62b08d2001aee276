//! Raw connections.
//!
//! A raw connection is one transport-level socket. It is owned by a pump task
//! and exposed to the rest of the controller as a [`SocketHandle`] (outbound
//! commands plus a "fully closed" signal) and a receiver of [`Inbound`]
//! frames. Sessions outlive sockets: a [`crate::connector::Connector`] may be
//! bound to many sockets over its lifetime, one at a time.
//!
//! Two transports exist:
//!
//! * [`spawn_websocket`] - a WebSocket carrying one JSON text frame per message
//! * [`channel_socket`] - an in-process pair used to drive the core in tests

use crate::error::CloseCode;
use crate::message::Frame;
use futures::{SinkExt, StreamExt};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{sleep_until, Instant};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode as WsCloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, trace};

/// How long a graceful close waits for the peer's close reply.
const CLOSE_GRACE: Duration = Duration::from_secs(5);

static NEXT_SOCKET_ID: AtomicU64 = AtomicU64::new(1);

/// Commands sent to the task that owns a raw connection.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Text(String),
    Ping,
    Close { code: u16, reason: String },
    Terminate,
}

/// What a raw connection delivers to the controller.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Text(String),
    /// A frame the protocol does not use, such as a binary message
    Unsupported,
    /// Transport-level liveness, such as a WebSocket ping or pong
    Activity,
}

/// Handle to one raw connection.
#[derive(Clone)]
pub struct SocketHandle {
    id: u64,
    remote: String,
    outbound: mpsc::UnboundedSender<Outbound>,
    closed: watch::Receiver<bool>,
}

impl fmt::Debug for SocketHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SocketHandle")
            .field("id", &self.id)
            .field("remote", &self.remote)
            .finish()
    }
}

impl SocketHandle {
    fn new(
        remote: String,
        outbound: mpsc::UnboundedSender<Outbound>,
        closed: watch::Receiver<bool>,
    ) -> Self {
        Self {
            id: NEXT_SOCKET_ID.fetch_add(1, Ordering::Relaxed),
            remote,
            outbound,
            closed,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn remote(&self) -> &str {
        &self.remote
    }

    /// Queues a frame. Returns `false` if the socket is already gone.
    pub fn send_frame(&self, frame: &Frame) -> bool {
        match frame.to_text() {
            Ok(text) => self.send_text(text),
            Err(e) => {
                debug!("Failed to serialize {} frame: {}", frame.kind(), e);
                false
            }
        }
    }

    pub fn send_text(&self, text: String) -> bool {
        self.outbound.send(Outbound::Text(text)).is_ok()
    }

    /// Sends a transport-level ping, if the transport has one.
    pub fn ping(&self) {
        let _ = self.outbound.send(Outbound::Ping);
    }

    /// Starts the close handshake.
    pub fn close(&self, code: CloseCode, reason: &str) {
        let _ = self.outbound.send(Outbound::Close {
            code: code.code(),
            reason: reason.to_string(),
        });
    }

    /// Drops the connection without a close handshake.
    pub fn terminate(&self) {
        let _ = self.outbound.send(Outbound::Terminate);
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow() || self.outbound.is_closed()
    }

    /// Resolves once the owning task has let go of the connection.
    pub async fn closed(&self) {
        let mut closed = self.closed.clone();
        let _ = closed.wait_for(|closed| *closed).await;
    }
}

/// Takes ownership of an upgraded WebSocket and starts pumping it.
pub fn spawn_websocket<S>(
    ws: WebSocketStream<S>,
    remote: impl Into<String>,
) -> (SocketHandle, mpsc::UnboundedReceiver<Inbound>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let (closed_tx, closed_rx) = watch::channel(false);
    let handle = SocketHandle::new(remote.into(), outbound_tx, closed_rx);

    tokio::spawn(pump_websocket(ws, handle.id, outbound_rx, inbound_tx, closed_tx));
    (handle, inbound_rx)
}

async fn pump_websocket<S>(
    mut ws: WebSocketStream<S>,
    socket_id: u64,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    inbound: mpsc::UnboundedSender<Inbound>,
    closed: watch::Sender<bool>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut close_deadline: Option<Instant> = None;

    loop {
        let grace = async move {
            match close_deadline {
                Some(deadline) => sleep_until(deadline).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            command = outbound.recv(), if close_deadline.is_none() => match command {
                Some(Outbound::Text(text)) => {
                    if let Err(e) = ws.send(WsMessage::Text(text.into())).await {
                        debug!(socket_id, "Write failed: {}", e);
                        break;
                    }
                }
                Some(Outbound::Ping) => {
                    if let Err(e) = ws.send(WsMessage::Ping(Default::default())).await {
                        debug!(socket_id, "Ping failed: {}", e);
                        break;
                    }
                }
                Some(Outbound::Close { code, reason }) => {
                    let frame = CloseFrame {
                        code: WsCloseCode::from(code),
                        reason: reason.into(),
                    };
                    if ws.send(WsMessage::Close(Some(frame))).await.is_err() {
                        break;
                    }
                    close_deadline = Some(Instant::now() + CLOSE_GRACE);
                }
                Some(Outbound::Terminate) | None => break,
            },
            incoming = ws.next() => match incoming {
                Some(Ok(WsMessage::Text(text))) => {
                    let _ = inbound.send(Inbound::Text(text.as_str().to_owned()));
                }
                Some(Ok(WsMessage::Binary(_))) => {
                    let _ = inbound.send(Inbound::Unsupported);
                }
                Some(Ok(WsMessage::Ping(_))) | Some(Ok(WsMessage::Pong(_))) => {
                    let _ = inbound.send(Inbound::Activity);
                    // Pong replies are queued by tungstenite and go out on flush.
                    let _ = ws.flush().await;
                }
                Some(Ok(WsMessage::Close(frame))) => {
                    trace!(socket_id, "Peer sent close {:?}", frame);
                    let _ = ws.flush().await;
                }
                Some(Ok(WsMessage::Frame(_))) => {}
                Some(Err(e)) => {
                    debug!(socket_id, "Read failed: {}", e);
                    break;
                }
                None => break,
            },
            _ = grace => {
                debug!(socket_id, "Peer did not answer close in time");
                break;
            }
        }
    }

    let _ = closed.send(true);
    drop(inbound);
}

/// In-process end of a [`channel_socket`], standing in for the remote peer.
pub struct ChannelPeer {
    inbound: mpsc::UnboundedSender<Inbound>,
    outbound: mpsc::UnboundedReceiver<Outbound>,
    disconnect: Option<oneshot::Sender<()>>,
}

impl ChannelPeer {
    pub fn send_frame(&self, frame: &Frame) {
        if let Ok(text) = frame.to_text() {
            self.send_text(text);
        }
    }

    pub fn send_text(&self, text: impl Into<String>) {
        let _ = self.inbound.send(Inbound::Text(text.into()));
    }

    pub fn send_inbound(&self, inbound: Inbound) {
        let _ = self.inbound.send(inbound);
    }

    /// Next command the controller issued on this socket.
    pub async fn next_outbound(&mut self) -> Option<Outbound> {
        self.outbound.recv().await
    }

    /// Next text frame, skipping pings. `None` once the controller closed or
    /// terminated the socket.
    pub async fn recv_frame(&mut self) -> Option<Frame> {
        loop {
            match self.outbound.recv().await? {
                Outbound::Text(text) => return Frame::parse(&text).ok(),
                Outbound::Ping => continue,
                Outbound::Close { .. } | Outbound::Terminate => return None,
            }
        }
    }

    /// Simulates the network dropping the connection.
    pub fn disconnect(&mut self) {
        if let Some(disconnect) = self.disconnect.take() {
            let _ = disconnect.send(());
        }
    }
}

/// Creates a raw connection backed by in-process channels.
pub fn channel_socket(
    remote: impl Into<String>,
) -> (SocketHandle, mpsc::UnboundedReceiver<Inbound>, ChannelPeer) {
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel();
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let (peer_in_tx, mut peer_in_rx) = mpsc::unbounded_channel();
    let (peer_out_tx, peer_out_rx) = mpsc::unbounded_channel();
    let (disconnect_tx, mut disconnect_rx) = oneshot::channel();
    let (closed_tx, closed_rx) = watch::channel(false);
    let handle = SocketHandle::new(remote.into(), outbound_tx, closed_rx);

    tokio::spawn(async move {
        loop {
            tokio::select! {
                command = outbound_rx.recv() => match command {
                    Some(command @ (Outbound::Close { .. } | Outbound::Terminate)) => {
                        let _ = peer_out_tx.send(command);
                        break;
                    }
                    Some(command) => {
                        let _ = peer_out_tx.send(command);
                    }
                    None => break,
                },
                incoming = peer_in_rx.recv() => match incoming {
                    Some(incoming) => {
                        let _ = inbound_tx.send(incoming);
                    }
                    None => break,
                },
                _ = &mut disconnect_rx => break,
            }
        }
        let _ = closed_tx.send(true);
        drop(inbound_tx);
    });

    let peer = ChannelPeer {
        inbound: peer_in_tx,
        outbound: peer_out_rx,
        disconnect: Some(disconnect_tx),
    };
    (handle, inbound_rx, peer)
}
