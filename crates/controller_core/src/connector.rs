//! Session connector.
//!
//! A [`Connector`] owns one logical session with one peer. The session
//! outlives any single raw connection: when the socket drops the connector
//! moves to [`SessionState::Resuming`], keeps buffering outbound messages, and
//! replays everything the peer has not acknowledged once the peer resumes on a
//! new socket.
//!
//! # Lifecycle
//!
//! ```text
//! Pending --ready--> Connected --socket lost--> Resuming --continue--> Connected
//!                        |                          |
//!                        +--close/terminate--+      +--timeout/close--+
//!                                            v                        v
//!                                          Closed <-------------------+
//! ```
//!
//! # Sequencing
//!
//! Every outbound [`Message`] gets the next sequence number and stays in the
//! send buffer until the peer reports (through `resume` or `heartbeat`) that it
//! has received it. Inbound messages with a sequence number at or below the
//! highest one already accepted are duplicates from a replay and are dropped.

use crate::address::Address;
use crate::error::{CloseCode, LinkError};
use crate::message::{Continue, Frame, Heartbeat, Message, Ready};
use crate::metrics::LinkMetrics;
use crate::socket::SocketHandle;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, trace, warn};

/// How long `continue` waits for a stale socket to finish closing.
const STALE_SOCKET_GRACE: Duration = Duration::from_secs(5);

/// Number of silent heartbeat intervals after which a socket counts as half-open.
const MISSED_HEARTBEATS: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Allocated by the handshake, `ready` not sent yet
    Pending,
    Connected,
    /// Socket lost, waiting for the peer to resume
    Resuming,
    /// Terminal
    Closed,
}

/// Timers negotiated at handshake time. Fixed for the life of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionTiming {
    pub heartbeat_interval_ms: u64,
    pub session_timeout_ms: u64,
}

impl SessionTiming {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_millis(self.session_timeout_ms)
    }
}

/// Lifecycle notifications for observers of a session.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectorEvent {
    Connect,
    Drop,
    Resume,
    Close { code: CloseCode, reason: String },
}

struct ConnectorInner {
    state: SessionState,
    socket: Option<SocketHandle>,
    closing: Option<(CloseCode, String)>,
    next_seq: u64,
    last_received_seq: u64,
    send_buffer: VecDeque<(u64, String)>,
    last_inbound: Instant,
    heartbeat: Option<JoinHandle<()>>,
    resume_timer: Option<JoinHandle<()>>,
}

impl ConnectorInner {
    fn acknowledge(&mut self, last_seq: u64) {
        while self
            .send_buffer
            .front()
            .is_some_and(|(seq, _)| *seq <= last_seq)
        {
            self.send_buffer.pop_front();
        }
    }

    fn stop_heartbeat(&mut self) {
        if let Some(heartbeat) = self.heartbeat.take() {
            heartbeat.abort();
        }
    }
}

/// One logical session with one peer.
pub struct Connector {
    session_id: u64,
    address: Address,
    timing: SessionTiming,
    metrics: Arc<LinkMetrics>,
    events: broadcast::Sender<ConnectorEvent>,
    inner: Mutex<ConnectorInner>,
}

impl std::fmt::Debug for Connector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connector")
            .field("session_id", &self.session_id)
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

impl Connector {
    pub fn new(
        session_id: u64,
        address: Address,
        timing: SessionTiming,
        metrics: Arc<LinkMetrics>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(32);
        Arc::new(Self {
            session_id,
            address,
            timing,
            metrics,
            events,
            inner: Mutex::new(ConnectorInner {
                state: SessionState::Pending,
                socket: None,
                closing: None,
                next_seq: 1,
                last_received_seq: 0,
                send_buffer: VecDeque::new(),
                last_inbound: Instant::now(),
                heartbeat: None,
                resume_timer: None,
            }),
        })
    }

    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn timing(&self) -> SessionTiming {
        self.timing
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectorEvent> {
        self.events.subscribe()
    }

    pub async fn state(&self) -> SessionState {
        self.inner.lock().await.state
    }

    pub async fn last_received_seq(&self) -> u64 {
        self.inner.lock().await.last_received_seq
    }

    /// Sequence numbers still waiting for the peer's acknowledgement.
    pub async fn buffered_seqs(&self) -> Vec<u64> {
        self.inner
            .lock()
            .await
            .send_buffer
            .iter()
            .map(|(seq, _)| *seq)
            .collect()
    }

    /// Binds the first socket and completes the handshake with `ready`.
    pub async fn ready(
        self: &Arc<Self>,
        socket: SocketHandle,
        session_token: String,
        extra: Option<Value>,
    ) -> Result<(), LinkError> {
        let mut inner = self.inner.lock().await;
        if inner.state != SessionState::Pending {
            return Err(LinkError::UnexpectedMessage("ready"));
        }

        socket.send_frame(&Frame::Ready(Ready {
            address: self.address,
            session_token,
            session_timeout_ms: self.timing.session_timeout_ms,
            heartbeat_interval_ms: self.timing.heartbeat_interval_ms,
            extra,
        }));

        info!(
            session_id = self.session_id,
            remote = socket.remote(),
            "🔗 Session for {} is ready",
            self.address
        );
        inner.state = SessionState::Connected;
        inner.socket = Some(socket);
        inner.last_inbound = Instant::now();
        self.start_heartbeat(&mut inner);
        self.metrics.session_opened();
        let _ = self.events.send(ConnectorEvent::Connect);
        Ok(())
    }

    /// Reattaches the session to a new socket after the peer resumed.
    ///
    /// A socket that is still bound is treated as a stale half-open
    /// connection: it is terminated and given a moment to wind down before the
    /// new one takes over. Everything the peer has not acknowledged up to
    /// `peer_last_seq` is replayed in order after the `continue` frame.
    pub async fn continue_session(
        self: &Arc<Self>,
        socket: SocketHandle,
        peer_last_seq: u64,
    ) -> Result<(), LinkError> {
        let stale = {
            let mut inner = self.inner.lock().await;
            match inner.state {
                SessionState::Pending | SessionState::Closed => {
                    return Err(LinkError::SessionClosed(self.session_id));
                }
                SessionState::Connected => {
                    inner.stop_heartbeat();
                    inner.state = SessionState::Resuming;
                    let _ = self.events.send(ConnectorEvent::Drop);
                    inner.socket.take()
                }
                SessionState::Resuming => None,
            }
        };

        if let Some(stale) = stale {
            warn!(
                session_id = self.session_id,
                "Terminating stale socket {} of {} before resuming",
                stale.id(),
                self.address
            );
            stale.terminate();
            if timeout(STALE_SOCKET_GRACE, stale.closed()).await.is_err() {
                debug!(session_id = self.session_id, "Stale socket did not close in time");
            }
        }

        let mut inner = self.inner.lock().await;
        if inner.state != SessionState::Resuming {
            return Err(LinkError::SessionClosed(self.session_id));
        }
        if let Some(timer) = inner.resume_timer.take() {
            timer.abort();
        }
        inner.closing = None;

        inner.acknowledge(peer_last_seq);
        socket.send_frame(&Frame::Continue(Continue {
            session_timeout_ms: self.timing.session_timeout_ms,
            heartbeat_interval_ms: self.timing.heartbeat_interval_ms,
            last_received_seq: inner.last_received_seq,
        }));
        for (_, text) in inner.send_buffer.iter() {
            socket.send_text(text.clone());
        }

        info!(
            session_id = self.session_id,
            remote = socket.remote(),
            replayed = inner.send_buffer.len(),
            "🔄 Session for {} resumed",
            self.address
        );
        inner.state = SessionState::Connected;
        inner.socket = Some(socket);
        inner.last_inbound = Instant::now();
        self.start_heartbeat(&mut inner);
        self.metrics.session_resumed();
        let _ = self.events.send(ConnectorEvent::Resume);
        Ok(())
    }

    /// Sequences and sends a message, returning its sequence number.
    ///
    /// While resuming the message is only buffered; it goes out when the peer
    /// comes back.
    pub async fn send(&self, mut message: Message) -> Result<u64, LinkError> {
        let mut inner = self.inner.lock().await;
        if matches!(inner.state, SessionState::Pending | SessionState::Closed) {
            return Err(LinkError::SessionClosed(self.session_id));
        }

        let seq = inner.next_seq;
        message.set_seq(seq);
        let text = message.into_frame().to_text()?;
        inner.next_seq += 1;
        inner.send_buffer.push_back((seq, text.clone()));

        if inner.state == SessionState::Connected {
            if let Some(socket) = &inner.socket {
                socket.send_text(text);
            }
        }
        self.metrics.message_sent();
        Ok(seq)
    }

    /// Accepts one inbound frame from `socket_id`.
    ///
    /// Returns the message to dispatch, or `None` for heartbeats, duplicates
    /// and frames from a socket the session is no longer bound to.
    pub async fn receive(&self, socket_id: u64, frame: Frame) -> Result<Option<Message>, LinkError> {
        let mut inner = self.inner.lock().await;
        if inner.socket.as_ref().map(SocketHandle::id) != Some(socket_id) {
            trace!(session_id = self.session_id, socket_id, "Ignoring frame from unbound socket");
            return Ok(None);
        }
        inner.last_inbound = Instant::now();

        match frame.into_message() {
            Ok(message) => {
                if message.seq() <= inner.last_received_seq {
                    trace!(
                        session_id = self.session_id,
                        seq = message.seq(),
                        "Dropping duplicate message"
                    );
                    return Ok(None);
                }
                inner.last_received_seq = message.seq();
                self.metrics.message_received();
                Ok(Some(message))
            }
            Err(Frame::Heartbeat(heartbeat)) => {
                inner.acknowledge(heartbeat.last_seq);
                Ok(None)
            }
            Err(other) => Err(LinkError::UnexpectedMessage(other.kind())),
        }
    }

    /// Records transport-level liveness on `socket_id`.
    pub async fn touch(&self, socket_id: u64) {
        let mut inner = self.inner.lock().await;
        if inner.socket.as_ref().map(SocketHandle::id) == Some(socket_id) {
            inner.last_inbound = Instant::now();
        }
    }

    /// Handles the loss of `socket_id`.
    pub async fn socket_closed(self: &Arc<Self>, socket_id: u64) {
        let mut inner = self.inner.lock().await;
        if inner.socket.as_ref().map(SocketHandle::id) != Some(socket_id) {
            return;
        }
        inner.socket = None;
        inner.stop_heartbeat();

        if let Some((code, reason)) = inner.closing.take() {
            self.finalize(&mut inner, code, reason);
        } else if inner.state == SessionState::Connected {
            info!(
                session_id = self.session_id,
                "📴 Connection to {} dropped, waiting {}ms for resume",
                self.address,
                self.timing.session_timeout_ms
            );
            inner.state = SessionState::Resuming;
            self.start_resume_timer(&mut inner);
            let _ = self.events.send(ConnectorEvent::Drop);
        }
    }

    /// Closes the session gracefully.
    pub async fn close(&self, code: CloseCode, reason: &str) {
        let mut inner = self.inner.lock().await;
        match inner.state {
            SessionState::Closed => {}
            SessionState::Pending | SessionState::Resuming => {
                self.finalize(&mut inner, code, reason.to_string());
            }
            SessionState::Connected => {
                if inner.closing.is_some() {
                    return;
                }
                inner.closing = Some((code, reason.to_string()));
                if let Some(socket) = inner.socket.clone() {
                    socket.close(code, reason);
                } else {
                    self.finalize(&mut inner, code, reason.to_string());
                }
            }
        }
    }

    /// Ends the session at once, without a close handshake.
    pub async fn terminate(&self, code: CloseCode, reason: &str) {
        let mut inner = self.inner.lock().await;
        if inner.state == SessionState::Closed {
            return;
        }
        if let Some(socket) = inner.socket.take() {
            socket.terminate();
        }
        self.finalize(&mut inner, code, reason.to_string());
    }

    fn finalize(&self, inner: &mut ConnectorInner, code: CloseCode, reason: String) {
        inner.state = SessionState::Closed;
        inner.socket = None;
        inner.closing = None;
        inner.stop_heartbeat();
        if let Some(timer) = inner.resume_timer.take() {
            timer.abort();
        }
        inner.send_buffer.clear();

        info!(
            session_id = self.session_id,
            "🔌 Session for {} closed: {} {}",
            self.address,
            code,
            reason
        );
        self.metrics.session_closed();
        let _ = self.events.send(ConnectorEvent::Close { code, reason });
    }

    fn start_heartbeat(self: &Arc<Self>, inner: &mut ConnectorInner) {
        inner.stop_heartbeat();
        let connector = Arc::downgrade(self);
        let interval = self.timing.heartbeat_interval();

        inner.heartbeat = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(connector) = connector.upgrade() else {
                    break;
                };
                if !connector.heartbeat_tick().await {
                    break;
                }
            }
        }));
    }

    async fn heartbeat_tick(&self) -> bool {
        let inner = self.inner.lock().await;
        if inner.state != SessionState::Connected {
            return false;
        }
        let Some(socket) = &inner.socket else {
            return false;
        };

        let silence_limit = self.timing.heartbeat_interval() * MISSED_HEARTBEATS;
        if inner.last_inbound.elapsed() > silence_limit {
            warn!(
                session_id = self.session_id,
                "💔 No traffic from {} for {:?}, terminating socket",
                self.address,
                silence_limit
            );
            socket.terminate();
            return false;
        }

        socket.ping();
        socket.send_frame(&Frame::Heartbeat(Heartbeat {
            last_seq: inner.last_received_seq,
        }));
        true
    }

    fn start_resume_timer(self: &Arc<Self>, inner: &mut ConnectorInner) {
        let connector: Weak<Self> = Arc::downgrade(self);
        let session_timeout = self.timing.session_timeout();

        inner.resume_timer = Some(tokio::spawn(async move {
            sleep(session_timeout).await;
            if let Some(connector) = connector.upgrade() {
                connector.expire().await;
            }
        }));
    }

    async fn expire(&self) {
        let mut inner = self.inner.lock().await;
        if inner.state != SessionState::Resuming {
            return;
        }
        // Detach rather than abort: this runs on the timer task itself.
        drop(inner.resume_timer.take());
        self.finalize(&mut inner, CloseCode::SessionTimeout, "Timeout".to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Event, Resume};
    use crate::socket::{channel_socket, ChannelPeer, Outbound};

    fn timing() -> SessionTiming {
        SessionTiming {
            heartbeat_interval_ms: 60_000,
            session_timeout_ms: 120_000,
        }
    }

    fn event(name: &str) -> Message {
        Message::Event(Event {
            seq: 0,
            src: Address::CONTROLLER,
            dst: Address::host(1),
            name: name.into(),
            data: Value::Null,
        })
    }

    async fn ready_connector() -> (Arc<Connector>, SocketHandle, ChannelPeer) {
        let connector = Connector::new(1, Address::host(1), timing(), Arc::new(LinkMetrics::new()));
        let (socket, _inbound, mut peer) = channel_socket("memory");
        connector
            .ready(socket.clone(), "token".into(), None)
            .await
            .unwrap();
        assert!(matches!(peer.recv_frame().await, Some(Frame::Ready(_))));
        (connector, socket, peer)
    }

    async fn recv_event_seq(peer: &mut ChannelPeer) -> u64 {
        match peer.recv_frame().await {
            Some(Frame::Event(event)) => event.seq,
            other => panic!("expected event, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_send_assigns_increasing_sequence_numbers() {
        let (connector, _socket, mut peer) = ready_connector().await;

        for expected in 1..=3 {
            assert_eq!(connector.send(event("tick")).await.unwrap(), expected);
            assert_eq!(recv_event_seq(&mut peer).await, expected);
        }
        assert_eq!(connector.buffered_seqs().await, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_resume_prunes_acknowledged_and_replays_rest_in_order() {
        let (connector, socket, mut peer) = ready_connector().await;
        for _ in 0..3 {
            connector.send(event("tick")).await.unwrap();
        }

        peer.disconnect();
        socket.closed().await;
        connector.socket_closed(socket.id()).await;
        assert_eq!(connector.state().await, SessionState::Resuming);

        // Queued while the peer is away
        assert_eq!(connector.send(event("late")).await.unwrap(), 4);

        let (new_socket, _inbound, mut new_peer) = channel_socket("memory");
        connector.continue_session(new_socket, 2).await.unwrap();

        assert!(matches!(new_peer.recv_frame().await, Some(Frame::Continue(_))));
        assert_eq!(recv_event_seq(&mut new_peer).await, 3);
        assert_eq!(recv_event_seq(&mut new_peer).await, 4);
        assert_eq!(connector.buffered_seqs().await, vec![3, 4]);
        assert_eq!(connector.state().await, SessionState::Connected);
    }

    #[tokio::test]
    async fn test_duplicates_and_heartbeats_are_not_dispatched() {
        let (connector, socket, _peer) = ready_connector().await;
        connector.send(event("a")).await.unwrap();
        connector.send(event("b")).await.unwrap();

        let mut inbound = event("from-peer");
        inbound.set_seq(1);
        let frame = inbound.clone().into_frame();

        assert!(connector.receive(socket.id(), frame.clone()).await.unwrap().is_some());
        assert!(connector.receive(socket.id(), frame).await.unwrap().is_none());
        assert_eq!(connector.last_received_seq().await, 1);

        let heartbeat = Frame::Heartbeat(Heartbeat { last_seq: 1 });
        assert!(connector.receive(socket.id(), heartbeat).await.unwrap().is_none());
        assert_eq!(connector.buffered_seqs().await, vec![2]);

        let resume = Frame::Resume(Resume {
            session_token: "x".into(),
            last_seq: 0,
        });
        assert!(connector.receive(socket.id(), resume).await.is_err());
    }

    #[tokio::test]
    async fn test_frames_from_unbound_socket_are_ignored() {
        let (connector, _socket, _peer) = ready_connector().await;
        let mut inbound = event("stale");
        inbound.set_seq(1);

        let result = connector.receive(9999, inbound.into_frame()).await.unwrap();
        assert!(result.is_none());
        assert_eq!(connector.last_received_seq().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resume_window_expiry_closes_session() {
        let (connector, socket, mut peer) = ready_connector().await;
        let mut events = connector.subscribe();

        peer.disconnect();
        socket.closed().await;
        connector.socket_closed(socket.id()).await;
        assert_eq!(events.recv().await.unwrap(), ConnectorEvent::Drop);

        tokio::time::sleep(Duration::from_millis(120_001)).await;
        assert_eq!(
            events.recv().await.unwrap(),
            ConnectorEvent::Close {
                code: CloseCode::SessionTimeout,
                reason: "Timeout".into()
            }
        );
        assert_eq!(connector.state().await, SessionState::Closed);
        assert!(connector.send(event("too late")).await.is_err());
    }

    #[tokio::test]
    async fn test_graceful_close_finishes_when_socket_closes() {
        let (connector, socket, mut peer) = ready_connector().await;
        let mut events = connector.subscribe();

        connector.close(CloseCode::Normal, "bye").await;
        assert_eq!(connector.state().await, SessionState::Connected);
        assert_eq!(
            peer.next_outbound().await,
            Some(Outbound::Close {
                code: 1000,
                reason: "bye".into()
            })
        );

        socket.closed().await;
        connector.socket_closed(socket.id()).await;
        assert_eq!(
            events.recv().await.unwrap(),
            ConnectorEvent::Close {
                code: CloseCode::Normal,
                reason: "bye".into()
            }
        );
    }

    #[tokio::test]
    async fn test_close_while_resuming_is_immediate() {
        let (connector, socket, mut peer) = ready_connector().await;
        peer.disconnect();
        socket.closed().await;
        connector.socket_closed(socket.id()).await;

        connector.close(CloseCode::ShuttingDown, "Controller shutting down").await;
        assert_eq!(connector.state().await, SessionState::Closed);
    }

    #[tokio::test]
    async fn test_terminate_skips_close_handshake() {
        let (connector, _socket, mut peer) = ready_connector().await;

        connector.terminate(CloseCode::CredentialsRevoked, "Token revoked").await;
        assert_eq!(connector.state().await, SessionState::Closed);
        assert_eq!(peer.next_outbound().await, Some(Outbound::Terminate));
    }

    #[tokio::test]
    async fn test_continue_terminates_stale_socket() {
        let (connector, _old_socket, mut old_peer) = ready_connector().await;
        connector.send(event("a")).await.unwrap();
        assert_eq!(recv_event_seq(&mut old_peer).await, 1);

        let (new_socket, _inbound, mut new_peer) = channel_socket("memory");
        connector.continue_session(new_socket, 0).await.unwrap();

        assert_eq!(old_peer.next_outbound().await, Some(Outbound::Terminate));
        assert!(matches!(new_peer.recv_frame().await, Some(Frame::Continue(_))));
        assert_eq!(recv_event_seq(&mut new_peer).await, 1);
    }

    #[tokio::test]
    async fn test_continue_on_closed_session_fails() {
        let (connector, _socket, _peer) = ready_connector().await;
        connector.terminate(CloseCode::Normal, "done").await;

        let (new_socket, _inbound, _new_peer) = channel_socket("memory");
        assert!(connector.continue_session(new_socket, 0).await.is_err());
    }
}
