//! Shared helpers for driving the controller core without a network.
#![allow(dead_code)]

use controller_core::message::{
    Event, Frame, RegisterControl, RegisterHost, Request, Response, Resume,
};
use controller_core::socket::{channel_socket, ChannelPeer, Outbound, SocketHandle};
use controller_core::{
    builtin, Address, Collaborators, ControllerConfig, HandlerTable, LinkRegistry,
    MemoryCollaborators, TokenSigner, User, CONNECT_PERMISSION,
};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

pub const WAIT: Duration = Duration::from_secs(5);

pub fn test_config() -> ControllerConfig {
    ControllerConfig {
        heartbeat_interval_ms: 60_000,
        session_timeout_ms: 120_000,
        handshake_timeout_ms: 5_000,
        request_timeout_ms: 5_000,
        ..ControllerConfig::default()
    }
}

pub struct Harness {
    pub registry: Arc<LinkRegistry>,
    pub memory: MemoryCollaborators,
}

impl Harness {
    pub fn new() -> Self {
        Self::with(test_config(), builtin::default_handlers().unwrap())
    }

    pub fn with_handlers(handlers: HandlerTable) -> Self {
        Self::with(test_config(), handlers)
    }

    pub fn with(config: ControllerConfig, handlers: HandlerTable) -> Self {
        let (collaborators, memory) = Collaborators::in_memory();
        let signer = TokenSigner::new(b"integration secret".to_vec()).unwrap();
        let registry = LinkRegistry::new(config, signer, collaborators, handlers);
        Self { registry, memory }
    }

    /// Adds a user allowed to connect, plus `permissions`.
    pub fn add_user(&self, name: &str, permissions: &[&str]) {
        let mut user = User::new(name).with_permission(CONNECT_PERMISSION);
        for permission in permissions {
            user = user.with_permission(*permission);
        }
        self.memory.users.insert(user);
    }

    /// Opens a raw connection and consumes the `hello`.
    pub async fn connect(&self) -> (ChannelPeer, SocketHandle) {
        let (socket, inbound, mut peer) = channel_socket("test-peer");
        let registry = self.registry.clone();
        let served = socket.clone();
        tokio::spawn(async move { registry.serve(served, inbound).await });

        match recv(&mut peer).await {
            Frame::Hello(_) => {}
            other => panic!("expected hello, got {:?}", other),
        }
        (peer, socket)
    }

    pub fn register_host_frame(&self, id: u32) -> Frame {
        Frame::RegisterHost(RegisterHost {
            token: self.registry.signer().host_token(id).unwrap(),
            id,
            name: format!("host-{id}"),
            version: "1.0.0".into(),
            plugins: Default::default(),
            public_address: None,
        })
    }

    pub async fn host(&self, id: u32) -> TestClient {
        let (mut peer, socket) = self.connect().await;
        peer.send_frame(&self.register_host_frame(id));
        TestClient::from_ready(peer, socket).await
    }

    pub async fn control(&self, user: &str) -> TestClient {
        let (mut peer, socket) = self.connect().await;
        peer.send_frame(&Frame::RegisterControl(RegisterControl {
            token: self.registry.signer().user_token(user).unwrap(),
        }));
        TestClient::from_ready(peer, socket).await
    }
}

/// Next frame from the controller, failing the test on close or silence.
pub async fn recv(peer: &mut ChannelPeer) -> Frame {
    match timeout(WAIT, peer.recv_frame()).await {
        Ok(Some(frame)) => frame,
        Ok(None) => panic!("connection closed while waiting for a frame"),
        Err(_) => panic!("timed out waiting for a frame"),
    }
}

/// Next close or terminate command, skipping any frames still queued.
pub async fn expect_closed(peer: &mut ChannelPeer) -> Outbound {
    loop {
        match timeout(WAIT, peer.next_outbound()).await {
            Ok(Some(Outbound::Text(_))) | Ok(Some(Outbound::Ping)) => continue,
            Ok(Some(command)) => return command,
            Ok(None) => panic!("socket ended without a close command"),
            Err(_) => panic!("timed out waiting for close"),
        }
    }
}

/// Fails if a frame arrives within a short grace period.
pub async fn expect_silence(peer: &mut ChannelPeer) {
    if let Ok(frame) = timeout(Duration::from_millis(200), peer.recv_frame()).await {
        panic!("expected no traffic, got {:?}", frame);
    }
}

/// A registered peer with its own outbound sequence counter.
pub struct TestClient {
    pub peer: ChannelPeer,
    pub socket: SocketHandle,
    pub address: Address,
    pub session_token: String,
    pub extra: Option<Value>,
    next_seq: u64,
}

impl TestClient {
    async fn from_ready(mut peer: ChannelPeer, socket: SocketHandle) -> Self {
        match recv(&mut peer).await {
            Frame::Ready(ready) => Self {
                peer,
                socket,
                address: ready.address,
                session_token: ready.session_token,
                extra: ready.extra,
                next_seq: 1,
            },
            other => panic!("expected ready, got {:?}", other),
        }
    }

    fn take_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    pub fn request_from(&mut self, src: Address, dst: Address, request_id: u64, name: &str, data: Value) {
        let seq = self.take_seq();
        self.peer.send_frame(&Frame::Request(Request {
            seq,
            src,
            dst,
            request_id,
            name: name.into(),
            data,
        }));
    }

    pub fn request(&mut self, dst: Address, request_id: u64, name: &str, data: Value) {
        self.request_from(self.address, dst, request_id, name, data);
    }

    pub fn respond(&mut self, dst: Address, request_id: u64, data: Value) {
        let seq = self.take_seq();
        self.peer.send_frame(&Frame::Response(Response {
            seq,
            src: self.address,
            dst,
            request_id,
            data,
        }));
    }

    pub fn event_from(&mut self, src: Address, dst: Address, name: &str, data: Value) {
        let seq = self.take_seq();
        self.peer.send_frame(&Frame::Event(Event {
            seq,
            src,
            dst,
            name: name.into(),
            data,
        }));
    }

    pub fn event(&mut self, dst: Address, name: &str, data: Value) {
        self.event_from(self.address, dst, name, data);
    }

    pub async fn recv(&mut self) -> Frame {
        recv(&mut self.peer).await
    }

    pub fn resume_frame(&self, last_seq: u64) -> Frame {
        Frame::Resume(Resume {
            session_token: self.session_token.clone(),
            last_seq,
        })
    }
}
