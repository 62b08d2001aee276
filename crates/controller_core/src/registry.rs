//! Link registry and handshake server.
//!
//! The [`LinkRegistry`] turns freshly accepted raw connections into links. It
//! greets every connection with `hello`, runs the handshake (`registerHost`,
//! `registerControl` or `resume`), and then pumps the connection's frames
//! into the owning session until the socket goes away.
//!
//! The registry is the only writer of its maps. Entries are added when a
//! handshake completes and removed when the session behind them closes for
//! good; a link replaced by a newer registration never removes its successor.

use crate::address::{Address, AddressType, BroadcastClass};
use crate::collaborators::{Collaborators, HostRegistration, CONNECT_PERMISSION};
use crate::config::ControllerConfig;
use crate::connector::{Connector, ConnectorEvent, SessionTiming};
use crate::error::{CloseCode, LinkError};
use crate::handlers::{EventMessage, HandlerTable};
use crate::link::{Link, LinkKind};
use crate::message::{Event, Frame, Hello, Invalidate, Message, RegisterControl, RegisterHost, Resume};
use crate::metrics::LinkMetrics;
use crate::router::Router;
use crate::socket::{Inbound, SocketHandle};
use crate::token::{
    session_audience, Claims, HostClaims, SessionClaims, TokenSigner, UserClaims, HOST_AUDIENCE,
    USER_AUDIENCE,
};
use crate::utils::current_timestamp_ms;
use dashmap::DashMap;
use serde_json::json;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};

/// Changes collaborators outside the link layer care about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    HostUpdated { id: u32, connected: bool },
    ControlCountChanged { count: usize },
}

pub struct LinkRegistry {
    config: ControllerConfig,
    /// Scopes session tokens to this run of the controller
    started_at_ms: u64,
    signer: TokenSigner,
    collaborators: Collaborators,
    handlers: HandlerTable,
    router: Arc<Router>,
    metrics: Arc<LinkMetrics>,
    hosts: DashMap<u32, Arc<Link>>,
    controls: DashMap<u32, Arc<Link>>,
    sessions: DashMap<u64, Arc<Link>>,
    next_session_id: AtomicU64,
    next_control_id: AtomicU32,
    accepting: AtomicBool,
    events: broadcast::Sender<RegistryEvent>,
}

impl std::fmt::Debug for LinkRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkRegistry")
            .field("started_at_ms", &self.started_at_ms)
            .field("hosts", &self.hosts.len())
            .field("controls", &self.controls.len())
            .field("sessions", &self.sessions.len())
            .finish_non_exhaustive()
    }
}

impl LinkRegistry {
    pub fn new(
        config: ControllerConfig,
        signer: TokenSigner,
        collaborators: Collaborators,
        handlers: HandlerTable,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        let router = Router::new(config.request_timeout());
        Arc::new(Self {
            config,
            started_at_ms: current_timestamp_ms(),
            signer,
            collaborators,
            handlers,
            router,
            metrics: Arc::new(LinkMetrics::new()),
            hosts: DashMap::new(),
            controls: DashMap::new(),
            sessions: DashMap::new(),
            next_session_id: AtomicU64::new(1),
            next_control_id: AtomicU32::new(1),
            accepting: AtomicBool::new(true),
            events,
        })
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn started_at_ms(&self) -> u64 {
        self.started_at_ms
    }

    pub fn signer(&self) -> &TokenSigner {
        &self.signer
    }

    pub fn collaborators(&self) -> &Collaborators {
        &self.collaborators
    }

    pub fn handlers(&self) -> &HandlerTable {
        &self.handlers
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    pub fn metrics(&self) -> &Arc<LinkMetrics> {
        &self.metrics
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    pub fn host_link(&self, host_id: u32) -> Option<Arc<Link>> {
        self.hosts.get(&host_id).map(|link| link.clone())
    }

    pub fn control_link(&self, control_id: u32) -> Option<Arc<Link>> {
        self.controls.get(&control_id).map(|link| link.clone())
    }

    pub fn session(&self, session_id: u64) -> Option<Arc<Link>> {
        self.sessions.get(&session_id).map(|link| link.clone())
    }

    /// Every live host link, ordered by host id.
    pub fn host_links(&self) -> Vec<Arc<Link>> {
        let mut links: Vec<Arc<Link>> = self.hosts.iter().map(|entry| entry.value().clone()).collect();
        links.sort_by_key(|link| link.host_id());
        links
    }

    pub fn control_links(&self) -> Vec<Arc<Link>> {
        self.controls.iter().map(|entry| entry.value().clone()).collect()
    }

    pub fn links_of(&self, class: BroadcastClass) -> Vec<Arc<Link>> {
        match class {
            BroadcastClass::Hosts => self.host_links(),
            BroadcastClass::Controls => self.control_links(),
        }
    }

    pub fn host_count(&self) -> usize {
        self.hosts.len()
    }

    pub fn control_count(&self) -> usize {
        self.controls.len()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    /// Refuses new registrations from now on. Resumes are still honoured.
    pub fn stop_accepting(&self) {
        if self.accepting.swap(false, Ordering::SeqCst) {
            info!("🚫 No longer accepting new sessions");
        }
    }

    /// Stops accepting and closes every live session with "shutting down".
    pub async fn shutdown(&self) {
        self.stop_accepting();
        let links: Vec<Arc<Link>> = self.sessions.iter().map(|entry| entry.value().clone()).collect();
        info!("🛑 Closing {} session(s)", links.len());
        for link in links {
            link.connector()
                .close(CloseCode::ShuttingDown, "Controller shutting down")
                .await;
        }
    }

    /// Waits until every session has been finalised. Returns `false` if some
    /// are still open after `limit`.
    pub async fn drained(&self, limit: Duration) -> bool {
        let deadline = Instant::now() + limit;
        while !self.sessions.is_empty() {
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        true
    }

    /// Sends an event from the controller to every live link of `target`'s class.
    pub async fn broadcast_event<E: EventMessage>(&self, target: AddressType, payload: &E) -> Result<usize, LinkError> {
        let event = Message::Event(Event {
            seq: 0,
            src: Address::CONTROLLER,
            dst: Address::broadcast(target),
            name: E::NAME.to_string(),
            data: serde_json::to_value(payload)?,
        });
        Ok(self.router.broadcast(self, None, &event).await?)
    }

    /// Immediately ends every control session of `user`.
    pub async fn terminate_user_links(&self, user: &str, code: CloseCode, reason: &str) -> usize {
        let links: Vec<Arc<Link>> = self
            .controls
            .iter()
            .filter(|entry| entry.value().user_name() == Some(user))
            .map(|entry| entry.value().clone())
            .collect();
        for link in &links {
            link.connector().terminate(code, reason).await;
        }
        links.len()
    }

    /// Immediately ends the session of host `host_id`, if it has one.
    pub async fn terminate_host_link(&self, host_id: u32, code: CloseCode, reason: &str) -> bool {
        match self.host_link(host_id) {
            Some(link) => {
                link.connector().terminate(code, reason).await;
                true
            }
            None => false,
        }
    }

    /// Drives one raw connection from `hello` until the socket closes.
    pub async fn serve(self: &Arc<Self>, socket: SocketHandle, mut inbound: mpsc::UnboundedReceiver<Inbound>) {
        self.metrics.connection_accepted();
        socket.send_frame(&Frame::Hello(Hello {
            version: self.config.version.clone(),
            plugins: self.config.plugins.clone(),
        }));

        let link = match self.handshake(&socket, &mut inbound).await {
            Ok(link) => link,
            Err(LinkError::Disconnected) => {
                debug!(remote = socket.remote(), "Connection closed before handshake");
                return;
            }
            Err(error) => {
                self.metrics.handshake_rejected();
                let (code, reason) = error.close_code();
                warn!(remote = socket.remote(), "❌ Handshake rejected: {}", error);
                socket.close(code, reason);
                return;
            }
        };

        self.pump(&link, &socket, &mut inbound).await;
        link.connector().socket_closed(socket.id()).await;
    }

    async fn handshake(
        self: &Arc<Self>,
        socket: &SocketHandle,
        inbound: &mut mpsc::UnboundedReceiver<Inbound>,
    ) -> Result<Arc<Link>, LinkError> {
        let mut deadline = Instant::now() + self.config.handshake_timeout();
        loop {
            let text = match timeout_at(deadline, inbound.recv()).await {
                Err(_) => return Err(LinkError::HandshakeTimeout),
                Ok(None) => return Err(LinkError::Disconnected),
                Ok(Some(Inbound::Text(text))) => text,
                Ok(Some(Inbound::Activity)) => continue,
                Ok(Some(Inbound::Unsupported)) => return Err(LinkError::UnexpectedMessage("binary")),
            };

            match Frame::parse(&text)? {
                Frame::Resume(resume) => match self.resume(socket, resume).await {
                    Ok(link) => return Ok(link),
                    Err(error) => {
                        self.metrics.handshake_rejected();
                        info!(remote = socket.remote(), "Resume rejected: {}", error);
                        socket.send_frame(&Frame::Invalidate(Invalidate {}));
                        deadline = Instant::now() + self.config.handshake_timeout();
                    }
                },
                Frame::RegisterHost(register) => {
                    self.ensure_accepting()?;
                    return self.register_host(socket, register).await;
                }
                Frame::RegisterControl(register) => {
                    self.ensure_accepting()?;
                    return self.register_control(socket, register).await;
                }
                other => return Err(LinkError::UnexpectedMessage(other.kind())),
            }
        }
    }

    fn ensure_accepting(&self) -> Result<(), LinkError> {
        if self.is_accepting() {
            Ok(())
        } else {
            Err(LinkError::NotAccepting)
        }
    }

    async fn resume(&self, socket: &SocketHandle, resume: Resume) -> Result<Arc<Link>, LinkError> {
        let claims: Claims<SessionClaims> = self
            .signer
            .verify(&resume.session_token, &session_audience(self.started_at_ms))?;
        let link = self
            .session(claims.body.sid)
            .ok_or(LinkError::SessionClosed(claims.body.sid))?;

        link.connector()
            .continue_session(socket.clone(), resume.last_seq)
            .await?;
        Ok(link)
    }

    async fn register_host(self: &Arc<Self>, socket: &SocketHandle, register: RegisterHost) -> Result<Arc<Link>, LinkError> {
        let claims: Claims<HostClaims> = self.signer.verify(&register.token, HOST_AUDIENCE)?;
        if claims.body.host != register.id {
            return Err(LinkError::Authentication(format!(
                "token for host {} used by host {}",
                claims.body.host, register.id
            )));
        }
        let valid_after = self.collaborators.hosts.token_valid_after(register.id).await;
        if claims.iat < valid_after {
            return Err(LinkError::Authentication(format!(
                "token for host {} has been revoked",
                register.id
            )));
        }

        let registration = HostRegistration {
            id: register.id,
            name: register.name,
            version: register.version,
            plugins: register.plugins,
            public_address: register.public_address,
            remote: socket.remote().to_string(),
        };
        let kind = LinkKind::Host {
            id: register.id,
            registration: registration.clone(),
        };
        let link = self.open_link(socket, Address::host(register.id), kind, None).await?;

        self.collaborators.hosts.host_connected(registration.clone()).await;
        let _ = self.events.send(RegistryEvent::HostUpdated {
            id: register.id,
            connected: true,
        });
        info!(
            remote = socket.remote(),
            "🖥️ Host {} ({} {}) registered",
            register.id,
            registration.name,
            registration.version
        );
        Ok(link)
    }

    async fn register_control(
        self: &Arc<Self>,
        socket: &SocketHandle,
        register: RegisterControl,
    ) -> Result<Arc<Link>, LinkError> {
        let claims: Claims<UserClaims> = self.signer.verify(&register.token, USER_AUDIENCE)?;
        let user = self
            .collaborators
            .users
            .resolve_user(&claims.body.user)
            .await
            .ok_or_else(|| LinkError::Authentication(format!("unknown user {}", claims.body.user)))?;
        if !user.accepts_token_issued_at(claims.iat) {
            return Err(LinkError::Authentication(format!(
                "token for user {} has been revoked",
                user.name
            )));
        }
        if !user.has_permission(CONNECT_PERMISSION) {
            warn!(
                target: "audit",
                user = %user.name,
                permission = CONNECT_PERMISSION,
                "Denied control connection for {}",
                user.name
            );
            return Err(LinkError::Authentication(format!(
                "user {} lacks {}",
                user.name, CONNECT_PERMISSION
            )));
        }

        let control_id = self.next_control_id.fetch_add(1, Ordering::Relaxed);
        let extra = json!({
            "account": {
                "name": user.name,
                "roles": user.roles,
                "permissions": user.permissions,
                "isAdmin": user.is_admin,
            }
        });
        let kind = LinkKind::Control {
            id: control_id,
            user: user.name.clone(),
        };
        let link = self
            .open_link(socket, Address::control(control_id), kind, Some(extra))
            .await?;

        self.publish_control_count();
        info!(
            remote = socket.remote(),
            "🎛️ Control {} connected as {}", control_id, user.name
        );
        Ok(link)
    }

    /// Allocates a session, registers its link and sends `ready`.
    async fn open_link(
        self: &Arc<Self>,
        socket: &SocketHandle,
        address: Address,
        kind: LinkKind,
        extra: Option<serde_json::Value>,
    ) -> Result<Arc<Link>, LinkError> {
        let session_id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
        let session_token = self
            .signer
            .sign(&SessionClaims { sid: session_id }, &session_audience(self.started_at_ms))?;
        let timing = SessionTiming {
            heartbeat_interval_ms: self.config.heartbeat_interval_ms,
            session_timeout_ms: self.config.session_timeout_ms,
        };
        let connector = Connector::new(session_id, address, timing, self.metrics.clone());
        let link = Link::new(kind, connector, self.config.request_timeout());

        self.watch(&link);
        self.sessions.insert(session_id, link.clone());
        // Insert and displace in one step: one link per peer id.
        let displaced = match address.address_type {
            AddressType::Host => self.hosts.insert(address.id, link.clone()),
            _ => self.controls.insert(address.id, link.clone()),
        };
        if let Some(previous) = displaced {
            info!(
                "🔁 {} registered from another connection, closing session {}",
                address,
                previous.session_id()
            );
            previous
                .connector()
                .close(CloseCode::Replaced, "Registered from another connection")
                .await;
        }

        link.connector()
            .ready(socket.clone(), session_token, extra)
            .await
            .map_err(|e| match e {
                // Displaced by a newer registration before `ready` went out
                LinkError::UnexpectedMessage(_) => LinkError::Replaced,
                other => other,
            })?;
        Ok(link)
    }

    /// Finalises `link` once its session closes.
    fn watch(self: &Arc<Self>, link: &Arc<Link>) {
        let mut events = link.connector().subscribe();
        let registry: Weak<Self> = Arc::downgrade(self);
        let link = link.clone();

        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(ConnectorEvent::Close { .. }) | Err(RecvError::Closed) => break,
                    Ok(_) | Err(RecvError::Lagged(_)) => continue,
                }
            }
            if let Some(registry) = registry.upgrade() {
                registry.finalize(&link).await;
            }
        });
    }

    async fn finalize(&self, link: &Arc<Link>) {
        self.sessions
            .remove_if(&link.session_id(), |_, current| Arc::ptr_eq(current, link));

        match link.kind() {
            LinkKind::Host { id, .. } => {
                let removed = self.hosts.remove_if(id, |_, current| Arc::ptr_eq(current, link));
                if removed.is_some() {
                    self.collaborators.hosts.host_disconnected(*id).await;
                    let _ = self.events.send(RegistryEvent::HostUpdated {
                        id: *id,
                        connected: false,
                    });
                    info!("🖥️ Host {} disconnected", id);
                }
            }
            LinkKind::Control { id, .. } => {
                if self.controls.remove_if(id, |_, current| Arc::ptr_eq(current, link)).is_some() {
                    self.publish_control_count();
                }
            }
        }

        link.fail_pending();
        self.router.fail_pending_to(link.session_id()).await;
        self.router.drop_pending_from(link);
    }

    fn publish_control_count(&self) {
        let count = self.controls.len();
        self.metrics.set_control_connections(count);
        let _ = self.events.send(RegistryEvent::ControlCountChanged { count });
    }

    /// Feeds steady-state frames from `socket` into `link` until the socket
    /// closes or misbehaves.
    async fn pump(
        self: &Arc<Self>,
        link: &Arc<Link>,
        socket: &SocketHandle,
        inbound: &mut mpsc::UnboundedReceiver<Inbound>,
    ) {
        let session_id = link.session_id();
        while let Some(item) = inbound.recv().await {
            let text = match item {
                Inbound::Text(text) => text,
                Inbound::Activity => {
                    link.connector().touch(socket.id()).await;
                    continue;
                }
                Inbound::Unsupported => {
                    warn!(session_id, "Unsupported frame from {}, dropping socket", link.address());
                    socket.terminate();
                    break;
                }
            };

            let frame = match Frame::parse(&text) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!(session_id, "Malformed frame from {}: {}", link.address(), e);
                    socket.terminate();
                    break;
                }
            };
            let message = match link.connector().receive(socket.id(), frame).await {
                Ok(Some(message)) => message,
                Ok(None) => continue,
                Err(e) => {
                    warn!(session_id, "Protocol violation by {}: {}", link.address(), e);
                    socket.terminate();
                    break;
                }
            };

            if let Err(e) = link.handle(self, message).await {
                warn!(session_id, "❌ Closing session of {}: {}", link.address(), e);
                link.connector()
                    .close(CloseCode::InvalidMessage, "Invalid message")
                    .await;
                break;
            }
        }
    }
}
