//! Links: a session plus what the controller knows about the peer behind it.
//!
//! Inbound traffic goes through [`Link::handle`], which checks the claimed
//! `src` against the peer's real identity before anything else happens. After
//! that a message either reaches a local handler or is handed to the
//! [`Router`](crate::router::Router).

use crate::address::{Address, AddressType};
use crate::collaborators::HostRegistration;
use crate::connector::Connector;
use crate::error::{ErrorCode, HandlerError, LinkError, RequestError};
use crate::handlers::{EventEntry, EventMessage, HandlerContext, HandlerScope, Permission, RequestMessage};
use crate::message::{ErrorResponse, Event, Message, Request, Response};
use crate::registry::LinkRegistry;
use crate::router::{RouteOutcome, Router};
use dashmap::DashMap;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::timeout;
use tracing::{debug, error, warn};

/// The kind of peer behind a link.
#[derive(Debug, Clone)]
pub enum LinkKind {
    Host {
        id: u32,
        registration: HostRegistration,
    },
    Control {
        id: u32,
        /// Name of the authenticated user
        user: String,
    },
}

type PendingReply = oneshot::Sender<Result<Value, RequestError>>;

/// One peer as the controller sees it.
pub struct Link {
    kind: LinkKind,
    connector: Arc<Connector>,
    /// Requests the controller itself sent to this peer
    pending: DashMap<u64, PendingReply>,
    next_request_id: AtomicU64,
    request_timeout: Duration,
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link")
            .field("kind", &self.kind)
            .field("session_id", &self.connector.session_id())
            .finish_non_exhaustive()
    }
}

impl Link {
    pub fn new(kind: LinkKind, connector: Arc<Connector>, request_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            kind,
            connector,
            pending: DashMap::new(),
            next_request_id: AtomicU64::new(1),
            request_timeout,
        })
    }

    pub fn kind(&self) -> &LinkKind {
        &self.kind
    }

    pub fn address(&self) -> Address {
        self.connector.address()
    }

    pub fn connector(&self) -> &Arc<Connector> {
        &self.connector
    }

    pub fn session_id(&self) -> u64 {
        self.connector.session_id()
    }

    /// Handler scope matching this link's peer type.
    pub fn scope(&self) -> HandlerScope {
        match self.kind {
            LinkKind::Host { .. } => HandlerScope::Host,
            LinkKind::Control { .. } => HandlerScope::Control,
        }
    }

    pub fn host_id(&self) -> Option<u32> {
        match self.kind {
            LinkKind::Host { id, .. } => Some(id),
            LinkKind::Control { .. } => None,
        }
    }

    pub fn user_name(&self) -> Option<&str> {
        match &self.kind {
            LinkKind::Control { user, .. } => Some(user),
            LinkKind::Host { .. } => None,
        }
    }

    pub async fn send(&self, message: Message) -> Result<u64, LinkError> {
        self.connector.send(message).await
    }

    /// Sends `payload` from the controller to `dst` over this link.
    pub async fn send_event<E: EventMessage>(&self, dst: Address, payload: &E) -> Result<u64, LinkError> {
        let event = Event {
            seq: 0,
            src: Address::CONTROLLER,
            dst,
            name: E::NAME.to_string(),
            data: serde_json::to_value(payload)?,
        };
        self.send(Message::Event(event)).await
    }

    /// Sends a request from the controller to this peer and waits for the answer.
    pub async fn request<R: RequestMessage>(&self, payload: &R) -> Result<R::Response, RequestError> {
        let data = serde_json::to_value(payload)
            .map_err(|e| RequestError::new(ErrorCode::InvalidData, e.to_string()))?;
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let (reply_tx, reply_rx) = oneshot::channel();
        self.pending.insert(request_id, reply_tx);

        let request = Request {
            seq: 0,
            src: Address::CONTROLLER,
            dst: self.address(),
            request_id,
            name: R::NAME.to_string(),
            data,
        };
        if self.send(Message::Request(request)).await.is_err() {
            self.pending.remove(&request_id);
            return Err(RequestError::session_lost());
        }

        let data = match timeout(self.request_timeout, reply_rx).await {
            Ok(Ok(result)) => result?,
            Ok(Err(_)) => return Err(RequestError::session_lost()),
            Err(_) => {
                self.pending.remove(&request_id);
                return Err(RequestError::timeout());
            }
        };
        serde_json::from_value(data).map_err(|e| {
            RequestError::new(
                ErrorCode::InvalidData,
                format!("Malformed {} response: {}", R::NAME, e),
            )
        })
    }

    /// Fails every request the controller is still waiting on with `session_lost`.
    pub fn fail_pending(&self) {
        let request_ids: Vec<u64> = self.pending.iter().map(|entry| *entry.key()).collect();
        for request_id in request_ids {
            if let Some((_, reply)) = self.pending.remove(&request_id) {
                let _ = reply.send(Err(RequestError::session_lost()));
            }
        }
    }

    /// Sends a `responseError` for the request `request_id` that `requester`
    /// sent to `responder`.
    pub async fn respond_error(
        &self,
        responder: Address,
        requester: Address,
        request_id: u64,
        error: RequestError,
    ) {
        let message = Message::ResponseError(ErrorResponse {
            seq: 0,
            src: responder,
            dst: requester,
            request_id,
            code: error.code,
            message: error.message,
        });
        if let Err(e) = self.send(message).await {
            debug!(session_id = self.session_id(), "Could not deliver error response: {}", e);
        }
    }

    /// Forwarding entry point for requests routed to this link.
    ///
    /// The request goes out under an id the router allocated, so the reply can
    /// find its way back to `origin` whatever id the requester used.
    pub async fn forward_request(self: &Arc<Self>, router: &Arc<Router>, origin: &Arc<Link>, mut request: Request) {
        let forward_id = router.track(origin, &request, self);
        let original_id = request.request_id;
        let (requester, responder) = (request.src, request.dst);
        request.request_id = forward_id;

        if self.send(Message::Request(request)).await.is_err() {
            router.untrack(forward_id);
            origin
                .respond_error(responder, requester, original_id, RequestError::session_lost())
                .await;
        }
    }

    /// Validates and dispatches one inbound message.
    ///
    /// `Err` means the peer sent something it is not allowed to send and the
    /// session should be torn down.
    pub async fn handle(self: &Arc<Self>, registry: &Arc<LinkRegistry>, message: Message) -> Result<(), LinkError> {
        self.validate_source(registry, message.src()).await?;

        match message {
            Message::Request(request) => self.handle_request(registry, request).await,
            Message::Event(event) => self.handle_event(registry, event).await,
            Message::Response(response) if response.dst.is_controller() => {
                self.resolve(response.request_id, Ok(response.data));
            }
            Message::ResponseError(error) if error.dst.is_controller() => {
                self.resolve(error.request_id, Err(error.to_request_error()));
            }
            reply => registry.router().route_reply(registry, self, reply).await,
        }
        Ok(())
    }

    async fn validate_source(&self, registry: &LinkRegistry, src: Address) -> Result<(), LinkError> {
        let valid = match &self.kind {
            LinkKind::Host { id, .. } => match src.address_type {
                AddressType::Host => src.id == *id,
                AddressType::Instance => {
                    registry
                        .collaborators()
                        .instances
                        .resolve_assigned_host(src.id)
                        .await
                        == Some(*id)
                }
                _ => false,
            },
            LinkKind::Control { id, .. } => src == Address::control(*id),
        };

        if valid {
            Ok(())
        } else {
            Err(LinkError::InvalidSource {
                link: self.address(),
                claimed: src,
            })
        }
    }

    fn resolve(&self, request_id: u64, result: Result<Value, RequestError>) {
        match self.pending.remove(&request_id) {
            Some((_, reply)) => {
                let _ = reply.send(result);
            }
            None => debug!(
                session_id = self.session_id(),
                request_id, "Reply to unknown or expired request"
            ),
        }
    }

    async fn handle_request(self: &Arc<Self>, registry: &Arc<LinkRegistry>, request: Request) {
        let request = if request.dst.is_controller() {
            request
        } else {
            if let Err(error) = self.authorize_outgoing_request(registry, &request).await {
                self.respond_error(request.dst, request.src, request.request_id, error)
                    .await;
                return;
            }
            let has_fallback = registry.handlers().request(&request.name, self.scope()).is_some();
            match registry
                .router()
                .forward(registry, self, Message::Request(request), has_fallback)
                .await
            {
                RouteOutcome::NotHandled(Message::Request(request)) => request,
                _ => return,
            }
        };
        self.dispatch_request(registry, request).await;
    }

    async fn dispatch_request(self: &Arc<Self>, registry: &Arc<LinkRegistry>, request: Request) {
        let Request {
            src,
            dst,
            request_id,
            name,
            data,
            ..
        } = request;

        let Some(entry) = registry.handlers().request(&name, self.scope()).cloned() else {
            let error = RequestError::new(ErrorCode::UnknownRequest, format!("Unknown request {name}"));
            self.respond_error(dst, src, request_id, error).await;
            return;
        };
        if let Err(error) = self.authorize(registry, &name, &entry.permission, &data).await {
            self.respond_error(dst, src, request_id, error).await;
            return;
        }

        let ctx = HandlerContext {
            registry: registry.clone(),
            link: self.clone(),
            src,
            dst,
        };
        let link = self.clone();
        tokio::spawn(async move {
            match entry.call(ctx, data).await {
                Ok(data) => {
                    let response = Message::Response(Response {
                        seq: 0,
                        src: dst,
                        dst: src,
                        request_id,
                        data,
                    });
                    if let Err(e) = link.send(response).await {
                        debug!(session_id = link.session_id(), "Could not deliver {} response: {}", name, e);
                    }
                }
                Err(handler_error) => {
                    if let HandlerError::Internal(cause) = &handler_error {
                        error!(
                            session_id = link.session_id(),
                            "Handler for {} from {} failed: {:?}",
                            name,
                            src,
                            cause
                        );
                    }
                    link.respond_error(dst, src, request_id, handler_error.to_request_error())
                        .await;
                }
            }
        });
    }

    async fn handle_event(self: &Arc<Self>, registry: &Arc<LinkRegistry>, event: Event) {
        let entry = registry.handlers().event(&event.name, self.scope()).cloned();

        let event = if event.dst.is_controller() {
            event
        } else if !self.may_send_event(registry, &event).await {
            return;
        } else if event.dst.is_broadcast() {
            // Broadcasts reach the other peers and, if wanted, the controller too
            let local = entry.as_ref().map(|_| event.clone());
            registry
                .router()
                .forward(registry, self, Message::Event(event), false)
                .await;
            match local {
                Some(event) => event,
                None => return,
            }
        } else {
            match registry
                .router()
                .forward(registry, self, Message::Event(event), entry.is_some())
                .await
            {
                RouteOutcome::NotHandled(Message::Event(event)) => event,
                _ => return,
            }
        };
        self.dispatch_event(registry, entry, event).await;
    }

    async fn dispatch_event(self: &Arc<Self>, registry: &Arc<LinkRegistry>, entry: Option<EventEntry>, event: Event) {
        let Some(entry) = entry else {
            warn!(
                session_id = self.session_id(),
                "No handler for event {} from {}", event.name, event.src
            );
            return;
        };
        if self
            .authorize(registry, &event.name, &entry.permission, &event.data)
            .await
            .is_err()
        {
            return;
        }

        let ctx = HandlerContext {
            registry: registry.clone(),
            link: self.clone(),
            src: event.src,
            dst: event.dst,
        };
        if let Err(e) = entry.call(ctx, event.data).await {
            warn!(
                session_id = self.session_id(),
                "Handler for event {} from {} failed: {:?}", event.name, event.src, e
            );
        }
    }

    /// Class level check for a request a control peer addresses to another
    /// peer. Only declared classes may leave the controller.
    async fn authorize_outgoing_request(&self, registry: &LinkRegistry, request: &Request) -> Result<(), RequestError> {
        if !matches!(self.kind, LinkKind::Control { .. }) {
            return Ok(());
        }
        match registry.handlers().request_permission(&request.name) {
            Some(permission) => {
                self.authorize(registry, &request.name, permission, &request.data)
                    .await
            }
            None => Err(RequestError::new(
                ErrorCode::UnknownRequest,
                format!("Unknown request {}", request.name),
            )),
        }
    }

    /// Class level check for an event a control peer addresses to other peers.
    async fn may_send_event(&self, registry: &LinkRegistry, event: &Event) -> bool {
        if !matches!(self.kind, LinkKind::Control { .. }) {
            return true;
        }
        match registry.handlers().event_permission(&event.name) {
            Some(permission) => self
                .authorize(registry, &event.name, permission, &event.data)
                .await
                .is_ok(),
            None => {
                warn!(
                    session_id = self.session_id(),
                    "Dropping undeclared event {} from {} to {}", event.name, event.src, event.dst
                );
                false
            }
        }
    }

    /// Permission check for control peers. Hosts are trusted.
    ///
    /// The user is resolved again for every check so revoked permissions take
    /// effect without a reconnect.
    async fn authorize(
        &self,
        registry: &LinkRegistry,
        name: &str,
        permission: &Permission,
        data: &Value,
    ) -> Result<(), RequestError> {
        let LinkKind::Control { user: user_name, .. } = &self.kind else {
            return Ok(());
        };
        if matches!(permission, Permission::None) {
            return Ok(());
        }

        let missing = match registry.collaborators().users.resolve_user(user_name).await {
            Some(user) => permission.authorize(&user, data).err(),
            None => Some(format!("user {user_name} no longer exists")),
        };
        match missing {
            None => Ok(()),
            Some(missing) => {
                warn!(
                    target: "audit",
                    user = %user_name,
                    link = %self.address(),
                    permission = %missing,
                    "Denied {} for {}: missing {}",
                    name,
                    user_name,
                    missing
                );
                Err(RequestError::new(
                    ErrorCode::PermissionDenied,
                    format!("Permission denied: {missing}"),
                ))
            }
        }
    }
}
