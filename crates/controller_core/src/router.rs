//! Address based routing between links.
//!
//! The router delivers messages whose destination is some other peer. It
//! never owns links: every lookup goes through the [`LinkRegistry`]. Requests
//! are the only messages it keeps state for, so that the eventual reply can
//! be returned to whoever asked even though the reply travels back through
//! the controller.

use crate::address::{Address, AddressType};
use crate::error::{RequestError, RouteError};
use crate::link::Link;
use crate::message::{Message, MessageKind, Request};
use crate::registry::LinkRegistry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, trace, warn};

/// What happened to a message handed to [`Router::forward`].
#[derive(Debug, PartialEq)]
pub enum RouteOutcome {
    /// Passed on to the next hop (or every broadcast recipient)
    Delivered,
    /// No next hop, and the caller said it can handle the message itself
    NotHandled(Message),
    /// No next hop. Requests have been answered with a `responseError`,
    /// anything else was dropped.
    Undeliverable(RouteError),
}

/// A request forwarded to another peer, waiting for its reply.
struct PendingRequest {
    origin: Arc<Link>,
    original_id: u64,
    requester: Address,
    responder: Address,
    destination_session: u64,
    deadline: Instant,
}

pub struct Router {
    pending: DashMap<u64, PendingRequest>,
    next_forward_id: AtomicU64,
    request_timeout: Duration,
}

impl Router {
    pub fn new(request_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            pending: DashMap::new(),
            next_forward_id: AtomicU64::new(1),
            request_timeout,
        })
    }

    /// Number of forwarded requests still waiting for a reply.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Delivers `message` from `origin` towards its destination.
    pub async fn forward(
        self: &Arc<Self>,
        registry: &LinkRegistry,
        origin: &Arc<Link>,
        message: Message,
        has_fallback: bool,
    ) -> RouteOutcome {
        let dst = message.dst();
        let error = if dst.is_broadcast() {
            match self.broadcast(registry, Some(origin), &message).await {
                Ok(_) => return RouteOutcome::Delivered,
                Err(error) => error,
            }
        } else {
            match self.next_hop(registry, origin, dst).await {
                Ok(next_hop) => {
                    self.deliver(origin, &next_hop, message).await;
                    return RouteOutcome::Delivered;
                }
                Err(error) => error,
            }
        };

        if has_fallback && !dst.is_broadcast() {
            return RouteOutcome::NotHandled(message);
        }
        match &message {
            Message::Request(request) => {
                debug!(
                    "Request {} from {} to {} is unroutable: {}",
                    request.name, request.src, dst, error
                );
                origin
                    .respond_error(request.dst, request.src, request.request_id, error.clone().into())
                    .await;
            }
            other => warn!(
                "Dropping {:?} from {} to {}: {}",
                other.kind(),
                other.src(),
                dst,
                error
            ),
        }
        RouteOutcome::Undeliverable(error)
    }

    /// Sends an event to every live link of the class `message.dst()` names,
    /// skipping `origin`. Returns the number of links reached.
    pub async fn broadcast(
        &self,
        registry: &LinkRegistry,
        origin: Option<&Arc<Link>>,
        message: &Message,
    ) -> Result<usize, RouteError> {
        if message.kind() != MessageKind::Event {
            return Err(RouteError::BroadcastNonEvent);
        }
        let dst = message.dst();
        let class = dst
            .broadcast_class()
            .ok_or(RouteError::InvalidBroadcast(dst.id))?;

        let mut delivered = 0;
        for link in registry.links_of(class) {
            if origin.is_some_and(|origin| Arc::ptr_eq(origin, &link)) {
                continue;
            }
            if link.send(message.clone()).await.is_ok() {
                delivered += 1;
            }
        }
        trace!("Broadcast {:?} to {} link(s)", message.name(), delivered);
        Ok(delivered)
    }

    /// Routes a `response`/`responseError` that `from` sent to another peer.
    ///
    /// Replies to forwarded requests go back to the link that asked, under
    /// the id it used. Anything else is routed by address.
    pub async fn route_reply(self: &Arc<Self>, registry: &LinkRegistry, from: &Arc<Link>, mut message: Message) {
        let request_id = match &message {
            Message::Response(response) => response.request_id,
            Message::ResponseError(error) => error.request_id,
            _ => {
                self.forward(registry, from, message, false).await;
                return;
            }
        };

        let tracked = self
            .pending
            .remove_if(&request_id, |_, pending| pending.destination_session == from.session_id());
        let Some((_, pending)) = tracked else {
            self.forward(registry, from, message, false).await;
            return;
        };

        match &mut message {
            Message::Response(response) => response.request_id = pending.original_id,
            Message::ResponseError(error) => error.request_id = pending.original_id,
            _ => {}
        }
        if let Err(e) = pending.origin.send(message).await {
            debug!(
                "Reply for {} could not be returned to {}: {}",
                pending.requester,
                pending.origin.address(),
                e
            );
        }
    }

    /// Starts tracking a request about to be forwarded to `destination`.
    /// Returns the id the request goes out under.
    pub(crate) fn track(self: &Arc<Self>, origin: &Arc<Link>, request: &Request, destination: &Link) -> u64 {
        let forward_id = self.next_forward_id.fetch_add(1, Ordering::Relaxed);
        let deadline = Instant::now() + self.request_timeout;
        self.pending.insert(
            forward_id,
            PendingRequest {
                origin: origin.clone(),
                original_id: request.request_id,
                requester: request.src,
                responder: request.dst,
                destination_session: destination.session_id(),
                deadline,
            },
        );

        let router: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            sleep_until(deadline).await;
            if let Some(router) = router.upgrade() {
                router.expire(forward_id).await;
            }
        });
        forward_id
    }

    pub(crate) fn untrack(&self, forward_id: u64) {
        self.pending.remove(&forward_id);
    }

    /// Answers every request forwarded to the session `session_id` with
    /// `session_lost`.
    pub async fn fail_pending_to(&self, session_id: u64) {
        let forward_ids: Vec<u64> = self
            .pending
            .iter()
            .filter(|entry| entry.destination_session == session_id)
            .map(|entry| *entry.key())
            .collect();

        for forward_id in forward_ids {
            if let Some((_, pending)) = self.pending.remove(&forward_id) {
                pending
                    .origin
                    .respond_error(
                        pending.responder,
                        pending.requester,
                        pending.original_id,
                        RequestError::session_lost(),
                    )
                    .await;
            }
        }
    }

    /// Forgets the requests `origin` forwarded. Their replies have nowhere to go.
    pub fn drop_pending_from(&self, origin: &Arc<Link>) {
        self.pending
            .retain(|_, pending| !Arc::ptr_eq(&pending.origin, origin));
    }

    async fn expire(&self, forward_id: u64) {
        let expired = self
            .pending
            .remove_if(&forward_id, |_, pending| pending.deadline <= Instant::now());
        if let Some((_, pending)) = expired {
            debug!(
                "Forwarded request from {} to {} timed out",
                pending.requester, pending.responder
            );
            pending
                .origin
                .respond_error(
                    pending.responder,
                    pending.requester,
                    pending.original_id,
                    RequestError::timeout(),
                )
                .await;
        }
    }

    async fn deliver(self: &Arc<Self>, origin: &Arc<Link>, next_hop: &Arc<Link>, message: Message) {
        match message {
            Message::Request(request) => next_hop.forward_request(self, origin, request).await,
            other => {
                if let Err(e) = next_hop.send(other).await {
                    debug!("Could not deliver to {}: {}", next_hop.address(), e);
                }
            }
        }
    }

    async fn next_hop(
        &self,
        registry: &LinkRegistry,
        origin: &Arc<Link>,
        dst: Address,
    ) -> Result<Arc<Link>, RouteError> {
        let next_hop = match dst.address_type {
            AddressType::Host => registry
                .host_link(dst.id)
                .ok_or(RouteError::HostNotConnected(dst.id))?,
            AddressType::Instance => {
                let host = registry
                    .collaborators()
                    .instances
                    .resolve_assigned_host(dst.id)
                    .await
                    .ok_or(RouteError::InstanceNotAssigned(dst.id))?;
                registry
                    .host_link(host)
                    .ok_or(RouteError::InstanceHostNotConnected {
                        instance: dst.id,
                        host,
                    })?
            }
            AddressType::Control => registry
                .control_link(dst.id)
                .ok_or(RouteError::ControlNotConnected(dst.id))?,
            AddressType::Controller => return Err(RouteError::ControllerDestination),
            AddressType::Broadcast => return Err(RouteError::InvalidBroadcast(dst.id)),
        };

        if Arc::ptr_eq(&next_hop, origin) {
            return Err(RouteError::Boomerang(dst));
        }
        Ok(next_hop)
    }
}
