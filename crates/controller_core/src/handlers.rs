//! Central handler tables.
//!
//! Every request and event class has a stable name that doubles as its wire
//! discriminant. Handlers are registered against that name once, before the
//! registry starts accepting links, and looked up per message at dispatch
//! time. Typed handlers see their payload already decoded; the table itself
//! only ever stores type-erased closures over [`serde_json::Value`].
//!
//! # Example
//!
//! ```rust,ignore
//! #[derive(Serialize, Deserialize)]
//! struct StartInstance { instance_id: u32 }
//!
//! impl RequestMessage for StartInstance {
//!     const NAME: &'static str = "instance.start";
//!     type Response = ();
//!     fn permission() -> Permission { Permission::named("core.instance.start") }
//! }
//!
//! table.on_request::<StartInstance, _, _>(HandlerScope::Control, |ctx, req| async move {
//!     info!("{} asked to start instance {}", ctx.src, req.instance_id);
//!     Ok(())
//! })?;
//! ```

use crate::address::Address;
use crate::collaborators::User;
use crate::error::{HandlerError, LinkError};
use crate::link::Link;
use crate::registry::LinkRegistry;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// A request class: name, payload shape, response shape and permission.
pub trait RequestMessage: Serialize + DeserializeOwned + Send + 'static {
    const NAME: &'static str;
    type Response: Serialize + DeserializeOwned + Send + 'static;

    fn permission() -> Permission {
        Permission::None
    }
}

/// An event class: name, payload shape and permission.
pub trait EventMessage: Serialize + DeserializeOwned + Send + 'static {
    const NAME: &'static str;

    fn permission() -> Permission {
        Permission::None
    }
}

type PermissionCheck = dyn Fn(&User, &Value) -> Result<(), String> + Send + Sync;

/// What a control peer's user must hold to send a message class.
///
/// Host peers are trusted and never checked.
#[derive(Clone)]
pub enum Permission {
    /// Always allowed
    None,
    /// The user must hold this permission (admins hold all of them)
    Named(String),
    /// Context dependent check over the user and the raw payload. `Err`
    /// names what was missing.
    Check(Arc<PermissionCheck>),
}

impl Permission {
    pub fn named(name: impl Into<String>) -> Self {
        Permission::Named(name.into())
    }

    pub fn check<F>(check: F) -> Self
    where
        F: Fn(&User, &Value) -> Result<(), String> + Send + Sync + 'static,
    {
        Permission::Check(Arc::new(check))
    }

    /// `Err` carries the permission the user lacks.
    pub fn authorize(&self, user: &User, data: &Value) -> Result<(), String> {
        match self {
            Permission::None => Ok(()),
            Permission::Named(name) if user.has_permission(name) => Ok(()),
            Permission::Named(name) => Err(name.clone()),
            Permission::Check(check) => check(user, data),
        }
    }
}

impl fmt::Debug for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Permission::None => write!(f, "None"),
            Permission::Named(name) => write!(f, "Named({name:?})"),
            Permission::Check(_) => write!(f, "Check(..)"),
        }
    }
}

/// Which kind of link a handler serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerScope {
    All,
    Host,
    Control,
}

impl HandlerScope {
    fn overlaps(self, other: HandlerScope) -> bool {
        self == HandlerScope::All || other == HandlerScope::All || self == other
    }

    /// Whether a handler registered with this scope serves a link of `kind`.
    pub fn admits(self, kind: HandlerScope) -> bool {
        self.overlaps(kind)
    }
}

/// Everything a handler gets to work with besides its payload.
#[derive(Clone)]
pub struct HandlerContext {
    pub registry: Arc<LinkRegistry>,
    /// The link the message arrived on
    pub link: Arc<Link>,
    /// The validated source of the message
    pub src: Address,
    /// The destination the peer addressed the message to
    pub dst: Address,
}

impl HandlerContext {
    /// Name of the user behind a control link.
    pub fn user_name(&self) -> Option<&str> {
        self.link.user_name()
    }
}

type RawRequestHandler =
    Arc<dyn Fn(HandlerContext, Value) -> BoxFuture<'static, Result<Value, HandlerError>> + Send + Sync>;
type RawEventHandler =
    Arc<dyn Fn(HandlerContext, Value) -> BoxFuture<'static, Result<(), HandlerError>> + Send + Sync>;

#[derive(Clone)]
pub struct RequestEntry {
    pub scope: HandlerScope,
    pub permission: Permission,
    handler: RawRequestHandler,
}

impl RequestEntry {
    pub fn call(&self, ctx: HandlerContext, data: Value) -> BoxFuture<'static, Result<Value, HandlerError>> {
        (self.handler)(ctx, data)
    }
}

#[derive(Clone)]
pub struct EventEntry {
    pub scope: HandlerScope,
    pub permission: Permission,
    handler: RawEventHandler,
}

impl EventEntry {
    pub fn call(&self, ctx: HandlerContext, data: Value) -> BoxFuture<'static, Result<(), HandlerError>> {
        (self.handler)(ctx, data)
    }
}

/// Request and event handlers keyed by message name.
///
/// Besides handlers, the table knows every message class a control peer may
/// send and the permission it requires, including classes that are only ever
/// handled by hosts. Registering a handler declares its class as well.
#[derive(Default)]
pub struct HandlerTable {
    requests: HashMap<String, Vec<RequestEntry>>,
    events: HashMap<String, Vec<EventEntry>>,
    declared_requests: HashMap<String, Permission>,
    declared_events: HashMap<String, Permission>,
}

impl HandlerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares a request class handled elsewhere, so control peers may
    /// address it to hosts and instances.
    pub fn declare_request<R: RequestMessage>(&mut self) -> Result<(), LinkError> {
        self.declare_raw_request(R::NAME, R::permission())
    }

    /// Declares an event class control peers may send to other peers.
    pub fn declare_event<E: EventMessage>(&mut self) -> Result<(), LinkError> {
        self.declare_raw_event(E::NAME, E::permission())
    }

    /// The first declaration of a class wins.
    pub fn declare_raw_request(&mut self, name: &str, permission: Permission) -> Result<(), LinkError> {
        check_name(name)?;
        self.declared_requests
            .entry(name.to_string())
            .or_insert(permission);
        Ok(())
    }

    pub fn declare_raw_event(&mut self, name: &str, permission: Permission) -> Result<(), LinkError> {
        check_name(name)?;
        self.declared_events
            .entry(name.to_string())
            .or_insert(permission);
        Ok(())
    }

    /// Registers a typed request handler.
    pub fn on_request<R, F, Fut>(&mut self, scope: HandlerScope, handler: F) -> Result<(), LinkError>
    where
        R: RequestMessage,
        F: Fn(HandlerContext, R) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R::Response, HandlerError>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        self.on_raw_request(R::NAME, scope, R::permission(), move |ctx, data| {
            let handler = handler.clone();
            async move {
                let request: R = serde_json::from_value(payload_or_empty(data))
                    .map_err(|e| HandlerError::InvalidData(format!("{}: {}", R::NAME, e)))?;
                let response = handler(ctx, request).await?;
                serde_json::to_value(response).map_err(|e| HandlerError::Internal(e.into()))
            }
        })
    }

    /// Registers a typed event handler.
    pub fn on_event<E, F, Fut>(&mut self, scope: HandlerScope, handler: F) -> Result<(), LinkError>
    where
        E: EventMessage,
        F: Fn(HandlerContext, E) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        self.on_raw_event(E::NAME, scope, E::permission(), move |ctx, data| {
            let handler = handler.clone();
            async move {
                let event: E = serde_json::from_value(payload_or_empty(data))
                    .map_err(|e| HandlerError::InvalidData(format!("{}: {}", E::NAME, e)))?;
                handler(ctx, event).await
            }
        })
    }

    /// Registers an untyped request handler, for message classes only known at runtime.
    pub fn on_raw_request<F, Fut>(
        &mut self,
        name: &str,
        scope: HandlerScope,
        permission: Permission,
        handler: F,
    ) -> Result<(), LinkError>
    where
        F: Fn(HandlerContext, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
    {
        check_name(name)?;
        let entries = self.requests.entry(name.to_string()).or_default();
        if entries.iter().any(|entry| entry.scope.overlaps(scope)) {
            return Err(LinkError::HandlerConflict(format!(
                "request {name} already has a handler for {scope:?} links"
            )));
        }
        self.declared_requests
            .entry(name.to_string())
            .or_insert_with(|| permission.clone());
        entries.push(RequestEntry {
            scope,
            permission,
            handler: Arc::new(move |ctx, data| handler(ctx, data).boxed()),
        });
        Ok(())
    }

    pub fn on_raw_event<F, Fut>(
        &mut self,
        name: &str,
        scope: HandlerScope,
        permission: Permission,
        handler: F,
    ) -> Result<(), LinkError>
    where
        F: Fn(HandlerContext, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        check_name(name)?;
        let entries = self.events.entry(name.to_string()).or_default();
        if entries.iter().any(|entry| entry.scope.overlaps(scope)) {
            return Err(LinkError::HandlerConflict(format!(
                "event {name} already has a handler for {scope:?} links"
            )));
        }
        self.declared_events
            .entry(name.to_string())
            .or_insert_with(|| permission.clone());
        entries.push(EventEntry {
            scope,
            permission,
            handler: Arc::new(move |ctx, data| handler(ctx, data).boxed()),
        });
        Ok(())
    }

    pub fn request(&self, name: &str, link_kind: HandlerScope) -> Option<&RequestEntry> {
        self.requests
            .get(name)?
            .iter()
            .find(|entry| entry.scope.admits(link_kind))
    }

    pub fn event(&self, name: &str, link_kind: HandlerScope) -> Option<&EventEntry> {
        self.events
            .get(name)?
            .iter()
            .find(|entry| entry.scope.admits(link_kind))
    }

    /// Permission of a declared request class.
    pub fn request_permission(&self, name: &str) -> Option<&Permission> {
        self.declared_requests.get(name)
    }

    /// Permission of a declared event class.
    pub fn event_permission(&self, name: &str) -> Option<&Permission> {
        self.declared_events.get(name)
    }

    pub fn request_count(&self) -> usize {
        self.requests.values().map(Vec::len).sum()
    }

    pub fn event_count(&self) -> usize {
        self.events.values().map(Vec::len).sum()
    }
}

/// An absent payload reads as an empty object.
fn payload_or_empty(data: Value) -> Value {
    match data {
        Value::Null => Value::Object(Default::default()),
        other => other,
    }
}

fn check_name(name: &str) -> Result<(), LinkError> {
    if name.trim().is_empty() {
        return Err(LinkError::HandlerConflict("message name must not be empty".into()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Serialize, Deserialize)]
    struct Ping {
        nonce: u32,
    }

    impl RequestMessage for Ping {
        const NAME: &'static str = "test.ping";
        type Response = u32;
    }

    #[derive(Serialize, Deserialize)]
    struct Noticed {}

    impl EventMessage for Noticed {
        const NAME: &'static str = "test.noticed";

        fn permission() -> Permission {
            Permission::named("test.notice")
        }
    }

    #[test]
    fn test_overlapping_registration_is_rejected() {
        let mut table = HandlerTable::new();
        table
            .on_request::<Ping, _, _>(HandlerScope::Host, |_, ping| async move { Ok(ping.nonce) })
            .unwrap();

        // Different link kind is fine
        table
            .on_request::<Ping, _, _>(HandlerScope::Control, |_, ping| async move { Ok(ping.nonce) })
            .unwrap();

        let result = table.on_request::<Ping, _, _>(HandlerScope::All, |_, ping| async move {
            Ok(ping.nonce)
        });
        assert!(matches!(result, Err(LinkError::HandlerConflict(_))));
        assert_eq!(table.request_count(), 2);
    }

    #[test]
    fn test_empty_names_are_rejected() {
        let mut table = HandlerTable::new();
        let result = table.on_raw_event(" ", HandlerScope::All, Permission::None, |_, _| async {
            Ok(())
        });
        assert!(matches!(result, Err(LinkError::HandlerConflict(_))));
    }

    #[test]
    fn test_lookup_respects_scope() {
        let mut table = HandlerTable::new();
        table
            .on_event::<Noticed, _, _>(HandlerScope::Control, |_, _| async { Ok(()) })
            .unwrap();

        assert!(table.event("test.noticed", HandlerScope::Control).is_some());
        assert!(table.event("test.noticed", HandlerScope::Host).is_none());
        assert!(table.event("test.unknown", HandlerScope::Control).is_none());

        let entry = table.event("test.noticed", HandlerScope::Control).unwrap();
        assert!(matches!(entry.permission, Permission::Named(ref name) if name == "test.notice"));
    }

    #[test]
    fn test_declarations_carry_class_permissions() {
        let mut table = HandlerTable::new();
        table.declare_event::<Noticed>().unwrap();
        table
            .on_request::<Ping, _, _>(HandlerScope::Host, |_, ping| async move { Ok(ping.nonce) })
            .unwrap();
        table
            .declare_raw_request("instance.delete", Permission::named("core.instance.delete"))
            .unwrap();

        // Declared without a local handler
        assert!(table.request("instance.delete", HandlerScope::Control).is_none());
        assert!(matches!(
            table.request_permission("instance.delete"),
            Some(Permission::Named(name)) if name == "core.instance.delete"
        ));
        assert!(matches!(table.request_permission("test.ping"), Some(Permission::None)));
        assert!(matches!(
            table.event_permission("test.noticed"),
            Some(Permission::Named(name)) if name == "test.notice"
        ));
        assert!(table.request_permission("instance.kill").is_none());
        assert!(table.declare_raw_event("", Permission::None).is_err());
    }

    #[test]
    fn test_permission_kinds() {
        let user = User::new("dora").with_permission("core.host.list");
        let data = serde_json::json!({ "name": "dora" });

        assert!(Permission::None.authorize(&user, &data).is_ok());
        assert!(Permission::named("core.host.list").authorize(&user, &data).is_ok());
        assert_eq!(
            Permission::named("core.host.revoke_token").authorize(&user, &data),
            Err("core.host.revoke_token".to_string())
        );

        let own_only = Permission::check(|user, data| {
            if data["name"] == user.name.as_str() {
                Ok(())
            } else {
                Err("core.user.revoke_other_token".into())
            }
        });
        assert!(own_only.authorize(&user, &data).is_ok());
        assert!(own_only
            .authorize(&user, &serde_json::json!({ "name": "eve" }))
            .is_err());
    }
}
