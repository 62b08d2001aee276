//! Request handlers every controller carries.
//!
//! These only touch link-layer state: what is connected, and whose
//! credentials are still good. Everything else is registered by the
//! embedding application on the same [`HandlerTable`].

use crate::collaborators::User;
use crate::error::{CloseCode, HandlerError, LinkError};
use crate::handlers::{HandlerScope, HandlerTable, Permission, RequestMessage};
use crate::link::LinkKind;
use crate::message::PluginVersions;
use crate::utils::current_timestamp_ms;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

pub const GET_INFO_PERMISSION: &str = "core.controller.get_info";
pub const LIST_HOSTS_PERMISSION: &str = "core.host.list";
pub const REVOKE_OTHER_USER_TOKEN_PERMISSION: &str = "core.user.revoke_other_token";
pub const REVOKE_HOST_TOKEN_PERMISSION: &str = "core.host.revoke_token";

const REVOKED_REASON: &str = "Credentials revoked";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ControllerInfoRequest {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControllerInfo {
    pub version: String,
    pub plugins: PluginVersions,
    pub connected_hosts: usize,
    pub connected_controls: usize,
    pub uptime_ms: u64,
}

impl RequestMessage for ControllerInfoRequest {
    const NAME: &'static str = "controller.info";
    type Response = ControllerInfo;

    fn permission() -> Permission {
        Permission::named(GET_INFO_PERMISSION)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HostListRequest {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostSummary {
    pub id: u32,
    pub name: String,
    pub version: String,
    pub plugins: PluginVersions,
    pub public_address: Option<String>,
    pub remote: String,
}

impl RequestMessage for HostListRequest {
    const NAME: &'static str = "host.list";
    type Response = Vec<HostSummary>;

    fn permission() -> Permission {
        Permission::named(LIST_HOSTS_PERMISSION)
    }
}

/// Revokes every token issued to a user. Without `name` the caller's own.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RevokeUserTokenRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl RequestMessage for RevokeUserTokenRequest {
    const NAME: &'static str = "user.revoke_token";
    type Response = ();

    fn permission() -> Permission {
        Permission::check(may_revoke_user_token)
    }
}

fn may_revoke_user_token(user: &User, data: &Value) -> Result<(), String> {
    let target = data.get("name").and_then(Value::as_str);
    match target {
        None => Ok(()),
        Some(name) if name == user.name => Ok(()),
        Some(_) if user.has_permission(REVOKE_OTHER_USER_TOKEN_PERMISSION) => Ok(()),
        Some(_) => Err(REVOKE_OTHER_USER_TOKEN_PERMISSION.to_string()),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RevokeHostTokenRequest {
    pub host_id: u32,
}

impl RequestMessage for RevokeHostTokenRequest {
    const NAME: &'static str = "host.revoke_token";
    type Response = ();

    fn permission() -> Permission {
        Permission::named(REVOKE_HOST_TOKEN_PERMISSION)
    }
}

/// Registers the built-in handlers on `table`.
pub fn register(table: &mut HandlerTable) -> Result<(), LinkError> {
    table.on_request::<ControllerInfoRequest, _, _>(HandlerScope::All, |ctx, _| async move {
        let registry = &ctx.registry;
        Ok(ControllerInfo {
            version: registry.config().version.clone(),
            plugins: registry.config().plugins.clone(),
            connected_hosts: registry.host_count(),
            connected_controls: registry.control_count(),
            uptime_ms: current_timestamp_ms().saturating_sub(registry.started_at_ms()),
        })
    })?;

    table.on_request::<HostListRequest, _, _>(HandlerScope::Control, |ctx, _| async move {
        let hosts = ctx
            .registry
            .host_links()
            .iter()
            .filter_map(|link| match link.kind() {
                LinkKind::Host { registration, .. } => Some(HostSummary {
                    id: registration.id,
                    name: registration.name.clone(),
                    version: registration.version.clone(),
                    plugins: registration.plugins.clone(),
                    public_address: registration.public_address.clone(),
                    remote: registration.remote.clone(),
                }),
                LinkKind::Control { .. } => None,
            })
            .collect();
        Ok(hosts)
    })?;

    table.on_request::<RevokeUserTokenRequest, _, _>(HandlerScope::Control, |ctx, request| async move {
        let target = match (request.name, ctx.user_name()) {
            (Some(name), _) => name,
            (None, Some(own)) => own.to_string(),
            (None, None) => return Err(HandlerError::failed("No user to revoke tokens for")),
        };
        if !ctx.registry.collaborators().users.revoke_tokens(&target).await {
            return Err(HandlerError::failed(format!("User {target} does not exist")));
        }

        let terminated = ctx
            .registry
            .terminate_user_links(&target, CloseCode::CredentialsRevoked, REVOKED_REASON)
            .await;
        info!(
            "🔑 Tokens of user {} revoked by {}, {} session(s) ended",
            target, ctx.src, terminated
        );
        Ok(())
    })?;

    table.on_request::<RevokeHostTokenRequest, _, _>(HandlerScope::Control, |ctx, request| async move {
        let host_id = request.host_id;
        ctx.registry.collaborators().hosts.revoke_tokens(host_id).await;
        let terminated = ctx
            .registry
            .terminate_host_link(host_id, CloseCode::CredentialsRevoked, REVOKED_REASON)
            .await;
        info!(
            "🔑 Tokens of host {} revoked by {}{}",
            host_id,
            ctx.src,
            if terminated { ", session ended" } else { "" }
        );
        Ok(())
    })?;

    Ok(())
}

/// A table holding only the built-in handlers.
pub fn default_handlers() -> Result<HandlerTable, LinkError> {
    let mut table = HandlerTable::new();
    register(&mut table)?;
    Ok(table)
}
