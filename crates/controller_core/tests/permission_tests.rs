//! Permission checks on control links and the built-in handlers.

mod common;

use common::{expect_closed, expect_silence, Harness};
use controller_core::builtin::{
    self, ControllerInfo, HostSummary, GET_INFO_PERMISSION, LIST_HOSTS_PERMISSION,
    REVOKE_HOST_TOKEN_PERMISSION, REVOKE_OTHER_USER_TOKEN_PERMISSION,
};
use controller_core::message::{Frame, RegisterControl};
use controller_core::socket::Outbound;
use controller_core::{
    Address, AddressType, ErrorCode, EventMessage, HandlerTable, Permission, RegistryEvent,
    RequestMessage, User, CONNECT_PERMISSION,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;

const DELETE_INSTANCE_PERMISSION: &str = "core.instance.delete";
const KILL_INSTANCES_PERMISSION: &str = "core.instance.kill_all";

/// Handled by hosts, never by the controller.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeleteInstance {
    instance_id: u32,
}

impl RequestMessage for DeleteInstance {
    const NAME: &'static str = "instance.delete";
    type Response = ();

    fn permission() -> Permission {
        Permission::named(DELETE_INSTANCE_PERMISSION)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct KillInstances {}

impl EventMessage for KillInstances {
    const NAME: &'static str = "instance.kill_all";

    fn permission() -> Permission {
        Permission::named(KILL_INSTANCES_PERMISSION)
    }
}

fn host_side_handlers() -> HandlerTable {
    let mut table = builtin::default_handlers().unwrap();
    table.declare_request::<DeleteInstance>().unwrap();
    table.declare_event::<KillInstances>().unwrap();
    table
}

fn response_data(frame: Frame, request_id: u64) -> Value {
    match frame {
        Frame::Response(response) => {
            assert_eq!(response.request_id, request_id);
            response.data
        }
        other => panic!("expected response, got {:?}", other),
    }
}

fn error_code(frame: Frame, request_id: u64) -> ErrorCode {
    match frame {
        Frame::ResponseError(error) => {
            assert_eq!(error.request_id, request_id);
            error.code
        }
        other => panic!("expected responseError, got {:?}", other),
    }
}

#[tokio::test]
async fn test_denied_host_revocation_changes_nothing() {
    let harness = Harness::new();
    harness.add_user("alice", &[]);
    let mut host = harness.host(1).await;
    let mut control = harness.control("alice").await;

    control.request(Address::CONTROLLER, 1, "host.revoke_token", json!({ "hostId": 1 }));
    assert_eq!(error_code(control.recv().await, 1), ErrorCode::PermissionDenied);

    assert_eq!(harness.memory.hosts.record(1).unwrap().token_valid_after, 0);
    assert!(harness.registry.host_link(1).is_some());
    expect_silence(&mut host.peer).await;
}

#[tokio::test]
async fn test_allowed_host_revocation_ends_host_session() {
    let harness = Harness::new();
    harness.add_user("alice", &[REVOKE_HOST_TOKEN_PERMISSION]);
    let mut host = harness.host(1).await;
    let mut control = harness.control("alice").await;
    let mut events = harness.registry.subscribe();

    control.request(Address::CONTROLLER, 1, "host.revoke_token", json!({ "hostId": 1 }));
    assert_eq!(response_data(control.recv().await, 1), Value::Null);

    assert_eq!(expect_closed(&mut host.peer).await, Outbound::Terminate);
    loop {
        match events.recv().await.unwrap() {
            RegistryEvent::HostUpdated { id: 1, connected } => {
                assert!(!connected);
                break;
            }
            _ => continue,
        }
    }
    assert!(harness.memory.hosts.record(1).unwrap().token_valid_after > 0);
    assert!(harness.registry.host_link(1).is_none());
}

#[tokio::test]
async fn test_permission_granted_later_applies_without_reconnect() {
    let harness = Harness::new();
    harness.add_user("alice", &[]);
    let mut control = harness.control("alice").await;

    control.request(Address::CONTROLLER, 1, "controller.info", json!({}));
    assert_eq!(error_code(control.recv().await, 1), ErrorCode::PermissionDenied);

    harness.memory.users.grant("alice", GET_INFO_PERMISSION);
    control.request(Address::CONTROLLER, 2, "controller.info", json!({}));
    let info: ControllerInfo = serde_json::from_value(response_data(control.recv().await, 2)).unwrap();
    assert_eq!(info.connected_controls, 1);
    assert_eq!(info.connected_hosts, 0);
}

#[tokio::test]
async fn test_admin_passes_every_named_permission() {
    let harness = Harness::new();
    harness
        .memory
        .users
        .insert(User::new("root").with_permission(CONNECT_PERMISSION).as_admin());
    let mut control = harness.control("root").await;

    control.request(Address::CONTROLLER, 1, "host.list", json!(null));
    assert_eq!(response_data(control.recv().await, 1), json!([]));
}

#[tokio::test]
async fn test_hosts_are_not_permission_checked() {
    let harness = Harness::new();
    let mut host = harness.host(3).await;

    host.request(Address::CONTROLLER, 1, "controller.info", json!({}));
    let info: ControllerInfo = serde_json::from_value(response_data(host.recv().await, 1)).unwrap();
    assert_eq!(info.connected_hosts, 1);
    assert_eq!(info.version, harness.registry.config().version);
}

#[tokio::test]
async fn test_host_list_is_ordered_by_id() {
    let harness = Harness::new();
    harness.add_user("alice", &[LIST_HOSTS_PERMISSION]);
    let _third = harness.host(3).await;
    let _first = harness.host(1).await;
    let mut control = harness.control("alice").await;

    control.request(Address::CONTROLLER, 1, "host.list", json!({}));
    let hosts: Vec<HostSummary> = serde_json::from_value(response_data(control.recv().await, 1)).unwrap();
    let ids: Vec<u32> = hosts.iter().map(|host| host.id).collect();
    assert_eq!(ids, vec![1, 3]);
    assert_eq!(hosts[0].name, "host-1");
    assert_eq!(hosts[0].remote, "test-peer");
}

#[tokio::test]
async fn test_revoking_another_user_needs_permission() {
    let harness = Harness::new();
    harness.add_user("alice", &[]);
    harness.add_user("bob", &[]);
    let mut alice = harness.control("alice").await;
    let mut bob = harness.control("bob").await;

    alice.request(Address::CONTROLLER, 1, "user.revoke_token", json!({ "name": "bob" }));
    assert_eq!(error_code(alice.recv().await, 1), ErrorCode::PermissionDenied);
    expect_silence(&mut bob.peer).await;
    assert_eq!(harness.memory.users.get("bob").unwrap().token_valid_after, 0);
}

#[tokio::test]
async fn test_revoked_user_is_disconnected_and_token_refused() {
    let harness = Harness::new();
    harness.add_user("alice", &[REVOKE_OTHER_USER_TOKEN_PERMISSION]);
    harness.add_user("bob", &[]);
    let mut alice = harness.control("alice").await;
    let mut bob = harness.control("bob").await;
    let old_token = harness.registry.signer().user_token("bob").unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;

    alice.request(Address::CONTROLLER, 1, "user.revoke_token", json!({ "name": "bob" }));
    assert_eq!(response_data(alice.recv().await, 1), Value::Null);
    assert_eq!(expect_closed(&mut bob.peer).await, Outbound::Terminate);

    let (mut peer, _socket) = harness.connect().await;
    peer.send_frame(&Frame::RegisterControl(RegisterControl { token: old_token }));
    assert!(matches!(
        expect_closed(&mut peer).await,
        Outbound::Close { code: 4004, .. }
    ));
}

#[tokio::test]
async fn test_revoking_unknown_user_fails() {
    let harness = Harness::new();
    harness.add_user("alice", &[REVOKE_OTHER_USER_TOKEN_PERMISSION]);
    let mut alice = harness.control("alice").await;

    alice.request(Address::CONTROLLER, 1, "user.revoke_token", json!({ "name": "nobody" }));
    assert_eq!(error_code(alice.recv().await, 1), ErrorCode::Failed);
}

#[tokio::test]
async fn test_unprivileged_control_cannot_reach_hosts() {
    let harness = Harness::with_handlers(host_side_handlers());
    harness.add_user("mallory", &[]);
    let mut host = harness.host(1).await;
    let mut control = harness.control("mallory").await;

    control.request(Address::host(1), 1, DeleteInstance::NAME, json!({ "instanceId": 3 }));
    assert_eq!(error_code(control.recv().await, 1), ErrorCode::PermissionDenied);

    control.request(Address::host(1), 2, "instance.format_disk", json!({}));
    assert_eq!(error_code(control.recv().await, 2), ErrorCode::UnknownRequest);

    control.event(Address::broadcast(AddressType::Host), KillInstances::NAME, json!({}));
    control.event(Address::host(1), KillInstances::NAME, json!({}));
    control.event(Address::host(1), "instance.undeclared", json!({}));

    expect_silence(&mut host.peer).await;
    expect_silence(&mut control.peer).await;
    assert_eq!(harness.registry.router().pending_count(), 0);
}

#[tokio::test]
async fn test_privileged_control_reaches_hosts() {
    let harness = Harness::with_handlers(host_side_handlers());
    harness.add_user(
        "alice",
        &[DELETE_INSTANCE_PERMISSION, KILL_INSTANCES_PERMISSION],
    );
    let mut host = harness.host(1).await;
    let mut control = harness.control("alice").await;

    control.request(Address::host(1), 1, DeleteInstance::NAME, json!({ "instanceId": 3 }));
    match host.recv().await {
        Frame::Request(request) => {
            assert_eq!(request.name, DeleteInstance::NAME);
            assert_eq!(request.src, control.address);
        }
        other => panic!("expected forwarded request, got {:?}", other),
    }

    control.event(Address::broadcast(AddressType::Host), KillInstances::NAME, json!({}));
    match host.recv().await {
        Frame::Event(event) => {
            assert_eq!(event.name, KillInstances::NAME);
            assert_eq!(event.src, control.address);
        }
        other => panic!("expected broadcast event, got {:?}", other),
    }
}
