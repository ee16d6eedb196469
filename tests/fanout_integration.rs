//! End-to-end fanout tests
//!
//! Two gateway processes are simulated in one test binary: each has its own
//! router, transport and registry, and they share one in-process bus and one
//! membership store, the way separate processes share a broker.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use jsonwebtoken::{encode, EncodingKey, Header};
use serde_json::{json, Value};
use tokio::sync::mpsc;

use realtime_relay::auth::{Claims, JwtValidator};
use realtime_relay::config::{JwtConfig, TenantConfig};
use realtime_relay::gateway::{
    ConnectionGateway, ConnectionHandle, ConnectionState, GatewayError, Handshake, RoomId,
};
use realtime_relay::resilience::ListenerStatus;
use realtime_relay::router::NotificationRouter;
use realtime_relay::session_share::{create_session_share, ClusterConfig, MemoryMembershipStore};
use realtime_relay::tenant::{MemoryIdentityStore, TenantResolver};
use realtime_relay::transport::{MemoryBus, MemoryTransport, TransportError, NOTIFY_PAYLOAD_LIMIT};
use realtime_relay::websocket::{JoinTarget, OutboundMessage};

const SECRET: &str = "integration-secret";

struct Node {
    gateway: Arc<ConnectionGateway>,
    router: Arc<NotificationRouter>,
    transport: Arc<MemoryTransport>,
}

struct Client {
    handle: Arc<ConnectionHandle>,
    rx: mpsc::Receiver<OutboundMessage>,
}

async fn start_node(bus: &MemoryBus, membership: &MemoryMembershipStore, cap: Option<usize>) -> Node {
    let transport = Arc::new(MemoryTransport::new(bus.clone(), cap, Duration::from_secs(1)));
    let router = Arc::new(NotificationRouter::new(transport.clone()));

    let cluster = ClusterConfig {
        enabled: true,
        ..Default::default()
    };
    let share = create_session_share(&cluster, &router, Arc::new(membership.clone()));

    let tenant = TenantConfig {
        enabled: true,
        base_domain: "example.com".into(),
        ..Default::default()
    };
    let identity = MemoryIdentityStore::new(&HashMap::new())
        .with_member("t1", "alice")
        .with_member("t1", "bob")
        .with_member("t2", "carol");

    let gateway = Arc::new(ConnectionGateway::new(
        Arc::new(JwtValidator::new(&JwtConfig {
            secret: SECRET.into(),
            issuer: None,
            audience: None,
        })),
        TenantResolver::new(&tenant),
        Arc::new(identity),
        share,
        16,
    ));
    gateway.register_handlers(&router).unwrap();
    router.start().await.unwrap();

    Node {
        gateway,
        router,
        transport,
    }
}

fn token(user: &str, tenant_claim: Option<&str>) -> String {
    let now = Utc::now().timestamp();
    let claims = Claims {
        sub: user.to_string(),
        exp: now + 3600,
        iat: now,
        roles: vec![],
        tenant_id: tenant_claim.map(str::to_string),
        extra: HashMap::new(),
    };
    encode(&Header::default(), &claims, &EncodingKey::from_secret(SECRET.as_bytes())).unwrap()
}

fn handshake(user: &str, tenant: &str) -> Handshake {
    Handshake {
        token: Some(token(user, None)),
        origin: Some(format!("https://{}.example.com", tenant)),
        host: None,
    }
}

async fn connect(node: &Node, user: &str, tenant: &str, target: JoinTarget) -> Client {
    let mut state = ConnectionState::Connecting;
    let (handle, rx) = node.gateway.admit(&handshake(user, tenant), &mut state).await.unwrap();
    node.gateway.join(&handle, &target).await.unwrap();
    Client { handle, rx }
}

fn to_json(message: OutboundMessage) -> Value {
    match message {
        OutboundMessage::Preserialized(text) => serde_json::from_str(&text).unwrap(),
        OutboundMessage::Message(message) => serde_json::to_value(message).unwrap(),
        OutboundMessage::Close { code, reason } => json!({"type": "close", "code": code, "reason": reason}),
    }
}

async fn next_frame(client: &mut Client) -> Value {
    let message = tokio::time::timeout(Duration::from_secs(2), client.rx.recv())
        .await
        .expect("frame within window")
        .expect("channel open");
    to_json(message)
}

async fn assert_silent(client: &mut Client) {
    let result = tokio::time::timeout(Duration::from_millis(200), client.rx.recv()).await;
    assert!(result.is_err(), "unexpected frame: {:?}", result.ok().flatten().map(to_json));
}

#[tokio::test]
async fn test_event_reaches_member_of_tenant_room() {
    let bus = MemoryBus::new(64);
    let node = start_node(&bus, &MemoryMembershipStore::new(), None).await;
    let mut s1 = connect(&node, "alice", "t1", JoinTarget::Tenant).await;

    node.router
        .publish("board-updated", json!({"boardId": "b1"}), Some("t1"))
        .outcome()
        .await
        .unwrap();

    let frame = next_frame(&mut s1).await;
    assert_eq!(frame["type"], "event");
    assert_eq!(frame["event"], "board-updated");
    assert_eq!(frame["data"]["boardId"], "b1");
    assert_silent(&mut s1).await;
}

#[tokio::test]
async fn test_other_tenant_receives_nothing() {
    let bus = MemoryBus::new(64);
    let node = start_node(&bus, &MemoryMembershipStore::new(), None).await;
    let mut s1 = connect(&node, "alice", "t1", JoinTarget::Tenant).await;
    let mut s2 = connect(&node, "carol", "t2", JoinTarget::Tenant).await;

    node.router
        .publish("board-updated", json!({"boardId": "b1"}), Some("t1"))
        .outcome()
        .await
        .unwrap();

    assert_eq!(next_frame(&mut s1).await["event"], "board-updated");
    assert_silent(&mut s2).await;
}

#[tokio::test]
async fn test_tenant_and_board_rooms_deliver_once() {
    let bus = MemoryBus::new(64);
    let node = start_node(&bus, &MemoryMembershipStore::new(), None).await;
    let mut s1 = connect(&node, "alice", "t1", JoinTarget::Tenant).await;
    let board = JoinTarget::Board {
        board_id: "b1".into(),
    };

    // Joining twice and joining the board room too still yields one frame.
    node.gateway.join(&s1.handle, &JoinTarget::Tenant).await.unwrap();
    node.gateway.join(&s1.handle, &board).await.unwrap();
    assert_eq!(node.gateway.registry().rooms_of(s1.handle.id).len(), 2);

    node.router
        .publish("task-updated", json!({"boardId": "b1", "taskId": "x"}), Some("t1"))
        .outcome()
        .await
        .unwrap();

    assert_eq!(next_frame(&mut s1).await["data"]["taskId"], "x");
    assert_silent(&mut s1).await;
}

#[tokio::test]
async fn test_board_room_member_only_sees_its_board() {
    let bus = MemoryBus::new(64);
    let node = start_node(&bus, &MemoryMembershipStore::new(), None).await;
    let mut watcher = connect(
        &node,
        "bob",
        "t1",
        JoinTarget::Board {
            board_id: "b2".into(),
        },
    )
    .await;

    node.router
        .publish("task-updated", json!({"boardId": "b1"}), Some("t1"))
        .outcome()
        .await
        .unwrap();
    assert_silent(&mut watcher).await;

    node.router
        .publish("task-updated", json!({"boardId": "b2"}), Some("t1"))
        .outcome()
        .await
        .unwrap();
    assert_eq!(next_frame(&mut watcher).await["data"]["boardId"], "b2");
}

#[tokio::test]
async fn test_delivery_resumes_after_outage() {
    let bus = MemoryBus::new(64);
    let node = start_node(&bus, &MemoryMembershipStore::new(), None).await;
    let mut s1 = connect(&node, "alice", "t1", JoinTarget::Tenant).await;

    node.transport.set_available(false);
    assert_eq!(node.router.health().status(), ListenerStatus::Reconnecting);

    let result = node
        .router
        .publish("board-updated", json!({"boardId": "lost"}), Some("t1"))
        .outcome()
        .await;
    assert!(matches!(result, Err(TransportError::Unavailable(_))));
    assert_silent(&mut s1).await;

    node.transport.set_available(true);
    assert_eq!(node.router.health().status(), ListenerStatus::Connected);

    node.router
        .publish("board-updated", json!({"boardId": "back"}), Some("t1"))
        .outcome()
        .await
        .unwrap();
    assert_eq!(next_frame(&mut s1).await["data"]["boardId"], "back");
    assert_eq!(node.router.stats().dropped, 1);
}

#[tokio::test]
async fn test_oversized_payload_is_dropped_whole() {
    let bus = MemoryBus::new(64);
    let node = start_node(&bus, &MemoryMembershipStore::new(), Some(NOTIFY_PAYLOAD_LIMIT)).await;
    let mut s1 = connect(&node, "alice", "t1", JoinTarget::Tenant).await;

    let result = node
        .router
        .publish("board-updated", json!({"blob": "x".repeat(9000)}), Some("t1"))
        .outcome()
        .await;
    assert!(matches!(result, Err(TransportError::EnvelopeTooLarge { .. })));
    assert_silent(&mut s1).await;

    node.router
        .publish("board-updated", json!({"boardId": "b1"}), Some("t1"))
        .outcome()
        .await
        .unwrap();
    assert_eq!(next_frame(&mut s1).await["data"]["boardId"], "b1");
}

#[tokio::test]
async fn test_publish_on_one_process_reaches_client_on_another() {
    let bus = MemoryBus::new(64);
    let membership = MemoryMembershipStore::new();
    let a = start_node(&bus, &membership, None).await;
    let b = start_node(&bus, &membership, None).await;
    let mut on_b = connect(&b, "alice", "t1", JoinTarget::Tenant).await;

    a.router
        .publish("board-updated", json!({"boardId": "b1"}), Some("t1"))
        .outcome()
        .await
        .unwrap();

    assert_eq!(next_frame(&mut on_b).await["event"], "board-updated");
    assert_silent(&mut on_b).await;
}

#[tokio::test]
async fn test_room_emit_is_shared_across_processes() {
    let bus = MemoryBus::new(64);
    let membership = MemoryMembershipStore::new();
    let a = start_node(&bus, &membership, None).await;
    let b = start_node(&bus, &membership, None).await;
    let mut on_a = connect(&a, "alice", "t1", JoinTarget::Tenant).await;
    let mut on_b = connect(&b, "bob", "t1", JoinTarget::Tenant).await;
    let mut other_tenant = connect(&b, "carol", "t2", JoinTarget::Tenant).await;

    let room = RoomId::tenant(Some("t1"));
    assert_eq!(a.gateway.session_share().room_size(&room).await.unwrap(), 2);

    let local = a
        .gateway
        .emit_to_room(&room, "presence-changed", json!({"online": 2}))
        .await;
    assert_eq!(local, 1);

    assert_eq!(next_frame(&mut on_a).await["event"], "presence-changed");
    assert_eq!(next_frame(&mut on_b).await["data"]["online"], 2);
    // The origin ignores its own echo.
    assert_silent(&mut on_a).await;
    assert_silent(&mut other_tenant).await;
}

#[tokio::test]
async fn test_forced_logout_closes_user_connections() {
    let bus = MemoryBus::new(64);
    let node = start_node(&bus, &MemoryMembershipStore::new(), None).await;
    let mut alice = connect(&node, "alice", "t1", JoinTarget::Tenant).await;
    let mut bob = connect(&node, "bob", "t1", JoinTarget::Tenant).await;

    node.router
        .publish("user-logged-out", json!({"userId": "alice"}), Some("t1"))
        .outcome()
        .await
        .unwrap();

    assert_eq!(next_frame(&mut alice).await["event"], "user-logged-out");
    let close = next_frame(&mut alice).await;
    assert_eq!(close["type"], "close");
    assert_eq!(close["code"], 4401);

    assert_eq!(next_frame(&mut bob).await["event"], "user-logged-out");
    assert_silent(&mut bob).await;
}

#[tokio::test]
async fn test_disconnect_clears_rooms_and_membership() {
    let bus = MemoryBus::new(64);
    let membership = MemoryMembershipStore::new();
    let node = start_node(&bus, &membership, None).await;
    let client = connect(&node, "alice", "t1", JoinTarget::Tenant).await;
    let room = RoomId::tenant(Some("t1"));

    assert_eq!(node.gateway.registry().room_size(&room), 1);
    node.gateway.disconnect(client.handle.id).await;

    assert_eq!(node.gateway.registry().room_size(&room), 0);
    assert_eq!(node.gateway.registry().connection_count(), 0);
    assert_eq!(node.gateway.session_share().room_size(&room).await.unwrap(), 0);
}

#[tokio::test]
async fn test_handshake_rejections() {
    let bus = MemoryBus::new(64);
    let node = start_node(&bus, &MemoryMembershipStore::new(), None).await;

    let missing = node.gateway.authenticate(&Handshake::default()).await;
    assert!(matches!(missing, Err(GatewayError::AuthRejected(_))));

    let forged = Handshake {
        token: Some("not-a-jwt".into()),
        ..handshake("alice", "t1")
    };
    assert!(matches!(
        node.gateway.authenticate(&forged).await,
        Err(GatewayError::AuthRejected(_))
    ));

    // alice is not a member of t2
    let stranger = node.gateway.authenticate(&handshake("alice", "t2")).await;
    assert!(matches!(stranger, Err(GatewayError::TenantMismatch(_))));

    // tenant claim naming another tenant
    let wrong_claim = Handshake {
        token: Some(token("alice", Some("t2"))),
        ..handshake("alice", "t1")
    };
    let err = node.gateway.authenticate(&wrong_claim).await.unwrap_err();
    assert_eq!(err.close_code(), Some(4403));

    let identity = node.gateway.authenticate(&handshake("alice", "t1")).await.unwrap();
    assert_eq!(identity.tenant_id.as_deref(), Some("t1"));
}

#[tokio::test]
async fn test_admit_walks_handshake_states() {
    let bus = MemoryBus::new(64);
    let node = start_node(&bus, &MemoryMembershipStore::new(), None).await;

    let mut state = ConnectionState::Connecting;
    let rejected = node.gateway.admit(&handshake("alice", "t2"), &mut state).await;
    assert!(matches!(rejected, Err(GatewayError::TenantMismatch(_))));
    assert_eq!(state, ConnectionState::Disconnected);
    assert_eq!(node.gateway.registry().connection_count(), 0);

    let mut state = ConnectionState::Connecting;
    let (handle, _rx) = node.gateway.admit(&handshake("alice", "t1"), &mut state).await.unwrap();
    assert_eq!(state, ConnectionState::Authenticated);
    assert_eq!(handle.state(), ConnectionState::Authenticated);
    assert_eq!(node.gateway.registry().connection_count(), 1);
}

#[tokio::test]
async fn test_handlers_register_once() {
    let bus = MemoryBus::new(64);
    let node = start_node(&bus, &MemoryMembershipStore::new(), None).await;

    let second = node.gateway.register_handlers(&node.router);
    assert!(matches!(second, Err(TransportError::DuplicateSubscription(_))));
}
