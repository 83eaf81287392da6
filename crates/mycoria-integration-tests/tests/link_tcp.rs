//! Integration test: two routers peering over real TCP.
//!
//! Starts two link managers, lets one listen and the other dial, waits for
//! the handshake to finish on both sides, and pushes a signed frame across
//! the sealed link.

use std::sync::Arc;
use std::time::Duration;

use mycoria_frame::frame::{FlowFlags, FrameOpts, MessageType};
use mycoria_integration_tests::{test_identity, TEST_PAYLOAD};
use mycoria_peering::manager::{LinkManager, ManagerConfig};
use mycoria_peering::transport::TcpTransport;
use mycoria_peering::url::PeeringUrl;
use mycoria_router::{build_routable_prefixes, RoutingTable};
use mycoria_session::SessionManager;
use mycoria_store::Store;

fn manager_for(
    seed: u8,
    dir: &std::path::Path,
) -> (
    Arc<LinkManager>,
    tokio::sync::mpsc::Receiver<(Arc<mycoria_peering::Link>, mycoria_frame::Frame)>,
) {
    let local = test_identity(seed);
    let sessions = Arc::new(SessionManager::new(local.clone()));
    let table = Arc::new(RoutingTable::new(build_routable_prefixes(local.ip())));
    let store = Arc::new(Store::open(dir.join(format!("state-{seed}.json"))).expect("store"));
    let config = ManagerConfig {
        router_version: "0.1.0".into(),
        universe: "testnet".into(),
        universe_secret: "hunter2".into(),
        lite: false,
        tun_mtu: 9000,
        auto_connect: false,
        min_auto_connect: 2,
        connect: Vec::new(),
        bootstrap: Vec::new(),
        listen: Vec::new(),
    };
    LinkManager::new(local, config, sessions, table, store)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_tcp_peering_and_frame_exchange() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (server, mut server_inbound) = manager_for(10, dir.path());
    let (client, _client_inbound) = manager_for(20, dir.path());

    let transport = TcpTransport;
    let listen_url = PeeringUrl::parse("tcp:0").expect("url");
    let bound = server.listen(&transport, &listen_url).await.expect("listen");

    let dial_url =
        PeeringUrl::parse(&format!("tcp://127.0.0.1:{}", bound.port())).expect("url");
    let link = client.connect_url(&transport, &dial_url).await.expect("connect");
    assert_eq!(link.remote_ip(), server.local().ip());
    assert!(link.is_client());

    // Wait until the server side registered the link too.
    for _ in 0..50 {
        if server.link_count() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(server.link_count(), 1);
    assert!(server.is_connected(client.local().ip()));

    // Peer routes exist on both sides.
    assert_eq!(client.table().routes_to(server.local().ip()).len(), 1);
    assert_eq!(server.table().routes_to(client.local().ip()).len(), 1);

    // Push a frame across the sealed link.
    let frame = client.frames().build(
        FrameOpts {
            ttl: 64,
            flow: FlowFlags::HOLD,
            message_type: MessageType::SessionData,
            src: client.local().ip(),
            dst: server.local().ip(),
        },
        &[],
        TEST_PAYLOAD,
        &[],
        false,
    );
    assert!(link.send(frame));

    let (from, mut received) = tokio::time::timeout(Duration::from_secs(5), server_inbound.recv())
        .await
        .expect("inbound frame in time")
        .expect("channel open");
    assert_eq!(from.remote_ip(), client.local().ip());
    assert_eq!(received.src(), client.local().ip());
    assert_eq!(received.dst(), server.local().ip());
    received.parse_payload().expect("payload");
    assert_eq!(received.message_data().expect("message"), TEST_PAYLOAD);

    // Closing the client link deregisters it on the server within the
    // read loop's error path.
    link.close();
    for _ in 0..100 {
        if server.link_count() == 0 && client.link_count() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(client.link_count(), 0);
    assert_eq!(server.link_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_universe_mismatch_over_tcp() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (server, _server_inbound) = manager_for(30, dir.path());
    let (client_base, _client_inbound) = manager_for(40, dir.path());

    let transport = TcpTransport;
    let bound = server
        .listen(&transport, &PeeringUrl::parse("tcp:0").expect("url"))
        .await
        .expect("listen");

    // Same universe name, different secret: the handshake must fail.
    let local = test_identity(41);
    let sessions = Arc::new(SessionManager::new(local.clone()));
    let table = Arc::new(RoutingTable::new(build_routable_prefixes(local.ip())));
    let store = Arc::new(Store::open(dir.path().join("state-41.json")).expect("store"));
    let config = ManagerConfig {
        universe_secret: "wrong".into(),
        ..client_base.config().clone()
    };
    let (client, _inbound) = LinkManager::new(local, config, sessions, table, store);

    let dial_url =
        PeeringUrl::parse(&format!("tcp://127.0.0.1:{}", bound.port())).expect("url");
    let result = client.connect_url(&transport, &dial_url).await;
    assert!(result.is_err(), "mismatched secrets must not peer");
    assert_eq!(client.link_count(), 0);
}
