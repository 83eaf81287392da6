//! Integration test: the full three-message peering handshake.
//!
//! Exercises request/response/ack between two fresh identities, including
//! the simultaneous request from both sides, universe authentication, the
//! derived link sessions (swapped roles, mirrored keys), and twenty sealed
//! round trips over the resulting link layer.

use mycoria_integration_tests::{test_identity, TEST_PAYLOAD};
use mycoria_peering::linkframe;
use mycoria_peering::protocol::{Handshake, HandshakeConfig, PeeringMsg};
use mycoria_peering::PeeringError;

fn config(seed: u8, client: bool, secret: &str) -> HandshakeConfig {
    HandshakeConfig {
        local: test_identity(seed),
        universe: "main".into(),
        universe_secret: secret.into(),
        router_version: "0.1.0".into(),
        lite: false,
        tun_mtu: 9000,
        client,
    }
}

#[test]
fn test_handshake_and_sealed_traffic() {
    let mut client = Handshake::new(config(1, true, "s3cret"));
    let mut server = Handshake::new(config(2, false, "s3cret"));

    // Both sides open with a request; the client's goes first, and each
    // side must tolerate the other's.
    let client_request = client.request();
    let server_request = server.request();
    assert!(client.handle(server_request).expect("client sees request").is_none());

    let response = server
        .handle(client_request)
        .expect("server handles request")
        .expect("server responds");
    let ack = client
        .handle(response)
        .expect("client handles response")
        .expect("client acks");
    assert!(server.handle(ack).expect("server handles ack").is_none());

    assert!(client.is_complete());
    assert!(server.is_complete());

    let client_out = client.into_outcome().expect("client outcome");
    let server_out = server.into_outcome().expect("server outcome");

    // Identities learned crosswise.
    assert_eq!(client_out.remote.ip, test_identity(2).ip());
    assert_eq!(server_out.remote.ip, test_identity(1).ip());

    // Identical keys with swapped roles.
    assert_eq!(
        client_out.link_session.out_key_id(),
        server_out.link_session.in_key_id()
    );
    assert_eq!(
        client_out.link_session.in_key_id(),
        server_out.link_session.out_key_id()
    );

    // Ten sealed round trips in each direction.
    for _ in 0..10 {
        let mut record = linkframe::seal(&client_out.link_session, TEST_PAYLOAD).expect("seal");
        let inner = linkframe::unseal(&server_out.link_session, &mut record).expect("unseal");
        assert_eq!(inner, TEST_PAYLOAD);
    }
    for _ in 0..10 {
        let mut record = linkframe::seal(&server_out.link_session, TEST_PAYLOAD).expect("seal");
        let inner = linkframe::unseal(&client_out.link_session, &mut record).expect("unseal");
        assert_eq!(inner, TEST_PAYLOAD);
    }
}

#[test]
fn test_mismatched_universe_secrets() {
    let mut client = Handshake::new(config(3, true, "alpha"));
    let mut server = Handshake::new(config(4, false, "beta"));

    let client_request = client.request();
    let server_request = server.request();
    client.handle(server_request).expect("client sees request");
    let response = server
        .handle(client_request)
        .expect("server handles request")
        .expect("server responds");

    // The client detects the bad universe auth locally...
    let err = client.handle(response).expect_err("auth must fail");
    assert!(matches!(err, PeeringError::UniverseMismatch(ref m) if m == "universe auth failed"));

    // ...and the server sees the denial through the error message.
    let denial = server
        .handle(PeeringMsg::error("universe auth failed"))
        .expect_err("denial");
    assert!(
        matches!(denial, PeeringError::RemoteDeniedPeering(ref reason) if reason == "universe auth failed"),
        "unexpected error: {denial}"
    );
}

#[test]
fn test_no_secret_skips_universe_auth() {
    let mut client = Handshake::new(config(5, true, ""));
    let mut server = Handshake::new(config(6, false, ""));

    let client_request = client.request();
    let server_request = server.request();
    client.handle(server_request).expect("client sees request");
    let response = server
        .handle(client_request)
        .expect("server handles request")
        .expect("server responds");
    assert!(response.universe_auth.is_empty());
    let ack = client.handle(response).expect("client").expect("ack");
    server.handle(ack).expect("server handles ack");
    assert!(client.is_complete() && server.is_complete());
}
