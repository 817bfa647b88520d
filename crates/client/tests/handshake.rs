//! Handshake tests against a scripted daemon.

mod common;

use std::sync::Arc;
use std::time::Duration;

use client::{ClientError, DeviceOptions};
use common::*;
use protocol::{
    AuthType, Command, CredentialStore, Feature, MemoryCredentialStore, Packet, ProtocolError,
    TOKEN_SIZE,
};

fn token(fill: u8) -> Packet {
    Packet::new(
        Command::Auth,
        AuthType::Token as u32,
        0,
        vec![fill; TOKEN_SIZE],
    )
}

fn accept(version: u32) -> Packet {
    Packet::new(
        Command::Connect,
        version,
        4096,
        "device::ro.product.model=Pixel;features=shell_v2,delayed_ack",
    )
}

fn expect_auth(packet: &Packet, auth_type: AuthType) {
    assert_eq!(packet.command, Command::Auth);
    assert_eq!(packet.arg0, auth_type as u32);
}

#[tokio::test]
async fn test_connect_banner_advertises_features() {
    let (handle, mut daemon, connect) =
        start_connect(store(vec![key_a()]), DeviceOptions::default()).await;

    assert_eq!(connect.arg0, protocol::PROTOCOL_VERSION);
    assert_eq!(connect.arg1, protocol::DEFAULT_MAX_PAYLOAD_SIZE);
    let banner = String::from_utf8_lossy(&connect.payload).into_owned();
    assert!(banner.starts_with("host::"), "banner: {banner}");
    assert!(banner.contains("shell_v2"));
    assert!(banner.contains("delayed_ack"));

    daemon.send(accept(protocol::PROTOCOL_VERSION)).await;
    let device = handle.await.unwrap().unwrap();
    assert_eq!(device.banner().model.as_deref(), Some("Pixel"));
    assert_eq!(device.params().max_payload_size, 4096);
    assert!(device.can_use_feature(Feature::ShellV2));
    assert!(!device.can_use_feature(Feature::StatV2));
}

#[tokio::test]
async fn test_first_key_signs_token() {
    let (handle, mut daemon, _) =
        start_connect(store(vec![key_a(), key_b()]), DeviceOptions::default()).await;

    daemon.send(token(7)).await;
    let signature = daemon.recv().await;
    expect_auth(&signature, AuthType::Signature);
    key_a()
        .public_key()
        .verify(&[7u8; TOKEN_SIZE], &signature.payload)
        .expect("signature from first key");

    daemon.send(accept(protocol::PROTOCOL_VERSION)).await;
    assert!(handle.await.unwrap().is_ok());
}

#[tokio::test]
async fn test_second_key_after_rejection() {
    let (handle, mut daemon, _) =
        start_connect(store(vec![key_a(), key_b()]), DeviceOptions::default()).await;

    daemon.send(token(1)).await;
    let first = daemon.recv().await;
    expect_auth(&first, AuthType::Signature);

    daemon.send(token(2)).await;
    let second = daemon.recv().await;
    expect_auth(&second, AuthType::Signature);
    key_b()
        .public_key()
        .verify(&[2u8; TOKEN_SIZE], &second.payload)
        .expect("signature from second key");
    assert!(key_a()
        .public_key()
        .verify(&[2u8; TOKEN_SIZE], &second.payload)
        .is_err());

    daemon.send(accept(protocol::PROTOCOL_VERSION)).await;
    assert!(handle.await.unwrap().is_ok());
}

#[tokio::test]
async fn test_public_key_offered_when_all_keys_rejected() {
    let (handle, mut daemon, _) =
        start_connect(store(vec![key_a()]), DeviceOptions::default()).await;

    daemon.send(token(1)).await;
    expect_auth(&daemon.recv().await, AuthType::Signature);

    daemon.send(token(2)).await;
    let offer = daemon.recv().await;
    expect_auth(&offer, AuthType::PublicKey);
    assert_eq!(
        offer.payload.as_ref(),
        key_a().public_key().to_auth_payload("tether@localhost").as_slice()
    );

    // The user approved the prompt.
    daemon.send(accept(protocol::PROTOCOL_VERSION)).await;
    assert!(handle.await.unwrap().is_ok());
}

#[tokio::test]
async fn test_token_after_offer_is_rejection() {
    let (handle, mut daemon, _) =
        start_connect(store(vec![key_a()]), DeviceOptions::default()).await;

    daemon.send(token(1)).await;
    expect_auth(&daemon.recv().await, AuthType::Signature);
    daemon.send(token(2)).await;
    expect_auth(&daemon.recv().await, AuthType::PublicKey);
    daemon.send(token(3)).await;

    let err = handle.await.unwrap().unwrap_err();
    assert!(
        matches!(
            err,
            ClientError::Protocol(ProtocolError::AuthenticationRejected(_))
        ),
        "got {err:?}"
    );
}

#[tokio::test]
async fn test_key_generated_when_store_is_empty() {
    let keys = Arc::new(MemoryCredentialStore::new(Vec::new()));
    let (handle, mut daemon, _) = start_connect(keys.clone(), DeviceOptions::default()).await;

    daemon.send(token(9)).await;
    let offer = daemon.recv().await;
    expect_auth(&offer, AuthType::PublicKey);

    let stored = keys.keys().unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(
        offer.payload.as_ref(),
        stored[0]
            .public_key()
            .to_auth_payload("tether@localhost")
            .as_slice()
    );

    // Prompt dismissed: the daemon hangs up.
    drop(daemon);
    let err = handle.await.unwrap().unwrap_err();
    assert!(
        matches!(
            err,
            ClientError::Protocol(ProtocolError::AuthenticationRejected(_))
        ),
        "got {err:?}"
    );
}

#[tokio::test]
async fn test_handshake_timeout() {
    let options = DeviceOptions {
        auth_timeout: Duration::from_millis(200),
        ..Default::default()
    };
    let (handle, _daemon, _) = start_connect(store(vec![key_a()]), options).await;

    let err = tokio::time::timeout(STEP_TIMEOUT, handle)
        .await
        .expect("handshake did not time out")
        .unwrap()
        .unwrap_err();
    assert!(
        matches!(
            err,
            ClientError::Protocol(ProtocolError::AuthenticationRejected(_))
        ),
        "got {err:?}"
    );
}

#[tokio::test]
async fn test_eof_before_auth_is_connection_closed() {
    let (handle, daemon, _) = start_connect(store(vec![key_a()]), DeviceOptions::default()).await;
    drop(daemon);

    let err = handle.await.unwrap().unwrap_err();
    assert!(
        matches!(err, ClientError::Protocol(ProtocolError::ConnectionClosed(_))),
        "got {err:?}"
    );
}

#[tokio::test]
async fn test_leftover_packets_are_ignored() {
    let (handle, mut daemon, _) =
        start_connect(store(vec![key_a()]), DeviceOptions::default()).await;

    daemon
        .send(Packet::new(Command::Write, 3, 4, &b"stale"[..]))
        .await;
    daemon.send(accept(protocol::PROTOCOL_VERSION)).await;
    assert!(handle.await.unwrap().is_ok());
}

#[tokio::test]
async fn test_legacy_version_negotiation() {
    let legacy = 0x0100_0000;
    let setup = DaemonSetup {
        version: legacy,
        features: vec!["shell_v2"],
        ..Default::default()
    };
    let (device, mut daemon) = connect(setup).await;

    let params = device.params();
    assert_eq!(params.version, legacy);
    assert!(params.checksum_required);
    assert!(params.null_terminated_services);
    assert_eq!(params.delayed_ack_bytes(), 0);

    let (opened, _) = tokio::join!(device.create_socket("shell:ls"), async {
        let open = daemon.recv().await;
        assert_eq!(open.command, Command::Open);
        assert_eq!(open.arg1, 0);
        assert_eq!(open.payload.as_ref(), b"shell:ls\0");
        daemon
            .send(Packet::new(Command::Okay, 9, open.arg0, bytes::Bytes::new()))
            .await;
    });
    let socket = opened.unwrap();
    assert_eq!(socket.service(), "shell:ls");

    // A corrupted checksum is fatal on a legacy link.
    let mut raw = Packet::new(Command::Write, 9, socket.local_id(), &b"data"[..]).serialize();
    raw[16] ^= 0xff;
    daemon.send_raw(&raw).await;

    let state = tokio::time::timeout(STEP_TIMEOUT, device.disconnected())
        .await
        .unwrap();
    match state {
        client::ConnectionState::Failed(reason) => {
            assert!(reason.contains("checksum"), "reason: {reason}")
        }
        other => panic!("expected failure, got {other:?}"),
    }
}
