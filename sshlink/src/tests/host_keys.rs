use std::borrow::Cow;
use std::path::Path;

use super::*;
use crate::client::SessionEvent;
use crate::keys::known_hosts::{KnownHosts, KnownHostsVerifier};
use crate::keys::tests::host_key;
use crate::Error;

fn curve25519_info(known_hosts: &Path) -> ConnectionInfo {
    let mut info = test_info();
    info.preferred = Preferred {
        kex: Cow::Borrowed(&[kex::CURVE25519]),
        cipher: Cow::Borrowed(&[cipher::AES_256_CTR]),
        mac: Cow::Borrowed(&[mac::HMAC_SHA256]),
        compression: Cow::Borrowed(&[compression::NONE]),
        ..Preferred::DEFAULT
    };
    info.host_key_verifier = Arc::new(KnownHostsVerifier::new(
        KnownHosts::load(known_hosts).unwrap(),
    ));
    info
}

fn write_known_hosts(dir: &tempfile::TempDir, text: &str) -> std::path::PathBuf {
    let path = dir.path().join("known_hosts");
    std::fs::write(&path, text).unwrap();
    path
}

/// Run the handshake against a server using the test host key, until
/// the client either connects or rejects the key.
async fn handshake(info: ConnectionInfo) -> (Result<(), Error>, Option<(u32, String)>) {
    let mut session = Session::new(info);
    let (client, server) = tokio::io::duplex(1 << 20);
    let mut server = FakeServer::new(server);
    let (result, rejected) = tokio::join!(session.connect_stream(client), async {
        server.handshake(Handshake::Curve25519(host_key())).await;
        server.accept_auth().await;
        server.rejected_handshake()
    });
    (result, rejected)
}

#[tokio::test]
async fn known_host_key_completes_an_encrypted_handshake() {
    test_init();
    let key = host_key().public_key().to_openssh().unwrap();
    let dir = tempfile::tempdir().unwrap();
    let path = write_known_hosts(&dir, &format!("other.example {key}\nfake.example {key}\n"));

    let mut session = Session::new(curve25519_info(&path));
    let events = record(session.events());
    let mut server = connect(&mut session, Handshake::Curve25519(host_key())).await;
    assert!(session.is_connected());
    assert!(events.lock().unwrap().iter().any(|e| matches!(
        e,
        SessionEvent::HostKeyReceived { host, port: 22, key }
            if host == "fake.example" && key.key_data() == host_key().public_key().key_data()
    )));

    // Packets are sealed and opened with the derived keys.
    let script = tokio::spawn(async move {
        let request = server.expect(msg::GLOBAL_REQUEST).await;
        assert_eq!(
            String::decode(&mut &request[1..]).unwrap(),
            "keepalive@openssh.com"
        );
        server.send(&[msg::REQUEST_SUCCESS]).await;
    });
    session
        .global_request("keepalive@openssh.com", true, &[])
        .await
        .unwrap();
    script.await.unwrap();
}

#[tokio::test]
async fn revoked_key_is_rejected_even_if_also_trusted() {
    test_init();
    let key = host_key().public_key().to_openssh().unwrap();
    let dir = tempfile::tempdir().unwrap();
    let path = write_known_hosts(
        &dir,
        &format!("fake.example {key}\n@revoked fake.example {key}\n"),
    );

    let (result, rejected) = handshake(curve25519_info(&path)).await;
    assert!(matches!(result, Err(Error::RevokedKey { line: 2 })));
    let (reason, _) = rejected.unwrap();
    assert_eq!(reason, crate::Disconnect::HostKeyNotVerifiable as u32);
}

#[tokio::test]
async fn unknown_host_is_rejected() {
    test_init();
    let dir = tempfile::tempdir().unwrap();
    let path = write_known_hosts(&dir, "");

    let (result, rejected) = handshake(curve25519_info(&path)).await;
    assert!(matches!(result, Err(Error::UnknownKey)));
    assert!(rejected.is_some());
}

#[tokio::test]
async fn changed_key_is_rejected() {
    test_init();
    let other = crate::keys::tests::ed25519_key()
        .public_key()
        .to_openssh()
        .unwrap();
    let dir = tempfile::tempdir().unwrap();
    let path = write_known_hosts(&dir, &format!("fake.example {other}\n"));

    let (result, _) = handshake(curve25519_info(&path)).await;
    assert!(matches!(result, Err(Error::KeyChanged { line: 1 })));
}

#[tokio::test]
async fn forged_signature_fails_before_the_key_is_checked() {
    test_init();
    let key = host_key().public_key().to_openssh().unwrap();
    let dir = tempfile::tempdir().unwrap();
    let path = write_known_hosts(&dir, &format!("fake.example {key}\n"));

    let mut session = Session::new(curve25519_info(&path));
    let events = record(session.events());
    let (client, server) = tokio::io::duplex(1 << 20);
    let mut server =
        FakeServer::new(server).signing_with(crate::keys::tests::ed25519_key());
    let (result, ()) = tokio::join!(session.connect_stream(client), async {
        server.handshake(Handshake::Curve25519(host_key())).await;
    });

    assert!(matches!(result, Err(Error::WrongServerSig)));
    let (reason, _) = server.rejected_handshake().unwrap();
    assert_eq!(reason, crate::Disconnect::KeyExchangeFailed as u32);
    assert!(!events
        .lock()
        .unwrap()
        .iter()
        .any(|e| matches!(e, SessionEvent::HostKeyReceived { .. })));
}

#[tokio::test]
async fn old_openssh_falls_back_to_group14() {
    test_init();
    let key = host_key().public_key().to_openssh().unwrap();
    let dir = tempfile::tempdir().unwrap();
    let path = write_known_hosts(&dir, &format!("fake.example {key}\n"));

    // Default algorithm preferences, against a server whose curve25519
    // is known to be broken.
    let mut info = test_info();
    info.preferred = Preferred::DEFAULT;
    info.host_key_verifier = Arc::new(KnownHostsVerifier::new(
        KnownHosts::load(&path).unwrap(),
    ));
    let mut session = Session::new(info);
    let (client, server) = tokio::io::duplex(1 << 20);
    let mut server = FakeServer::new(server).with_id("SSH-2.0-OpenSSH_6.6p1 Ubuntu-2ubuntu1");
    let (result, ()) = tokio::join!(session.connect_stream(client), async {
        server.handshake(Handshake::DhGroup14(host_key())).await;
        server.accept_auth().await;
    });
    result.unwrap();
    assert!(session.is_connected());

    let offered = server.offered_kex();
    assert!(!offered.iter().any(|k| k.starts_with("curve25519")));
    assert!(offered.contains(&"diffie-hellman-group14-sha256".to_string()));

    let script = tokio::spawn(async move {
        server.expect(msg::GLOBAL_REQUEST).await;
        server.send(&[msg::REQUEST_SUCCESS]).await;
    });
    session
        .global_request("keepalive@openssh.com", true, &[])
        .await
        .unwrap();
    script.await.unwrap();
}
