use std::time::Duration;

use ssh_encoding::{Decode, Encode};
use tokio_stream::StreamExt;

use super::*;
use crate::client::{SessionEvent, SessionState, SshClient};
use crate::{ChannelOpenFailure, Disconnect, Error};

async fn next_disconnected(
    events: &mut (impl tokio_stream::Stream<Item = SessionEvent> + Unpin),
) -> (Option<Disconnect>, String) {
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), events.next())
            .await
            .unwrap()
            .unwrap();
        if let SessionEvent::Disconnected {
            reason,
            description,
        } = event
        {
            return (reason, description);
        }
    }
}

#[tokio::test]
async fn connect_authenticates_and_reports_the_server() {
    test_init();
    let mut session = Session::new(test_info());
    let events = record(session.events());
    assert_eq!(session.state(), SessionState::Disconnected);

    let _server = connect(&mut session, Handshake::None).await;
    assert!(session.is_connected());
    assert_eq!(session.server_version().unwrap().software, "FakeServer_1.0");
    assert!(session.session_id().is_some());
    assert!(events
        .lock()
        .unwrap()
        .iter()
        .any(|e| matches!(e, SessionEvent::ServerIdentification(id) if id == SERVER_ID)));

    assert!(matches!(
        session.connect_stream(tokio::io::duplex(64).0).await,
        Err(Error::AlreadyConnected)
    ));
}

#[tokio::test]
async fn wrong_password_fails_authentication() {
    test_init();
    let mut info = test_info();
    info.auth_methods = vec![crate::auth::AuthMethod::password("wrong")];
    let mut session = Session::new(info);
    let (client, server) = tokio::io::duplex(1 << 20);
    let mut server = FakeServer::new(server);

    let (result, disconnect) = tokio::join!(session.connect_stream(client), async {
        server.handshake(Handshake::None).await;
        server.accept_service().await;
        assert_eq!(server.answer_auth().await, ("none".to_string(), false));
        assert_eq!(server.answer_auth().await, ("password".to_string(), false));
        server.expect(msg::DISCONNECT).await
    });
    match result {
        Err(Error::AuthenticationFailed { remaining }) => {
            assert_eq!(remaining.to_string(), "password")
        }
        r => panic!("unexpected {r:?}"),
    }
    assert_eq!(
        read_disconnect(&disconnect).0,
        Disconnect::NoMoreAuthMethodsAvailable as u32
    );
    assert_eq!(session.state(), SessionState::Disconnected);
}

#[tokio::test]
async fn oversized_packet_disconnects_with_its_length() {
    test_init();
    let (session, mut server) = connected(test_info()).await;
    let mut events = session.events().stream();

    let declared: u32 = 0x0010_0001;
    let mut packet = declared.to_be_bytes().to_vec();
    packet.extend(&[0; 12]);
    server.write_raw(&packet).await;

    let (reason, description) = read_disconnect(&server.expect(msg::DISCONNECT).await);
    assert_eq!(reason, Disconnect::ProtocolError as u32);
    assert!(description.contains(&declared.to_string()), "{description}");

    let (reason, description) = next_disconnected(&mut events).await;
    assert_eq!(reason, Some(Disconnect::ProtocolError));
    assert!(description.contains("1048577"));
    assert!(!session.is_connected());
    assert!(matches!(
        session.create_channel_session(),
        Err(Error::NotConnected)
    ));
}

#[tokio::test]
async fn run_command_collects_output_and_exit_status() {
    test_init();
    let mut client = SshClient::new(test_info());
    let mut server = connect(client.session_mut(), Handshake::None).await;

    let script = tokio::spawn(async move {
        let (kind, channel, _) = server.confirm_open().await;
        assert_eq!(kind, "session");
        let (name, data) = server.reply_request(channel, true).await;
        assert_eq!(name, "exec");
        assert_eq!(String::decode(&mut data.as_slice()).unwrap(), "uptime");

        server.send(&channel_data(channel, b"up 3 days\n")).await;
        let mut stderr = vec![msg::CHANNEL_EXTENDED_DATA];
        channel.encode(&mut stderr).unwrap();
        1u32.encode(&mut stderr).unwrap();
        b"load high\n".as_slice().encode(&mut stderr).unwrap();
        server.send(&stderr).await;

        let mut exit = vec![msg::CHANNEL_REQUEST];
        channel.encode(&mut exit).unwrap();
        "exit-status".encode(&mut exit).unwrap();
        0u8.encode(&mut exit).unwrap();
        3u32.encode(&mut exit).unwrap();
        server.send(&exit).await;
        server.send(&channel_message(msg::CHANNEL_EOF, channel)).await;
        server.send(&channel_message(msg::CHANNEL_CLOSE, channel)).await;
        server.expect(msg::CHANNEL_CLOSE).await;
    });

    let output = client.run_command("uptime").await.unwrap();
    assert_eq!(output.stdout, b"up 3 days\n");
    assert_eq!(output.stderr, b"load high\n");
    assert_eq!(output.exit_status, Some(3));
    script.await.unwrap();
}

#[tokio::test]
async fn large_writes_are_split_to_fit_a_packet() {
    test_init();
    let (session, mut server) = connected(test_info()).await;

    // The server's maximum packet is larger than what the transport carries.
    let (channel, _) = tokio::join!(session.channel_open_session(), async {
        server.confirm_open_with(4 << 20, 1 << 20).await
    });
    let channel = channel.unwrap();

    let script = tokio::spawn(async move {
        let mut received = 0;
        while received < 600_000 {
            let data = read_channel_data(&server.expect(msg::CHANNEL_DATA).await);
            assert!(data.len() <= crate::channels::MAX_CHUNK_LEN);
            assert!(data.iter().all(|b| *b == 7));
            received += data.len();
        }
        assert_eq!(received, 600_000);
        server
    });

    channel.data(&vec![7; 600_000]).await.unwrap();
    let server = script.await.unwrap();
    assert!(session.is_connected());
    drop(server);
}

#[tokio::test]
async fn disconnect_notifies_the_server() {
    test_init();
    let (mut session, mut server) = connected(test_info()).await;
    let mut events = session.events().stream();

    session.disconnect().await.unwrap();
    let (reason, _) = read_disconnect(&server.expect(msg::DISCONNECT).await);
    assert_eq!(reason, Disconnect::ByApplication as u32);
    assert_eq!(
        next_disconnected(&mut events).await.0,
        Some(Disconnect::ByApplication)
    );
    assert_eq!(session.state(), SessionState::Disconnected);
    // Nothing left to disconnect.
    session.disconnect().await.unwrap();
}

#[tokio::test]
async fn global_requests_get_their_replies() {
    test_init();
    let (session, mut server) = connected(test_info()).await;

    let script = tokio::spawn(async move {
        let request = server.expect(msg::GLOBAL_REQUEST).await;
        let mut r = &request[1..];
        assert_eq!(String::decode(&mut r).unwrap(), "no-more-sessions@openssh.com");
        server.send(&[msg::REQUEST_FAILURE]).await;

        let request = server.expect(msg::GLOBAL_REQUEST).await;
        let mut r = &request[1..];
        assert_eq!(String::decode(&mut r).unwrap(), "tcpip-forward");
        assert_eq!(u8::decode(&mut r).unwrap(), 1);
        assert_eq!(String::decode(&mut r).unwrap(), "0.0.0.0");
        assert_eq!(u32::decode(&mut r).unwrap(), 0);
        let mut success = vec![msg::REQUEST_SUCCESS];
        40000u32.encode(&mut success).unwrap();
        server.send(&success).await;
    });

    assert!(matches!(
        session
            .global_request("no-more-sessions@openssh.com", true, &[])
            .await,
        Err(Error::RequestDenied)
    ));
    assert_eq!(session.tcpip_forward("0.0.0.0", 0).await.unwrap(), 40000);
    script.await.unwrap();
}

#[tokio::test]
async fn stray_messages_are_reported_without_disconnecting() {
    test_init();
    let (session, mut server) = connected(test_info()).await;
    let events = record(session.events());

    let script = tokio::spawn(async move {
        let seqn = server.writer.buffer.seqn.0;
        server.send(&[200, 1, 2, 3]).await;
        // Authentication is over: a second success is only reported.
        server.send(&[msg::USERAUTH_SUCCESS]).await;

        // The request may overtake the UNIMPLEMENTED.
        let (mut unimplemented, mut requested) = (false, false);
        while !(unimplemented && requested) {
            let payload = server.recv().await;
            match payload[0] {
                msg::UNIMPLEMENTED => {
                    assert!(!unimplemented);
                    assert_eq!(u32::decode(&mut &payload[1..]).unwrap(), seqn);
                    unimplemented = true;
                }
                msg::GLOBAL_REQUEST => {
                    server.send(&[msg::REQUEST_SUCCESS]).await;
                    requested = true;
                }
                n => panic!("unexpected message {n}"),
            }
        }

        // Nothing was sent back for the USERAUTH_SUCCESS.
        server.expect(msg::GLOBAL_REQUEST).await;
        server.send(&[msg::REQUEST_SUCCESS]).await;
        server
    });

    for _ in 0..2 {
        session
            .global_request("keepalive@openssh.com", true, &[])
            .await
            .unwrap();
    }
    let server = script.await.unwrap();
    assert!(session.is_connected());
    let errors = events
        .lock()
        .unwrap()
        .iter()
        .filter(|e| matches!(e, SessionEvent::ErrorOccurred(_)))
        .count();
    assert_eq!(errors, 2);
    drop(server);
}

#[tokio::test]
async fn rejected_channel_open_reports_the_reason() {
    test_init();
    let (session, mut server) = connected(test_info()).await;

    let script = tokio::spawn(async move {
        let open = server.expect(msg::CHANNEL_OPEN).await;
        let mut r = &open[1..];
        assert_eq!(String::decode(&mut r).unwrap(), "direct-tcpip");
        let channel = u32::decode(&mut r).unwrap();
        let mut failure = channel_message(msg::CHANNEL_OPEN_FAILURE, channel);
        (ChannelOpenFailure::ConnectFailed as u32)
            .encode(&mut failure)
            .unwrap();
        "connection refused".encode(&mut failure).unwrap();
        "".encode(&mut failure).unwrap();
        server.send(&failure).await;

        // Channel types the client does not accept.
        let mut open = vec![msg::CHANNEL_OPEN];
        "x11".encode(&mut open).unwrap();
        SERVER_CHANNEL.encode(&mut open).unwrap();
        (1u32 << 20).encode(&mut open).unwrap();
        32768u32.encode(&mut open).unwrap();
        server.send(&open).await;
        let failure = server.expect(msg::CHANNEL_OPEN_FAILURE).await;
        let mut r = &failure[1..];
        assert_eq!(u32::decode(&mut r).unwrap(), SERVER_CHANNEL);
        assert_eq!(
            u32::decode(&mut r).unwrap(),
            ChannelOpenFailure::UnknownChannelType as u32
        );
        server
    });

    let result = session
        .channel_open_direct_tcpip("db.internal", 5432, "127.0.0.1", 40000)
        .await;
    assert!(matches!(
        result,
        Err(Error::ChannelOpenFailure(ChannelOpenFailure::ConnectFailed))
    ));
    // The server end stays open until the session has been checked.
    let server = script.await.unwrap();
    assert!(session.is_connected());
    drop(server);
}

#[tokio::test]
async fn server_initiated_rekey_keeps_the_session_id() {
    test_init();
    let (session, mut server) = connected(test_info()).await;
    let session_id = session.session_id();

    let rekey = tokio::spawn(async move {
        let mut kexinit = vec![msg::KEXINIT];
        kexinit.extend(&[1; 16]);
        let lists = ["none", "ssh-ed25519", "none", "none", "none", "none", "none", "none"];
        for list in lists.iter().chain(&["", ""]) {
            list.encode(&mut kexinit).unwrap();
        }
        kexinit.extend(&[0, 0, 0, 0, 0]);
        server.send(&kexinit).await;
        server.expect(msg::KEXINIT).await;
        server.expect(msg::NEWKEYS).await;
        server.send(&[msg::NEWKEYS]).await;
        server
    });
    let mut server = rekey.await.unwrap();

    // Held back by the client until the exchange is over.
    let script = tokio::spawn(async move {
        let request = server.expect(msg::GLOBAL_REQUEST).await;
        assert_eq!(String::decode(&mut &request[1..]).unwrap(), "ping@example.org");
        server.send(&[msg::REQUEST_SUCCESS]).await;
    });
    session
        .global_request("ping@example.org", true, &[])
        .await
        .unwrap();
    script.await.unwrap();
    assert_eq!(session.session_id(), session_id);
}
