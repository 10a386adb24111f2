use ssh_encoding::{Decode, Encode};

use super::*;
use crate::subsystem::{SubsystemEvent, SubsystemHandler, SubsystemSender, SubsystemSession};
use crate::Error;

/// Greets the server, and records the frames it gets back.
struct Recorder {
    frames: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl SubsystemHandler for Recorder {
    fn on_channel_open(&mut self, sender: &SubsystemSender) -> Result<(), Error> {
        sender.send_data(&b"<hello/>"[..])
    }

    fn on_data_received(&mut self, data: &[u8], sender: &SubsystemSender) -> Result<(), Error> {
        if data == b"<bad/>" {
            return Err(Error::Inconsistent);
        }
        self.frames.lock().unwrap().push(data.to_vec());
        sender.send_data(&b"<ok/>"[..])
    }
}

#[tokio::test]
async fn subsystem_survives_handler_errors() {
    test_init();
    let (session, mut server) = connected(test_info()).await;
    let frames = Arc::new(Mutex::new(Vec::new()));
    let mut netconf = SubsystemSession::new(
        "netconf",
        Recorder {
            frames: frames.clone(),
        },
    );
    let events = record(netconf.events());
    assert!(matches!(netconf.send_data(&b"early"[..]), Err(Error::NotStarted)));

    let (connected, channel) = tokio::join!(netconf.connect(&session), async {
        let (kind, channel, _) = server.confirm_open().await;
        assert_eq!(kind, "session");
        let (name, data) = server.reply_request(channel, true).await;
        assert_eq!(name, "subsystem");
        assert_eq!(String::decode(&mut data.as_slice()).unwrap(), "netconf");
        channel
    });
    connected.unwrap();
    assert!(netconf.is_open());
    assert_eq!(read_channel_data(&server.expect(msg::CHANNEL_DATA).await), b"<hello/>");

    server.send(&channel_data(channel, b"<bad/>")).await;
    server.send(&channel_data(channel, b"<rpc/>")).await;
    assert_eq!(read_channel_data(&server.expect(msg::CHANNEL_DATA).await), b"<ok/>");
    assert_eq!(*frames.lock().unwrap(), vec![b"<rpc/>".to_vec()]);
    assert_eq!(
        events.lock().unwrap().first(),
        Some(&SubsystemEvent::Error(Error::Inconsistent.to_string()))
    );

    netconf.disconnect().await.unwrap();
    server.expect(msg::CHANNEL_CLOSE).await;
    assert!(!netconf.is_open());
    assert_eq!(events.lock().unwrap().last(), Some(&SubsystemEvent::Closed));
}

#[tokio::test]
async fn refused_subsystem_can_be_retried() {
    test_init();
    let (session, mut server) = connected(test_info()).await;
    let mut sftp = SubsystemSession::new(
        "sftp",
        Recorder {
            frames: Arc::default(),
        },
    );

    let (refused, ()) = tokio::join!(sftp.connect(&session), async {
        let (_, channel, _) = server.confirm_open().await;
        server.reply_request(channel, false).await;
    });
    assert!(matches!(refused, Err(Error::RequestDenied)));
    assert!(!sftp.is_open());

    let (accepted, ()) = tokio::join!(sftp.connect(&session), async {
        // The refused channel is closed first.
        server.expect(msg::CHANNEL_CLOSE).await;
        let (_, channel, _) = server.confirm_open().await;
        server.reply_request(channel, true).await;
    });
    accepted.unwrap();
    assert!(sftp.is_open());
}

#[tokio::test]
async fn subsystem_closed_by_the_server_can_reconnect() {
    test_init();
    let (session, mut server) = connected(test_info()).await;
    let mut netconf = SubsystemSession::new(
        "netconf",
        Recorder {
            frames: Arc::default(),
        },
    );
    let events = record(netconf.events());

    let (connected, channel) = tokio::join!(netconf.connect(&session), async {
        let (_, channel, _) = server.confirm_open().await;
        server.reply_request(channel, true).await;
        channel
    });
    connected.unwrap();

    server
        .send(&channel_message(msg::CHANNEL_CLOSE, channel))
        .await;
    tokio::time::timeout(Duration::from_secs(5), async {
        while netconf.is_open() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(events.lock().unwrap().last(), Some(&SubsystemEvent::Closed));

    let (reconnected, ()) = tokio::join!(netconf.connect(&session), async {
        let open = server.skip_to(msg::CHANNEL_OPEN).await;
        let mut r = &open[1..];
        assert_eq!(String::decode(&mut r).unwrap(), "session");
        let client_channel = u32::decode(&mut r).unwrap();
        let mut confirm = channel_message(msg::CHANNEL_OPEN_CONFIRMATION, client_channel);
        SERVER_CHANNEL.encode(&mut confirm).unwrap();
        (1u32 << 20).encode(&mut confirm).unwrap();
        32768u32.encode(&mut confirm).unwrap();
        server.send(&confirm).await;
        server.reply_request(client_channel, true).await;
    });
    reconnected.unwrap();
    assert!(netconf.is_open());
}
