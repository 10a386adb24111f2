#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)] // Allow unwraps, expects and panics in the test suite

//! Scenarios against an in-process server, speaking the transport
//! protocol over a [`tokio::io::duplex`] pipe.
use std::borrow::Cow;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ssh_encoding::{Decode, Encode};
use ssh_key::PrivateKey;
use tokio::io::{AsyncWriteExt, DuplexStream};

use crate::auth::AuthMethod;
use crate::cipher::{self, OpeningKey};
use crate::helpers::EncodedExt;
use crate::client::{ConnectionInfo, Session};
use crate::kex::{self, KEXES};
use crate::keys::AcceptAnyHostKey;
use crate::session::Exchange;
use crate::sshbuffer::{read_ssh_id, PacketWriter, SSHBuffer};
use crate::{compression, mac, msg, Preferred};

mod host_keys;
mod session;
mod subsystem;

pub(crate) fn test_init() {
    let _ = env_logger::try_init();
}

pub(crate) const SERVER_ID: &str = "SSH-2.0-FakeServer_1.0";
/// The server's side of every channel it opens or confirms.
pub(crate) const SERVER_CHANNEL: u32 = 7;
pub(crate) const PASSWORD: &str = "correct horse";

/// Connection parameters for the unencrypted `none` transport.
pub(crate) fn test_info() -> ConnectionInfo {
    let mut info = ConnectionInfo::new("fake.example", 22, "alice");
    info.auth_methods.push(AuthMethod::password(PASSWORD));
    info.preferred = Preferred {
        kex: Cow::Borrowed(&[kex::NONE]),
        cipher: Cow::Borrowed(&[cipher::NONE]),
        mac: Cow::Borrowed(&[mac::NONE]),
        compression: Cow::Borrowed(&[compression::NONE]),
        ..Preferred::DEFAULT
    };
    info.host_key_verifier = Arc::new(AcceptAnyHostKey);
    info.timeout = Duration::from_secs(5);
    info
}

/// A connected session and the server it talks to.
pub(crate) async fn connected(info: ConnectionInfo) -> (Session, FakeServer) {
    let mut session = Session::new(info);
    let server = connect(&mut session, Handshake::None).await;
    (session, server)
}

pub(crate) async fn connect(session: &mut Session, handshake: Handshake) -> FakeServer {
    let (client, server) = tokio::io::duplex(1 << 20);
    let mut server = FakeServer::new(server);
    let (result, ()) = tokio::join!(session.connect_stream(client), async {
        server.handshake(handshake).await;
        server.accept_auth().await;
    });
    result.unwrap();
    server
}

/// Collects everything an observer list reports.
pub(crate) fn record<T: Clone + Send + 'static>(
    observers: &crate::observer::Observers<T>,
) -> Arc<Mutex<Vec<T>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let s = seen.clone();
    observers.subscribe(move |e: &T| s.lock().unwrap().push(e.clone()));
    seen
}

pub(crate) enum Handshake {
    /// The `none` key exchange, packets stay in clear.
    None,
    /// curve25519-sha256 with aes256-ctr and hmac-sha2-256, signed with
    /// this host key.
    Curve25519(PrivateKey),
    /// diffie-hellman-group14-sha256, otherwise as [`Handshake::Curve25519`].
    DhGroup14(PrivateKey),
}

pub(crate) struct FakeServer {
    stream: DuplexStream,
    id: &'static str,
    buffer: SSHBuffer,
    opening: Box<dyn OpeningKey + Send>,
    writer: PacketWriter,
    /// The DISCONNECT the client sent instead of NEWKEYS.
    rejected: Option<(u32, String)>,
    /// The client's last KEXINIT payload.
    client_kex_init: Vec<u8>,
    /// Signs the exchange hash in place of the host key.
    forger: Option<PrivateKey>,
}

impl FakeServer {
    pub fn new(stream: DuplexStream) -> Self {
        FakeServer {
            stream,
            id: SERVER_ID,
            buffer: SSHBuffer::new(),
            opening: Box::new(cipher::clear::Key),
            writer: PacketWriter::clear(),
            rejected: None,
            client_kex_init: Vec::new(),
            forger: None,
        }
    }

    /// Identify as `id` instead of [`SERVER_ID`].
    pub fn with_id(mut self, id: &'static str) -> Self {
        self.id = id;
        self
    }

    /// Sign the exchange hash with `key`, whatever host key is presented.
    pub fn signing_with(mut self, key: PrivateKey) -> Self {
        self.forger = Some(key);
        self
    }

    pub async fn send(&mut self, payload: &[u8]) {
        self.writer.packet(payload).unwrap();
        let out = self.writer.take();
        self.stream.write_all(&out).await.unwrap();
    }

    pub async fn write_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.unwrap();
    }

    /// The next payload, skipping keep-alives.
    pub async fn recv(&mut self) -> Vec<u8> {
        loop {
            self.buffer.buffer.clear();
            let n = cipher::read(&mut self.stream, &mut self.buffer, &mut *self.opening)
                .await
                .unwrap();
            let payload = self.buffer.buffer[5..n].to_vec();
            if payload[0] != msg::IGNORE {
                return payload;
            }
        }
    }

    pub async fn expect(&mut self, number: u8) -> Vec<u8> {
        let payload = self.recv().await;
        assert_eq!(payload[0], number, "unexpected message {payload:?}");
        payload
    }

    /// Skip messages until one numbered `number`.
    pub async fn skip_to(&mut self, number: u8) -> Vec<u8> {
        loop {
            let payload = self.recv().await;
            if payload[0] == number {
                return payload;
            }
        }
    }

    pub async fn handshake(&mut self, handshake: Handshake) {
        self.write_raw(format!("{}\r\n", self.id).as_bytes()).await;
        let client_id = read_ssh_id(&mut self.stream).await.unwrap();
        assert!(client_id.starts_with("SSH-2.0-"));

        let (kex_name, host_key) = match handshake {
            Handshake::None => (kex::NONE, None),
            Handshake::Curve25519(key) => (kex::CURVE25519, Some(key)),
            Handshake::DhGroup14(key) => (kex::DH_G14_SHA256, Some(key)),
        };
        let (cipher_name, mac_name) = if host_key.is_some() {
            ("aes256-ctr", "hmac-sha2-256")
        } else {
            ("none", "none")
        };
        let server_kex_init = kexinit(kex_name.as_ref(), cipher_name, mac_name);
        self.send(&server_kex_init).await;
        let client_kex_init = self.expect(msg::KEXINIT).await;
        self.client_kex_init = client_kex_init.clone();

        let Some(host_key) = host_key else {
            self.expect(msg::NEWKEYS).await;
            self.send(&[msg::NEWKEYS]).await;
            return;
        };

        let mut exchange = Exchange::new(client_id.as_bytes(), self.id.as_bytes());
        exchange.client_kex_init = client_kex_init;
        exchange.server_kex_init = server_kex_init;
        let mut kex = KEXES.get(&kex_name).unwrap().make();
        let init = self.expect(msg::KEX_ECDH_INIT).await;
        kex.server_dh(&mut exchange, &init).unwrap();

        let blob = host_key.public_key().key_data().encoded().unwrap();
        let hash = kex.compute_exchange_hash(&blob, &exchange).unwrap();
        let mut reply = vec![msg::KEX_ECDH_REPLY];
        blob.encode(&mut reply).unwrap();
        exchange.server_ephemeral.encode(&mut reply).unwrap();
        crate::keys::sign(self.forger.as_ref().unwrap_or(&host_key), &hash)
            .unwrap()
            .encode(&mut reply)
            .unwrap();
        self.send(&reply).await;

        // The client may reject the key, in which case it disconnects.
        let payload = self.recv().await;
        if payload[0] == msg::DISCONNECT {
            self.rejected = Some(read_disconnect(&payload));
            return;
        }
        assert_eq!(payload[0], msg::NEWKEYS);
        let pair = kex
            .compute_keys(
                &hash,
                &hash,
                cipher::AES_256_CTR,
                mac::HMAC_SHA256,
                mac::HMAC_SHA256,
                true,
            )
            .unwrap();
        self.send(&[msg::NEWKEYS]).await;
        self.writer.cipher = pair.local_to_remote;
        self.opening = pair.remote_to_local;
    }

    /// The key exchange algorithms the client offered.
    pub fn offered_kex(&self) -> Vec<String> {
        let mut r = &self.client_kex_init[17..];
        String::decode(&mut r)
            .unwrap()
            .split(',')
            .map(String::from)
            .collect()
    }

    /// The reason and description of the DISCONNECT the client sent
    /// instead of NEWKEYS, if any.
    pub fn rejected_handshake(&self) -> Option<(u32, String)> {
        self.rejected.clone()
    }

    pub async fn accept_service(&mut self) {
        let request = self.expect(msg::SERVICE_REQUEST).await;
        assert_eq!(String::decode(&mut &request[1..]).unwrap(), "ssh-userauth");
        let mut accept = vec![msg::SERVICE_ACCEPT];
        "ssh-userauth".encode(&mut accept).unwrap();
        self.send(&accept).await;
    }

    /// Answer one USERAUTH_REQUEST: only [`PASSWORD`] is accepted.
    /// Returns the method and whether it succeeded.
    pub async fn answer_auth(&mut self) -> (String, bool) {
        let request = self.expect(msg::USERAUTH_REQUEST).await;
        let mut r = &request[1..];
        let _user = String::decode(&mut r).unwrap();
        let _service = String::decode(&mut r).unwrap();
        let method = String::decode(&mut r).unwrap();
        if method == "password" {
            let _change = u8::decode(&mut r).unwrap();
            if String::decode(&mut r).unwrap() == PASSWORD {
                self.send(&[msg::USERAUTH_SUCCESS]).await;
                return (method, true);
            }
        }
        let mut failure = vec![msg::USERAUTH_FAILURE];
        "password".encode(&mut failure).unwrap();
        failure.push(0);
        self.send(&failure).await;
        (method, false)
    }

    pub async fn accept_auth(&mut self) {
        if self.rejected_handshake().is_some() {
            return;
        }
        self.accept_service().await;
        while !self.answer_auth().await.1 {}
    }

    /// Confirm the next CHANNEL_OPEN. Returns its type, the client's
    /// channel number and the type-specific data.
    pub async fn confirm_open(&mut self) -> (String, u32, Vec<u8>) {
        self.confirm_open_with(1 << 20, 32768).await
    }

    /// [`FakeServer::confirm_open`], advertising `window` and `max_packet`.
    pub async fn confirm_open_with(
        &mut self,
        window: u32,
        max_packet: u32,
    ) -> (String, u32, Vec<u8>) {
        let open = self.expect(msg::CHANNEL_OPEN).await;
        let mut r = &open[1..];
        let kind = String::decode(&mut r).unwrap();
        let client_channel = u32::decode(&mut r).unwrap();
        let _window = u32::decode(&mut r).unwrap();
        let _max_packet = u32::decode(&mut r).unwrap();
        let mut confirm = vec![msg::CHANNEL_OPEN_CONFIRMATION];
        client_channel.encode(&mut confirm).unwrap();
        SERVER_CHANNEL.encode(&mut confirm).unwrap();
        window.encode(&mut confirm).unwrap();
        max_packet.encode(&mut confirm).unwrap();
        self.send(&confirm).await;
        (kind, client_channel, r.to_vec())
    }

    /// Answer the next CHANNEL_REQUEST, on the client's `channel`.
    /// Returns its name and data.
    pub async fn reply_request(&mut self, channel: u32, success: bool) -> (String, Vec<u8>) {
        let request = self.expect(msg::CHANNEL_REQUEST).await;
        let mut r = &request[1..];
        assert_eq!(u32::decode(&mut r).unwrap(), SERVER_CHANNEL);
        let name = String::decode(&mut r).unwrap();
        let want_reply = u8::decode(&mut r).unwrap() != 0;
        let data = r.to_vec();
        if want_reply {
            let number = if success {
                msg::CHANNEL_SUCCESS
            } else {
                msg::CHANNEL_FAILURE
            };
            let mut reply = vec![number];
            channel.encode(&mut reply).unwrap();
            self.send(&reply).await;
        }
        (name, data)
    }
}

pub(crate) fn read_disconnect(payload: &[u8]) -> (u32, String) {
    let mut r = &payload[1..];
    let reason = u32::decode(&mut r).unwrap();
    (reason, String::decode(&mut r).unwrap())
}

pub(crate) fn channel_data(channel: u32, data: &[u8]) -> Vec<u8> {
    let mut buf = vec![msg::CHANNEL_DATA];
    channel.encode(&mut buf).unwrap();
    data.encode(&mut buf).unwrap();
    buf
}

/// The data of a CHANNEL_DATA sent to the server's channel.
pub(crate) fn read_channel_data(payload: &[u8]) -> Vec<u8> {
    assert_eq!(payload[0], msg::CHANNEL_DATA);
    let mut r = &payload[1..];
    assert_eq!(u32::decode(&mut r).unwrap(), SERVER_CHANNEL);
    Vec::<u8>::decode(&mut r).unwrap()
}

pub(crate) fn channel_message(number: u8, channel: u32) -> Vec<u8> {
    let mut buf = vec![number];
    channel.encode(&mut buf).unwrap();
    buf
}

fn kexinit(kex: &str, cipher: &str, mac: &str) -> Vec<u8> {
    let mut buf = vec![msg::KEXINIT];
    buf.extend(&[42; 16]);
    for list in [kex, "ssh-ed25519", cipher, cipher, mac, mac, "none", "none", "", ""] {
        list.encode(&mut buf).unwrap();
    }
    buf.push(0);
    buf.extend(&[0, 0, 0, 0]);
    buf
}
