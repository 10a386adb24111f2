// Copyright 2016 Pierre-Étienne Meunier
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//

//! The client session.
//!
//! ```no_run
//! use sshlink::auth::AuthMethod;
//! use sshlink::client::{ConnectionInfo, Session};
//! use sshlink::ChannelMsg;
//!
//! # async fn run() -> Result<(), sshlink::Error> {
//! let mut info = ConnectionInfo::new("example.com", 22, "me");
//! info.auth_methods.push(AuthMethod::password("hunter2"));
//! let mut session = Session::new(info);
//! session.connect().await?;
//!
//! let mut channel = session.channel_open_session().await?;
//! channel.exec(true, "uname -a").await?;
//! while let Some(msg) = channel.wait().await {
//!     match msg {
//!         ChannelMsg::Data { data } => print!("{}", String::from_utf8_lossy(&data)),
//!         ChannelMsg::ExitStatus { exit_status } => println!("exit {exit_status}"),
//!         ChannelMsg::Close => break,
//!         _ => {}
//!     }
//! }
//! session.disconnect().await?;
//! # Ok(())
//! # }
//! ```
use std::collections::HashMap;
use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Duration;

use log::{debug, info, warn};
use ssh_encoding::Encode;
use ssh_key::PublicKey;
use sshlink_proxy::ProxySettings;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc::{self, unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::auth::{AuthMethod, AuthTransport, ClientAuthentication, DEFAULT_MAX_PARTIAL_SUCCESSES};
use crate::channels::{Channel, ChannelTable};
use crate::compat::{self, CompatRule, ServerVersion, DEFAULT_RULES};
use crate::factory::Connector;
use crate::forwarding::PortCore;
use crate::keys::known_hosts::DefaultKnownHosts;
use crate::keys::HostKeyVerifier;
use crate::msg::{self, MessageKind, CONNECTION_KINDS};
use crate::observer::Observers;
use crate::sshbuffer::read_ssh_id;
use crate::{Disconnect, Error, Limits, Preferred, SshId};

mod encrypted;
mod kex;
mod keepalive;
mod session;
mod ssh_client;
mod transport;

pub use keepalive::{KeepAlive, KeepAliveSender};
pub use ssh_client::{CommandOutput, Connect, KeepAliveConfig, SshClient};

use kex::KexConfig;
use transport::Transport;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_WINDOW_SIZE: u32 = 2 * 1024 * 1024;
pub const DEFAULT_MAXIMUM_PACKET_SIZE: u32 = 32 * 1024;

/// Outgoing messages queued before the event loop pushes back.
const QUEUE_LEN: usize = 64;

/// Where and how to connect.
#[derive(Clone)]
pub struct ConnectionInfo {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub proxy: ProxySettings,
    /// Tried in order, among those the server allows.
    pub auth_methods: Vec<AuthMethod>,
    /// Bounds connection establishment, channel opens and requests.
    pub timeout: Duration,
    pub max_partial_successes: usize,
    /// `None` or a zero duration disables keep-alives.
    pub keepalive_interval: Option<Duration>,
    pub preferred: Preferred,
    pub limits: Limits,
    /// Initial local window of each channel.
    pub window_size: u32,
    pub maximum_packet_size: u32,
    pub client_id: SshId,
    /// Added to [`compat::DEFAULT_RULES`].
    pub compat_rules: Vec<CompatRule>,
    pub host_key_verifier: Arc<dyn HostKeyVerifier>,
}

impl ConnectionInfo {
    pub fn new<H: Into<String>, U: Into<String>>(host: H, port: u16, username: U) -> Self {
        ConnectionInfo {
            host: host.into(),
            port,
            username: username.into(),
            ..Default::default()
        }
    }
}

impl Default for ConnectionInfo {
    fn default() -> Self {
        ConnectionInfo {
            host: String::new(),
            port: 22,
            username: String::new(),
            proxy: ProxySettings::default(),
            auth_methods: Vec::new(),
            timeout: DEFAULT_TIMEOUT,
            max_partial_successes: DEFAULT_MAX_PARTIAL_SUCCESSES,
            keepalive_interval: None,
            preferred: Preferred::default(),
            limits: Limits::default(),
            window_size: DEFAULT_WINDOW_SIZE,
            maximum_packet_size: DEFAULT_MAXIMUM_PACKET_SIZE,
            client_id: SshId::default(),
            compat_rules: Vec::new(),
            host_key_verifier: Arc::new(DefaultKnownHosts),
        }
    }
}

impl Debug for ConnectionInfo {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionInfo")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("proxy", &self.proxy.kind)
            .field("auth_methods", &self.auth_methods)
            .field("timeout", &self.timeout)
            .field("keepalive_interval", &self.keepalive_interval)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
}

/// What a session reports to its [`Session::events`] subscribers.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// The server's identification line.
    ServerIdentification(String),
    /// Sent before the key is checked by the host key verifier.
    HostKeyReceived {
        host: String,
        port: u16,
        key: PublicKey,
    },
    AuthBanner(String),
    /// A problem that did not, by itself, end the session.
    ErrorOccurred(String),
    Disconnected {
        reason: Option<Disconnect>,
        description: String,
    },
}

/// Requests from handles to the event loop.
#[derive(Debug)]
pub(crate) enum Msg {
    Packet {
        payload: Vec<u8>,
        /// Fired once the packet has been written to the stream.
        ack: Option<oneshot::Sender<()>>,
    },
    GlobalRequest {
        payload: Vec<u8>,
        reply: Option<oneshot::Sender<Option<Vec<u8>>>>,
    },
    Rekey,
    Disconnect {
        reason: Disconnect,
        description: String,
    },
}

/// State of a connected session, shared by its handles and its event loop.
pub(crate) struct Shared {
    pub channels: Mutex<ChannelTable>,
    registry: Mutex<HashMap<MessageKind, usize>>,
    pub session_id: OnceLock<Vec<u8>>,
    /// Receives the registered authentication messages, and
    /// SSH_MSG_SERVICE_ACCEPT, while authenticating.
    pub auth_inbox: Mutex<Option<UnboundedSender<Vec<u8>>>>,
    /// Remotely forwarded ports, by bound address and port.
    pub forwards: Mutex<HashMap<(String, u32), UnboundedSender<Channel>>>,
    pub ports: Mutex<Vec<Weak<PortCore>>>,
    alive: AtomicBool,
    pub timeout: Duration,
    pub window_size: u32,
    pub maximum_packet_size: u32,
    pub events: Observers<SessionEvent>,
}

impl Debug for Shared {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shared")
            .field("alive", &self.is_alive())
            .finish_non_exhaustive()
    }
}

impl Shared {
    fn new(info: &ConnectionInfo, events: Observers<SessionEvent>) -> Self {
        Shared {
            channels: Mutex::new(ChannelTable::default()),
            registry: Mutex::new(HashMap::new()),
            session_id: OnceLock::new(),
            auth_inbox: Mutex::new(None),
            forwards: Mutex::new(HashMap::new()),
            ports: Mutex::new(Vec::new()),
            alive: AtomicBool::new(true),
            timeout: info.timeout,
            window_size: info.window_size,
            maximum_packet_size: info.maximum_packet_size,
            events,
        }
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Registrations are counted: a kind stays registered until it has
    /// been unregistered as many times as it was registered.
    pub fn register(&self, kind: MessageKind) {
        if let Ok(mut registry) = self.registry.lock() {
            *registry.entry(kind).or_default() += 1;
        }
    }

    pub fn unregister(&self, kind: MessageKind) {
        if let Ok(mut registry) = self.registry.lock() {
            if let Some(n) = registry.get_mut(&kind) {
                *n -= 1;
                if *n == 0 {
                    registry.remove(&kind);
                }
            }
        }
    }

    pub fn is_registered(&self, kind: MessageKind) -> bool {
        self.registry
            .lock()
            .map(|r| r.contains_key(&kind))
            .unwrap_or(false)
    }

    pub fn error(&self, message: String) {
        warn!("{message}");
        self.events.notify(&SessionEvent::ErrorOccurred(message));
    }

    /// Called by the event loop when it stops. Every channel and pending
    /// reply is released.
    pub fn teardown(&self) {
        self.alive.store(false, Ordering::SeqCst);
        if let Ok(mut channels) = self.channels.lock() {
            channels.clear();
        }
        if let Ok(mut inbox) = self.auth_inbox.lock() {
            inbox.take();
        }
        if let Ok(mut forwards) = self.forwards.lock() {
            forwards.clear();
        }
    }
}

/// What channels, forwarded ports and the keep-alive driver hold to
/// reach the event loop.
#[derive(Clone)]
pub(crate) struct Handle {
    pub sender: mpsc::Sender<Msg>,
    pub shared: Arc<Shared>,
}

impl Debug for Handle {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        self.shared.fmt(f)
    }
}

fn check_size(payload: &[u8]) -> Result<(), Error> {
    // Leave room for the packet header, padding and MAC.
    if payload.len() + 64 > crate::cipher::MAXIMUM_PACKET_LEN {
        return Err(Error::PacketSize(payload.len()));
    }
    Ok(())
}

impl Handle {
    pub fn is_alive(&self) -> bool {
        self.shared.is_alive() && !self.sender.is_closed()
    }

    /// Queue a packet.
    pub async fn send(&self, payload: Vec<u8>) -> Result<(), Error> {
        check_size(&payload)?;
        if !self.shared.is_alive() {
            return Err(Error::NotConnected);
        }
        self.sender
            .send(Msg::Packet { payload, ack: None })
            .await
            .map_err(|_| Error::NotConnected)
    }

    /// Queue a packet and wait until it is written.
    pub async fn send_flushed(&self, payload: Vec<u8>) -> Result<(), Error> {
        check_size(&payload)?;
        if !self.shared.is_alive() {
            return Err(Error::NotConnected);
        }
        let (ack, written) = oneshot::channel();
        self.sender
            .send(Msg::Packet {
                payload,
                ack: Some(ack),
            })
            .await
            .map_err(|_| Error::NotConnected)?;
        written.await.map_err(|_| Error::NotConnected)
    }

    /// Queue a packet without waiting for room in the queue.
    pub fn try_send(&self, payload: Vec<u8>) -> bool {
        self.shared.is_alive()
            && self
                .sender
                .try_send(Msg::Packet { payload, ack: None })
                .is_ok()
    }

    /// Send SSH_MSG_GLOBAL_REQUEST. With `want_reply`, returns the data
    /// of the server's SSH_MSG_REQUEST_SUCCESS.
    pub async fn global_request(
        &self,
        name: &str,
        want_reply: bool,
        data: &[u8],
    ) -> Result<Vec<u8>, Error> {
        let mut payload = vec![msg::GLOBAL_REQUEST];
        name.encode(&mut payload)?;
        (want_reply as u8).encode(&mut payload)?;
        payload.extend_from_slice(data);
        check_size(&payload)?;
        if !self.shared.is_alive() {
            return Err(Error::NotConnected);
        }

        let (reply, receiver) = if want_reply {
            let (s, r) = oneshot::channel();
            (Some(s), Some(r))
        } else {
            (None, None)
        };
        self.sender
            .send(Msg::GlobalRequest { payload, reply })
            .await
            .map_err(|_| Error::NotConnected)?;
        let Some(receiver) = receiver else {
            return Ok(Vec::new());
        };
        match tokio::time::timeout(self.shared.timeout, receiver).await {
            Ok(Ok(Some(data))) => Ok(data),
            Ok(Ok(None)) => Err(Error::RequestDenied),
            Ok(Err(_)) => Err(Error::NotConnected),
            Err(_) => Err(Error::ConnectionTimeout),
        }
    }
}

/// The session seen from [`ClientAuthentication`].
struct AuthChannel {
    handle: Handle,
    inbox: UnboundedReceiver<Vec<u8>>,
}

impl AuthTransport for AuthChannel {
    fn session_id(&self) -> Option<Vec<u8>> {
        self.handle.shared.session_id.get().cloned()
    }

    fn register_message(&mut self, kind: MessageKind) {
        self.handle.shared.register(kind)
    }

    fn unregister_message(&mut self, kind: MessageKind) {
        self.handle.shared.unregister(kind)
    }

    async fn send_message(&mut self, payload: Vec<u8>) -> Result<(), Error> {
        self.handle.send(payload).await
    }

    async fn recv_message(&mut self) -> Result<Vec<u8>, Error> {
        self.inbox.recv().await.ok_or(Error::RecvError)
    }
}

struct Connection {
    handle: Handle,
    server_version: ServerVersion,
    transport: JoinHandle<Result<(), Error>>,
    keepalive: KeepAlive,
}

/// A client session: one transport connection to a server, and the
/// channels multiplexed over it.
pub struct Session {
    info: ConnectionInfo,
    events: Observers<SessionEvent>,
    state: SessionState,
    keepalive_interval: Option<Duration>,
    connection: Option<Connection>,
}

impl Debug for Session {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("host", &self.info.host)
            .field("port", &self.info.port)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Session {
    pub fn new(info: ConnectionInfo) -> Self {
        Session {
            keepalive_interval: info.keepalive_interval,
            info,
            events: Observers::new(),
            state: SessionState::Disconnected,
            connection: None,
        }
    }

    pub fn info(&self) -> &ConnectionInfo {
        &self.info
    }

    pub fn events(&self) -> &Observers<SessionEvent> {
        &self.events
    }

    pub fn state(&self) -> SessionState {
        match &self.connection {
            Some(c) if c.handle.is_alive() => SessionState::Connected,
            Some(_) => SessionState::Disconnected,
            None => self.state,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state() == SessionState::Connected
    }

    /// The exchange hash of the first key exchange.
    pub fn session_id(&self) -> Option<Vec<u8>> {
        self.connection
            .as_ref()
            .and_then(|c| c.handle.shared.session_id.get().cloned())
    }

    pub fn server_version(&self) -> Option<&ServerVersion> {
        self.connection.as_ref().map(|c| &c.server_version)
    }

    pub(crate) fn handle(&self) -> Result<Handle, Error> {
        match &self.connection {
            Some(c) if c.handle.is_alive() => Ok(c.handle.clone()),
            _ => Err(Error::NotConnected),
        }
    }

    /// Connect to `info.host`, through the configured proxy, then
    /// exchange keys and authenticate.
    pub async fn connect(&mut self) -> Result<(), Error> {
        if self.is_connected() {
            return Err(Error::AlreadyConnected);
        }
        let stream = Connector::new(self.info.proxy.clone(), self.info.timeout)
            .connect(&self.info.host, self.info.port)
            .await?;
        self.connect_stream(stream).await
    }

    /// Run the protocol over an already established stream.
    pub async fn connect_stream<S>(&mut self, stream: S) -> Result<(), Error>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        if self.is_connected() {
            return Err(Error::AlreadyConnected);
        }
        // A previous connection that died on its own.
        self.connection = None;
        self.state = SessionState::Connecting;
        match self.establish(stream).await {
            Ok(connection) => {
                info!("connected to {}:{}", self.info.host, self.info.port);
                self.connection = Some(connection);
                self.state = SessionState::Connected;
                Ok(())
            }
            Err(e) => {
                self.state = SessionState::Disconnected;
                self.events.notify(&SessionEvent::ErrorOccurred(e.to_string()));
                Err(e)
            }
        }
    }

    async fn establish<S>(&self, mut stream: S) -> Result<Connection, Error>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let info = &self.info;
        let mut id = Vec::new();
        info.client_id.write(&mut id);
        stream.write_all(&id).await?;
        stream.flush().await?;

        let server_id = tokio::time::timeout(info.timeout, read_ssh_id(&mut stream))
            .await
            .map_err(|_| Error::ConnectionTimeout)??;
        let server_version = ServerVersion::parse(&server_id)?;
        self.events
            .notify(&SessionEvent::ServerIdentification(server_id.clone()));

        let rules: Vec<CompatRule> = DEFAULT_RULES
            .iter()
            .chain(info.compat_rules.iter())
            .cloned()
            .collect();
        let quirks = compat::quirks_for(&server_version, &rules);
        if !quirks.is_empty() {
            debug!("quirks for {}: {quirks:?}", server_version.software);
        }
        let config = Arc::new(KexConfig {
            preferred: compat::apply(quirks, &info.preferred),
            client_id: info.client_id.clone(),
            server_id,
            host: info.host.clone(),
            port: info.port,
            verifier: info.host_key_verifier.clone(),
        });

        let shared = Arc::new(Shared::new(info, self.events.clone()));
        let (sender, receiver) = mpsc::channel(QUEUE_LEN);
        let (kex_done, initial_kex) = oneshot::channel();
        let transport = Transport::new(
            config,
            shared.clone(),
            sender.downgrade(),
            info.limits.clone(),
            kex_done,
        );
        let join = tokio::spawn(transport.run(stream, receiver));
        let handle = Handle { sender, shared };

        let result = async {
            match tokio::time::timeout(info.timeout, initial_kex).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => return Err(Error::RecvError),
                Err(_) => return Err(Error::ConnectionTimeout),
            }
            self.authenticate(&handle).await
        }
        .await;
        if let Err(e) = result {
            return Err(abandon(handle, join, e, info.timeout).await);
        }

        for kind in CONNECTION_KINDS {
            handle.shared.register(*kind);
        }
        let keepalive = KeepAlive::start(handle.clone(), self.keepalive_interval);
        Ok(Connection {
            handle,
            server_version,
            transport: join,
            keepalive,
        })
    }

    async fn authenticate(&self, handle: &Handle) -> Result<(), Error> {
        let (inbox_sender, inbox) = unbounded_channel();
        *handle
            .shared
            .auth_inbox
            .lock()
            .map_err(|_| Error::Inconsistent)? = Some(inbox_sender);
        let mut channel = AuthChannel {
            handle: handle.clone(),
            inbox,
        };

        let mut request = vec![msg::SERVICE_REQUEST];
        "ssh-userauth".encode(&mut request)?;
        channel.send_message(request).await?;
        let accept = tokio::time::timeout(self.info.timeout, channel.recv_message())
            .await
            .map_err(|_| Error::ConnectionTimeout)??;
        if accept.first() != Some(&msg::SERVICE_ACCEPT) {
            return Err(Error::UnexpectedMessage("service accept"));
        }

        ClientAuthentication::new(&self.info)
            .authenticate(&mut channel)
            .await?;
        handle
            .shared
            .auth_inbox
            .lock()
            .map_err(|_| Error::Inconsistent)?
            .take();
        Ok(())
    }

    /// Send a message, and wait until it is written to the stream.
    pub async fn send_message(&self, payload: Vec<u8>) -> Result<(), Error> {
        self.handle()?.send_flushed(payload).await
    }

    /// Like [`Session::send_message`], but reports failure as `false`.
    pub async fn try_send_message(&self, payload: Vec<u8>) -> bool {
        match self.handle() {
            Ok(handle) => handle.send_flushed(payload).await.is_ok(),
            Err(_) => false,
        }
    }

    /// Have messages of `kind` dispatched by the session. Registration
    /// is counted; see [`Session::unregister_message`].
    pub fn register_message(&self, kind: MessageKind) -> Result<(), Error> {
        self.handle()?.shared.register(kind);
        Ok(())
    }

    pub fn unregister_message(&self, kind: MessageKind) -> Result<(), Error> {
        self.handle()?.shared.unregister(kind);
        Ok(())
    }

    pub fn keepalive_interval(&self) -> Option<Duration> {
        self.keepalive_interval
    }

    /// Takes effect immediately when connected. `None` or a zero
    /// duration stops keep-alives.
    pub fn set_keepalive_interval(&mut self, interval: Option<Duration>) {
        self.keepalive_interval = interval;
        if let Some(c) = &self.connection {
            c.keepalive.set_interval(interval);
        }
    }

    /// Start a new key exchange.
    pub async fn rekey(&self) -> Result<(), Error> {
        self.handle()?
            .sender
            .send(Msg::Rekey)
            .await
            .map_err(|_| Error::NotConnected)
    }

    pub async fn disconnect(&mut self) -> Result<(), Error> {
        self.disconnect_with(Disconnect::ByApplication, "").await
    }

    /// Stop the forwarded ports, send SSH_MSG_DISCONNECT and wait for the
    /// event loop to finish. Does nothing when not connected.
    pub async fn disconnect_with(
        &mut self,
        reason: Disconnect,
        description: &str,
    ) -> Result<(), Error> {
        self.state = SessionState::Disconnected;
        let Some(connection) = self.connection.take() else {
            return Ok(());
        };
        let Connection {
            handle,
            mut transport,
            keepalive,
            ..
        } = connection;
        drop(keepalive);
        crate::forwarding::stop_all(&handle.shared).await;

        let _ = handle
            .sender
            .send(Msg::Disconnect {
                reason,
                description: description.to_string(),
            })
            .await;
        drop(handle);
        match tokio::time::timeout(self.info.timeout, &mut transport).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => debug!("event loop ended with: {e}"),
            Ok(Err(e)) => warn!("event loop failed: {e}"),
            Err(_) => {
                warn!("event loop did not stop in time");
                transport.abort();
            }
        }
        Ok(())
    }
}

/// Give up on a connection that failed before it was established,
/// returning the most informative error.
async fn abandon(
    handle: Handle,
    mut join: JoinHandle<Result<(), Error>>,
    error: Error,
    timeout: Duration,
) -> Error {
    let reason = match error {
        Error::AuthenticationFailed { .. } | Error::TooManyPartialSuccesses(_) => {
            Disconnect::NoMoreAuthMethodsAvailable
        }
        _ => Disconnect::ByApplication,
    };
    let _ = handle.sender.try_send(Msg::Disconnect {
        reason,
        description: error.to_string(),
    });
    drop(handle);
    match tokio::time::timeout(timeout, &mut join).await {
        // The event loop knows why it stopped.
        Ok(Ok(Err(e))) if matches!(error, Error::RecvError | Error::NotConnected) => e,
        Ok(_) => error,
        Err(_) => {
            join.abort();
            error
        }
    }
}
