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

//! Client-side user authentication (RFC 4252).
//!
//! [`ClientAuthentication`] first sends the `none` method, both to learn
//! which methods the server accepts and in case no authentication is
//! needed at all. It then tries, in order, the first configured method
//! the server currently allows. A partial success replaces the allowed
//! set with the one the server sends back, which is how multi-factor
//! chains (e.g. password then public key) are followed. The number of
//! partial successes is bounded.
use std::fmt::{Debug, Display, Formatter};
use std::future::Future;
use std::ops::{Deref, DerefMut};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info};
use ssh_encoding::{Decode, Encode};
use ssh_key::PrivateKey;

use crate::client::ConnectionInfo;
use crate::helpers::{EncodedExt, NameList};
use crate::msg::{self, MessageKind, USERAUTH_KINDS};
use crate::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MethodKind {
    None,
    Password,
    PublicKey,
    HostBased,
    KeyboardInteractive,
}

impl From<&MethodKind> for &'static str {
    fn from(value: &MethodKind) -> Self {
        match value {
            MethodKind::None => "none",
            MethodKind::Password => "password",
            MethodKind::PublicKey => "publickey",
            MethodKind::HostBased => "hostbased",
            MethodKind::KeyboardInteractive => "keyboard-interactive",
        }
    }
}

impl FromStr for MethodKind {
    fn from_str(b: &str) -> Result<MethodKind, Self::Err> {
        match b {
            "none" => Ok(MethodKind::None),
            "password" => Ok(MethodKind::Password),
            "publickey" => Ok(MethodKind::PublicKey),
            "hostbased" => Ok(MethodKind::HostBased),
            "keyboard-interactive" => Ok(MethodKind::KeyboardInteractive),
            _ => Err(()),
        }
    }

    type Err = ();
}

impl From<&MethodKind> for String {
    fn from(value: &MethodKind) -> Self {
        <&str>::from(value).to_string()
    }
}

impl Display for MethodKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.into())
    }
}

/// An ordered set of authentication methods.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MethodSet(Vec<MethodKind>);

impl Deref for MethodSet {
    type Target = [MethodKind];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<&[MethodKind]> for MethodSet {
    fn from(value: &[MethodKind]) -> Self {
        let mut this = Self::empty();
        for method in value {
            this.push(*method);
        }
        this
    }
}

impl From<&MethodSet> for NameList {
    fn from(value: &MethodSet) -> Self {
        Self(value.iter().map(|x| x.into()).collect())
    }
}

/// Names we don't implement (e.g. `gssapi-with-mic`) are dropped.
impl From<&NameList> for MethodSet {
    fn from(value: &NameList) -> Self {
        Self(
            value
                .0
                .iter()
                .filter_map(|x| MethodKind::from_str(x).ok())
                .collect(),
        )
    }
}

impl Display for MethodSet {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&NameList::from(self).as_encoded_string())
    }
}

impl MethodSet {
    pub fn empty() -> Self {
        Self(Vec::new())
    }

    pub fn remove(&mut self, method: MethodKind) {
        self.0.retain(|x| *x != method);
    }

    /// Push a method to the end of the list.
    /// If the method is already in the list, it is moved to the end.
    pub fn push(&mut self, method: MethodKind) {
        self.remove(method);
        self.0.push(method);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthResult {
    Success,
    Failure {
        /// The server suggests to proceed with these auth methods
        remaining_methods: MethodSet,
        /// The server says that though auth method has been accepted,
        /// further authentication is required
        partial_success: bool,
    },
}

impl AuthResult {
    pub fn success(&self) -> bool {
        matches!(self, AuthResult::Success)
    }
}

/// A keyboard-interactive challenge (RFC 4256). Each prompt comes with
/// whether the answer may be echoed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompt {
    pub name: String,
    pub instruction: String,
    pub prompts: Vec<(String, bool)>,
}

pub type Responder = Arc<dyn Fn(&Prompt) -> Vec<String> + Send + Sync>;

/// A configured way of authenticating.
#[derive(Clone)]
pub enum AuthMethod {
    None,
    Password {
        password: String,
    },
    PublicKey {
        key: Arc<PrivateKey>,
    },
    KeyboardInteractive {
        submethods: String,
        responder: Responder,
    },
}

impl Debug for AuthMethod {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthMethod::None => f.write_str("None"),
            AuthMethod::Password { .. } => f.write_str("Password { [hidden] }"),
            AuthMethod::PublicKey { key } => f
                .debug_struct("PublicKey")
                .field("algorithm", &key.algorithm())
                .finish(),
            AuthMethod::KeyboardInteractive { submethods, .. } => f
                .debug_struct("KeyboardInteractive")
                .field("submethods", submethods)
                .finish(),
        }
    }
}

impl AuthMethod {
    pub fn password<P: Into<String>>(password: P) -> Self {
        AuthMethod::Password {
            password: password.into(),
        }
    }

    pub fn public_key(key: PrivateKey) -> Self {
        AuthMethod::PublicKey { key: Arc::new(key) }
    }

    pub fn keyboard_interactive<F>(responder: F) -> Self
    where
        F: Fn(&Prompt) -> Vec<String> + Send + Sync + 'static,
    {
        AuthMethod::KeyboardInteractive {
            submethods: String::new(),
            responder: Arc::new(responder),
        }
    }

    pub fn kind(&self) -> MethodKind {
        match self {
            AuthMethod::None => MethodKind::None,
            AuthMethod::Password { .. } => MethodKind::Password,
            AuthMethod::PublicKey { .. } => MethodKind::PublicKey,
            AuthMethod::KeyboardInteractive { .. } => MethodKind::KeyboardInteractive,
        }
    }
}

/// What [`ClientAuthentication`] needs from the session: the session
/// identifier, message registration, and a way to exchange messages.
pub trait AuthTransport: Send {
    fn session_id(&self) -> Option<Vec<u8>>;

    fn register_message(&mut self, kind: MessageKind);

    fn unregister_message(&mut self, kind: MessageKind);

    fn send_message(&mut self, payload: Vec<u8>) -> impl Future<Output = Result<(), Error>> + Send;

    /// The next message of a registered kind.
    fn recv_message(&mut self) -> impl Future<Output = Result<Vec<u8>, Error>> + Send;
}

/// Holds the authentication message registrations, and releases them
/// when dropped, whether authentication finished, failed, or was
/// cancelled.
struct Registration<'a, T: AuthTransport> {
    transport: &'a mut T,
}

impl<'a, T: AuthTransport> Registration<'a, T> {
    fn new(transport: &'a mut T) -> Self {
        for kind in USERAUTH_KINDS {
            transport.register_message(*kind);
        }
        Registration { transport }
    }
}

impl<T: AuthTransport> Drop for Registration<'_, T> {
    fn drop(&mut self) {
        for kind in USERAUTH_KINDS {
            self.transport.unregister_message(*kind);
        }
    }
}

impl<T: AuthTransport> Deref for Registration<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        self.transport
    }
}

impl<T: AuthTransport> DerefMut for Registration<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.transport
    }
}

pub const DEFAULT_MAX_PARTIAL_SUCCESSES: usize = 5;

const SERVICE: &str = "ssh-connection";

/// Runs the configured authentication methods against a session.
#[derive(Debug, Clone)]
pub struct ClientAuthentication {
    username: String,
    methods: Vec<AuthMethod>,
    max_partial_successes: usize,
    timeout: Duration,
}

impl ClientAuthentication {
    pub fn new(info: &ConnectionInfo) -> Self {
        ClientAuthentication {
            username: info.username.clone(),
            methods: info.auth_methods.clone(),
            max_partial_successes: info.max_partial_successes,
            timeout: info.timeout,
        }
    }

    pub fn with_methods<U: Into<String>>(username: U, methods: Vec<AuthMethod>) -> Self {
        ClientAuthentication {
            username: username.into(),
            methods,
            max_partial_successes: DEFAULT_MAX_PARTIAL_SUCCESSES,
            timeout: crate::client::DEFAULT_TIMEOUT,
        }
    }

    pub fn max_partial_successes(mut self, max: usize) -> Self {
        self.max_partial_successes = max;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Authenticate, registering for the `SSH_MSG_USERAUTH_*` messages
    /// only for the duration of the call.
    pub async fn authenticate<T: AuthTransport>(&self, transport: &mut T) -> Result<(), Error> {
        if self.username.is_empty() {
            return Err(Error::MissingArgument("username"));
        }
        let mut transport = Registration::new(transport);

        let mut allowed = match self.attempt(&mut *transport, &AuthMethod::None).await? {
            AuthResult::Success => {
                info!("{} authenticated without credentials", self.username);
                return Ok(());
            }
            AuthResult::Failure {
                remaining_methods, ..
            } => remaining_methods,
        };
        debug!("server allows {allowed}");

        let mut partial_successes = 0;
        // Indices of methods that failed against the current allowed set.
        let mut failed = Vec::new();
        loop {
            let next = self.methods.iter().enumerate().find(|(i, m)| {
                m.kind() != MethodKind::None && allowed.contains(&m.kind()) && !failed.contains(i)
            });
            let Some((i, method)) = next else {
                return Err(Error::AuthenticationFailed { remaining: allowed });
            };
            debug!("trying {}", method.kind());

            match self.attempt(&mut *transport, method).await? {
                AuthResult::Success => {
                    info!("{} authenticated with {}", self.username, method.kind());
                    return Ok(());
                }
                AuthResult::Failure {
                    remaining_methods,
                    partial_success: true,
                } => {
                    partial_successes += 1;
                    if partial_successes > self.max_partial_successes {
                        return Err(Error::TooManyPartialSuccesses(partial_successes));
                    }
                    debug!("partial success, server now allows {remaining_methods}");
                    allowed = remaining_methods;
                    failed.clear();
                }
                AuthResult::Failure { .. } => failed.push(i),
            }
        }
    }

    fn request(&self, method: &str) -> Result<Vec<u8>, Error> {
        let mut buf = vec![msg::USERAUTH_REQUEST];
        self.username.encode(&mut buf)?;
        SERVICE.encode(&mut buf)?;
        method.encode(&mut buf)?;
        Ok(buf)
    }

    async fn attempt<T: AuthTransport>(
        &self,
        transport: &mut T,
        method: &AuthMethod,
    ) -> Result<AuthResult, Error> {
        let payload = match method {
            AuthMethod::None => self.request("none")?,
            AuthMethod::Password { password } => {
                let mut buf = self.request("password")?;
                0u8.encode(&mut buf)?;
                password.encode(&mut buf)?;
                buf
            }
            AuthMethod::PublicKey { key } => {
                let session_id = transport.session_id().ok_or(Error::Inconsistent)?;
                let mut buf = self.request("publickey")?;
                1u8.encode(&mut buf)?;
                crate::keys::signing_algorithm(key).as_str().encode(&mut buf)?;
                key.public_key().key_data().encoded()?.encode(&mut buf)?;

                let mut to_sign = session_id.encoded()?;
                to_sign.extend_from_slice(&buf);
                crate::keys::sign(key, &to_sign)?.encode(&mut buf)?;
                buf
            }
            AuthMethod::KeyboardInteractive { submethods, .. } => {
                let mut buf = self.request("keyboard-interactive")?;
                "".encode(&mut buf)?; // language tag
                submethods.encode(&mut buf)?;
                buf
            }
        };
        transport.send_message(payload).await?;

        loop {
            let reply = tokio::time::timeout(self.timeout, transport.recv_message())
                .await
                .map_err(|_| Error::ConnectionTimeout)??;
            let Some((&number, mut r)) = reply.split_first() else {
                return Err(Error::Inconsistent);
            };
            match number {
                msg::USERAUTH_SUCCESS => return Ok(AuthResult::Success),
                msg::USERAUTH_FAILURE => {
                    let remaining_methods = MethodSet::from(&NameList::decode(&mut r)?);
                    let partial_success = u8::decode(&mut r)? != 0;
                    return Ok(AuthResult::Failure {
                        remaining_methods,
                        partial_success,
                    });
                }
                // Reported by the session as an event.
                msg::USERAUTH_BANNER => continue,
                msg::USERAUTH_INFO_REQUEST => match method {
                    AuthMethod::KeyboardInteractive { responder, .. } => {
                        let prompt = read_prompt(&mut r)?;
                        debug!("{} keyboard-interactive prompts", prompt.prompts.len());
                        let mut answers = responder(&prompt);
                        answers.resize(prompt.prompts.len(), String::new());

                        let mut buf = vec![msg::USERAUTH_INFO_RESPONSE];
                        (answers.len() as u32).encode(&mut buf)?;
                        for answer in &answers {
                            answer.encode(&mut buf)?;
                        }
                        transport.send_message(buf).await?;
                    }
                    // SSH_MSG_USERAUTH_PASSWD_CHANGEREQ shares this number.
                    // Changing the password is not supported.
                    _ => {
                        debug!("server requests a password change");
                        return Ok(AuthResult::Failure {
                            remaining_methods: MethodSet::from(
                                &[MethodKind::Password][..],
                            ),
                            partial_success: false,
                        });
                    }
                },
                n => {
                    return Err(Error::UnexpectedMessage(
                        MessageKind::from_u8(n).map(|k| k.name()).unwrap_or("unknown"),
                    ))
                }
            }
        }
    }
}

fn read_prompt(r: &mut &[u8]) -> Result<Prompt, Error> {
    let name = String::decode(r)?;
    let instruction = String::decode(r)?;
    let _lang = String::decode(r)?;
    let n = u32::decode(r)?;
    let mut prompts = Vec::new();
    for _ in 0..n {
        let prompt = String::decode(r)?;
        let echo = u8::decode(r)? != 0;
        prompts.push((prompt, echo));
    }
    Ok(Prompt {
        name,
        instruction,
        prompts,
    })
}

#[cfg(test)]
mod tests {
    use std::collections::{HashMap, VecDeque};

    use super::*;
    use crate::keys::tests::ed25519_key;

    /// Reacts to each request with the replies returned by `script`,
    /// which gets the method name (or `info-response`) and the payload.
    struct ScriptedServer {
        script: Box<dyn FnMut(&str, &[u8]) -> Vec<Vec<u8>> + Send>,
        inbox: VecDeque<Vec<u8>>,
        tried: Vec<String>,
        registered: HashMap<MessageKind, i32>,
        register_calls: usize,
        unregister_calls: usize,
    }

    impl ScriptedServer {
        fn new<F: FnMut(&str, &[u8]) -> Vec<Vec<u8>> + Send + 'static>(script: F) -> Self {
            ScriptedServer {
                script: Box::new(script),
                inbox: VecDeque::new(),
                tried: Vec::new(),
                registered: HashMap::new(),
                register_calls: 0,
                unregister_calls: 0,
            }
        }

        fn assert_released_once(&self) {
            assert_eq!(self.register_calls, USERAUTH_KINDS.len());
            assert_eq!(self.unregister_calls, USERAUTH_KINDS.len());
            assert!(self.registered.values().all(|n| *n == 0));
        }
    }

    impl AuthTransport for ScriptedServer {
        fn session_id(&self) -> Option<Vec<u8>> {
            Some(b"session-id".to_vec())
        }

        fn register_message(&mut self, kind: MessageKind) {
            self.register_calls += 1;
            *self.registered.entry(kind).or_default() += 1;
        }

        fn unregister_message(&mut self, kind: MessageKind) {
            self.unregister_calls += 1;
            *self.registered.entry(kind).or_default() -= 1;
        }

        async fn send_message(&mut self, payload: Vec<u8>) -> Result<(), Error> {
            let method = if payload[0] == msg::USERAUTH_INFO_RESPONSE {
                "info-response".to_string()
            } else {
                let mut r = &payload[1..];
                let _user = String::decode(&mut r).unwrap();
                let _service = String::decode(&mut r).unwrap();
                String::decode(&mut r).unwrap()
            };
            self.tried.push(method.clone());
            let replies = (self.script)(&method, &payload);
            self.inbox.extend(replies);
            Ok(())
        }

        async fn recv_message(&mut self) -> Result<Vec<u8>, Error> {
            self.inbox.pop_front().ok_or(Error::RecvError)
        }
    }

    fn failure(methods: &str, partial: bool) -> Vec<u8> {
        let mut buf = vec![msg::USERAUTH_FAILURE];
        methods.encode(&mut buf).unwrap();
        buf.push(partial as u8);
        buf
    }

    fn success() -> Vec<u8> {
        vec![msg::USERAUTH_SUCCESS]
    }

    #[tokio::test]
    async fn none_accepted() {
        let mut server = ScriptedServer::new(|_, _| vec![success()]);
        let auth = ClientAuthentication::with_methods("me", vec![AuthMethod::password("x")]);
        auth.authenticate(&mut server).await.unwrap();
        assert_eq!(server.tried, ["none"]);
        server.assert_released_once();
    }

    #[tokio::test]
    async fn password_then_publickey_chain() {
        let mut server = ScriptedServer::new(|method, payload| match method {
            "none" => vec![failure("password", false)],
            "password" => vec![failure("publickey", true)],
            "publickey" => {
                // The signature covers the session id and the request.
                let key = ed25519_key();
                let mut r = &payload[1..];
                for _ in 0..3 {
                    String::decode(&mut r).unwrap();
                }
                assert_eq!(u8::decode(&mut r).unwrap(), 1);
                assert_eq!(String::decode(&mut r).unwrap(), "ssh-ed25519");
                let _blob = Vec::<u8>::decode(&mut r).unwrap();
                let signed_len = payload.len() - r.len();
                let sig = Vec::<u8>::decode(&mut r).unwrap();
                let mut signed = b"session-id".to_vec().encoded().unwrap();
                signed.extend_from_slice(&payload[..signed_len]);
                crate::keys::verify_signature(key.public_key(), &signed, &sig).unwrap();
                vec![success()]
            }
            _ => panic!("unexpected {method}"),
        });
        let auth = ClientAuthentication::with_methods(
            "me",
            vec![
                AuthMethod::public_key(ed25519_key()),
                AuthMethod::password("hunter2"),
            ],
        );
        auth.authenticate(&mut server).await.unwrap();
        // publickey is configured first, but only password is allowed at first.
        assert_eq!(server.tried, ["none", "password", "publickey"]);
        server.assert_released_once();
    }

    #[tokio::test]
    async fn failed_method_falls_through_to_the_next() {
        let mut server = ScriptedServer::new(|method, _| match method {
            "none" => vec![failure("password,keyboard-interactive", false)],
            "password" => vec![failure("password,keyboard-interactive", false)],
            "keyboard-interactive" => {
                let mut req = vec![msg::USERAUTH_INFO_REQUEST];
                for s in ["login", "one time code", ""] {
                    s.encode(&mut req).unwrap();
                }
                1u32.encode(&mut req).unwrap();
                "Code: ".encode(&mut req).unwrap();
                req.push(0);
                vec![req]
            }
            "info-response" => vec![success()],
            _ => panic!("unexpected {method}"),
        });
        let auth = ClientAuthentication::with_methods(
            "me",
            vec![
                AuthMethod::password("wrong"),
                AuthMethod::keyboard_interactive(|p: &Prompt| {
                    assert_eq!(p.prompts, [("Code: ".to_string(), false)]);
                    vec!["123456".to_string()]
                }),
            ],
        );
        auth.authenticate(&mut server).await.unwrap();
        assert_eq!(
            server.tried,
            ["none", "password", "keyboard-interactive", "info-response"]
        );
        server.assert_released_once();
    }

    #[tokio::test]
    async fn exhausted_methods_fail() {
        let mut server = ScriptedServer::new(|_, _| vec![failure("password,publickey", false)]);
        let auth = ClientAuthentication::with_methods("me", vec![AuthMethod::password("nope")]);
        match auth.authenticate(&mut server).await {
            Err(Error::AuthenticationFailed { remaining }) => {
                assert_eq!(remaining.to_string(), "password,publickey")
            }
            r => panic!("unexpected {r:?}"),
        }
        server.assert_released_once();
    }

    #[tokio::test]
    async fn partial_success_cycling_is_bounded() {
        let mut server = ScriptedServer::new(|method, _| match method {
            "none" => vec![failure("password", false)],
            _ => vec![failure("password", true)],
        });
        let auth = ClientAuthentication::with_methods("me", vec![AuthMethod::password("pw")])
            .max_partial_successes(3);
        assert!(matches!(
            auth.authenticate(&mut server).await,
            Err(Error::TooManyPartialSuccesses(4))
        ));
        assert_eq!(server.tried.len(), 5);
        server.assert_released_once();
    }

    #[tokio::test]
    async fn transport_error_still_unregisters() {
        let mut server = ScriptedServer::new(|_, _| Vec::new());
        let auth = ClientAuthentication::with_methods("me", vec![AuthMethod::password("pw")]);
        assert!(matches!(
            auth.authenticate(&mut server).await,
            Err(Error::RecvError)
        ));
        server.assert_released_once();
    }

    #[tokio::test]
    async fn missing_username() {
        let mut server = ScriptedServer::new(|_, _| vec![success()]);
        let auth = ClientAuthentication::with_methods("", vec![]);
        assert!(matches!(
            auth.authenticate(&mut server).await,
            Err(Error::MissingArgument("username"))
        ));
        assert_eq!(server.register_calls, 0);
        assert!(server.tried.is_empty());
    }

    #[test]
    fn method_set_drops_unknown_names() {
        let names = NameList::from_encoded_string("gssapi-with-mic,publickey,password");
        let set = MethodSet::from(&names);
        assert_eq!(&*set, &[MethodKind::PublicKey, MethodKind::Password]);
        assert_eq!(set.to_string(), "publickey,password");
    }
}
