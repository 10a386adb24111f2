#![deny(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic
)]
#![allow(clippy::single_match, clippy::upper_case_acronyms)]
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

//! Asynchronous SSH2 client engine, based on tokio.
//!
//! A [`client::Session`] owns one transport connection. Connecting it
//! performs the version exchange, the key exchange and user
//! authentication, after which channels can be opened on it:
//!
//! * interactive shells and commands ([`client::Session::create_channel_session`]),
//! * subsystems such as SFTP or NETCONF ([`subsystem::SubsystemSession`]),
//! * TCP tunnels ([`forwarding`]).
//!
//! # Internal details of the event loop
//!
//! A single task owns the socket. It waits either for an incoming
//! packet, which it decrypts and dispatches to the channel table, to
//! the authentication inbox or to the global handlers, or for an
//! outgoing message queued by a [`client::Session`] handle, which it
//! encrypts and writes. Since that task is the only writer, packets
//! from concurrent callers (channel data, keep-alives, global requests)
//! never interleave on the wire.
//!
//! While a key exchange is running, the outgoing queue is not polled,
//! so at most one key exchange is ever in flight.
//!
//! Application-facing operations (opening a channel, a channel request,
//! a global request) queue a message and then wait, bounded by the
//! connection timeout, for the reply that the event loop routes back.
//! When the connection goes away, every pending wait is released with
//! an error.

use std::convert::TryFrom;
use std::fmt::{Debug, Display, Formatter};

use ssh_encoding::{Decode, Encode};
use thiserror::Error;

#[cfg(test)]
mod tests;

pub mod auth;
pub mod channels;
/// Cipher names
pub mod cipher;
pub mod client;
pub mod compat;
/// Compression algorithm names
pub mod compression;
pub mod factory;
pub mod forwarding;
mod helpers;
/// Key exchange algorithm names
pub mod kex;
pub mod keys;
/// MAC algorithm names
pub mod mac;
pub mod msg;
mod negotiation;
pub mod observer;
mod session;
mod sshbuffer;
pub mod subsystem;

pub use channels::{Channel, ChannelKind, ChannelMsg};
pub use negotiation::{Names, Preferred};
pub use sshbuffer::SshId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlgorithmKind {
    Kex,
    Key,
    Cipher,
    Compression,
    Mac,
}

#[derive(Debug, Error)]
pub enum Error {
    /// Unspecified problem with the beginning of key exchange.
    #[error("Key exchange init failed")]
    KexInit,

    /// Unknown algorithm name.
    #[error("Unknown algorithm")]
    UnknownAlgo,

    /// No common algorithm found during key exchange.
    #[error("No common {kind:?} algorithm - ours: {ours:?}, theirs: {theirs:?}")]
    NoCommonAlgo {
        kind: AlgorithmKind,
        ours: Vec<String>,
        theirs: Vec<String>,
    },

    /// Invalid SSH version string.
    #[error("invalid SSH version string")]
    Version,

    /// Error during key exchange.
    #[error("Key exchange failed")]
    Kex,

    /// Invalid packet authentication code.
    #[error("Wrong packet authentication code")]
    PacketAuth,

    /// The protocol is in an inconsistent state.
    #[error("Inconsistent state of the protocol")]
    Inconsistent,

    /// A message arrived that makes no sense at this point of the protocol.
    #[error("Unexpected message {0}")]
    UnexpectedMessage(&'static str),

    /// Unknown server key.
    #[error("Unknown server key")]
    UnknownKey,

    /// The server provided a wrong signature.
    #[error("Wrong server signature")]
    WrongServerSig,

    /// Excessive packet size.
    #[error("Bad packet size: {0}")]
    PacketSize(usize),

    /// Message received/sent on unopened channel.
    #[error("Channel not open")]
    WrongChannel,

    /// Server refused to open a channel.
    #[error("Failed to open channel ({0:?})")]
    ChannelOpenFailure(ChannelOpenFailure),

    /// The channel was closed, or its session went away, while an
    /// operation was waiting on it.
    #[error("Channel closed")]
    ChannelClosed,

    /// The server sent SSH_MSG_DISCONNECT.
    #[error("Disconnected by the server ({reason:?}): {description}")]
    DisconnectByPeer {
        reason: Disconnect,
        description: String,
    },

    /// No home directory found when looking for the known hosts file.
    #[error("No home directory when looking for known hosts")]
    NoHomeDir,

    /// Remote key changed, this could mean a man-in-the-middle attack
    /// is being performed on the connection.
    #[error("Key changed, line {}", line)]
    KeyChanged { line: usize },

    /// The server key matches an entry marked `@revoked`.
    #[error("Key revoked, line {}", line)]
    RevokedKey { line: usize },

    /// A known hosts line could not be parsed.
    #[error("Malformed known hosts entry, line {}", line)]
    KnownHostsFormat { line: usize },

    /// Connection closed by the remote side.
    #[error("Connection closed by the remote side")]
    HUP,

    /// Connection timeout.
    #[error("Connection timeout")]
    ConnectionTimeout,

    /// The session is not connected.
    #[error("Client not connected")]
    NotConnected,

    /// `connect` was called on a session that is already connected.
    #[error("Client already connected")]
    AlreadyConnected,

    /// Every configured method has been tried.
    #[error("Authentication failed, remaining methods: {remaining}")]
    AuthenticationFailed { remaining: auth::MethodSet },

    /// The server kept answering with partial successes.
    #[error("Too many partial successes ({0})")]
    TooManyPartialSuccesses(usize),

    /// A required argument was absent.
    #[error("Missing argument: {0}")]
    MissingArgument(&'static str),

    #[error("The request was rejected by the other party")]
    RequestDenied,

    /// `start` was called on a forwarded port that is already started.
    #[error("Forwarded port is already started")]
    AlreadyStarted,

    /// The forwarded port is not started.
    #[error("Forwarded port is not started")]
    NotStarted,

    /// The forwarded port was disposed of and cannot be started again.
    #[error("Forwarded port is disposed")]
    PortDisposed,

    /// Malformed SOCKS request from a local client.
    #[error("SOCKS: {0}")]
    Socks(String),

    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    IO(#[from] std::io::Error),

    #[error(transparent)]
    Utf8(#[from] std::str::Utf8Error),

    #[error(transparent)]
    #[cfg(feature = "flate2")]
    Compress(#[from] flate2::CompressError),

    #[error(transparent)]
    #[cfg(feature = "flate2")]
    Decompress(#[from] flate2::DecompressError),

    #[error(transparent)]
    Join(#[from] tokio::task::JoinError),

    #[error(transparent)]
    Proxy(#[from] sshlink_proxy::Error),

    #[error("Signature: {0}")]
    Signature(#[from] signature::Error),

    #[error("SshKey: {0}")]
    SshKey(#[from] ssh_key::Error),

    #[error("SshEncoding: {0}")]
    SshEncoding(#[from] ssh_encoding::Error),

    /// The event loop stopped while a reply was expected.
    #[error("Unable to receive more messages from the event loop")]
    RecvError,
}

impl Error {
    /// Protocol violations that tear the transport down, with the reason
    /// sent to the server.
    pub(crate) fn disconnect_reason(&self) -> Option<Disconnect> {
        match self {
            Error::PacketSize(_) | Error::Inconsistent | Error::UnexpectedMessage(_) => {
                Some(Disconnect::ProtocolError)
            }
            Error::PacketAuth => Some(Disconnect::MACError),
            #[cfg(feature = "flate2")]
            Error::Decompress(_) => Some(Disconnect::CompressionError),
            Error::Kex | Error::KexInit | Error::NoCommonAlgo { .. } | Error::WrongServerSig => {
                Some(Disconnect::KeyExchangeFailed)
            }
            Error::UnknownKey | Error::KeyChanged { .. } | Error::RevokedKey { .. } => {
                Some(Disconnect::HostKeyNotVerifiable)
            }
            _ => None,
        }
    }
}

/// The number of bytes read/written, and the number of seconds before a key
/// re-exchange is requested.
#[derive(Debug, Clone)]
pub struct Limits {
    pub rekey_write_limit: usize,
    pub rekey_read_limit: usize,
    pub rekey_time_limit: std::time::Duration,
}

impl Limits {
    /// Create a new `Limits`, checking that the given bounds cannot lead to
    /// nonce reuse.
    pub fn new(
        write_limit: usize,
        read_limit: usize,
        time_limit: std::time::Duration,
    ) -> Result<Limits, Error> {
        if write_limit > 1 << 30 || read_limit > 1 << 30 {
            return Err(Error::InvalidConfig(
                "rekey limits must not exceed 1 GiB".into(),
            ));
        }
        Ok(Limits {
            rekey_write_limit: write_limit,
            rekey_read_limit: read_limit,
            rekey_time_limit: time_limit,
        })
    }
}

impl Default for Limits {
    fn default() -> Self {
        // Following the recommendations of
        // https://tools.ietf.org/html/rfc4253#section-9
        Limits {
            rekey_write_limit: 1 << 30, // 1 Gb
            rekey_read_limit: 1 << 30,  // 1 Gb
            rekey_time_limit: std::time::Duration::from_secs(3600),
        }
    }
}

/// A reason for disconnection.
#[allow(missing_docs)] // This should be relatively self-explanatory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disconnect {
    HostNotAllowedToConnect = 1,
    ProtocolError = 2,
    KeyExchangeFailed = 3,
    #[doc(hidden)]
    Reserved = 4,
    MACError = 5,
    CompressionError = 6,
    ServiceNotAvailable = 7,
    ProtocolVersionNotSupported = 8,
    HostKeyNotVerifiable = 9,
    ConnectionLost = 10,
    ByApplication = 11,
    TooManyConnections = 12,
    AuthCancelledByUser = 13,
    NoMoreAuthMethodsAvailable = 14,
    IllegalUserName = 15,
}

impl TryFrom<u32> for Disconnect {
    type Error = crate::Error;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Ok(match value {
            1 => Self::HostNotAllowedToConnect,
            2 => Self::ProtocolError,
            3 => Self::KeyExchangeFailed,
            4 => Self::Reserved,
            5 => Self::MACError,
            6 => Self::CompressionError,
            7 => Self::ServiceNotAvailable,
            8 => Self::ProtocolVersionNotSupported,
            9 => Self::HostKeyNotVerifiable,
            10 => Self::ConnectionLost,
            11 => Self::ByApplication,
            12 => Self::TooManyConnections,
            13 => Self::AuthCancelledByUser,
            14 => Self::NoMoreAuthMethodsAvailable,
            15 => Self::IllegalUserName,
            _ => return Err(crate::Error::Inconsistent),
        })
    }
}

/// The type of signals that can be sent to a remote process. If you
/// plan to use custom signals, read [the
/// RFC](https://tools.ietf.org/html/rfc4254#section-6.10) to
/// understand the encoding.
#[allow(missing_docs)]
// This should be relatively self-explanatory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sig {
    ABRT,
    ALRM,
    FPE,
    HUP,
    ILL,
    INT,
    KILL,
    PIPE,
    QUIT,
    SEGV,
    TERM,
    USR1,
    Custom(String),
}

impl Sig {
    fn name(&self) -> &str {
        match *self {
            Sig::ABRT => "ABRT",
            Sig::ALRM => "ALRM",
            Sig::FPE => "FPE",
            Sig::HUP => "HUP",
            Sig::ILL => "ILL",
            Sig::INT => "INT",
            Sig::KILL => "KILL",
            Sig::PIPE => "PIPE",
            Sig::QUIT => "QUIT",
            Sig::SEGV => "SEGV",
            Sig::TERM => "TERM",
            Sig::USR1 => "USR1",
            Sig::Custom(ref c) => c,
        }
    }
    fn from_name(name: &str) -> Sig {
        match name {
            "ABRT" => Sig::ABRT,
            "ALRM" => Sig::ALRM,
            "FPE" => Sig::FPE,
            "HUP" => Sig::HUP,
            "ILL" => Sig::ILL,
            "INT" => Sig::INT,
            "KILL" => Sig::KILL,
            "PIPE" => Sig::PIPE,
            "QUIT" => Sig::QUIT,
            "SEGV" => Sig::SEGV,
            "TERM" => Sig::TERM,
            "USR1" => Sig::USR1,
            x => Sig::Custom(x.to_string()),
        }
    }
}

/// Reason for not being able to open a channel.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum ChannelOpenFailure {
    AdministrativelyProhibited = 1,
    ConnectFailed = 2,
    UnknownChannelType = 3,
    ResourceShortage = 4,
    Unknown = 0,
}

impl ChannelOpenFailure {
    fn from_u32(x: u32) -> Option<ChannelOpenFailure> {
        match x {
            1 => Some(ChannelOpenFailure::AdministrativelyProhibited),
            2 => Some(ChannelOpenFailure::ConnectFailed),
            3 => Some(ChannelOpenFailure::UnknownChannelType),
            4 => Some(ChannelOpenFailure::ResourceShortage),
            _ => None,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
/// The identifier of a channel.
pub struct ChannelId(pub(crate) u32);

impl Decode for ChannelId {
    type Error = ssh_encoding::Error;

    fn decode(reader: &mut impl ssh_encoding::Reader) -> Result<Self, Self::Error> {
        Ok(Self(u32::decode(reader)?))
    }
}

impl Encode for ChannelId {
    fn encoded_len(&self) -> Result<usize, ssh_encoding::Error> {
        self.0.encoded_len()
    }

    fn encode(&self, writer: &mut impl ssh_encoding::Writer) -> Result<(), ssh_encoding::Error> {
        self.0.encode(writer)
    }
}

impl From<ChannelId> for u32 {
    fn from(c: ChannelId) -> u32 {
        c.0
    }
}

impl Display for ChannelId {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
