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
// https://tools.ietf.org/html/rfc4253#section-12

//! Message numbers, and the [`MessageKind`] names the dispatch table is
//! keyed by.

pub const DISCONNECT: u8 = 1;
pub const IGNORE: u8 = 2;
pub const UNIMPLEMENTED: u8 = 3;
pub const DEBUG: u8 = 4;

pub const SERVICE_REQUEST: u8 = 5;
pub const SERVICE_ACCEPT: u8 = 6;
pub const EXT_INFO: u8 = 7;
pub const KEXINIT: u8 = 20;
pub const NEWKEYS: u8 = 21;

// http://tools.ietf.org/html/rfc5656#section-7.1
pub const KEX_ECDH_INIT: u8 = 30;
pub const KEX_ECDH_REPLY: u8 = 31;

// https://tools.ietf.org/html/rfc4250#section-4.1.2
pub const USERAUTH_REQUEST: u8 = 50;
pub const USERAUTH_FAILURE: u8 = 51;
pub const USERAUTH_SUCCESS: u8 = 52;
pub const USERAUTH_BANNER: u8 = 53;

// https://tools.ietf.org/html/rfc4256#section-5
pub const USERAUTH_INFO_REQUEST: u8 = 60;
pub const USERAUTH_INFO_RESPONSE: u8 = 61;

// https://tools.ietf.org/html/rfc4254#section-9
pub const GLOBAL_REQUEST: u8 = 80;
pub const REQUEST_SUCCESS: u8 = 81;
pub const REQUEST_FAILURE: u8 = 82;

pub const CHANNEL_OPEN: u8 = 90;
pub const CHANNEL_OPEN_CONFIRMATION: u8 = 91;
pub const CHANNEL_OPEN_FAILURE: u8 = 92;
pub const CHANNEL_WINDOW_ADJUST: u8 = 93;
pub const CHANNEL_DATA: u8 = 94;
pub const CHANNEL_EXTENDED_DATA: u8 = 95;
pub const CHANNEL_EOF: u8 = 96;
pub const CHANNEL_CLOSE: u8 = 97;
pub const CHANNEL_REQUEST: u8 = 98;
pub const CHANNEL_SUCCESS: u8 = 99;
pub const CHANNEL_FAILURE: u8 = 100;

pub const SSH_OPEN_ADMINISTRATIVELY_PROHIBITED: u32 = 1;
pub const SSH_OPEN_CONNECT_FAILED: u32 = 2;
pub const SSH_OPEN_UNKNOWN_CHANNEL_TYPE: u32 = 3;

macro_rules! message_kinds {
    ($($variant:ident = $num:ident, $name:literal;)*) => {
        /// A message type, by its RFC 4250 name.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum MessageKind {
            $($variant,)*
        }

        impl MessageKind {
            pub const ALL: &'static [MessageKind] = &[$(MessageKind::$variant,)*];

            /// The `SSH_MSG_*` name of this kind.
            pub fn name(&self) -> &'static str {
                match self {
                    $(MessageKind::$variant => $name,)*
                }
            }

            pub fn number(&self) -> u8 {
                match self {
                    $(MessageKind::$variant => $num,)*
                }
            }

            pub fn from_u8(n: u8) -> Option<MessageKind> {
                match n {
                    $($num => Some(MessageKind::$variant),)*
                    _ => None,
                }
            }

            pub fn from_name(name: &str) -> Option<MessageKind> {
                match name {
                    $($name => Some(MessageKind::$variant),)*
                    _ => None,
                }
            }
        }
    };
}

message_kinds! {
    Disconnect = DISCONNECT, "SSH_MSG_DISCONNECT";
    Ignore = IGNORE, "SSH_MSG_IGNORE";
    Unimplemented = UNIMPLEMENTED, "SSH_MSG_UNIMPLEMENTED";
    Debug = DEBUG, "SSH_MSG_DEBUG";
    ServiceRequest = SERVICE_REQUEST, "SSH_MSG_SERVICE_REQUEST";
    ServiceAccept = SERVICE_ACCEPT, "SSH_MSG_SERVICE_ACCEPT";
    ExtInfo = EXT_INFO, "SSH_MSG_EXT_INFO";
    KexInit = KEXINIT, "SSH_MSG_KEXINIT";
    NewKeys = NEWKEYS, "SSH_MSG_NEWKEYS";
    KexEcdhInit = KEX_ECDH_INIT, "SSH_MSG_KEX_ECDH_INIT";
    KexEcdhReply = KEX_ECDH_REPLY, "SSH_MSG_KEX_ECDH_REPLY";
    UserAuthRequest = USERAUTH_REQUEST, "SSH_MSG_USERAUTH_REQUEST";
    UserAuthFailure = USERAUTH_FAILURE, "SSH_MSG_USERAUTH_FAILURE";
    UserAuthSuccess = USERAUTH_SUCCESS, "SSH_MSG_USERAUTH_SUCCESS";
    UserAuthBanner = USERAUTH_BANNER, "SSH_MSG_USERAUTH_BANNER";
    UserAuthInfoRequest = USERAUTH_INFO_REQUEST, "SSH_MSG_USERAUTH_INFO_REQUEST";
    UserAuthInfoResponse = USERAUTH_INFO_RESPONSE, "SSH_MSG_USERAUTH_INFO_RESPONSE";
    GlobalRequest = GLOBAL_REQUEST, "SSH_MSG_GLOBAL_REQUEST";
    RequestSuccess = REQUEST_SUCCESS, "SSH_MSG_REQUEST_SUCCESS";
    RequestFailure = REQUEST_FAILURE, "SSH_MSG_REQUEST_FAILURE";
    ChannelOpen = CHANNEL_OPEN, "SSH_MSG_CHANNEL_OPEN";
    ChannelOpenConfirmation = CHANNEL_OPEN_CONFIRMATION, "SSH_MSG_CHANNEL_OPEN_CONFIRMATION";
    ChannelOpenFailure = CHANNEL_OPEN_FAILURE, "SSH_MSG_CHANNEL_OPEN_FAILURE";
    ChannelWindowAdjust = CHANNEL_WINDOW_ADJUST, "SSH_MSG_CHANNEL_WINDOW_ADJUST";
    ChannelData = CHANNEL_DATA, "SSH_MSG_CHANNEL_DATA";
    ChannelExtendedData = CHANNEL_EXTENDED_DATA, "SSH_MSG_CHANNEL_EXTENDED_DATA";
    ChannelEof = CHANNEL_EOF, "SSH_MSG_CHANNEL_EOF";
    ChannelClose = CHANNEL_CLOSE, "SSH_MSG_CHANNEL_CLOSE";
    ChannelRequest = CHANNEL_REQUEST, "SSH_MSG_CHANNEL_REQUEST";
    ChannelSuccess = CHANNEL_SUCCESS, "SSH_MSG_CHANNEL_SUCCESS";
    ChannelFailure = CHANNEL_FAILURE, "SSH_MSG_CHANNEL_FAILURE";
}

impl MessageKind {
    /// Transport-layer messages (RFC 4253), handled by the event loop
    /// itself and never subject to registration.
    pub fn is_transport(&self) -> bool {
        self.number() < USERAUTH_REQUEST
    }

    pub fn is_userauth(&self) -> bool {
        (USERAUTH_REQUEST..GLOBAL_REQUEST).contains(&self.number())
    }

    pub fn is_connection(&self) -> bool {
        self.number() >= GLOBAL_REQUEST
    }

    /// Messages that may legitimately arrive while a key exchange is in
    /// progress.
    pub(crate) fn allowed_during_kex(&self) -> bool {
        matches!(
            self,
            MessageKind::Disconnect
                | MessageKind::Ignore
                | MessageKind::Debug
                | MessageKind::Unimplemented
                | MessageKind::KexInit
                | MessageKind::KexEcdhReply
                | MessageKind::NewKeys
        )
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// The authentication messages a client listens to while authenticating.
pub const USERAUTH_KINDS: &[MessageKind] = &[
    MessageKind::UserAuthFailure,
    MessageKind::UserAuthSuccess,
    MessageKind::UserAuthBanner,
    MessageKind::UserAuthInfoRequest,
];

/// The connection-protocol messages a client handles once authenticated.
pub const CONNECTION_KINDS: &[MessageKind] = &[
    MessageKind::GlobalRequest,
    MessageKind::RequestSuccess,
    MessageKind::RequestFailure,
    MessageKind::ChannelOpen,
    MessageKind::ChannelOpenConfirmation,
    MessageKind::ChannelOpenFailure,
    MessageKind::ChannelWindowAdjust,
    MessageKind::ChannelData,
    MessageKind::ChannelExtendedData,
    MessageKind::ChannelEof,
    MessageKind::ChannelClose,
    MessageKind::ChannelRequest,
    MessageKind::ChannelSuccess,
    MessageKind::ChannelFailure,
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_and_numbers_agree() {
        for kind in MessageKind::ALL {
            assert_eq!(MessageKind::from_u8(kind.number()), Some(*kind));
            assert_eq!(MessageKind::from_name(kind.name()), Some(*kind));
        }
        assert_eq!(MessageKind::from_u8(200), None);
        assert_eq!(
            MessageKind::UserAuthBanner.name(),
            "SSH_MSG_USERAUTH_BANNER"
        );
    }

    #[test]
    fn layers() {
        assert!(MessageKind::KexInit.is_transport());
        assert!(MessageKind::UserAuthSuccess.is_userauth());
        assert!(MessageKind::ChannelData.is_connection());
        assert!(!MessageKind::ChannelData.is_userauth());
    }
}
