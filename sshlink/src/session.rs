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

use std::fmt::{Debug, Formatter};

use crate::cipher::OpeningKey;
use crate::compression::Compression;
use crate::negotiation::Names;

/// Everything hashed into the exchange hash, besides the host key and
/// the shared secret.
#[derive(Debug, Clone, Default)]
pub(crate) struct Exchange {
    pub client_id: Vec<u8>,
    pub server_id: Vec<u8>,
    pub client_kex_init: Vec<u8>,
    pub server_kex_init: Vec<u8>,
    pub client_ephemeral: Vec<u8>,
    pub server_ephemeral: Vec<u8>,
}

impl Exchange {
    pub fn new(client_id: &[u8], server_id: &[u8]) -> Self {
        Exchange {
            client_id: client_id.to_vec(),
            server_id: server_id.to_vec(),
            ..Default::default()
        }
    }
}

/// The result of a completed key exchange. The sealing key is installed
/// as soon as our NEWKEYS is sent, so only the opening half is left here,
/// waiting for the server's NEWKEYS.
pub(crate) struct NewKeys {
    pub names: Names,
    pub session_id: Vec<u8>,
    pub remote_to_local: Box<dyn OpeningKey + Send>,
}

impl Debug for NewKeys {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NewKeys")
            .field("names", &self.names)
            .field("remote_to_local", &"[hidden]")
            .finish()
    }
}

impl NewKeys {
    pub fn server_compression(&self) -> &Compression {
        &self.names.server_compression
    }
}

/// Why a key exchange was started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum KexCause {
    Initial,
    Rekey { strict: bool },
}

impl KexCause {
    pub fn is_rekey(&self) -> bool {
        matches!(self, KexCause::Rekey { .. })
    }
}
