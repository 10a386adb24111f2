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
use std::sync::Arc;

use log::{debug, error};
use ssh_encoding::{Decode, Encode};
use ssh_key::PublicKey;

use super::SessionEvent;
use crate::kex::{KexAlgorithm, KEXES};
use crate::keys::{self, HostKeyVerifier};
use crate::negotiation::{self, Names};
use crate::observer::Observers;
use crate::session::{Exchange, KexCause, NewKeys};
use crate::sshbuffer::PacketWriter;
use crate::{msg, Error, Preferred, SshId};

/// What every key exchange of a session needs to know.
pub(crate) struct KexConfig {
    pub preferred: Preferred,
    pub client_id: SshId,
    pub server_id: String,
    pub host: String,
    pub port: u16,
    pub verifier: Arc<dyn HostKeyVerifier>,
}

#[allow(clippy::large_enum_variant)]
enum ClientKexState {
    Created,
    WaitingForDhReply {
        names: Names,
        kex: Box<dyn KexAlgorithm + Send>,
    },
    WaitingForNewKeys(NewKeys),
}

pub(crate) enum KexProgress {
    NeedsReply(ClientKex),
    Done {
        newkeys: NewKeys,
        /// Strict key exchange restarts the read sequence numbers.
        reset_seqn: bool,
    },
}

/// One key exchange, from our KEXINIT to the server's NEWKEYS.
pub(crate) struct ClientKex {
    exchange: Exchange,
    cause: KexCause,
    session_id: Option<Vec<u8>>,
    state: ClientKexState,
    config: Arc<KexConfig>,
}

impl Debug for ClientKex {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let mut s = f.debug_struct("ClientKex");
        s.field("cause", &self.cause);
        match self.state {
            ClientKexState::Created => s.field("state", &"created"),
            ClientKexState::WaitingForDhReply { .. } => {
                s.field("state", &"waiting for DH response")
            }
            ClientKexState::WaitingForNewKeys(_) => s.field("state", &"waiting for NEWKEYS"),
        };
        s.finish()
    }
}

fn unexpected(payload: &[u8]) -> Error {
    error!(
        "Unexpected kex message at this stage: {:?}",
        payload.first()
    );
    Error::KexInit
}

impl ClientKex {
    pub fn new(config: Arc<KexConfig>, cause: KexCause, session_id: Option<Vec<u8>>) -> Self {
        let exchange = Exchange::new(
            config.client_id.as_kex_hash_bytes(),
            config.server_id.as_bytes(),
        );
        ClientKex {
            exchange,
            cause,
            session_id,
            state: ClientKexState::Created,
            config,
        }
    }

    pub fn cause(&self) -> KexCause {
        self.cause
    }

    /// Write our KEXINIT.
    pub fn kexinit(&mut self, output: &mut PacketWriter) -> Result<(), Error> {
        let mut payload = Vec::new();
        negotiation::write_kex(&self.config.preferred, &mut payload)?;
        output.packet(&payload)?;
        self.exchange.client_kex_init = payload;
        Ok(())
    }

    /// During a rekey, until the server's KEXINIT arrives, the connection
    /// keeps carrying other messages.
    pub fn accepts_other_messages(&self) -> bool {
        self.cause.is_rekey() && matches!(self.state, ClientKexState::Created)
    }

    /// Whether strict key exchange forbids any message but the kex ones.
    /// Only known once the server's KEXINIT is read.
    pub fn is_strict_initial(&self) -> bool {
        match &self.state {
            ClientKexState::Created => false,
            ClientKexState::WaitingForDhReply { names, .. } => {
                names.strict_kex && !self.cause.is_rekey()
            }
            ClientKexState::WaitingForNewKeys(newkeys) => {
                newkeys.names.strict_kex && !self.cause.is_rekey()
            }
        }
    }

    fn strict(&self, names: &Names) -> bool {
        names.strict_kex || matches!(self.cause, KexCause::Rekey { strict: true })
    }

    /// Feed one packet of the exchange. `seqn` is that packet's sequence
    /// number.
    pub fn step(
        mut self,
        payload: &[u8],
        seqn: u32,
        output: &mut PacketWriter,
        events: &Observers<SessionEvent>,
    ) -> Result<KexProgress, Error> {
        match std::mem::replace(&mut self.state, ClientKexState::Created) {
            ClientKexState::Created => {
                if payload.first() != Some(&msg::KEXINIT) {
                    return Err(unexpected(payload));
                }
                self.exchange.server_kex_init.clear();
                self.exchange.server_kex_init.extend_from_slice(payload);
                let names = negotiation::read_kex(payload, &self.config.preferred)?;
                debug!("negotiated algorithms: {names:?}");

                if names.strict_kex && !self.cause.is_rekey() && seqn != 0 {
                    error!("strict kex: KEXINIT was not the first packet (seqn {seqn})");
                    return Err(Error::KexInit);
                }

                let mut kex = KEXES.get(&names.kex).ok_or(Error::UnknownAlgo)?.make();

                if kex.skip_exchange() {
                    let newkeys = self.new_keys(kex.as_ref(), names, Vec::new(), output)?;
                    self.state = ClientKexState::WaitingForNewKeys(newkeys);
                    return Ok(KexProgress::NeedsReply(self));
                }

                let mut init = Vec::new();
                kex.client_dh(&mut self.exchange.client_ephemeral, &mut init)?;
                output.packet(&init)?;
                self.state = ClientKexState::WaitingForDhReply { names, kex };
                Ok(KexProgress::NeedsReply(self))
            }
            ClientKexState::WaitingForDhReply { mut names, mut kex } => {
                if names.ignore_guessed {
                    debug!("ignoring guessed kex");
                    names.ignore_guessed = false;
                    self.state = ClientKexState::WaitingForDhReply { names, kex };
                    return Ok(KexProgress::NeedsReply(self));
                }
                let Some((&msg::KEX_ECDH_REPLY, mut r)) = payload.split_first() else {
                    return Err(unexpected(payload));
                };

                let host_key_blob = Vec::<u8>::decode(&mut r)?;
                let host_key = keys::parse_public_key(&host_key_blob)?;
                debug!("received server host key: {:?}", host_key.algorithm());

                let server_ephemeral = Vec::<u8>::decode(&mut r)?;
                self.exchange.server_ephemeral = server_ephemeral;
                kex.compute_shared_secret(&self.exchange.server_ephemeral)?;
                let hash = kex.compute_exchange_hash(&host_key_blob, &self.exchange)?;

                let signature = Vec::<u8>::decode(&mut r)?;
                keys::verify_signature(&host_key, &hash, &signature)?;

                // Only a key that proved possession reaches the verifier.
                self.check_host_key(&host_key, events)?;

                let newkeys = self.new_keys(kex.as_ref(), names, hash, output)?;
                self.state = ClientKexState::WaitingForNewKeys(newkeys);
                Ok(KexProgress::NeedsReply(self))
            }
            ClientKexState::WaitingForNewKeys(newkeys) => {
                if payload.first() != Some(&msg::NEWKEYS) {
                    error!("expected NEWKEYS, got {:?}", payload.first());
                    return Err(Error::Kex);
                }
                let reset_seqn = self.strict(&newkeys.names);
                Ok(KexProgress::Done {
                    newkeys,
                    reset_seqn,
                })
            }
        }
    }

    fn check_host_key(
        &self,
        key: &PublicKey,
        events: &Observers<SessionEvent>,
    ) -> Result<(), Error> {
        let config = &self.config;
        events.notify(&SessionEvent::HostKeyReceived {
            host: config.host.clone(),
            port: config.port,
            key: key.clone(),
        });
        if !config.verifier.verify(&config.host, config.port, key)? {
            debug!("host key rejected for {}:{}", config.host, config.port);
            return Err(Error::UnknownKey);
        }
        Ok(())
    }

    /// Derive the keys, send NEWKEYS and start sealing with the new key.
    fn new_keys(
        &self,
        kex: &(dyn KexAlgorithm + Send),
        names: Names,
        hash: Vec<u8>,
        output: &mut PacketWriter,
    ) -> Result<NewKeys, Error> {
        let session_id = self.session_id.clone().unwrap_or_else(|| hash.clone());
        let pair = kex.compute_keys(
            &session_id,
            &hash,
            names.cipher,
            names.server_mac,
            names.client_mac,
            false,
        )?;

        let mut newkeys = Vec::new();
        msg::NEWKEYS.encode(&mut newkeys)?;
        output.packet(&newkeys)?;
        output.cipher = pair.local_to_remote;
        if self.strict(&names) {
            output.buffer.seqn.0 = 0;
        }
        Ok(NewKeys {
            names,
            session_id,
            remote_to_local: pair.remote_to_local,
        })
    }
}
