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

use curve25519_dalek::constants::ED25519_BASEPOINT_TABLE;
use curve25519_dalek::montgomery::MontgomeryPoint;
use curve25519_dalek::scalar::Scalar;
use log::debug;
use sha2::Digest;
use ssh_encoding::{Decode, Encode};

use super::{compute_keys, encode_mpint, KexAlgorithm, KexType};
use crate::cipher::{self, CipherPair};
use crate::mac;
use crate::session::Exchange;
use crate::{msg, Error};

pub struct Curve25519KexType {}

impl KexType for Curve25519KexType {
    fn make(&self) -> Box<dyn KexAlgorithm + Send> {
        Box::new(Curve25519Kex {
            local_secret: None,
            shared_secret: None,
        })
    }
}

#[doc(hidden)]
pub struct Curve25519Kex {
    local_secret: Option<Scalar>,
    shared_secret: Option<MontgomeryPoint>,
}

impl std::fmt::Debug for Curve25519Kex {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "Algorithm {{ local_secret: [hidden], shared_secret: [hidden] }}",
        )
    }
}

fn read_point(bytes: &[u8]) -> Result<MontgomeryPoint, Error> {
    let bytes: [u8; 32] = bytes.try_into().map_err(|_| Error::Kex)?;
    Ok(MontgomeryPoint(bytes))
}

impl KexAlgorithm for Curve25519Kex {
    fn skip_exchange(&self) -> bool {
        false
    }

    fn server_dh(&mut self, exchange: &mut Exchange, payload: &[u8]) -> Result<(), Error> {
        debug!("server_dh");
        let (&first, mut rest) = payload.split_first().ok_or(Error::Inconsistent)?;
        if first != msg::KEX_ECDH_INIT {
            return Err(Error::Inconsistent);
        }
        let client_pubkey = read_point(&Vec::<u8>::decode(&mut rest)?)?;

        let server_secret = Scalar::from_bytes_mod_order(rand::random::<[u8; 32]>());
        let server_pubkey = (ED25519_BASEPOINT_TABLE * &server_secret).to_montgomery();

        exchange.client_ephemeral.clear();
        exchange.client_ephemeral.extend_from_slice(&client_pubkey.0);
        exchange.server_ephemeral.clear();
        exchange.server_ephemeral.extend_from_slice(&server_pubkey.0);
        self.shared_secret = Some(server_secret * client_pubkey);
        Ok(())
    }

    fn client_dh(
        &mut self,
        client_ephemeral: &mut Vec<u8>,
        buf: &mut Vec<u8>,
    ) -> Result<(), Error> {
        let client_secret = Scalar::from_bytes_mod_order(rand::random::<[u8; 32]>());
        let client_pubkey = (ED25519_BASEPOINT_TABLE * &client_secret).to_montgomery();

        client_ephemeral.clear();
        client_ephemeral.extend_from_slice(&client_pubkey.0);

        buf.push(msg::KEX_ECDH_INIT);
        client_pubkey.0[..].encode(buf)?;

        self.local_secret = Some(client_secret);
        Ok(())
    }

    fn compute_shared_secret(&mut self, remote_pubkey: &[u8]) -> Result<(), Error> {
        let local_secret = self.local_secret.take().ok_or(Error::KexInit)?;
        let remote_pubkey = read_point(remote_pubkey)?;
        let shared = local_secret * remote_pubkey;
        // An all-zero result means the server sent a low-order point.
        if shared.0 == [0; 32] {
            return Err(Error::Kex);
        }
        self.shared_secret = Some(shared);
        Ok(())
    }

    fn compute_exchange_hash(&self, key: &[u8], exchange: &Exchange) -> Result<Vec<u8>, Error> {
        // Computing the exchange hash, see page 7 of RFC 5656.
        let mut buffer = Vec::new();
        exchange.client_id.encode(&mut buffer)?;
        exchange.server_id.encode(&mut buffer)?;
        exchange.client_kex_init.encode(&mut buffer)?;
        exchange.server_kex_init.encode(&mut buffer)?;

        key.encode(&mut buffer)?;
        exchange.client_ephemeral.encode(&mut buffer)?;
        exchange.server_ephemeral.encode(&mut buffer)?;

        if let Some(ref shared) = self.shared_secret {
            encode_mpint(&shared.0, &mut buffer)?;
        }

        let mut hasher = sha2::Sha256::new();
        hasher.update(&buffer);
        Ok(hasher.finalize().to_vec())
    }

    fn compute_keys(
        &self,
        session_id: &[u8],
        exchange_hash: &[u8],
        cipher: cipher::Name,
        remote_to_local_mac: mac::Name,
        local_to_remote_mac: mac::Name,
        is_server: bool,
    ) -> Result<CipherPair, Error> {
        compute_keys::<sha2::Sha256>(
            self.shared_secret.as_ref().map(|x| &x.0[..]),
            session_id,
            exchange_hash,
            cipher,
            remote_to_local_mac,
            local_to_remote_mac,
            is_server,
        )
    }
}
