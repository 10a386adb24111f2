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


//! Finite-field Diffie-Hellman over the 2048-bit MODP group of RFC 3526,
//! for servers that cannot do curve25519.

use std::marker::PhantomData;

use digest::Digest;
use hex_literal::hex;
use log::debug;
use num_bigint::{BigUint, RandBigInt};
use sha1::Sha1;
use sha2::Sha256;
use ssh_encoding::{Decode, Encode};

use super::{compute_keys, encode_mpint, KexAlgorithm, KexType};
use crate::cipher::{self, CipherPair};
use crate::mac;
use crate::session::Exchange;
use crate::{msg, Error};

const GROUP14_PRIME: [u8; 256] = hex!(
    "
    FFFFFFFF FFFFFFFF C90FDAA2 2168C234 C4C6628B 80DC1CD1
    29024E08 8A67CC74 020BBEA6 3B139B22 514A0879 8E3404DD
    EF9519B3 CD3A431B 302B0A6D F25F1437 4FE1356D 6D51C245
    E485B576 625E7EC6 F44C42E9 A637ED6B 0BFF5CB6 F406B7ED
    EE386BFB 5A899FA5 AE9F2411 7C4B1FE6 49286651 ECE45B3D
    C2007CB8 A163BF05 98DA4836 1C55D39A 69163FA8 FD24CF5F
    83655D23 DCA3AD96 1C62F356 208552BB 9ED52907 7096966D
    670C354E 4ABC9804 F1746C08 CA18217C 32905E46 2E36CE3B
    E39E772C 180E8603 9B2783A2 EC07A28F B5C55DF0 6F4C52C9
    DE2BCBF6 95581718 3995497C EA956AE5 15D22618 98FA0510
    15728E5A 8AACAA68 FFFFFFFF FFFFFFFF
    "
);

const GROUP14_GENERATOR: u8 = 2;

pub struct DhGroup14Sha1KexType {}

impl KexType for DhGroup14Sha1KexType {
    fn make(&self) -> Box<dyn KexAlgorithm + Send> {
        Box::new(DhGroupKex::<Sha1>::group14())
    }
}

pub struct DhGroup14Sha256KexType {}

impl KexType for DhGroup14Sha256KexType {
    fn make(&self) -> Box<dyn KexAlgorithm + Send> {
        Box::new(DhGroupKex::<Sha256>::group14())
    }
}

#[doc(hidden)]
pub struct DhGroupKex<D: Digest> {
    prime: BigUint,
    generator: BigUint,
    private_key: Option<BigUint>,
    /// Big-endian, as it goes into an `mpint`.
    shared_secret: Option<Vec<u8>>,
    _digest: PhantomData<D>,
}

impl<D: Digest> DhGroupKex<D> {
    fn group14() -> Self {
        DhGroupKex {
            prime: BigUint::from_bytes_be(&GROUP14_PRIME),
            generator: BigUint::from(GROUP14_GENERATOR),
            private_key: None,
            shared_secret: None,
            _digest: PhantomData,
        }
    }

    /// Pick a private exponent in `[2, (p-1)/2)` and return `g^x mod p`.
    fn generate(&mut self) -> BigUint {
        let q = (&self.prime - BigUint::from(1u8)) / BigUint::from(2u8);
        let private_key = rand::thread_rng().gen_biguint_range(&BigUint::from(2u8), &q);
        let public_key = self.generator.modpow(&private_key, &self.prime);
        self.private_key = Some(private_key);
        public_key
    }

    /// Public values and shared secrets must lie in `(1, p-1)`.
    fn in_range(&self, x: &BigUint) -> bool {
        let one = BigUint::from(1u8);
        x > &one && x < &(&self.prime - &one)
    }

    fn agree(&mut self, remote_pubkey: &[u8]) -> Result<(), Error> {
        let remote = BigUint::from_bytes_be(remote_pubkey);
        if !self.in_range(&remote) {
            debug!("DH public value out of range");
            return Err(Error::Kex);
        }
        let private_key = self.private_key.take().ok_or(Error::KexInit)?;
        let shared = remote.modpow(&private_key, &self.prime);
        if !self.in_range(&shared) {
            return Err(Error::Kex);
        }
        self.shared_secret = Some(shared.to_bytes_be());
        Ok(())
    }
}

impl<D: Digest> std::fmt::Debug for DhGroupKex<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "Algorithm {{ local_secret: [hidden], shared_secret: [hidden] }}",
        )
    }
}

/// The body of an `mpint`: big-endian, with a leading zero when the top
/// bit is set.
fn biguint_to_mpint(x: &BigUint) -> Vec<u8> {
    let bytes = x.to_bytes_be();
    let mut mpint = Vec::with_capacity(bytes.len() + 1);
    if bytes.first().is_some_and(|b| *b > 0x7f) {
        mpint.push(0);
    }
    mpint.extend_from_slice(&bytes);
    mpint
}

impl<D: Digest> KexAlgorithm for DhGroupKex<D> {
    fn skip_exchange(&self) -> bool {
        false
    }

    fn server_dh(&mut self, exchange: &mut Exchange, payload: &[u8]) -> Result<(), Error> {
        debug!("server_dh");
        let (&first, mut rest) = payload.split_first().ok_or(Error::Inconsistent)?;
        if first != msg::KEX_ECDH_INIT {
            return Err(Error::Inconsistent);
        }
        let client_pubkey = Vec::<u8>::decode(&mut rest)?;

        let server_pubkey = self.generate();
        exchange.client_ephemeral.clear();
        exchange.client_ephemeral.extend_from_slice(&client_pubkey);
        exchange.server_ephemeral = biguint_to_mpint(&server_pubkey);
        self.agree(&client_pubkey)
    }

    fn client_dh(
        &mut self,
        client_ephemeral: &mut Vec<u8>,
        buf: &mut Vec<u8>,
    ) -> Result<(), Error> {
        let client_pubkey = biguint_to_mpint(&self.generate());
        client_ephemeral.clear();
        client_ephemeral.extend_from_slice(&client_pubkey);

        // KEXDH_INIT shares its number with KEX_ECDH_INIT.
        buf.push(msg::KEX_ECDH_INIT);
        client_pubkey.encode(buf)?;
        Ok(())
    }

    fn compute_shared_secret(&mut self, remote_pubkey: &[u8]) -> Result<(), Error> {
        self.agree(remote_pubkey)
    }

    fn compute_exchange_hash(&self, key: &[u8], exchange: &Exchange) -> Result<Vec<u8>, Error> {
        // RFC 4253, section 8.
        let mut buffer = Vec::new();
        exchange.client_id.encode(&mut buffer)?;
        exchange.server_id.encode(&mut buffer)?;
        exchange.client_kex_init.encode(&mut buffer)?;
        exchange.server_kex_init.encode(&mut buffer)?;

        key.encode(&mut buffer)?;
        exchange.client_ephemeral.encode(&mut buffer)?;
        exchange.server_ephemeral.encode(&mut buffer)?;

        if let Some(ref shared) = self.shared_secret {
            encode_mpint(shared, &mut buffer)?;
        }

        let mut hasher = D::new();
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
        compute_keys::<D>(
            self.shared_secret.as_deref(),
            session_id,
            exchange_hash,
            cipher,
            remote_to_local_mac,
            local_to_remote_mac,
            is_server,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn out_of_range_public_values_are_refused() {
        let mut kex = DhGroupKex::<Sha256>::group14();
        let mut ephemeral = Vec::new();
        let mut init = Vec::new();
        kex.client_dh(&mut ephemeral, &mut init).unwrap();
        assert!(matches!(kex.compute_shared_secret(&[1]), Err(Error::Kex)));

        let mut kex = DhGroupKex::<Sha256>::group14();
        kex.client_dh(&mut ephemeral, &mut init).unwrap();
        let p_minus_one = (&kex.prime - BigUint::from(1u8)).to_bytes_be();
        assert!(matches!(kex.compute_shared_secret(&p_minus_one), Err(Error::Kex)));
    }

    #[test]
    fn mpint_body_has_sign_byte() {
        assert_eq!(biguint_to_mpint(&BigUint::from(0x80u8)), [0, 0x80]);
        assert_eq!(biguint_to_mpint(&BigUint::from(0x7fu8)), [0x7f]);
    }
}
