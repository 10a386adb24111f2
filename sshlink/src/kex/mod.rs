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

//!
//! This module exports kex algorithm names for use with [Preferred](crate::Preferred).
mod curve25519;
mod dh;
mod none;
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::LazyLock;

use curve25519::Curve25519KexType;
use dh::{DhGroup14Sha1KexType, DhGroup14Sha256KexType};
use delegate::delegate;
use digest::Digest;
use ssh_encoding::Encode;
use zeroize::Zeroizing;

use crate::cipher::{self, CipherPair, CIPHERS};
use crate::mac::{self, MACS};
use crate::session::Exchange;
use crate::Error;

pub(crate) trait KexType {
    fn make(&self) -> Box<dyn KexAlgorithm + Send>;
}

impl Debug for dyn KexAlgorithm + Send {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "KexAlgorithm")
    }
}

pub(crate) trait KexAlgorithm {
    /// Key exchanges that derive keys without any round trip.
    fn skip_exchange(&self) -> bool;

    /// Server half of the exchange: read the client's public value from
    /// `payload` and fill `exchange.server_ephemeral`.
    #[doc(hidden)]
    fn server_dh(&mut self, exchange: &mut Exchange, payload: &[u8]) -> Result<(), Error>;

    /// Generate our ephemeral key, and append the KEX_ECDH_INIT payload to `buf`.
    fn client_dh(&mut self, client_ephemeral: &mut Vec<u8>, buf: &mut Vec<u8>)
        -> Result<(), Error>;

    fn compute_shared_secret(&mut self, remote_pubkey: &[u8]) -> Result<(), Error>;

    /// `key` is the server host key blob.
    fn compute_exchange_hash(&self, key: &[u8], exchange: &Exchange) -> Result<Vec<u8>, Error>;

    fn compute_keys(
        &self,
        session_id: &[u8],
        exchange_hash: &[u8],
        cipher: cipher::Name,
        remote_to_local_mac: mac::Name,
        local_to_remote_mac: mac::Name,
        is_server: bool,
    ) -> Result<CipherPair, Error>;
}

#[derive(Debug, PartialEq, Eq, Copy, Clone, Hash)]
pub struct Name(&'static str);
impl AsRef<str> for Name {
    fn as_ref(&self) -> &str {
        self.0
    }
}

impl Encode for Name {
    delegate! { to self.as_ref() {
        fn encoded_len(&self) -> Result<usize, ssh_encoding::Error>;
        fn encode(&self, writer: &mut impl ssh_encoding::Writer) -> Result<(), ssh_encoding::Error>;
    }}
}

impl TryFrom<&str> for Name {
    type Error = ();
    fn try_from(s: &str) -> Result<Name, ()> {
        KEXES
            .keys()
            .chain(EXTENSIONS.iter())
            .find(|x| x.0 == s)
            .map(|x| **x)
            .ok_or(())
    }
}

impl Name {
    /// Pseudo-algorithms advertised in the kex list to signal protocol
    /// extensions. They are never selected as the key exchange.
    pub fn is_extension(&self) -> bool {
        EXTENSIONS.contains(&self)
    }
}

/// `curve25519-sha256`
pub const CURVE25519: Name = Name("curve25519-sha256");
/// `curve25519-sha256@libssh.org`
pub const CURVE25519_PRE_RFC_8731: Name = Name("curve25519-sha256@libssh.org");
/// `diffie-hellman-group14-sha256`
pub const DH_G14_SHA256: Name = Name("diffie-hellman-group14-sha256");
/// `diffie-hellman-group14-sha1`
pub const DH_G14_SHA1: Name = Name("diffie-hellman-group14-sha1");
/// `none`, which derives keys without exchanging anything. Only useful
/// with the `none` cipher, for tests.
pub const NONE: Name = Name("none");
/// `kex-strict-c-v00@openssh.com`
pub const EXTENSION_OPENSSH_STRICT_KEX_AS_CLIENT: Name = Name("kex-strict-c-v00@openssh.com");
/// `kex-strict-s-v00@openssh.com`
pub const EXTENSION_OPENSSH_STRICT_KEX_AS_SERVER: Name = Name("kex-strict-s-v00@openssh.com");

const EXTENSIONS: &[&Name] = &[
    &EXTENSION_OPENSSH_STRICT_KEX_AS_CLIENT,
    &EXTENSION_OPENSSH_STRICT_KEX_AS_SERVER,
];

const _CURVE25519: Curve25519KexType = Curve25519KexType {};
const _DH_G14_SHA1: DhGroup14Sha1KexType = DhGroup14Sha1KexType {};
const _DH_G14_SHA256: DhGroup14Sha256KexType = DhGroup14Sha256KexType {};
const _NONE: none::NoneKexType = none::NoneKexType {};

pub(crate) static KEXES: LazyLock<HashMap<&'static Name, &(dyn KexType + Send + Sync)>> =
    LazyLock::new(|| {
        let mut h: HashMap<&'static Name, &(dyn KexType + Send + Sync)> = HashMap::new();
        h.insert(&CURVE25519, &_CURVE25519);
        h.insert(&CURVE25519_PRE_RFC_8731, &_CURVE25519);
        h.insert(&DH_G14_SHA256, &_DH_G14_SHA256);
        h.insert(&DH_G14_SHA1, &_DH_G14_SHA1);
        h.insert(&NONE, &_NONE);
        h
    });

/// Append `s`, a big-endian unsigned integer, as an SSH `mpint`.
pub(crate) fn encode_mpint(s: &[u8], buf: &mut Vec<u8>) -> Result<(), Error> {
    // Skip initial 0s.
    let mut i = 0;
    while i < s.len() && s.get(i) == Some(&0) {
        i += 1
    }
    #[allow(clippy::indexing_slicing)] // i <= len
    let s = &s[i..];
    // If the first non-zero is >= 128, write its length (u32, BE), followed by 0.
    if s.first().is_some_and(|b| b & 0x80 != 0) {
        ((s.len() + 1) as u32).encode(buf)?;
        buf.push(0)
    } else {
        (s.len() as u32).encode(buf)?;
    }
    buf.extend_from_slice(s);
    Ok(())
}

pub(crate) fn compute_keys<D: Digest>(
    shared_secret: Option<&[u8]>,
    session_id: &[u8],
    exchange_hash: &[u8],
    cipher: cipher::Name,
    remote_to_local_mac: mac::Name,
    local_to_remote_mac: mac::Name,
    is_server: bool,
) -> Result<CipherPair, Error> {
    let cipher = CIPHERS.get(&cipher).ok_or(Error::UnknownAlgo)?;
    let remote_to_local_mac = MACS.get(&remote_to_local_mac).ok_or(Error::UnknownAlgo)?;
    let local_to_remote_mac = MACS.get(&local_to_remote_mac).ok_or(Error::UnknownAlgo)?;

    // https://tools.ietf.org/html/rfc4253#section-7.2
    let compute_key = |c: u8, len: usize| -> Result<Zeroizing<Vec<u8>>, Error> {
        let mut buffer = Zeroizing::new(Vec::new());
        let mut key = Zeroizing::new(Vec::new());

        if let Some(shared) = shared_secret {
            encode_mpint(shared, &mut buffer)?;
        }

        buffer.extend_from_slice(exchange_hash);
        buffer.push(c);
        buffer.extend_from_slice(session_id);
        let hash = {
            let mut hasher = D::new();
            hasher.update(&buffer[..]);
            hasher.finalize()
        };
        key.extend_from_slice(hash.as_ref());

        while key.len() < len {
            // extend.
            buffer.clear();
            if let Some(shared) = shared_secret {
                encode_mpint(shared, &mut buffer)?;
            }
            buffer.extend_from_slice(exchange_hash);
            buffer.extend_from_slice(&key);
            let hash = {
                let mut hasher = D::new();
                hasher.update(&buffer[..]);
                hasher.finalize()
            };
            key.extend_from_slice(hash.as_ref());
        }

        key.truncate(len);
        Ok(key)
    };

    let (local_to_remote, remote_to_local) = if is_server {
        (b'D', b'C')
    } else {
        (b'C', b'D')
    };

    let (local_to_remote_nonce, remote_to_local_nonce) = if is_server {
        (b'B', b'A')
    } else {
        (b'A', b'B')
    };

    let (local_to_remote_mac_key, remote_to_local_mac_key) = if is_server {
        (b'F', b'E')
    } else {
        (b'E', b'F')
    };

    let key = compute_key(local_to_remote, cipher.key_len())?;
    let nonce = compute_key(local_to_remote_nonce, cipher.nonce_len())?;
    let mac = compute_key(local_to_remote_mac_key, local_to_remote_mac.key_len())?;
    let local_to_remote = cipher.make_sealing_key(&key, &nonce, &mac, *local_to_remote_mac)?;

    let key = compute_key(remote_to_local, cipher.key_len())?;
    let nonce = compute_key(remote_to_local_nonce, cipher.nonce_len())?;
    let mac = compute_key(remote_to_local_mac_key, remote_to_local_mac.key_len())?;
    let remote_to_local = cipher.make_opening_key(&key, &nonce, &mac, *remote_to_local_mac)?;

    Ok(CipherPair {
        local_to_remote,
        remote_to_local,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mpint_encoding() {
        let mut buf = Vec::new();
        encode_mpint(&[0, 0, 0x12, 0x34], &mut buf).unwrap();
        assert_eq!(buf, [0, 0, 0, 2, 0x12, 0x34]);

        let mut buf = Vec::new();
        encode_mpint(&[0x80, 1], &mut buf).unwrap();
        assert_eq!(buf, [0, 0, 0, 3, 0, 0x80, 1]);

        let mut buf = Vec::new();
        encode_mpint(&[0, 0], &mut buf).unwrap();
        assert_eq!(buf, [0, 0, 0, 0]);
    }

    #[test]
    fn extensions_are_not_key_exchanges() {
        assert!(EXTENSION_OPENSSH_STRICT_KEX_AS_CLIENT.is_extension());
        assert!(!CURVE25519.is_extension());
        assert_eq!(
            Name::try_from("kex-strict-s-v00@openssh.com"),
            Ok(EXTENSION_OPENSSH_STRICT_KEX_AS_SERVER)
        );
    }

    #[test]
    fn client_and_server_derive_matching_keys() {
        let kex = KEXES.get(&CURVE25519).unwrap();
        let mut client = kex.make();
        let mut server = kex.make();

        let mut exchange = Exchange::default();
        let mut init = Vec::new();
        client.client_dh(&mut exchange.client_ephemeral, &mut init).unwrap();
        server.server_dh(&mut exchange, &init).unwrap();
        client.compute_shared_secret(&exchange.server_ephemeral).unwrap();

        let hash_c = client.compute_exchange_hash(b"hostkey", &exchange).unwrap();
        let hash_s = server.compute_exchange_hash(b"hostkey", &exchange).unwrap();
        assert_eq!(hash_c, hash_s);

        let mut c = client
            .compute_keys(&hash_c, &hash_c, cipher::AES_256_CTR, mac::HMAC_SHA256, mac::HMAC_SHA256, false)
            .unwrap();
        let mut s = server
            .compute_keys(&hash_s, &hash_s, cipher::AES_256_CTR, mac::HMAC_SHA256, mac::HMAC_SHA256, true)
            .unwrap();

        let mut out = crate::sshbuffer::SSHBuffer::new();
        c.local_to_remote.write(b"\x05ssh-userauth", &mut out).unwrap();
        let mut buf = out.buffer.clone();
        let len = buf.len();
        let mac_len = s.remote_to_local.tag_len();
        let plain = s
            .remote_to_local
            .open(0, &mut buf[..len])
            .unwrap()
            .to_vec();
        assert_eq!(&plain[1..1 + 13], b"\x05ssh-userauth");
        assert_eq!(mac_len, 32);

        let mut out = crate::sshbuffer::SSHBuffer::new();
        s.local_to_remote.write(b"\x06", &mut out).unwrap();
        let mut buf = out.buffer.clone();
        assert!(c.remote_to_local.open(0, &mut buf).is_ok());
    }
}
