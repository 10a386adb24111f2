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
use std::borrow::Cow;

use log::debug;
use rand::RngCore;
use ssh_encoding::{Decode, Encode};
use ssh_key::{Algorithm, EcdsaCurve, HashAlg};

use crate::cipher::CIPHERS;
use crate::helpers::NameList;
use crate::{cipher, compression, kex, mac, msg, AlgorithmKind, Error};

/// The algorithms agreed on by a key exchange.
#[derive(Debug, Clone)]
pub struct Names {
    pub kex: kex::Name,
    pub key: Algorithm,
    pub cipher: cipher::Name,
    pub client_mac: mac::Name,
    pub server_mac: mac::Name,
    pub server_compression: compression::Compression,
    pub client_compression: compression::Compression,
    pub ignore_guessed: bool,
    pub strict_kex: bool,
}

/// Lists of preferred algorithms. This is normally hard-coded into implementations.
#[derive(Debug, Clone, PartialEq)]
pub struct Preferred {
    /// Preferred key exchange algorithms.
    pub kex: Cow<'static, [kex::Name]>,
    /// Preferred host key algorithms.
    pub key: Cow<'static, [Algorithm]>,
    /// Preferred symmetric ciphers.
    pub cipher: Cow<'static, [cipher::Name]>,
    /// Preferred MAC algorithms.
    pub mac: Cow<'static, [mac::Name]>,
    /// Preferred compression algorithms.
    pub compression: Cow<'static, [compression::Name]>,
}

const SAFE_KEX_ORDER: &[kex::Name] = &[
    kex::CURVE25519,
    kex::CURVE25519_PRE_RFC_8731,
    kex::DH_G14_SHA256,
    kex::EXTENSION_OPENSSH_STRICT_KEX_AS_CLIENT,
];

const CIPHER_ORDER: &[cipher::Name] = &[cipher::AES_256_CTR, cipher::AES_128_CTR];

const HMAC_ORDER: &[mac::Name] = &[mac::HMAC_SHA512, mac::HMAC_SHA256, mac::HMAC_SHA1];

const COMPRESSION_ORDER: &[compression::Name] = &[
    compression::NONE,
    #[cfg(feature = "flate2")]
    compression::ZLIB,
    #[cfg(feature = "flate2")]
    compression::ZLIB_LEGACY,
];

const COMPRESSED_ORDER: &[compression::Name] = &[
    #[cfg(feature = "flate2")]
    compression::ZLIB_LEGACY,
    #[cfg(feature = "flate2")]
    compression::ZLIB,
    compression::NONE,
];

impl Preferred {
    pub const DEFAULT: Preferred = Preferred {
        kex: Cow::Borrowed(SAFE_KEX_ORDER),
        key: Cow::Borrowed(&[
            Algorithm::Ed25519,
            Algorithm::Ecdsa {
                curve: EcdsaCurve::NistP256,
            },
            Algorithm::Ecdsa {
                curve: EcdsaCurve::NistP384,
            },
            Algorithm::Ecdsa {
                curve: EcdsaCurve::NistP521,
            },
            Algorithm::Rsa {
                hash: Some(HashAlg::Sha512),
            },
            Algorithm::Rsa {
                hash: Some(HashAlg::Sha256),
            },
        ]),
        cipher: Cow::Borrowed(CIPHER_ORDER),
        mac: Cow::Borrowed(HMAC_ORDER),
        compression: Cow::Borrowed(COMPRESSION_ORDER),
    };

    /// Same as [`Preferred::DEFAULT`], but preferring compression.
    pub const COMPRESSED: Preferred = Preferred {
        kex: Cow::Borrowed(SAFE_KEX_ORDER),
        key: Preferred::DEFAULT.key,
        cipher: Cow::Borrowed(CIPHER_ORDER),
        mac: Cow::Borrowed(HMAC_ORDER),
        compression: Cow::Borrowed(COMPRESSED_ORDER),
    };
}

impl Default for Preferred {
    fn default() -> Preferred {
        Preferred::DEFAULT
    }
}

pub(crate) fn parse_kex_algo_list(list: &str) -> Vec<&str> {
    list.split(',').collect()
}

/// The client's first choice that the server also supports. The boolean
/// tells whether both sides put that algorithm first.
pub(crate) fn select<S: AsRef<str> + Clone>(
    client_list: &[S],
    server_list: &[&str],
    kind: AlgorithmKind,
) -> Result<(bool, S), Error> {
    let mut both_first_choice = true;
    for c in client_list {
        for s in server_list {
            if s == &c.as_ref() {
                return Ok((both_first_choice, c.clone()));
            }
            both_first_choice = false
        }
    }
    Err(Error::NoCommonAlgo {
        kind,
        ours: client_list.iter().map(|x| x.as_ref().to_owned()).collect(),
        theirs: server_list.iter().map(|x| (*x).to_owned()).collect(),
    })
}

/// Read the server's KEXINIT and pick the algorithms for this exchange.
pub(crate) fn read_kex(buffer: &[u8], pref: &Preferred) -> Result<Names, Error> {
    // message number and cookie
    let Some(mut r) = buffer.get(17..) else {
        return Err(Error::Inconsistent);
    };

    // Key exchange

    let kex_string = String::decode(&mut r)?;
    let usable_kex: Vec<kex::Name> = pref
        .kex
        .iter()
        .filter(|k| !k.is_extension())
        .cloned()
        .collect();
    let (kex_both_first, kex_algorithm) = select(
        &usable_kex,
        &parse_kex_algo_list(&kex_string),
        AlgorithmKind::Kex,
    )?;

    // Strict kex detection

    let strict_kex_requested = pref
        .kex
        .contains(&kex::EXTENSION_OPENSSH_STRICT_KEX_AS_CLIENT);
    let strict_kex_provided = parse_kex_algo_list(&kex_string)
        .contains(&kex::EXTENSION_OPENSSH_STRICT_KEX_AS_SERVER.as_ref());
    if strict_kex_requested && strict_kex_provided {
        debug!("strict kex enabled")
    }

    // Host key

    let key_string = String::decode(&mut r)?;
    let (key_both_first, key_algorithm) = select(
        &pref.key,
        &parse_kex_algo_list(&key_string),
        AlgorithmKind::Key,
    )?;

    // Cipher

    let cipher_string = String::decode(&mut r)?;
    let (_cipher_both_first, cipher) = select(
        &pref.cipher,
        &parse_kex_algo_list(&cipher_string),
        AlgorithmKind::Cipher,
    )?;
    String::decode(&mut r)?; // cipher server-to-client.

    // MAC

    let need_mac = CIPHERS.get(&cipher).map(|x| x.needs_mac()).unwrap_or(false);

    let select_mac = |r: &mut &[u8]| -> Result<mac::Name, Error> {
        match select(
            &pref.mac,
            &parse_kex_algo_list(&String::decode(r)?),
            AlgorithmKind::Mac,
        ) {
            Ok((_, m)) => Ok(m),
            Err(e) => {
                if need_mac {
                    Err(e)
                } else {
                    Ok(mac::NONE)
                }
            }
        }
    };
    let client_mac = select_mac(&mut r)?;
    let server_mac = select_mac(&mut r)?;

    // Compression

    // client-to-server compression.
    let client_compression = compression::Compression::new(
        &select(
            &pref.compression,
            &parse_kex_algo_list(&String::decode(&mut r)?),
            AlgorithmKind::Compression,
        )?
        .1,
    );

    // server-to-client compression.
    let server_compression = compression::Compression::new(
        &select(
            &pref.compression,
            &parse_kex_algo_list(&String::decode(&mut r)?),
            AlgorithmKind::Compression,
        )?
        .1,
    );
    debug!("client_compression = {:?}", client_compression);
    String::decode(&mut r)?; // languages client-to-server
    String::decode(&mut r)?; // languages server-to-client

    let follows = u8::decode(&mut r)? != 0;
    Ok(Names {
        kex: kex_algorithm,
        key: key_algorithm,
        cipher,
        client_mac,
        server_mac,
        client_compression,
        server_compression,
        // Ignore the next packet if (1) it follows and (2) it's not the correct guess.
        ignore_guessed: follows && !(kex_both_first && key_both_first),
        strict_kex: strict_kex_requested && strict_kex_provided,
    })
}

/// Append our KEXINIT payload to `buf`.
pub(crate) fn write_kex(prefs: &Preferred, buf: &mut Vec<u8>) -> Result<(), Error> {
    buf.push(msg::KEXINIT);

    let mut cookie = [0; 16];
    rand::thread_rng().fill_bytes(&mut cookie);

    buf.extend(&cookie); // cookie
    NameList(prefs.kex.iter().map(|x| x.as_ref().to_owned()).collect()).encode(buf)?; // kex algo

    NameList(prefs.key.iter().map(|x| x.as_str().to_owned()).collect()).encode(buf)?;

    let ciphers = NameList(
        prefs
            .cipher
            .iter()
            .map(|x| x.as_ref().to_string())
            .collect(),
    );
    // cipher client to server, then server to client
    ciphers.encode(buf)?;
    ciphers.encode(buf)?;

    let macs = NameList(prefs.mac.iter().map(|x| x.as_ref().to_string()).collect());
    macs.encode(buf)?;
    macs.encode(buf)?;

    let compression = NameList(
        prefs
            .compression
            .iter()
            .map(|x| x.as_ref().to_string())
            .collect(),
    );
    compression.encode(buf)?;
    compression.encode(buf)?;

    NameList(Vec::new()).encode(buf)?; // languages client to server
    NameList(Vec::new()).encode(buf)?; // languages server to client

    buf.push(0); // doesn't follow
    buf.extend(&[0, 0, 0, 0]); // reserved
    Ok(())
}
