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

//!
//! This module exports cipher names for use with [Preferred](crate::Preferred),
//! and implements the binary packet protocol on top of them.
use std::borrow::Borrow;
use std::collections::HashMap;
use std::convert::TryFrom;
use std::fmt::Debug;
use std::marker::PhantomData;
use std::num::Wrapping;
use std::sync::LazyLock;

use aes::{Aes128, Aes256};
use byteorder::{BigEndian, ByteOrder};
use ctr::Ctr128BE;
use delegate::delegate;
use log::trace;
use ssh_encoding::Encode;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::mac::MacAlgorithm;
use crate::sshbuffer::SSHBuffer;
use crate::Error;

pub(crate) mod block;
pub(crate) mod clear;

use block::SshBlockCipher;
use clear::Clear;

pub(crate) trait Cipher {
    fn needs_mac(&self) -> bool {
        false
    }
    fn key_len(&self) -> usize;
    fn nonce_len(&self) -> usize {
        0
    }
    fn make_opening_key(
        &self,
        key: &[u8],
        nonce: &[u8],
        mac_key: &[u8],
        mac: &dyn MacAlgorithm,
    ) -> Result<Box<dyn OpeningKey + Send>, Error>;
    fn make_sealing_key(
        &self,
        key: &[u8],
        nonce: &[u8],
        mac_key: &[u8],
        mac: &dyn MacAlgorithm,
    ) -> Result<Box<dyn SealingKey + Send>, Error>;
}

/// `clear`
pub const CLEAR: Name = Name("clear");
/// `aes128-ctr`
pub const AES_128_CTR: Name = Name("aes128-ctr");
/// `aes256-ctr`
pub const AES_256_CTR: Name = Name("aes256-ctr");
/// `none`
pub const NONE: Name = Name("none");

pub(crate) static _CLEAR: Clear = Clear {};
static _AES_128_CTR: SshBlockCipher<Ctr128BE<Aes128>> = SshBlockCipher(PhantomData);
static _AES_256_CTR: SshBlockCipher<Ctr128BE<Aes256>> = SshBlockCipher(PhantomData);

pub static ALL_CIPHERS: &[&Name] = &[&CLEAR, &NONE, &AES_128_CTR, &AES_256_CTR];

pub(crate) static CIPHERS: LazyLock<HashMap<&'static Name, &(dyn Cipher + Send + Sync)>> =
    LazyLock::new(|| {
        let mut h: HashMap<&'static Name, &(dyn Cipher + Send + Sync)> = HashMap::new();
        h.insert(&CLEAR, &_CLEAR);
        h.insert(&NONE, &_CLEAR);
        h.insert(&AES_128_CTR, &_AES_128_CTR);
        h.insert(&AES_256_CTR, &_AES_256_CTR);
        h
    });

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

impl Borrow<str> for &Name {
    fn borrow(&self) -> &str {
        self.0
    }
}

impl TryFrom<&str> for Name {
    type Error = ();
    fn try_from(s: &str) -> Result<Name, ()> {
        CIPHERS.keys().find(|x| x.0 == s).map(|x| **x).ok_or(())
    }
}

pub(crate) struct CipherPair {
    pub local_to_remote: Box<dyn SealingKey + Send>,
    pub remote_to_local: Box<dyn OpeningKey + Send>,
}

impl Debug for CipherPair {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> Result<(), std::fmt::Error> {
        f.write_str("CipherPair { [hidden] }")
    }
}

impl CipherPair {
    /// The pair in use before the first key exchange completes.
    pub(crate) fn clear() -> Self {
        CipherPair {
            local_to_remote: Box::new(clear::Key),
            remote_to_local: Box::new(clear::Key),
        }
    }
}

pub(crate) trait OpeningKey {
    fn packet_length_to_read_for_block_length(&self) -> usize {
        4
    }

    fn decrypt_packet_length(&self, seqn: u32, encrypted_packet_length: &[u8]) -> [u8; 4];

    fn tag_len(&self) -> usize;

    fn open<'a>(&mut self, seqn: u32, ciphertext_and_tag: &'a mut [u8]) -> Result<&'a [u8], Error>;
}

pub(crate) trait SealingKey {
    fn padding_length(&self, plaintext: &[u8]) -> usize;

    fn fill_padding(&self, padding_out: &mut [u8]);

    fn tag_len(&self) -> usize;

    fn seal(&mut self, seqn: u32, plaintext_in_ciphertext_out: &mut [u8], tag_out: &mut [u8]);

    fn write(&mut self, payload: &[u8], buffer: &mut SSHBuffer) -> Result<(), Error> {
        // https://tools.ietf.org/html/rfc4253#section-6
        //
        // The variables `payload`, `packet_length` and `padding_length` refer
        // to the protocol fields of the same names.
        trace!("writing, seqn = {:?}", buffer.seqn.0);

        let padding_length = self.padding_length(payload);
        let packet_length = PADDING_LENGTH_LEN + payload.len() + padding_length;
        trace!("packet_length {packet_length:?}, padding length {padding_length:?}");
        if packet_length > MAXIMUM_PACKET_LEN || padding_length > u8::MAX as usize {
            return Err(Error::PacketSize(packet_length));
        }
        let offset = buffer.buffer.len();

        (packet_length as u32).encode(&mut buffer.buffer)?;
        buffer.buffer.push(padding_length as u8);
        buffer.buffer.extend_from_slice(payload);
        let padding_start = buffer.buffer.len();
        buffer.buffer.resize(padding_start + padding_length, 0);
        #[allow(clippy::indexing_slicing)] // length checked
        self.fill_padding(&mut buffer.buffer[padding_start..]);
        let tag_len = self.tag_len();
        buffer.buffer.resize(buffer.buffer.len() + tag_len, 0);

        #[allow(clippy::indexing_slicing)] // length checked
        let (plaintext, tag) =
            buffer.buffer[offset..].split_at_mut(PACKET_LENGTH_LEN + packet_length);

        self.seal(buffer.seqn.0, plaintext, tag);

        buffer.bytes += payload.len();
        // Sequence numbers are on 32 bits and wrap.
        // https://tools.ietf.org/html/rfc4253#section-6.4
        buffer.seqn += Wrapping(1);
        Ok(())
    }
}

/// Read one packet from `stream` into `buffer`, returning the length of
/// the decrypted packet (length field, padding length and payload,
/// without the padding). The payload is at
/// `buffer.buffer[5..returned length]`.
///
/// A declared length above [`MAXIMUM_PACKET_LEN`] is rejected with
/// [`Error::PacketSize`] carrying that length, before any more of the
/// packet is read.
pub(crate) async fn read<R: AsyncRead + Unpin>(
    stream: &mut R,
    buffer: &mut SSHBuffer,
    cipher: &mut (dyn OpeningKey + Send),
) -> Result<usize, Error> {
    if buffer.len == 0 {
        let mut len = vec![0; cipher.packet_length_to_read_for_block_length()];

        read_exact(stream, &mut len).await?;
        trace!("reading, len = {len:?}");
        {
            let seqn = buffer.seqn.0;
            buffer.buffer.clear();
            buffer.buffer.extend(&len);
            trace!("reading, seqn = {seqn:?}");
            let len = cipher.decrypt_packet_length(seqn, &len);
            let len = BigEndian::read_u32(&len) as usize;

            if len > MAXIMUM_PACKET_LEN || len + PACKET_LENGTH_LEN < MINIMUM_PACKET_LEN {
                return Err(Error::PacketSize(len));
            }

            buffer.len = len + cipher.tag_len();
            trace!("reading, clear len = {:?}", buffer.len);
        }
    }

    buffer.buffer.resize(buffer.len + 4, 0);
    trace!("read_exact {:?}", buffer.len + 4);

    let l = cipher.packet_length_to_read_for_block_length();

    // A packet shorter than the first block cannot be decrypted.
    let Some(rest) = buffer.buffer.get_mut(l..) else {
        return Err(Error::PacketSize(buffer.len - cipher.tag_len()));
    };
    read_exact(stream, rest).await?;

    trace!("read_exact done");
    let seqn = buffer.seqn.0;
    let plaintext = cipher.open(seqn, &mut buffer.buffer)?;

    let padding_length = *plaintext.first().to_owned().unwrap_or(&0) as usize;
    trace!("reading, padding_length {padding_length:?}");
    let plaintext_end = plaintext
        .len()
        .checked_sub(padding_length)
        .filter(|end| *end >= PADDING_LENGTH_LEN)
        .ok_or(Error::Inconsistent)?;

    // Sequence numbers are on 32 bits and wrap.
    // https://tools.ietf.org/html/rfc4253#section-6.4
    buffer.seqn += Wrapping(1);
    buffer.len = 0;
    buffer.bytes += plaintext_end;

    // Remove the padding
    buffer.buffer.truncate(plaintext_end + 4);

    Ok(plaintext_end + 4)
}

async fn read_exact<R: AsyncRead + Unpin>(stream: &mut R, buf: &mut [u8]) -> Result<(), Error> {
    match stream.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(Error::HUP),
        Err(e) => Err(e.into()),
    }
}

pub(crate) const PACKET_LENGTH_LEN: usize = 4;

const MINIMUM_PACKET_LEN: usize = 16;
/// Largest `packet_length` accepted from the server.
pub const MAXIMUM_PACKET_LEN: usize = 256 * 1024;

const PADDING_LENGTH_LEN: usize = 1;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mac::MACS;

    fn make_pair(name: &Name, mac: &crate::mac::Name) -> CipherPair {
        let cipher = CIPHERS.get(name).unwrap();
        let mac = *MACS.get(mac).unwrap();
        let key = vec![1u8; cipher.key_len()];
        let nonce = vec![2u8; cipher.nonce_len()];
        let mac_key = vec![3u8; mac.key_len()];
        CipherPair {
            local_to_remote: cipher
                .make_sealing_key(&key, &nonce, &mac_key, mac)
                .unwrap(),
            remote_to_local: cipher
                .make_opening_key(&key, &nonce, &mac_key, mac)
                .unwrap(),
        }
    }

    async fn send_and_read(pair: &mut CipherPair, payloads: &[&[u8]]) {
        let mut out = SSHBuffer::new();
        for p in payloads {
            pair.local_to_remote.write(p, &mut out).unwrap();
        }
        let mut wire = &out.buffer[..];
        let mut input = SSHBuffer::new();
        for p in payloads {
            let n = read(&mut wire, &mut input, &mut *pair.remote_to_local)
                .await
                .unwrap();
            assert_eq!(&input.buffer[5..n], *p);
        }
        assert!(wire.is_empty());
        assert_eq!(input.seqn.0, payloads.len() as u32);
    }

    #[tokio::test]
    async fn aes_ctr_hmac_packets() {
        let mut pair = make_pair(&AES_256_CTR, &crate::mac::HMAC_SHA256);
        send_and_read(&mut pair, &[b"\x05ssh-userauth", &[94; 3000], b"\x02"]).await;
        let mut pair = make_pair(&AES_128_CTR, &crate::mac::HMAC_SHA1);
        send_and_read(&mut pair, &[b"\x15"]).await;
    }

    #[tokio::test]
    async fn clear_packets() {
        let mut pair = CipherPair::clear();
        send_and_read(&mut pair, &[b"\x14cookie", b"\x15"]).await;
    }

    #[tokio::test]
    async fn tampered_packet_fails_mac() {
        let mut pair = make_pair(&AES_128_CTR, &crate::mac::HMAC_SHA512);
        let mut out = SSHBuffer::new();
        pair.local_to_remote.write(b"\x5ehello", &mut out).unwrap();
        let n = out.buffer.len();
        out.buffer[n - 1] ^= 1;
        let mut wire = &out.buffer[..];
        let r = read(&mut wire, &mut SSHBuffer::new(), &mut *pair.remote_to_local).await;
        assert!(matches!(r, Err(Error::PacketAuth)));
    }

    #[tokio::test]
    async fn oversized_length_reports_declared_length() {
        let mut wire: &[u8] = &[0x00, 0x10, 0x00, 0x01, 0, 0, 0, 0];
        let r = read(&mut wire, &mut SSHBuffer::new(), &mut clear::Key).await;
        match r {
            Err(Error::PacketSize(n)) => assert_eq!(n, 0x0010_0001),
            r => panic!("unexpected {r:?}"),
        }
    }
}
