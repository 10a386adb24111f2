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

use std::marker::PhantomData;

use aes::cipher::{IvSizeUser, KeyIvInit, KeySizeUser, StreamCipher};
use rand::RngCore;

use super::super::Error;
use super::PACKET_LENGTH_LEN;
use crate::mac::{Mac, MacAlgorithm};

const BLOCK_SIZE: usize = 16;

fn new_cipher_from_slices<C: KeyIvInit>(k: &[u8], n: &[u8]) -> Result<C, Error> {
    C::new_from_slices(k, n).map_err(|_| Error::KexInit)
}

/// A stream cipher used with SSH's 16-byte block framing, e.g. AES-CTR.
pub struct SshBlockCipher<C: StreamCipher + KeySizeUser + IvSizeUser>(pub PhantomData<C>);

impl<C: StreamCipher + KeySizeUser + IvSizeUser + KeyIvInit + Clone + Send + 'static>
    super::Cipher for SshBlockCipher<C>
{
    fn key_len(&self) -> usize {
        C::key_size()
    }

    fn nonce_len(&self) -> usize {
        C::iv_size()
    }

    fn needs_mac(&self) -> bool {
        true
    }

    fn make_opening_key(
        &self,
        k: &[u8],
        n: &[u8],
        m: &[u8],
        mac: &dyn MacAlgorithm,
    ) -> Result<Box<dyn super::OpeningKey + Send>, Error> {
        Ok(Box::new(OpeningKey {
            cipher: new_cipher_from_slices::<C>(k, n)?,
            mac: mac.make_mac(m)?,
        }))
    }

    fn make_sealing_key(
        &self,
        k: &[u8],
        n: &[u8],
        m: &[u8],
        mac: &dyn MacAlgorithm,
    ) -> Result<Box<dyn super::SealingKey + Send>, Error> {
        Ok(Box::new(SealingKey {
            cipher: new_cipher_from_slices::<C>(k, n)?,
            mac: mac.make_mac(m)?,
        }))
    }
}

pub struct OpeningKey<C: StreamCipher> {
    pub(crate) cipher: C,
    pub(crate) mac: Box<dyn Mac + Send>,
}

pub struct SealingKey<C: StreamCipher> {
    pub(crate) cipher: C,
    pub(crate) mac: Box<dyn Mac + Send>,
}

impl<C: StreamCipher + Clone> super::OpeningKey for OpeningKey<C> {
    fn packet_length_to_read_for_block_length(&self) -> usize {
        BLOCK_SIZE
    }

    fn decrypt_packet_length(
        &self,
        _sequence_number: u32,
        encrypted_packet_length: &[u8],
    ) -> [u8; 4] {
        let mut first_block = [0u8; BLOCK_SIZE];
        let n = encrypted_packet_length.len().min(BLOCK_SIZE);
        #[allow(clippy::indexing_slicing)] // n <= both lengths
        first_block[..n].copy_from_slice(&encrypted_packet_length[..n]);

        // Decrypt with a copy of the keystream position, `open` decrypts
        // the whole packet again from the same position.
        let mut cipher = self.cipher.clone();
        cipher.apply_keystream(&mut first_block);

        let mut len = [0; 4];
        #[allow(clippy::indexing_slicing)] // BLOCK_SIZE > 4
        len.copy_from_slice(&first_block[..4]);
        len
    }

    fn tag_len(&self) -> usize {
        self.mac.mac_len()
    }

    fn open<'a>(
        &mut self,
        sequence_number: u32,
        ciphertext_and_tag: &'a mut [u8],
    ) -> Result<&'a [u8], Error> {
        let ciphertext_len = ciphertext_and_tag
            .len()
            .checked_sub(self.tag_len())
            .ok_or(Error::Inconsistent)?;
        let (ciphertext_in_plaintext_out, tag) = ciphertext_and_tag.split_at_mut(ciphertext_len);
        self.cipher.apply_keystream(ciphertext_in_plaintext_out);

        if !self
            .mac
            .verify(sequence_number, ciphertext_in_plaintext_out, tag)
        {
            return Err(Error::PacketAuth);
        }

        ciphertext_in_plaintext_out
            .get(PACKET_LENGTH_LEN..)
            .ok_or(Error::Inconsistent)
    }
}

impl<C: StreamCipher> super::SealingKey for SealingKey<C> {
    fn padding_length(&self, payload: &[u8]) -> usize {
        let extra_len = PACKET_LENGTH_LEN + super::PADDING_LENGTH_LEN;

        let padding_len = if payload.len() + extra_len <= super::MINIMUM_PACKET_LEN {
            super::MINIMUM_PACKET_LEN - payload.len() - extra_len
        } else {
            BLOCK_SIZE - ((extra_len + payload.len()) % BLOCK_SIZE)
        };
        if padding_len < PACKET_LENGTH_LEN {
            padding_len + BLOCK_SIZE
        } else {
            padding_len
        }
    }

    fn fill_padding(&self, padding_out: &mut [u8]) {
        rand::thread_rng().fill_bytes(padding_out);
    }

    fn tag_len(&self) -> usize {
        self.mac.mac_len()
    }

    fn seal(
        &mut self,
        sequence_number: u32,
        plaintext_in_ciphertext_out: &mut [u8],
        tag_out: &mut [u8],
    ) {
        self.mac
            .compute(sequence_number, plaintext_in_ciphertext_out, tag_out);
        self.cipher.apply_keystream(plaintext_in_ciphertext_out);
    }
}
