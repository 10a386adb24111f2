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
use std::convert::TryFrom;

use delegate::delegate;
use ssh_encoding::Encode;

use crate::Error;

#[derive(Debug, Clone)]
pub enum Compression {
    None,
    #[cfg(feature = "flate2")]
    Zlib {
        /// `zlib@openssh.com`: only active once the user is authenticated.
        delayed: bool,
    },
}

#[derive(Debug)]
pub enum Compress {
    None,
    #[cfg(feature = "flate2")]
    Zlib(flate2::Compress),
}

#[derive(Debug)]
pub enum Decompress {
    None,
    #[cfg(feature = "flate2")]
    Zlib(flate2::Decompress),
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
        ALL_COMPRESSION_ALGORITHMS
            .iter()
            .find(|x| x.0 == s)
            .map(|x| **x)
            .ok_or(())
    }
}

/// `none`
pub const NONE: Name = Name("none");
/// `zlib`
#[cfg(feature = "flate2")]
pub const ZLIB: Name = Name("zlib");
/// `zlib@openssh.com`
#[cfg(feature = "flate2")]
pub const ZLIB_LEGACY: Name = Name("zlib@openssh.com");

pub const ALL_COMPRESSION_ALGORITHMS: &[&Name] = &[
    &NONE,
    #[cfg(feature = "flate2")]
    &ZLIB,
    #[cfg(feature = "flate2")]
    &ZLIB_LEGACY,
];

impl Compression {
    pub fn new(name: &Name) -> Self {
        match name.0 {
            #[cfg(feature = "flate2")]
            "zlib" => Compression::Zlib { delayed: false },
            #[cfg(feature = "flate2")]
            "zlib@openssh.com" => Compression::Zlib { delayed: true },
            _ => Compression::None,
        }
    }

    /// Whether this compression should be running, given the
    /// authentication state.
    pub fn active(&self, authenticated: bool) -> bool {
        match self {
            Compression::None => false,
            #[cfg(feature = "flate2")]
            Compression::Zlib { delayed } => authenticated || !delayed,
        }
    }

    pub fn init_compress(&self, authenticated: bool) -> Compress {
        match self {
            #[cfg(feature = "flate2")]
            Compression::Zlib { .. } if self.active(authenticated) => {
                Compress::Zlib(flate2::Compress::new(flate2::Compression::fast(), true))
            }
            _ => Compress::None,
        }
    }

    pub fn init_decompress(&self, authenticated: bool) -> Decompress {
        match self {
            #[cfg(feature = "flate2")]
            Compression::Zlib { .. } if self.active(authenticated) => {
                Decompress::Zlib(flate2::Decompress::new(true))
            }
            _ => Decompress::None,
        }
    }
}

impl Compress {
    pub fn is_active(&self) -> bool {
        !matches!(self, Compress::None)
    }

    pub fn compress<'a>(
        &mut self,
        input: &'a [u8],
        output: &'a mut Vec<u8>,
    ) -> Result<&'a [u8], Error> {
        match *self {
            Compress::None => Ok(input),
            #[cfg(feature = "flate2")]
            Compress::Zlib(ref mut z) => {
                output.clear();
                let n_in = z.total_in() as usize;
                let n_out = z.total_out() as usize;
                output.resize(input.len() + 64, 0);
                loop {
                    let consumed = z.total_in() as usize - n_in;
                    let produced = z.total_out() as usize - n_out;
                    #[allow(clippy::indexing_slicing)] // bounded by the lengths above
                    z.compress(
                        &input[consumed..],
                        &mut output[produced..],
                        flate2::FlushCompress::Partial,
                    )?;
                    let consumed = z.total_in() as usize - n_in;
                    let produced = z.total_out() as usize - n_out;
                    // Done once all the input is in and the flush fit.
                    if consumed == input.len() && produced < output.len() {
                        output.truncate(produced);
                        return Ok(&output[..]);
                    }
                    let len = output.len();
                    output.resize(len * 2, 0);
                }
            }
        }
    }
}

impl Decompress {
    pub fn decompress<'a>(
        &mut self,
        input: &'a [u8],
        output: &'a mut Vec<u8>,
    ) -> Result<&'a [u8], Error> {
        match *self {
            Decompress::None => Ok(input),
            #[cfg(feature = "flate2")]
            Decompress::Zlib(ref mut z) => {
                output.clear();
                let n_in = z.total_in() as usize;
                let n_out = z.total_out() as usize;
                output.resize(input.len().max(64) * 4, 0);
                loop {
                    let consumed = z.total_in() as usize - n_in;
                    let produced = z.total_out() as usize - n_out;
                    #[allow(clippy::indexing_slicing)] // bounded by the lengths above
                    z.decompress(
                        &input[consumed..],
                        &mut output[produced..],
                        flate2::FlushDecompress::Sync,
                    )?;
                    let consumed = z.total_in() as usize - n_in;
                    let produced = z.total_out() as usize - n_out;
                    if consumed == input.len() && produced < output.len() {
                        output.truncate(produced);
                        return Ok(&output[..]);
                    }
                    if produced > crate::cipher::MAXIMUM_PACKET_LEN {
                        return Err(Error::PacketSize(produced));
                    }
                    let len = output.len();
                    output.resize(len * 2, 0);
                }
            }
        }
    }
}

#[cfg(all(test, feature = "flate2"))]
mod tests {
    use super::*;

    #[test]
    fn zlib_stream_across_packets() {
        let c = Compression::new(&ZLIB);
        let mut comp = c.init_compress(false);
        let mut decomp = c.init_decompress(false);
        let mut wire = Vec::new();
        let mut plain = Vec::new();
        for packet in [&b"\x5eaaaaaaaaaaaaaaaaaaaaaaaaaaaa"[..], &[7u8; 70000], b"\x02"] {
            let compressed = comp.compress(packet, &mut wire).unwrap().to_vec();
            let restored = decomp.decompress(&compressed, &mut plain).unwrap();
            assert_eq!(restored, packet);
        }
    }

    #[test]
    fn delayed_compression_waits_for_auth() {
        let c = Compression::new(&ZLIB_LEGACY);
        assert!(!c.init_compress(false).is_active());
        assert!(c.init_compress(true).is_active());
        assert!(!Compression::new(&NONE).active(true));
    }
}
