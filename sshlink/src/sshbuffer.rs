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

use std::num::Wrapping;

use log::{debug, trace};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::cipher::SealingKey;
use crate::compression::Compress;
use crate::Error;

/// The SSH client/server identification string.
#[derive(Debug, Clone)]
pub enum SshId {
    /// When sending the id, append RFC standard `\r\n`. Example: `SshId::Standard("SSH-2.0-acme")`
    Standard(String),
    /// When sending the id, use this buffer as it is and do not append additional line terminators.
    Raw(String),
}

impl Default for SshId {
    fn default() -> Self {
        SshId::Standard(format!(
            "SSH-2.0-{}_{}",
            env!("CARGO_PKG_NAME"),
            env!("CARGO_PKG_VERSION")
        ))
    }
}

impl SshId {
    pub(crate) fn as_kex_hash_bytes(&self) -> &[u8] {
        match self {
            Self::Standard(s) => s.as_bytes(),
            Self::Raw(s) => s.trim_end_matches(['\n', '\r']).as_bytes(),
        }
    }

    pub(crate) fn write(&self, buffer: &mut Vec<u8>) {
        match self {
            Self::Standard(s) => buffer.extend(format!("{}\r\n", s).as_bytes()),
            Self::Raw(s) => buffer.extend(s.as_bytes()),
        }
    }
}

// https://tools.ietf.org/html/rfc4253#section-4.2
const MAX_ID_LINE: usize = 255;
// Lines a server may send before its identification.
const MAX_PRELUDE_LINES: usize = 64;

/// Read the server identification line, skipping the lines a server is
/// allowed to send before it. Returns the line without its terminator.
///
/// This reads one byte at a time so that nothing past the line is
/// consumed from `stream`.
pub(crate) async fn read_ssh_id<R: AsyncRead + Unpin>(stream: &mut R) -> Result<String, Error> {
    for _ in 0..MAX_PRELUDE_LINES {
        let mut line = Vec::with_capacity(64);
        loop {
            let b = match stream.read_u8().await {
                Ok(b) => b,
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    return Err(Error::HUP)
                }
                Err(e) => return Err(e.into()),
            };
            if b == b'\n' {
                break;
            }
            if line.len() >= MAX_ID_LINE {
                return Err(Error::Version);
            }
            line.push(b);
        }
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        if line.starts_with(b"SSH-") {
            let id = std::str::from_utf8(&line)?.to_string();
            debug!("server id: {id:?}");
            return Ok(id);
        }
        trace!("skipping pre-identification line {:?}", String::from_utf8_lossy(&line));
    }
    Err(Error::Version)
}

#[derive(Debug, Default)]
pub(crate) struct SSHBuffer {
    pub buffer: Vec<u8>,
    pub len: usize, // next packet length.
    pub bytes: usize,
    // Sequence numbers are on 32 bits and wrap.
    // https://tools.ietf.org/html/rfc4253#section-6.4
    pub seqn: Wrapping<u32>,
}

impl SSHBuffer {
    pub fn new() -> Self {
        SSHBuffer {
            buffer: Vec::new(),
            len: 0,
            bytes: 0,
            seqn: Wrapping(0),
        }
    }

    pub fn send_ssh_id(&mut self, id: &SshId) {
        id.write(&mut self.buffer);
    }
}

/// The outgoing half of the binary packet protocol: compresses and
/// seals payloads into `buffer`, ready to be flushed to the socket.
pub(crate) struct PacketWriter {
    pub buffer: SSHBuffer,
    pub cipher: Box<dyn SealingKey + Send>,
    pub compress: Compress,
    compress_buffer: Vec<u8>,
}

impl std::fmt::Debug for PacketWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("PacketWriter")
            .field("seqn", &self.buffer.seqn)
            .field("pending", &self.buffer.buffer.len())
            .finish()
    }
}

impl PacketWriter {
    pub fn clear() -> Self {
        PacketWriter {
            buffer: SSHBuffer::new(),
            cipher: Box::new(crate::cipher::clear::Key),
            compress: Compress::None,
            compress_buffer: Vec::new(),
        }
    }

    pub fn packet(&mut self, payload: &[u8]) -> Result<(), Error> {
        let payload = self.compress.compress(payload, &mut self.compress_buffer)?;
        self.cipher.write(payload, &mut self.buffer)
    }

    /// Bytes sealed since the last key exchange.
    pub fn bytes(&self) -> usize {
        self.buffer.bytes
    }

    pub fn take(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buffer.buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ssh_id() {
        let mut buffer = Vec::new();
        SshId::Standard("SSH-2.0-acme".to_string()).write(&mut buffer);
        assert_eq!(&buffer[..], b"SSH-2.0-acme\r\n");

        let mut buffer = Vec::new();
        SshId::Raw("SSH-2.0-raw\n".to_string()).write(&mut buffer);
        assert_eq!(&buffer[..], b"SSH-2.0-raw\n");

        assert_eq!(
            SshId::Raw("SSH-2.0-raw\n".to_string()).as_kex_hash_bytes(),
            b"SSH-2.0-raw"
        );
    }

    #[test]
    fn clear_writer_counts_packets() {
        let mut w = PacketWriter::clear();
        w.packet(b"\x05ssh-userauth").unwrap();
        w.packet(b"\x02").unwrap();
        assert_eq!(w.buffer.seqn.0, 2);
        assert_eq!(w.bytes(), 14);
        let wire = w.take();
        assert_eq!(wire.len() % 8, 0);
        assert!(w.buffer.buffer.is_empty());
    }

    #[tokio::test]
    async fn server_id_after_banner_lines() {
        let mut input: &[u8] = b"Welcome\r\nto the box\r\nSSH-2.0-OpenSSH_8.9p1 Ubuntu-3\r\n\x00\x00";
        let id = read_ssh_id(&mut input).await.unwrap();
        assert_eq!(id, "SSH-2.0-OpenSSH_8.9p1 Ubuntu-3");
        // The packet bytes following the line are untouched.
        assert_eq!(input, b"\x00\x00");
    }

    #[tokio::test]
    async fn overlong_line_is_a_version_error() {
        let long = vec![b'x'; 300];
        let mut input: &[u8] = &long;
        assert!(matches!(read_ssh_id(&mut input).await, Err(Error::Version)));
    }

    #[tokio::test]
    async fn eof_before_id() {
        let mut input: &[u8] = b"SSH-2.0";
        assert!(matches!(read_ssh_id(&mut input).await, Err(Error::HUP)));
    }
}
