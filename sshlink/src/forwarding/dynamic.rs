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

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::{Arc, Mutex};

use log::debug;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use super::local::accept;
use super::{tunnel, PortCore, PortEvent, PortState};
use crate::channels::{Channel, ChannelKind};
use crate::client::{Handle, Session};
use crate::observer::Observers;
use crate::Error;

const SOCKS4: u8 = 4;
const SOCKS5: u8 = 5;
const CONNECT: u8 = 1;
const SOCKS4_GRANTED: u8 = 0x5a;
const SOCKS4_REJECTED: u8 = 0x5b;
const SOCKS5_NO_AUTH: u8 = 0;
const SOCKS5_NO_ACCEPTABLE_METHOD: u8 = 0xff;
const SOCKS5_SUCCEEDED: u8 = 0;
const SOCKS5_GENERAL_FAILURE: u8 = 1;
const SOCKS5_COMMAND_NOT_SUPPORTED: u8 = 7;
const SOCKS5_ADDRESS_NOT_SUPPORTED: u8 = 8;
const MAX_SOCKS4_FIELD: usize = 255;

/// A local SOCKS4, SOCKS4a or SOCKS5 proxy: each connection goes to the
/// destination its client asks for, through a `direct-tcpip` channel.
#[derive(Debug)]
pub struct DynamicPort {
    core: Arc<PortCore>,
    bound_host: String,
    bound_port: u16,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl DynamicPort {
    pub fn new<B: Into<String>>(bound_host: B, bound_port: u16) -> Self {
        DynamicPort {
            core: PortCore::new(),
            bound_host: bound_host.into(),
            bound_port,
            local_addr: Mutex::new(None),
        }
    }

    pub fn events(&self) -> &Observers<PortEvent> {
        &self.core.events
    }

    pub fn state(&self) -> PortState {
        self.core.state()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.lock().ok().and_then(|a| *a)
    }

    pub async fn start(&self, session: &Session) -> Result<(), Error> {
        let handle = self.core.begin(session)?;
        let bound = TcpListener::bind((self.bound_host.as_str(), self.bound_port))
            .await
            .and_then(|l| Ok((l.local_addr()?, l)));
        let (addr, listener) = match bound {
            Ok(x) => x,
            Err(e) => {
                self.core.abandon();
                return Err(e.into());
            }
        };
        debug!("SOCKS proxy on {addr}");
        if let Ok(mut a) = self.local_addr.lock() {
            *a = Some(addr);
        }
        self.core.spawn(accept(
            listener,
            Arc::downgrade(&self.core),
            forward,
            handle,
        ));
        Ok(())
    }

    pub async fn stop(&self) {
        self.core.stop().await
    }

    pub async fn dispose(&self) {
        self.core.dispose().await
    }
}

async fn forward(handle: Handle, mut socket: TcpStream, peer: SocketAddr) -> Result<(), Error> {
    let version = socket.read_u8().await?;
    let request = match version {
        SOCKS4 => read_socks4(&mut socket).await?,
        SOCKS5 => read_socks5(&mut socket).await?,
        v => return Err(Error::Socks(format!("unsupported version {v}"))),
    };
    debug!("SOCKS{version} request for {}:{}", request.host, request.port);

    let channel = Channel::new(
        handle,
        ChannelKind::DirectTcpip {
            host_to_connect: request.host.clone(),
            port_to_connect: request.port as u32,
            originator_address: peer.ip().to_string(),
            originator_port: peer.port() as u32,
        },
    );
    let opened = match channel {
        Ok(mut channel) => channel.open().await.map(|_| channel),
        Err(e) => Err(e),
    };
    let channel = match opened {
        Ok(channel) => {
            reply(&mut socket, version, true).await?;
            channel
        }
        Err(e) => {
            reply(&mut socket, version, false).await?;
            return Err(e);
        }
    };
    tunnel(socket, channel).await
}

#[derive(Debug, PartialEq, Eq)]
struct Request {
    host: String,
    port: u16,
}

/// The rest of a SOCKS4 or SOCKS4a request, after the version byte.
async fn read_socks4<S: AsyncRead + AsyncWrite + Unpin>(s: &mut S) -> Result<Request, Error> {
    let command = s.read_u8().await?;
    let port = s.read_u16().await?;
    let mut ip = [0; 4];
    s.read_exact(&mut ip).await?;
    read_null_terminated(s).await?; // user id
    if command != CONNECT {
        s.write_all(&[0, SOCKS4_REJECTED, 0, 0, 0, 0, 0, 0]).await?;
        return Err(Error::Socks(format!("unsupported command {command}")));
    }
    // 0.0.0.x, x != 0, announces a SOCKS4a host name.
    let host = if matches!(ip, [0, 0, 0, x] if x != 0) {
        read_null_terminated(s).await?
    } else {
        Ipv4Addr::from(ip).to_string()
    };
    Ok(Request { host, port })
}

async fn read_null_terminated<S: AsyncRead + Unpin>(s: &mut S) -> Result<String, Error> {
    let mut field = Vec::new();
    loop {
        match s.read_u8().await? {
            0 => break,
            _ if field.len() >= MAX_SOCKS4_FIELD => {
                return Err(Error::Socks("field too long".into()))
            }
            b => field.push(b),
        }
    }
    Ok(std::str::from_utf8(&field)?.to_string())
}

/// The rest of a SOCKS5 negotiation and request, after the version byte.
async fn read_socks5<S: AsyncRead + AsyncWrite + Unpin>(s: &mut S) -> Result<Request, Error> {
    let n = s.read_u8().await? as usize;
    let mut methods = vec![0; n];
    s.read_exact(&mut methods).await?;
    if !methods.contains(&SOCKS5_NO_AUTH) {
        s.write_all(&[SOCKS5, SOCKS5_NO_ACCEPTABLE_METHOD]).await?;
        return Err(Error::Socks("no acceptable authentication method".into()));
    }
    s.write_all(&[SOCKS5, SOCKS5_NO_AUTH]).await?;

    let mut header = [0; 4];
    s.read_exact(&mut header).await?;
    let [version, command, _, address_type] = header;
    if version != SOCKS5 {
        return Err(Error::Socks(format!("unexpected version {version}")));
    }
    let host = match address_type {
        1 => {
            let mut ip = [0; 4];
            s.read_exact(&mut ip).await?;
            Ipv4Addr::from(ip).to_string()
        }
        3 => {
            let len = s.read_u8().await? as usize;
            let mut name = vec![0; len];
            s.read_exact(&mut name).await?;
            std::str::from_utf8(&name)?.to_string()
        }
        4 => {
            let mut ip = [0; 16];
            s.read_exact(&mut ip).await?;
            Ipv6Addr::from(ip).to_string()
        }
        t => {
            socks5_reply(s, SOCKS5_ADDRESS_NOT_SUPPORTED).await?;
            return Err(Error::Socks(format!("unsupported address type {t}")));
        }
    };
    let port = s.read_u16().await?;
    if command != CONNECT {
        socks5_reply(s, SOCKS5_COMMAND_NOT_SUPPORTED).await?;
        return Err(Error::Socks(format!("unsupported command {command}")));
    }
    Ok(Request { host, port })
}

async fn socks5_reply<S: AsyncWrite + Unpin>(s: &mut S, code: u8) -> Result<(), Error> {
    s.write_all(&[SOCKS5, code, 0, 1, 0, 0, 0, 0, 0, 0]).await?;
    Ok(())
}

async fn reply<S: AsyncWrite + Unpin>(s: &mut S, version: u8, granted: bool) -> Result<(), Error> {
    if version == SOCKS4 {
        let code = if granted { SOCKS4_GRANTED } else { SOCKS4_REJECTED };
        s.write_all(&[0, code, 0, 0, 0, 0, 0, 0]).await?;
        return Ok(());
    }
    let code = if granted {
        SOCKS5_SUCCEEDED
    } else {
        SOCKS5_GENERAL_FAILURE
    };
    socks5_reply(s, code).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn socks4a_request() {
        let (mut client, mut server) = tokio::io::duplex(256);
        client
            .write_all(b"\x01\x00\x16\x00\x00\x00\x01me\x00example.com\x00")
            .await
            .unwrap();
        let request = read_socks4(&mut server).await.unwrap();
        assert_eq!(
            request,
            Request {
                host: "example.com".into(),
                port: 22
            }
        );
    }

    #[tokio::test]
    async fn socks4_ip_request() {
        let (mut client, mut server) = tokio::io::duplex(256);
        client.write_all(b"\x01\x01\xbb\x0a\x00\x00\x05\x00").await.unwrap();
        let request = read_socks4(&mut server).await.unwrap();
        assert_eq!(request.host, "10.0.0.5");
        assert_eq!(request.port, 443);
    }

    #[tokio::test]
    async fn socks5_domain_request() {
        let (mut client, mut server) = tokio::io::duplex(256);
        client.write_all(b"\x02\x00\x02").await.unwrap();
        client
            .write_all(b"\x05\x01\x00\x03\x0bexample.com\x00\x50")
            .await
            .unwrap();
        let request = read_socks5(&mut server).await.unwrap();
        assert_eq!(request.host, "example.com");
        assert_eq!(request.port, 80);

        let mut method = [0; 2];
        client.read_exact(&mut method).await.unwrap();
        assert_eq!(method, [SOCKS5, SOCKS5_NO_AUTH]);
    }

    #[tokio::test]
    async fn socks5_ipv6_request() {
        let (mut client, mut server) = tokio::io::duplex(256);
        client.write_all(b"\x01\x00").await.unwrap();
        let mut request = vec![5, 1, 0, 4];
        request.extend_from_slice(&Ipv6Addr::LOCALHOST.octets());
        request.extend_from_slice(&[0, 22]);
        client.write_all(&request).await.unwrap();
        let request = read_socks5(&mut server).await.unwrap();
        assert_eq!(request.host, "::1");
    }

    #[tokio::test]
    async fn socks5_requires_no_auth() {
        let (mut client, mut server) = tokio::io::duplex(256);
        client.write_all(b"\x01\x02").await.unwrap();
        assert!(matches!(
            read_socks5(&mut server).await,
            Err(Error::Socks(_))
        ));
        let mut answer = [0; 2];
        client.read_exact(&mut answer).await.unwrap();
        assert_eq!(answer, [SOCKS5, SOCKS5_NO_ACCEPTABLE_METHOD]);
    }

    #[tokio::test]
    async fn socks5_bind_is_refused() {
        let (mut client, mut server) = tokio::io::duplex(256);
        client.write_all(b"\x01\x00\x05\x02\x00\x01\x7f\x00\x00\x01\x00\x16").await.unwrap();
        assert!(read_socks5(&mut server).await.is_err());
        let mut answer = [0; 12];
        client.read_exact(&mut answer).await.unwrap();
        assert_eq!(answer[2..4], [SOCKS5, SOCKS5_COMMAND_NOT_SUPPORTED]);
    }
}
