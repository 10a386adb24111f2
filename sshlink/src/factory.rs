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

//! Construction of the objects a client is assembled from.
//!
//! Code that drives sessions takes a [`ServiceFactory`] rather than
//! calling constructors, so that tests can substitute in-memory pipes
//! for TCP connections.
use std::time::Duration;

use log::debug;
use sshlink_proxy::{ProxySettings, ProxyType, Stream};
use tokio::io::DuplexStream;

use crate::client::{ConnectionInfo, Session};
use crate::subsystem::{SubsystemHandler, SubsystemSession};
use crate::Error;

/// Opens the byte stream a session runs over.
#[derive(Debug, Clone)]
pub struct Connector {
    settings: ProxySettings,
    timeout: Duration,
}

impl Connector {
    pub fn new(settings: ProxySettings, timeout: Duration) -> Self {
        Connector { settings, timeout }
    }

    pub fn kind(&self) -> ProxyType {
        self.settings.kind
    }

    /// Connect to `host:port`. Running out of time is reported as
    /// [`Error::ConnectionTimeout`].
    pub async fn connect(&self, host: &str, port: u16) -> Result<Stream, Error> {
        debug!("{:?} connector to {host}:{port}", self.settings.kind);
        sshlink_proxy::connect(host, port, &self.settings, self.timeout)
            .await
            .map_err(|e| match e {
                sshlink_proxy::Error::Timeout(_) => Error::ConnectionTimeout,
                e => e.into(),
            })
    }
}

pub trait ServiceFactory: Send + Sync {
    fn create_session(&self, info: ConnectionInfo) -> Session {
        Session::new(info)
    }

    fn create_subsystem_session<H>(&self, name: &str, handler: H) -> SubsystemSession<H>
    where
        H: SubsystemHandler,
        Self: Sized,
    {
        SubsystemSession::new(name, handler)
    }

    /// Two connected in-memory streams, each buffering up to `capacity`
    /// bytes.
    fn create_pipe(&self, capacity: usize) -> (DuplexStream, DuplexStream) {
        tokio::io::duplex(capacity)
    }

    /// The connector for `info`, picked from its proxy settings.
    fn create_connector(&self, info: &ConnectionInfo) -> Connector {
        Connector::new(info.proxy.clone(), info.timeout)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultServiceFactory;

impl ServiceFactory for DefaultServiceFactory {}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    #[tokio::test]
    async fn pipes_are_connected() {
        let (mut a, mut b) = DefaultServiceFactory.create_pipe(64);
        a.write_all(b"SSH-2.0-pipe\r\n").await.unwrap();
        let mut buf = [0; 14];
        b.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"SSH-2.0-pipe\r\n");
    }

    #[test]
    fn connector_follows_the_proxy_settings() {
        let mut info = ConnectionInfo::new("example.org", 22, "me");
        assert_eq!(DefaultServiceFactory.create_connector(&info).kind(), ProxyType::None);
        info.proxy = ProxySettings::socks5("127.0.0.1", 1080);
        assert_eq!(DefaultServiceFactory.create_connector(&info).kind(), ProxyType::Socks5);
    }

    #[tokio::test]
    async fn unreachable_proxy_is_an_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let connector = Connector::new(
            ProxySettings::http("127.0.0.1", port),
            Duration::from_secs(5),
        );
        assert!(connector.connect("example.org", 22).await.is_err());
    }
}
