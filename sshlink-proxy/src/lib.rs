#![deny(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic
)]
//! Opening the raw duplex byte stream an SSH session runs over.
//!
//! [`connect`] picks a connector from [`ProxySettings::kind`]: a direct
//! TCP connection, an HTTP `CONNECT` tunnel, a SOCKS4 or SOCKS5 proxy,
//! or an external proxy command. Every connector yields a [`Stream`].
use std::time::Duration;

use log::debug;
use thiserror::*;

mod http;
mod proxy;
mod socks;

pub use proxy::*;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Host not found: {0}")]
    HostNotFound(String),
    #[error("Connection to {0} timed out")]
    Timeout(String),
    #[error("HTTP proxy refused the tunnel: {0}")]
    HttpStatus(String),
    #[error("SOCKS proxy error: {0}")]
    Socks(String),
    #[error("Malformed proxy response")]
    InvalidResponse,
    #[error("Missing proxy host")]
    MissingProxyHost,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Which connector opens the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProxyType {
    #[default]
    None,
    Http,
    Socks4,
    Socks5,
    /// Runs `ProxySettings::command` and talks over its stdin/stdout.
    Command,
}

/// Proxy part of a connection descriptor.
#[derive(Debug, Clone, Default)]
pub struct ProxySettings {
    pub kind: ProxyType,
    pub host: Option<String>,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Program and arguments for [`ProxyType::Command`]. `%h` and `%p`
    /// are replaced by the destination host and port.
    pub command: Vec<String>,
}

impl ProxySettings {
    pub fn http(host: &str, port: u16) -> Self {
        ProxySettings {
            kind: ProxyType::Http,
            host: Some(host.to_string()),
            port,
            ..Default::default()
        }
    }

    pub fn socks4(host: &str, port: u16) -> Self {
        ProxySettings {
            kind: ProxyType::Socks4,
            host: Some(host.to_string()),
            port,
            ..Default::default()
        }
    }

    pub fn socks5(host: &str, port: u16) -> Self {
        ProxySettings {
            kind: ProxyType::Socks5,
            host: Some(host.to_string()),
            port,
            ..Default::default()
        }
    }

    pub fn with_credentials(mut self, username: &str, password: &str) -> Self {
        self.username = Some(username.to_string());
        self.password = Some(password.to_string());
        self
    }

    fn proxy_host(&self) -> Result<&str, Error> {
        self.host.as_deref().ok_or(Error::MissingProxyHost)
    }
}

/// Open a stream to `host:port`, going through the proxy described by
/// `settings`. The whole establishment, proxy handshake included, is
/// bounded by `timeout`.
pub async fn connect(
    host: &str,
    port: u16,
    settings: &ProxySettings,
    timeout: Duration,
) -> Result<Stream, Error> {
    let target = format!("{host}:{port}");
    match tokio::time::timeout(timeout, connect_inner(host, port, settings)).await {
        Ok(r) => r,
        Err(_) => Err(Error::Timeout(target)),
    }
}

async fn connect_inner(host: &str, port: u16, settings: &ProxySettings) -> Result<Stream, Error> {
    match settings.kind {
        ProxyType::None => {
            debug!("connecting directly to {host}:{port}");
            Stream::tcp_connect_host(host, port).await
        }
        ProxyType::Http => {
            let proxy = settings.proxy_host()?;
            debug!("connecting to {host}:{port} through HTTP proxy {proxy}");
            let mut stream = Stream::tcp_connect_host(proxy, settings.port).await?;
            http::connect_tunnel(&mut stream, host, port, settings).await?;
            Ok(stream)
        }
        ProxyType::Socks4 => {
            let proxy = settings.proxy_host()?;
            debug!("connecting to {host}:{port} through SOCKS4 proxy {proxy}");
            let mut stream = Stream::tcp_connect_host(proxy, settings.port).await?;
            socks::socks4_connect(&mut stream, host, port, settings).await?;
            Ok(stream)
        }
        ProxyType::Socks5 => {
            let proxy = settings.proxy_host()?;
            debug!("connecting to {host}:{port} through SOCKS5 proxy {proxy}");
            let mut stream = Stream::tcp_connect_host(proxy, settings.port).await?;
            socks::socks5_connect(&mut stream, host, port, settings).await?;
            Ok(stream)
        }
        ProxyType::Command => {
            let mut args = settings
                .command
                .iter()
                .map(|a| a.replace("%h", host).replace("%p", &port.to_string()));
            let cmd = args.next().ok_or(Error::MissingProxyHost)?;
            let args: Vec<String> = args.collect();
            debug!("spawning proxy command {cmd:?} {args:?}");
            let args: Vec<&str> = args.iter().map(String::as_str).collect();
            Ok(Stream::proxy_command(&cmd, &args).await?)
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use super::*;

    #[tokio::test]
    async fn direct_connect_reaches_listener() {
        let _ = env_logger::try_init();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (mut s, _) = listener.accept().await.unwrap();
            s.write_all(b"SSH-2.0-test\r\n").await.unwrap();
        });
        let mut stream = connect(
            "127.0.0.1",
            port,
            &ProxySettings::default(),
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        let mut buf = [0; 14];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"SSH-2.0-test\r\n");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn missing_proxy_host_is_an_error() {
        let settings = ProxySettings {
            kind: ProxyType::Socks5,
            ..Default::default()
        };
        let r = connect("example.com", 22, &settings, Duration::from_secs(1)).await;
        assert!(matches!(r, Err(Error::MissingProxyHost)));
    }
}
