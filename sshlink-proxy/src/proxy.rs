use std::net::SocketAddr;
use std::pin::Pin;
use std::process::Stdio;

use futures::ready;
use futures::task::*;
use log::debug;
use tokio::io::ReadBuf;
use tokio::net::TcpStream;
use tokio::process::Command;

use crate::Error;

/// A transport stream: a TCP socket (direct or to a proxy), or the
/// stdin/stdout pair of a proxy command.
pub enum Stream {
    #[allow(missing_docs)]
    Child(tokio::process::Child),
    #[allow(missing_docs)]
    Tcp(TcpStream),
}

impl Stream {
    /// Connect a direct TCP stream (as opposed to a proxied one).
    pub async fn tcp_connect(addr: &SocketAddr) -> Result<Stream, std::io::Error> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(Stream::Tcp(stream))
    }

    /// Resolve `host` and connect to the first address that accepts.
    pub async fn tcp_connect_host(host: &str, port: u16) -> Result<Stream, Error> {
        let addrs = tokio::net::lookup_host((host, port))
            .await
            .map_err(|_| Error::HostNotFound(host.to_string()))?;
        let mut last_err = None;
        for addr in addrs {
            match Stream::tcp_connect(&addr).await {
                Ok(s) => return Ok(s),
                Err(e) => {
                    debug!("connect to {addr} failed: {e}");
                    last_err = Some(e)
                }
            }
        }
        Err(match last_err {
            Some(e) => Error::Io(e),
            None => Error::HostNotFound(host.to_string()),
        })
    }

    /// Connect through a proxy command.
    pub async fn proxy_command(cmd: &str, args: &[&str]) -> Result<Stream, std::io::Error> {
        Ok(Stream::Child(
            Command::new(cmd)
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .kill_on_drop(true)
                .args(args)
                .spawn()?,
        ))
    }

    /// Peer address, when the stream is a socket.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        match self {
            Stream::Tcp(t) => t.peer_addr().ok(),
            Stream::Child(_) => None,
        }
    }
}

impl tokio::io::AsyncRead for Stream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context,
        buf: &mut ReadBuf,
    ) -> Poll<Result<(), std::io::Error>> {
        match *self {
            Stream::Child(ref mut c) => match c.stdout.as_mut() {
                Some(ref mut stdout) => Pin::new(stdout).poll_read(cx, buf),
                None => Poll::Ready(Ok(())),
            },
            Stream::Tcp(ref mut t) => Pin::new(t).poll_read(cx, buf),
        }
    }
}

impl tokio::io::AsyncWrite for Stream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context,
        buf: &[u8],
    ) -> Poll<Result<usize, std::io::Error>> {
        match *self {
            Stream::Child(ref mut c) => match c.stdin.as_mut() {
                Some(ref mut stdin) => Pin::new(stdin).poll_write(cx, buf),
                None => Poll::Ready(Ok(0)),
            },
            Stream::Tcp(ref mut t) => Pin::new(t).poll_write(cx, buf),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context) -> Poll<Result<(), std::io::Error>> {
        match *self {
            Stream::Child(ref mut c) => match c.stdin.as_mut() {
                Some(ref mut stdin) => Pin::new(stdin).poll_flush(cx),
                None => Poll::Ready(Ok(())),
            },
            Stream::Tcp(ref mut t) => Pin::new(t).poll_flush(cx),
        }
    }

    fn poll_shutdown(
        mut self: Pin<&mut Self>,
        cx: &mut Context,
    ) -> Poll<Result<(), std::io::Error>> {
        match *self {
            Stream::Child(ref mut c) => {
                if let Some(ref mut stdin) = c.stdin {
                    ready!(Pin::new(stdin).poll_shutdown(cx))?;
                }
                drop(c.stdin.take());
                Poll::Ready(Ok(()))
            }
            Stream::Tcp(ref mut t) => Pin::new(t).poll_shutdown(cx),
        }
    }
}
