use data_encoding::BASE64;
use log::debug;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{Error, ProxySettings};

// Response headers beyond this are treated as a broken proxy.
const MAX_RESPONSE_HEADER: usize = 8192;

/// Ask an HTTP proxy to open a `CONNECT` tunnel to `host:port`.
pub(crate) async fn connect_tunnel<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut S,
    host: &str,
    port: u16,
    settings: &ProxySettings,
) -> Result<(), Error> {
    let mut request = format!("CONNECT {host}:{port} HTTP/1.1\r\nHost: {host}:{port}\r\n");
    if let Some(ref user) = settings.username {
        let password = settings.password.as_deref().unwrap_or("");
        let token = BASE64.encode(format!("{user}:{password}").as_bytes());
        request.push_str(&format!("Proxy-Authorization: Basic {token}\r\n"));
    }
    request.push_str("\r\n");
    stream.write_all(request.as_bytes()).await?;
    stream.flush().await?;

    // Read byte by byte, so that nothing past the header (the SSH
    // identification line) is consumed.
    let mut header = Vec::new();
    while !header.ends_with(b"\r\n\r\n") {
        if header.len() > MAX_RESPONSE_HEADER {
            return Err(Error::InvalidResponse);
        }
        header.push(stream.read_u8().await?);
    }
    let header = String::from_utf8_lossy(&header);
    let status_line = header.lines().next().ok_or(Error::InvalidResponse)?;
    debug!("HTTP proxy answered {status_line:?}");
    let mut parts = status_line.split_whitespace();
    match (parts.next(), parts.next()) {
        (Some(version), Some("200")) if version.starts_with("HTTP/") => Ok(()),
        (Some(version), Some(_)) if version.starts_with("HTTP/") => {
            Err(Error::HttpStatus(status_line.to_string()))
        }
        _ => Err(Error::InvalidResponse),
    }
}
