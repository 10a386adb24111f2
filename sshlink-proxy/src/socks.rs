use std::net::{IpAddr, Ipv4Addr};

use log::debug;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{Error, ProxySettings};

const SOCKS4_VERSION: u8 = 4;
const SOCKS5_VERSION: u8 = 5;
const CMD_CONNECT: u8 = 1;
const SOCKS4_GRANTED: u8 = 0x5a;

const AUTH_NONE: u8 = 0;
const AUTH_USER_PASSWORD: u8 = 2;
const AUTH_NO_ACCEPTABLE: u8 = 0xff;

const ATYP_IPV4: u8 = 1;
const ATYP_DOMAIN: u8 = 3;
const ATYP_IPV6: u8 = 4;

/// SOCKS4 `CONNECT`. Hosts that are not IPv4 literals are sent using the
/// SOCKS4a extension and resolved by the proxy.
pub(crate) async fn socks4_connect<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut S,
    host: &str,
    port: u16,
    settings: &ProxySettings,
) -> Result<(), Error> {
    let mut req = vec![SOCKS4_VERSION, CMD_CONNECT];
    req.extend_from_slice(&port.to_be_bytes());
    let literal = host.parse::<Ipv4Addr>().ok();
    match literal {
        Some(ip) => req.extend_from_slice(&ip.octets()),
        None => req.extend_from_slice(&[0, 0, 0, 1]),
    }
    if let Some(ref user) = settings.username {
        req.extend_from_slice(user.as_bytes());
    }
    req.push(0);
    if literal.is_none() {
        req.extend_from_slice(host.as_bytes());
        req.push(0);
    }
    stream.write_all(&req).await?;
    stream.flush().await?;

    let mut reply = [0u8; 8];
    stream.read_exact(&mut reply).await?;
    debug!("SOCKS4 reply code {:#x}", reply[1]);
    if reply[1] != SOCKS4_GRANTED {
        return Err(Error::Socks(format!(
            "request rejected with code {:#x}",
            reply[1]
        )));
    }
    Ok(())
}

/// SOCKS5 `CONNECT` (RFC 1928), with username/password authentication
/// (RFC 1929) when credentials are configured.
pub(crate) async fn socks5_connect<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut S,
    host: &str,
    port: u16,
    settings: &ProxySettings,
) -> Result<(), Error> {
    let credentials = settings
        .username
        .as_ref()
        .map(|u| (u.as_str(), settings.password.as_deref().unwrap_or("")));
    if credentials.is_some() {
        stream
            .write_all(&[SOCKS5_VERSION, 2, AUTH_NONE, AUTH_USER_PASSWORD])
            .await?;
    } else {
        stream.write_all(&[SOCKS5_VERSION, 1, AUTH_NONE]).await?;
    }
    stream.flush().await?;

    let mut choice = [0u8; 2];
    stream.read_exact(&mut choice).await?;
    if choice[0] != SOCKS5_VERSION {
        return Err(Error::InvalidResponse);
    }
    match (choice[1], credentials) {
        (AUTH_NONE, _) => {}
        (AUTH_USER_PASSWORD, Some((user, password))) => {
            if user.len() > 255 || password.len() > 255 {
                return Err(Error::Socks("credentials too long".into()));
            }
            let mut auth = vec![1, user.len() as u8];
            auth.extend_from_slice(user.as_bytes());
            auth.push(password.len() as u8);
            auth.extend_from_slice(password.as_bytes());
            stream.write_all(&auth).await?;
            stream.flush().await?;
            let mut status = [0u8; 2];
            stream.read_exact(&mut status).await?;
            if status[1] != 0 {
                return Err(Error::Socks("authentication rejected".into()));
            }
        }
        (AUTH_NO_ACCEPTABLE, _) => {
            return Err(Error::Socks("no acceptable authentication method".into()))
        }
        (m, _) => return Err(Error::Socks(format!("unexpected method {m:#x}"))),
    }

    let mut req = vec![SOCKS5_VERSION, CMD_CONNECT, 0];
    match host.parse::<IpAddr>() {
        Ok(IpAddr::V4(ip)) => {
            req.push(ATYP_IPV4);
            req.extend_from_slice(&ip.octets());
        }
        Ok(IpAddr::V6(ip)) => {
            req.push(ATYP_IPV6);
            req.extend_from_slice(&ip.octets());
        }
        Err(_) => {
            if host.len() > 255 {
                return Err(Error::Socks("host name too long".into()));
            }
            req.push(ATYP_DOMAIN);
            req.push(host.len() as u8);
            req.extend_from_slice(host.as_bytes());
        }
    }
    req.extend_from_slice(&port.to_be_bytes());
    stream.write_all(&req).await?;
    stream.flush().await?;

    let mut head = [0u8; 4];
    stream.read_exact(&mut head).await?;
    if head[0] != SOCKS5_VERSION {
        return Err(Error::InvalidResponse);
    }
    if head[1] != 0 {
        return Err(Error::Socks(format!("connect failed with code {:#x}", head[1])));
    }
    // Skip the bound address.
    let skip = match head[3] {
        ATYP_IPV4 => 4,
        ATYP_IPV6 => 16,
        ATYP_DOMAIN => stream.read_u8().await? as usize,
        _ => return Err(Error::InvalidResponse),
    };
    let mut bound = vec![0u8; skip + 2];
    stream.read_exact(&mut bound).await?;
    debug!("SOCKS5 tunnel to {host}:{port} established");
    Ok(())
}
