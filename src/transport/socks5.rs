//! Async SOCKS5 `CONNECT` dialer, adapted from the teacher's
//! `network::socks5_client::Socks5Client::connect_socks5` (blocking
//! `std::net::TcpStream`) into a `tokio::net::TcpStream` handshake. The
//! wire bytes of the greeting/request/response are unchanged; only the
//! I/O calls became async.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};

use super::TransportError;

const SOCKS5_VERSION: u8 = 0x05;
const AUTH_NO_AUTH: u8 = 0x00;
const CMD_CONNECT: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const RESERVED: u8 = 0x00;

/// Dial `target_host:target_port` through a local SOCKS5 proxy (the
/// Tor daemon's SOCKS port). `target_host` is typically a `.onion`
/// address; SOCKS5 resolves it proxy-side, so no DNS lookup ever
/// happens locally.
pub async fn connect_socks5(
    proxy_addr: &str,
    target_host: &str,
    target_port: u16,
    deadline: Duration,
) -> Result<TcpStream, TransportError> {
    let mut stream = timeout(deadline, TcpStream::connect(proxy_addr))
        .await
        .map_err(|_| TransportError::Timeout)??;

    let greeting = [SOCKS5_VERSION, 0x01, AUTH_NO_AUTH];
    stream.write_all(&greeting).await?;

    let mut method_response = [0u8; 2];
    stream.read_exact(&mut method_response).await?;
    if method_response[0] != SOCKS5_VERSION {
        return Err(TransportError::Socks5("unexpected SOCKS version in greeting reply".into()));
    }
    if method_response[1] != AUTH_NO_AUTH {
        return Err(TransportError::Socks5("SOCKS5 proxy demanded authentication".into()));
    }

    let host_bytes = target_host.as_bytes();
    if host_bytes.len() > 255 {
        return Err(TransportError::Socks5("onion address too long for SOCKS5 domain field".into()));
    }
    let mut request = Vec::with_capacity(7 + host_bytes.len());
    request.push(SOCKS5_VERSION);
    request.push(CMD_CONNECT);
    request.push(RESERVED);
    request.push(ATYP_DOMAIN);
    request.push(host_bytes.len() as u8);
    request.extend_from_slice(host_bytes);
    request.extend_from_slice(&target_port.to_be_bytes());
    stream.write_all(&request).await?;

    let mut reply_head = [0u8; 4];
    stream.read_exact(&mut reply_head).await?;
    if reply_head[0] != SOCKS5_VERSION {
        return Err(TransportError::Socks5("unexpected SOCKS version in connect reply".into()));
    }
    if reply_head[1] != 0x00 {
        return Err(TransportError::Socks5(socks5_error_message(reply_head[1]).to_string()));
    }

    match reply_head[3] {
        0x01 => {
            let mut addr = [0u8; 6];
            stream.read_exact(&mut addr).await?;
        }
        0x03 => {
            let mut len_byte = [0u8; 1];
            stream.read_exact(&mut len_byte).await?;
            let mut addr = vec![0u8; len_byte[0] as usize + 2];
            stream.read_exact(&mut addr).await?;
        }
        0x04 => {
            let mut addr = [0u8; 18];
            stream.read_exact(&mut addr).await?;
        }
        other => return Err(TransportError::Socks5(format!("unknown SOCKS5 address type {other}"))),
    }

    Ok(stream)
}

fn socks5_error_message(code: u8) -> &'static str {
    match code {
        0x01 => "general SOCKS server failure",
        0x02 => "connection not allowed by ruleset",
        0x03 => "network unreachable",
        0x04 => "host unreachable",
        0x05 => "connection refused",
        0x06 => "TTL expired",
        0x07 => "command not supported",
        0x08 => "address type not supported",
        _ => "unknown SOCKS5 error",
    }
}
