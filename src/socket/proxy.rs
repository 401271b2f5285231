use std::net::SocketAddr;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::error::*;

/// How TCP connections to a TURN server are tunneled.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProxyKind {
    Socks5,
    Http,
}

/// Proxy configuration for relay establishment over TCP.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProxyConfig {
    pub kind: ProxyKind,
    pub server: SocketAddr,
    pub username: Option<String>,
    pub password: Option<String>,
}

/// Runs the CONNECT handshake for the configured proxy on an already
/// connected stream, leaving it in passthrough mode towards `target`.
pub(crate) async fn proxy_connect(
    config: &ProxyConfig,
    stream: &mut TcpStream,
    target: SocketAddr,
) -> Result<()> {
    match config.kind {
        ProxyKind::Socks5 => {
            socks5_connect(
                stream,
                target,
                config.username.as_deref(),
                config.password.as_deref(),
            )
            .await
        }
        ProxyKind::Http => {
            http_connect(
                stream,
                target,
                config.username.as_deref(),
                config.password.as_deref(),
            )
            .await
        }
    }
}

/// SOCKS5 CONNECT, RFC 1928, with optional username/password
/// authentication per RFC 1929.
pub(crate) async fn socks5_connect(
    stream: &mut TcpStream,
    target: SocketAddr,
    username: Option<&str>,
    password: Option<&str>,
) -> Result<()> {
    let with_auth = username.is_some();

    // Method selection: no-auth, plus username/password when configured.
    let greeting: &[u8] = if with_auth {
        &[0x05, 0x02, 0x00, 0x02]
    } else {
        &[0x05, 0x01, 0x00]
    };
    stream.write_all(greeting).await?;

    let mut choice = [0u8; 2];
    stream.read_exact(&mut choice).await?;
    if choice[0] != 0x05 {
        return Err(Error::ErrProxyNegotiationFailed);
    }

    match choice[1] {
        0x00 => {}
        0x02 if with_auth => {
            let user = username.unwrap_or_default().as_bytes();
            let pass = password.unwrap_or_default().as_bytes();
            if user.len() > 255 || pass.len() > 255 {
                return Err(Error::ErrProxyNegotiationFailed);
            }
            let mut auth = vec![0x01, user.len() as u8];
            auth.extend_from_slice(user);
            auth.push(pass.len() as u8);
            auth.extend_from_slice(pass);
            stream.write_all(&auth).await?;

            let mut status = [0u8; 2];
            stream.read_exact(&mut status).await?;
            if status[1] != 0x00 {
                return Err(Error::ErrProxyNegotiationFailed);
            }
        }
        _ => return Err(Error::ErrProxyNegotiationFailed),
    }

    // CONNECT request with the literal target address.
    let mut request = vec![0x05, 0x01, 0x00];
    match target {
        SocketAddr::V4(v4) => {
            request.push(0x01);
            request.extend_from_slice(&v4.ip().octets());
        }
        SocketAddr::V6(v6) => {
            request.push(0x04);
            request.extend_from_slice(&v6.ip().octets());
        }
    }
    request.extend_from_slice(&target.port().to_be_bytes());
    stream.write_all(&request).await?;

    let mut reply_head = [0u8; 4];
    stream.read_exact(&mut reply_head).await?;
    if reply_head[1] != 0x00 {
        return Err(Error::ErrProxyNegotiationFailed);
    }
    // Consume the bound address, variable by address type.
    let addr_len = match reply_head[3] {
        0x01 => 4,
        0x04 => 16,
        0x03 => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            len[0] as usize
        }
        _ => return Err(Error::ErrProxyNegotiationFailed),
    };
    let mut bound = vec![0u8; addr_len + 2];
    stream.read_exact(&mut bound).await?;

    Ok(())
}

/// HTTP CONNECT with optional basic authentication.
pub(crate) async fn http_connect(
    stream: &mut TcpStream,
    target: SocketAddr,
    username: Option<&str>,
    password: Option<&str>,
) -> Result<()> {
    let mut request = format!(
        "CONNECT {target} HTTP/1.1\r\nHost: {target}\r\nContent-Length: 0\r\n"
    );
    if let Some(user) = username {
        let credentials = base64_encode(
            format!("{}:{}", user, password.unwrap_or_default()).as_bytes(),
        );
        request.push_str(&format!("Proxy-Authorization: Basic {credentials}\r\n"));
    }
    request.push_str("\r\n");
    stream.write_all(request.as_bytes()).await?;

    // Read up to the end of the response header block.
    let mut response = vec![];
    let mut byte = [0u8; 1];
    while !response.ends_with(b"\r\n\r\n") {
        if response.len() > 8192 {
            return Err(Error::ErrProxyNegotiationFailed);
        }
        stream.read_exact(&mut byte).await?;
        response.push(byte[0]);
    }

    let header = String::from_utf8_lossy(&response);
    let status_line = header.lines().next().unwrap_or_default();
    if !status_line.starts_with("HTTP/") || !status_line.contains(" 200") {
        return Err(Error::ErrProxyNegotiationFailed);
    }

    Ok(())
}

// Canned hellos exchanged before TURN traffic on a TLS-type relay
// connection. The server never negotiates real TLS; both sides swap one
// fixed record each and then speak STUN framing on the open stream.
pub(crate) const PSEUDO_SSL_CLIENT_HELLO: [u8; 72] = [
    0x80, 0x46, // SSLv2-style header, 70-byte record
    0x01, // client hello
    0x03, 0x01, // version
    0x00, 0x2d, // cipher spec length: 45
    0x00, 0x00, // session id length: 0
    0x00, 0x10, // challenge length: 16
    // 15 cipher specs
    0x01, 0x00, 0x80, 0x03, 0x00, 0x80, 0x07, 0x00, 0xc0, 0x06, 0x00, 0x40, 0x02, 0x00, 0x80,
    0x04, 0x00, 0x80, 0x00, 0x00, 0x04, 0x00, 0xff, 0x85, 0x00, 0x00, 0x85, 0x01, 0x00, 0x80,
    0x08, 0x00, 0x80, 0x00, 0x00, 0x64, 0x00, 0x00, 0x62, 0x00, 0x00, 0x03, 0x00, 0x00, 0x06,
    // challenge
    0x1f, 0x17, 0x0c, 0xa6, 0x2f, 0x00, 0x78, 0xfc, 0x46, 0x55, 0x2e, 0xb1, 0x83, 0x39, 0xf1,
    0xea,
];

pub(crate) const PSEUDO_SSL_SERVER_HELLO: [u8; 79] = [
    0x16, // handshake record
    0x03, 0x01, // version
    0x00, 0x4a, // length: 74
    0x02, // server hello
    0x00, 0x00, 0x46, // handshake length: 70
    0x03, 0x01, // version
    // random
    0x42, 0x85, 0x45, 0xa7, 0x27, 0xa9, 0x5d, 0xa0, 0xb3, 0xc5, 0xe7, 0x53, 0xda, 0x48, 0x2b,
    0x3f, 0xc6, 0x5a, 0xca, 0x89, 0xc1, 0x58, 0x52, 0xa1, 0x78, 0x3c, 0x5b, 0x17, 0x46, 0x00,
    0x85, 0x3f,
    0x20, // session id length: 32
    // session id
    0x0e, 0xd3, 0x06, 0x72, 0x5b, 0x5b, 0x1b, 0x5f, 0x15, 0xac, 0x13, 0xf9, 0x88, 0x53, 0x9d,
    0x9b, 0xe8, 0x3d, 0x7b, 0x0c, 0x30, 0x32, 0x6e, 0x38, 0x4d, 0xa2, 0x75, 0x57, 0x41, 0x6c,
    0x34, 0x5c,
    0x00, 0x04, // cipher suite
    0x00, // compression: null
];

/// Client half of the fake TLS exchange: send the canned hello, read and
/// verify the server's.
pub(crate) async fn pseudo_ssl_client(stream: &mut TcpStream) -> Result<()> {
    stream.write_all(&PSEUDO_SSL_CLIENT_HELLO).await?;

    let mut hello = [0u8; PSEUDO_SSL_SERVER_HELLO.len()];
    stream.read_exact(&mut hello).await?;
    if hello != PSEUDO_SSL_SERVER_HELLO {
        return Err(Error::ErrProxyNegotiationFailed);
    }
    Ok(())
}

/// Server half, for tests and for accepting TLS-type peers.
pub(crate) async fn pseudo_ssl_server(stream: &mut TcpStream) -> Result<()> {
    let mut hello = [0u8; PSEUDO_SSL_CLIENT_HELLO.len()];
    stream.read_exact(&mut hello).await?;
    if hello != PSEUDO_SSL_CLIENT_HELLO {
        return Err(Error::ErrProxyNegotiationFailed);
    }

    stream.write_all(&PSEUDO_SSL_SERVER_HELLO).await?;
    Ok(())
}

pub(crate) fn base64_encode(input: &[u8]) -> String {
    const TABLE: &[u8; 64] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";
    let mut out = String::with_capacity((input.len() + 2) / 3 * 4);
    for chunk in input.chunks(3) {
        let b = [
            chunk[0],
            chunk.get(1).copied().unwrap_or(0),
            chunk.get(2).copied().unwrap_or(0),
        ];
        let n = (u32::from(b[0]) << 16) | (u32::from(b[1]) << 8) | u32::from(b[2]);
        out.push(TABLE[(n >> 18) as usize & 0x3f] as char);
        out.push(TABLE[(n >> 12) as usize & 0x3f] as char);
        out.push(if chunk.len() > 1 {
            TABLE[(n >> 6) as usize & 0x3f] as char
        } else {
            '='
        });
        out.push(if chunk.len() > 2 {
            TABLE[n as usize & 0x3f] as char
        } else {
            '='
        });
    }
    out
}
