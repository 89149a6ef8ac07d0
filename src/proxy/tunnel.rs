use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_socks::tcp::Socks5Stream;
use tokio_util::compat::TokioAsyncReadCompatExt;

use crate::error::TransportError;
use crate::proxy::{Candidate, ProxyKind, ProxySpec};
use crate::transport::stream::TunnelStream;

// Upper bound on the CONNECT response we are willing to buffer.
const MAX_CONNECT_RESPONSE: usize = 8 * 1024;

/// Open a byte stream to `host:port` through the given candidate.
pub async fn open(
    candidate: &Candidate,
    host: &str,
    port: u16,
    connect_timeout: Duration,
) -> Result<TunnelStream, TransportError> {
    match candidate {
        Candidate::Direct => {
            let tcp = connect_tcp(host, port, connect_timeout).await?;
            Ok(TunnelStream::Tcp(tcp.compat()))
        }
        Candidate::Tunnel(spec) => match spec.kind {
            ProxyKind::Http => http_connect(spec, host, port, connect_timeout).await,
            ProxyKind::Socks5 => socks5_connect(spec, host, port, connect_timeout).await,
        },
    }
}

async fn connect_tcp(
    host: &str,
    port: u16,
    connect_timeout: Duration,
) -> Result<TcpStream, TransportError> {
    let attempt = timeout(connect_timeout, TcpStream::connect((host, port))).await;
    match attempt {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(source)) => Err(TransportError::Connect {
            host: host.to_string(),
            port,
            source,
        }),
        Err(_) => Err(TransportError::Connect {
            host: host.to_string(),
            port,
            source: std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timed out"),
        }),
    }
}

/// CONNECT handshake against an HTTP proxy. The proxy answers with a
/// status line and headers; everything after the blank line belongs to
/// the mail server.
async fn http_connect(
    spec: &ProxySpec,
    host: &str,
    port: u16,
    connect_timeout: Duration,
) -> Result<TunnelStream, TransportError> {
    let mut tcp = connect_tcp(&spec.host, spec.port, connect_timeout).await?;

    let mut request = format!("CONNECT {host}:{port} HTTP/1.1\r\nHost: {host}:{port}\r\n");
    if let Some(user) = &spec.username {
        let password = spec.password.as_deref().unwrap_or("");
        let token = BASE64_STANDARD.encode(format!("{user}:{password}"));
        request.push_str(&format!("Proxy-Authorization: Basic {token}\r\n"));
    }
    request.push_str("\r\n");

    let handshake = async {
        tcp.write_all(request.as_bytes()).await?;

        let mut response = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            let n = tcp.read(&mut byte).await?;
            if n == 0 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "proxy closed during CONNECT",
                ));
            }
            response.push(byte[0]);
            if response.ends_with(b"\r\n\r\n") {
                break;
            }
            if response.len() > MAX_CONNECT_RESPONSE {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    "oversized CONNECT response",
                ));
            }
        }
        Ok(response)
    };

    let response = timeout(connect_timeout, handshake)
        .await
        .map_err(|_| TransportError::Tunnel(format!("CONNECT to {host}:{port} timed out")))?
        .map_err(|err| TransportError::Tunnel(err.to_string()))?;

    let status = String::from_utf8_lossy(&response);
    let first_line = status.lines().next().unwrap_or("");
    if !first_line.contains(" 200") {
        return Err(TransportError::Tunnel(format!(
            "proxy refused CONNECT: {first_line}"
        )));
    }

    Ok(TunnelStream::Tcp(tcp.compat()))
}

async fn socks5_connect(
    spec: &ProxySpec,
    host: &str,
    port: u16,
    connect_timeout: Duration,
) -> Result<TunnelStream, TransportError> {
    let proxy = (spec.host.as_str(), spec.port);
    let target = (host, port);

    let attempt = async {
        match &spec.username {
            Some(user) => {
                let password = spec.password.as_deref().unwrap_or("");
                Socks5Stream::connect_with_password(proxy, target, user, password).await
            }
            None => Socks5Stream::connect(proxy, target).await,
        }
    };

    let stream = timeout(connect_timeout, attempt)
        .await
        .map_err(|_| {
            TransportError::Tunnel(format!(
                "SOCKS5 tunnel via {}:{} timed out",
                spec.host, spec.port
            ))
        })?
        .map_err(|err| TransportError::Tunnel(err.to_string()))?;

    Ok(TunnelStream::Socks5(stream.compat()))
}
