use std::pin::Pin;
use std::task::{Context as TaskContext, Poll};

use async_native_tls::TlsStream;
use futures::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_socks::tcp::Socks5Stream;
use tokio_util::compat::Compat;

use crate::error::TransportError;

/// A connected byte stream to the mail server, before TLS. Either a
/// plain TCP connection (direct, or already carried through an HTTP
/// CONNECT tunnel) or a SOCKS5 tunnel.
pub enum TunnelStream {
    Tcp(Compat<TcpStream>),
    Socks5(Compat<Socks5Stream<TcpStream>>),
}

impl AsyncRead for TunnelStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut [u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            TunnelStream::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            TunnelStream::Socks5(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for TunnelStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            TunnelStream::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            TunnelStream::Socks5(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            TunnelStream::Tcp(s) => Pin::new(s).poll_flush(cx),
            TunnelStream::Socks5(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_close(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            TunnelStream::Tcp(s) => Pin::new(s).poll_close(cx),
            TunnelStream::Socks5(s) => Pin::new(s).poll_close(cx),
        }
    }
}

impl std::fmt::Debug for TunnelStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TunnelStream::Tcp(_) => f.write_str("TunnelStream::Tcp"),
            TunnelStream::Socks5(_) => f.write_str("TunnelStream::Socks5"),
        }
    }
}

/// The stream handed to the mail protocol client: the tunnel, optionally
/// wrapped in TLS.
pub enum MailStream {
    Tls(TlsStream<TunnelStream>),
    Plain(TunnelStream),
}

impl AsyncRead for MailStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut [u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            MailStream::Tls(s) => Pin::new(s).poll_read(cx, buf),
            MailStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for MailStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            MailStream::Tls(s) => Pin::new(s).poll_write(cx, buf),
            MailStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            MailStream::Tls(s) => Pin::new(s).poll_flush(cx),
            MailStream::Plain(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_close(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            MailStream::Tls(s) => Pin::new(s).poll_close(cx),
            MailStream::Plain(s) => Pin::new(s).poll_close(cx),
        }
    }
}

impl std::fmt::Debug for MailStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MailStream::Tls(_) => f.write_str("MailStream::Tls"),
            MailStream::Plain(_) => f.write_str("MailStream::Plain"),
        }
    }
}

/// Wrap the tunnel in TLS when the account asks for it.
///
/// Certificate validation is off: accounts frequently point at mail hosts
/// with self-signed or mismatched certificates, and credentials for them
/// are already stored server-side.
pub async fn secure(
    tunnel: TunnelStream,
    host: &str,
    use_ssl: bool,
) -> Result<MailStream, TransportError> {
    if !use_ssl {
        return Ok(MailStream::Plain(tunnel));
    }
    let connector = async_native_tls::TlsConnector::new().danger_accept_invalid_certs(true);
    let tls = connector.connect(host, tunnel).await?;
    Ok(MailStream::Tls(tls))
}
