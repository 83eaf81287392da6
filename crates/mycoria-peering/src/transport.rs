//! The transport contract and the TCP transport.
//!
//! A transport turns peering URLs into byte streams. Only the contract is
//! normative; further transports (websocket, kcp) plug in behind the same
//! trait.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};

use crate::url::PeeringUrl;

/// Dial deadline.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

/// A peering transport.
pub trait Transport: Send + Sync + 'static {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;
    type Listener: Acceptor<Stream = Self::Stream>;

    /// URL schemes this transport serves.
    fn schemes(&self) -> &'static [&'static str];

    /// Dial a peer, returning the stream and its transport address.
    fn dial(
        &self,
        url: &PeeringUrl,
    ) -> impl std::future::Future<Output = io::Result<(Self::Stream, SocketAddr)>> + Send;

    /// Bind a listener for the given URL (compact form: port only).
    fn listen(
        &self,
        url: &PeeringUrl,
    ) -> impl std::future::Future<Output = io::Result<Self::Listener>> + Send;
}

/// The accepting side of a bound transport.
pub trait Acceptor: Send + 'static {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    fn accept(
        &mut self,
    ) -> impl std::future::Future<Output = io::Result<(Self::Stream, SocketAddr)>> + Send;

    fn local_addr(&self) -> io::Result<SocketAddr>;
}

/// Plain TCP.
#[derive(Clone, Copy, Debug, Default)]
pub struct TcpTransport;

impl Transport for TcpTransport {
    type Stream = TcpStream;
    type Listener = TcpAcceptor;

    fn schemes(&self) -> &'static [&'static str] {
        &["tcp"]
    }

    async fn dial(&self, url: &PeeringUrl) -> io::Result<(Self::Stream, SocketAddr)> {
        let target = url.dial_addr();
        let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(&target))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, format!("dialing {target}")))??;
        stream.set_nodelay(true)?;
        let peer = stream.peer_addr()?;
        Ok((stream, peer))
    }

    async fn listen(&self, url: &PeeringUrl) -> io::Result<Self::Listener> {
        let bind = if url.domain.is_empty() {
            format!("[::]:{}", url.port)
        } else {
            url.dial_addr()
        };
        let listener = TcpListener::bind(&bind).await?;
        Ok(TcpAcceptor { listener })
    }
}

/// Accepts TCP peerings.
pub struct TcpAcceptor {
    listener: TcpListener,
}

impl Acceptor for TcpAcceptor {
    type Stream = TcpStream;

    async fn accept(&mut self) -> io::Result<(Self::Stream, SocketAddr)> {
        let (stream, peer) = self.listener.accept().await?;
        stream.set_nodelay(true)?;
        Ok((stream, peer))
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }
}
