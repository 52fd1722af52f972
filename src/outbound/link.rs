//! Transport capability traits
//!
//! The outbound state machine is written once against these traits; TCP and
//! UDP differ only in how a [`Link`] is dialed and how message boundaries are
//! treated on the wire.

use std::io;
use std::net::SocketAddr;

use async_trait::async_trait;
use bytes::Bytes;

use crate::config::Protocol;

/// Read half of an established link
#[async_trait]
pub trait LinkReader: Send {
    /// Next chunk (stream) or datagram; `Ok(None)` once the peer has closed.
    ///
    /// Must be cancel safe: it is raced against timers and the send queue.
    async fn read(&mut self) -> io::Result<Option<Bytes>>;
}

/// Write half of an established link
#[async_trait]
pub trait LinkWriter: Send {
    async fn write(&mut self, data: Bytes) -> io::Result<()>;

    /// Open a message; datagram transports collect data until `message_end`
    async fn message_start(&mut self) -> io::Result<()> {
        Ok(())
    }

    async fn message_end(&mut self) -> io::Result<()> {
        Ok(())
    }

    async fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }

    /// Half-close the write direction
    async fn shutdown(&mut self) -> io::Result<()>;
}

/// An established transport session
pub struct Link {
    pub reader: Box<dyn LinkReader>,
    pub writer: Box<dyn LinkWriter>,
    pub local_addr: Option<SocketAddr>,
    pub peer_addr: Option<SocketAddr>,
    /// Received units are datagrams and are relayed as framed messages
    pub framed: bool,
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link")
            .field("local_addr", &self.local_addr)
            .field("peer_addr", &self.peer_addr)
            .field("framed", &self.framed)
            .finish()
    }
}

/// Everything a dialer needs for one attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DialRequest {
    pub host: String,
    pub port: u16,
    pub bind: Option<SocketAddr>,
    pub keep_alive: bool,
    pub no_delay: bool,
}

impl DialRequest {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            bind: None,
            keep_alive: false,
            no_delay: false,
        }
    }

    pub fn target(&self) -> String {
        crate::address::format_host_port(&self.host, self.port)
    }
}

/// Connect-phase behaviour of a transport
#[async_trait]
pub trait Dialer: Send + Sync {
    fn protocol(&self) -> Protocol;

    /// Whether dialing involves a handshake the connect timeout applies to
    fn has_handshake(&self) -> bool {
        true
    }

    async fn dial(&self, request: &DialRequest) -> io::Result<Link>;
}

/// Resolve `request`'s target, keeping only addresses usable from its bind address
pub(crate) async fn resolve(request: &DialRequest) -> io::Result<Vec<SocketAddr>> {
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((request.host.as_str(), request.port))
        .await?
        .filter(|addr| match request.bind {
            Some(bind) => bind.is_ipv4() == addr.is_ipv4(),
            None => true,
        })
        .collect();

    if addrs.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            format!("no usable address for {}", request.target()),
        ));
    }
    Ok(addrs)
}
