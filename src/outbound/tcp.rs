//! TCP transport

use std::io;
use std::net::SocketAddr;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpSocket, TcpStream};

use super::link::{resolve, DialRequest, Dialer, Link, LinkReader, LinkWriter};
use crate::config::Protocol;

const READ_CHUNK: usize = 16 * 1024;

#[derive(Debug, Default, Clone, Copy)]
pub struct TcpDialer;

#[async_trait]
impl Dialer for TcpDialer {
    fn protocol(&self) -> Protocol {
        Protocol::Tcp
    }

    async fn dial(&self, request: &DialRequest) -> io::Result<Link> {
        let mut last_error = None;
        for addr in resolve(request).await? {
            match connect_one(addr, request).await {
                Ok(stream) => return link(stream),
                Err(e) => {
                    tracing::debug!("🔌 TCP connect to {} failed: {}", addr, e);
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| io::Error::from(io::ErrorKind::AddrNotAvailable)))
    }
}

async fn connect_one(addr: SocketAddr, request: &DialRequest) -> io::Result<TcpStream> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    if request.keep_alive {
        socket.set_keepalive(true)?;
    }
    if let Some(bind) = request.bind {
        socket.bind(bind)?;
    }

    let stream = socket.connect(addr).await?;
    if request.no_delay {
        stream.set_nodelay(true)?;
    }
    Ok(stream)
}

fn link(stream: TcpStream) -> io::Result<Link> {
    let local_addr = stream.local_addr()?;
    let peer_addr = stream.peer_addr()?;
    let (read_half, write_half) = stream.into_split();

    Ok(Link {
        reader: Box::new(TcpReader {
            inner: read_half,
            buffer: BytesMut::with_capacity(READ_CHUNK),
        }),
        writer: Box::new(TcpWriter { inner: write_half }),
        local_addr: Some(local_addr),
        peer_addr: Some(peer_addr),
        framed: false,
    })
}

struct TcpReader {
    inner: OwnedReadHalf,
    buffer: BytesMut,
}

#[async_trait]
impl LinkReader for TcpReader {
    async fn read(&mut self) -> io::Result<Option<Bytes>> {
        self.buffer.reserve(READ_CHUNK);
        match self.inner.read_buf(&mut self.buffer).await? {
            0 => Ok(None),
            _ => Ok(Some(self.buffer.split().freeze())),
        }
    }
}

struct TcpWriter {
    inner: OwnedWriteHalf,
}

#[async_trait]
impl LinkWriter for TcpWriter {
    async fn write(&mut self, data: Bytes) -> io::Result<()> {
        self.inner.write_all(&data).await
    }

    async fn flush(&mut self) -> io::Result<()> {
        self.inner.flush().await
    }

    async fn shutdown(&mut self) -> io::Result<()> {
        self.inner.shutdown().await
    }
}
