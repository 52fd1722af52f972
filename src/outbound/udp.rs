//! UDP transport
//!
//! A connected datagram socket. There is no handshake, so the connect timeout
//! does not apply. `MessageStart .. MessageEnd` on the send side delimits one
//! datagram; each received datagram is relayed as one framed message.

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::net::UdpSocket;

use super::link::{resolve, DialRequest, Dialer, Link, LinkReader, LinkWriter};
use crate::config::Protocol;

const MAX_DATAGRAM: usize = 64 * 1024;

#[derive(Debug, Default, Clone, Copy)]
pub struct UdpDialer;

#[async_trait]
impl Dialer for UdpDialer {
    fn protocol(&self) -> Protocol {
        Protocol::Udp
    }

    fn has_handshake(&self) -> bool {
        false
    }

    async fn dial(&self, request: &DialRequest) -> io::Result<Link> {
        let addrs = resolve(request).await?;
        let peer = addrs[0];
        let local = request.bind.unwrap_or_else(|| match peer {
            SocketAddr::V4(_) => SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
            SocketAddr::V6(_) => SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0)),
        });

        let socket = UdpSocket::bind(local).await?;
        socket.connect(peer).await?;
        let local_addr = socket.local_addr()?;
        tracing::debug!("🔌 UDP socket {} associated with {}", local_addr, peer);

        let socket = Arc::new(socket);
        Ok(Link {
            reader: Box::new(UdpReader {
                socket: socket.clone(),
                buffer: BytesMut::with_capacity(MAX_DATAGRAM),
            }),
            writer: Box::new(UdpWriter {
                socket,
                message: None,
            }),
            local_addr: Some(local_addr),
            peer_addr: Some(peer),
            framed: true,
        })
    }
}

struct UdpReader {
    socket: Arc<UdpSocket>,
    buffer: BytesMut,
}

#[async_trait]
impl LinkReader for UdpReader {
    async fn read(&mut self) -> io::Result<Option<Bytes>> {
        self.buffer.clear();
        self.buffer.reserve(MAX_DATAGRAM);
        self.socket.recv_buf(&mut self.buffer).await?;
        Ok(Some(self.buffer.split().freeze()))
    }
}

struct UdpWriter {
    socket: Arc<UdpSocket>,
    message: Option<BytesMut>,
}

#[async_trait]
impl LinkWriter for UdpWriter {
    async fn write(&mut self, data: Bytes) -> io::Result<()> {
        match &mut self.message {
            Some(message) => {
                message.extend_from_slice(&data);
                Ok(())
            }
            None => self.socket.send(&data).await.map(|_| ()),
        }
    }

    async fn message_start(&mut self) -> io::Result<()> {
        self.message = Some(BytesMut::new());
        Ok(())
    }

    async fn message_end(&mut self) -> io::Result<()> {
        match self.message.take() {
            Some(message) => self.socket.send(&message).await.map(|_| ()),
            None => Ok(()),
        }
    }

    async fn shutdown(&mut self) -> io::Result<()> {
        self.message = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_framed_datagrams() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = server.local_addr().unwrap().port();

        let mut link = UdpDialer.dial(&DialRequest::new("127.0.0.1", port)).await.unwrap();
        assert!(link.framed);
        assert!(!UdpDialer.has_handshake());

        // one message, two writes, one datagram
        link.writer.message_start().await.unwrap();
        link.writer.write(Bytes::from_static(b"ab")).await.unwrap();
        link.writer.write(Bytes::from_static(b"cd")).await.unwrap();
        link.writer.message_end().await.unwrap();

        let mut buf = [0u8; 64];
        let (n, from) = server.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"abcd");
        assert_eq!(Some(from), link.local_addr);

        server.send_to(b"pong", from).await.unwrap();
        assert_eq!(link.reader.read().await.unwrap(), Some(Bytes::from_static(b"pong")));
    }

    #[tokio::test]
    async fn test_unframed_write_is_one_datagram() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = server.local_addr().unwrap().port();
        let mut link = UdpDialer.dial(&DialRequest::new("127.0.0.1", port)).await.unwrap();

        link.writer.write(Bytes::from_static(b"raw")).await.unwrap();
        let mut buf = [0u8; 64];
        let (n, _) = server.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"raw");
    }
}
