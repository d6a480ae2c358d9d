//! Destination sockets for proxied TCP/UDP streams

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, UdpSocket};
use tokio_util::codec::{BytesCodec, FramedRead};
use tracing::trace;
use wisp_mux::packet::{ConnectPacket, StreamType};
use wisp_mux::upstream::{ProxySocket, SocketConnector, SocketRead, SocketWrite};

/// Max UDP packet size
const MAX_DATAGRAM_SIZE: usize = 65507;

/// Opens real sockets for streams the filter allowed. Expects the
/// destination host to be an IP address.
pub struct TokioSocketConnector {
    buffer_size: usize,
}

impl TokioSocketConnector {
    /// `buffer_size` is the read buffer for TCP sockets.
    pub fn new(buffer_size: usize) -> Self {
        Self {
            buffer_size: buffer_size.max(1),
        }
    }
}

fn socket_addr(destination: &ConnectPacket) -> io::Result<SocketAddr> {
    let ip: IpAddr = destination.host.parse().map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("Invalid IP address: {}", destination.host),
        )
    })?;
    Ok(SocketAddr::new(ip, destination.port))
}

#[async_trait]
impl SocketConnector for TokioSocketConnector {
    async fn connect(&self, destination: &ConnectPacket) -> io::Result<ProxySocket> {
        let addr = socket_addr(destination)?;
        match destination.stream_type {
            StreamType::Tcp => {
                let stream = TcpStream::connect(addr).await?;
                // Enable TCP_NODELAY for lower latency
                let _ = stream.set_nodelay(true);
                Ok(split_tcp(stream, self.buffer_size))
            }
            StreamType::Udp => {
                let bind_addr = if addr.is_ipv4() {
                    SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), 0)
                } else {
                    SocketAddr::new(Ipv6Addr::UNSPECIFIED.into(), 0)
                };
                let socket = UdpSocket::bind(bind_addr).await?;
                socket.connect(addr).await?;
                Ok(UdpSocketHalf::split(socket))
            }
            StreamType::Other(_) => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "Unsupported stream type",
            )),
        }
    }
}

fn split_tcp(stream: TcpStream, buffer_size: usize) -> ProxySocket {
    let (read, write) = stream.into_split();
    ProxySocket::new(
        TcpRead(FramedRead::with_capacity(read, BytesCodec::new(), buffer_size)),
        TcpWrite(write),
    )
}

struct TcpRead(FramedRead<OwnedReadHalf, BytesCodec>);

#[async_trait]
impl SocketRead for TcpRead {
    async fn recv(&mut self) -> io::Result<Option<Bytes>> {
        self.0.next().await.transpose().map(|chunk| chunk.map(|c| c.freeze()))
    }
}

struct TcpWrite(OwnedWriteHalf);

#[async_trait]
impl SocketWrite for TcpWrite {
    async fn send(&mut self, data: Bytes) -> io::Result<()> {
        self.0.write_all(&data).await
    }

    async fn close(&mut self) -> io::Result<()> {
        self.0.shutdown().await
    }
}

/// One half of a connected UDP socket. Each payload is one datagram.
struct UdpSocketHalf(Arc<UdpSocket>);

impl UdpSocketHalf {
    fn split(socket: UdpSocket) -> ProxySocket {
        let socket = Arc::new(socket);
        ProxySocket::new(Self(socket.clone()), Self(socket))
    }
}

#[async_trait]
impl SocketRead for UdpSocketHalf {
    async fn recv(&mut self) -> io::Result<Option<Bytes>> {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        let n = self.0.recv(&mut buf).await?;
        buf.truncate(n);
        Ok(Some(Bytes::from(buf)))
    }
}

#[async_trait]
impl SocketWrite for UdpSocketHalf {
    async fn send(&mut self, data: Bytes) -> io::Result<()> {
        let sent = self.0.send(&data).await?;
        if sent < data.len() {
            trace!("UDP datagram truncated: {} of {} bytes", sent, data.len());
        }
        Ok(())
    }

    async fn close(&mut self) -> io::Result<()> {
        Ok(())
    }
}
