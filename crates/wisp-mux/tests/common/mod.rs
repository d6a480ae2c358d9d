#![allow(dead_code)]

use std::{
    io,
    pin::Pin,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Sink, SinkExt, Stream, StreamExt};
use wisp_mux::{
    packet::{CloseReason, ConnectPacket, Packet, Payload, WispVersion},
    upstream::{
        AccessFilter, ConnectionContext, FilterVerdict, ProxySocket, SocketConnector, SocketRead,
        SocketWrite,
    },
    ClientConfig, ClientMux, ServerConfig, ServerMux, WispError,
};

pub const TIMEOUT: Duration = Duration::from_secs(2);
pub const QUIET: Duration = Duration::from_millis(150);

pub type Read = Pin<Box<dyn Stream<Item = Result<Bytes, WispError>> + Send>>;
pub type Write = Pin<Box<dyn Sink<Bytes, Error = WispError> + Send>>;

fn half(tx: flume::Sender<Bytes>, rx: flume::Receiver<Bytes>) -> (Read, Write) {
    let read: Read = Box::pin(rx.into_stream().map(Ok));
    let write: Write = Box::pin(
        tx.into_sink()
            .sink_map_err(|_| WispError::TransportClosed),
    );
    (read, write)
}

/// Two connected in-memory message transports.
pub fn duplex() -> ((Read, Write), (Read, Write)) {
    let (a_tx, a_rx) = flume::unbounded();
    let (b_tx, b_rx) = flume::unbounded();
    (half(a_tx, b_rx), half(b_tx, a_rx))
}

/// Like [`duplex`], but the second end can only have `capacity` frames in
/// flight towards the first, so its writes stall until the first end reads.
pub fn duplex_bounded(capacity: usize) -> ((Read, Write), (Read, Write)) {
    let (a_tx, a_rx) = flume::unbounded();
    let (b_tx, b_rx) = flume::bounded(capacity);
    (half(a_tx, b_rx), half(b_tx, a_rx))
}

/// A hand-driven peer speaking raw frames.
pub struct RawPeer {
    pub read: Read,
    pub write: Write,
}

impl RawPeer {
    pub fn new((read, write): (Read, Write)) -> Self {
        Self { read, write }
    }

    pub async fn send(&mut self, packet: Packet) {
        self.send_raw(packet.encode()).await;
    }

    pub async fn send_raw(&mut self, frame: Bytes) {
        self.write.send(frame).await.expect("transport closed");
    }

    pub async fn recv(&mut self) -> Packet {
        let frame = tokio::time::timeout(TIMEOUT, self.read.next())
            .await
            .expect("timed out waiting for a packet")
            .expect("transport closed")
            .expect("transport error");
        Packet::decode(frame).expect("malformed packet")
    }

    /// Next packet that is not `DATA`.
    pub async fn recv_control(&mut self) -> Packet {
        loop {
            let packet = self.recv().await;
            if !matches!(packet.payload, Payload::Data(_)) {
                return packet;
            }
        }
    }

    /// Assert nothing arrives for a short while.
    pub async fn expect_quiet(&mut self) {
        if let Ok(frame) = tokio::time::timeout(QUIET, self.read.next()).await {
            panic!("unexpected frame: {:?}", frame.map(|f| f.map(Packet::decode)));
        }
    }

    /// Whether the other side has closed the transport.
    pub async fn closed(&mut self) -> bool {
        loop {
            match tokio::time::timeout(TIMEOUT, self.read.next()).await {
                Ok(None) | Ok(Some(Err(_))) => return true,
                Ok(Some(Ok(_))) => continue,
                Err(_) => return false,
            }
        }
    }
}

/// The far end of a socket handed out by [`MockConnector`].
pub struct Remote {
    pub destination: ConnectPacket,
    /// Feed data the destination "sends" back. Dropping it is end of stream.
    pub to_client: flume::Sender<Bytes>,
    /// Data the server wrote to the destination.
    pub from_client: flume::Receiver<Bytes>,
}

impl Remote {
    pub async fn recv(&self) -> Option<Bytes> {
        tokio::time::timeout(TIMEOUT, self.from_client.recv_async())
            .await
            .expect("timed out waiting for socket data")
            .ok()
    }

    /// Echo everything back until the server closes the socket.
    pub fn echo(self) {
        tokio::spawn(async move {
            while let Ok(data) = self.from_client.recv_async().await {
                if self.to_client.send_async(data).await.is_err() {
                    break;
                }
            }
        });
    }
}

struct MockRead(flume::Receiver<Bytes>);

#[async_trait]
impl SocketRead for MockRead {
    async fn recv(&mut self) -> io::Result<Option<Bytes>> {
        Ok(self.0.recv_async().await.ok())
    }
}

struct MockWrite(Option<flume::Sender<Bytes>>);

#[async_trait]
impl SocketWrite for MockWrite {
    async fn send(&mut self, data: Bytes) -> io::Result<()> {
        let tx = self.0.as_ref().ok_or(io::ErrorKind::BrokenPipe)?;
        tx.send_async(data)
            .await
            .map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe))
    }

    async fn close(&mut self) -> io::Result<()> {
        self.0.take();
        Ok(())
    }
}

/// Hands every opened socket to the test through `remotes`.
pub struct MockConnector {
    pub connects: AtomicUsize,
    pub fail: Option<io::ErrorKind>,
    /// Room for socket writes the remote has not read yet. `None` is unbounded.
    socket_capacity: Option<usize>,
    remotes: flume::Sender<Remote>,
}

impl MockConnector {
    pub fn new() -> (Arc<Self>, flume::Receiver<Remote>) {
        Self::with_failure(None)
    }

    pub fn with_failure(fail: Option<io::ErrorKind>) -> (Arc<Self>, flume::Receiver<Remote>) {
        let (remotes, rx) = flume::unbounded();
        let connector = Self {
            connects: AtomicUsize::new(0),
            fail,
            socket_capacity: None,
            remotes,
        };
        (Arc::new(connector), rx)
    }

    /// Socket writes only complete once the remote reads them.
    pub fn gated() -> (Arc<Self>, flume::Receiver<Remote>) {
        let (remotes, rx) = flume::unbounded();
        let connector = Self {
            connects: AtomicUsize::new(0),
            fail: None,
            socket_capacity: Some(0),
            remotes,
        };
        (Arc::new(connector), rx)
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SocketConnector for MockConnector {
    async fn connect(&self, destination: &ConnectPacket) -> io::Result<ProxySocket> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if let Some(kind) = self.fail {
            return Err(kind.into());
        }
        let (to_client, socket_rx) = flume::unbounded();
        let (socket_tx, from_client) = match self.socket_capacity {
            Some(capacity) => flume::bounded(capacity),
            None => flume::unbounded(),
        };
        let _ = self.remotes.send(Remote {
            destination: destination.clone(),
            to_client,
            from_client,
        });
        Ok(ProxySocket::new(MockRead(socket_rx), MockWrite(Some(socket_tx))))
    }
}

pub async fn next_remote(remotes: &flume::Receiver<Remote>) -> Remote {
    tokio::time::timeout(TIMEOUT, remotes.recv_async())
        .await
        .expect("timed out waiting for a socket")
        .expect("connector dropped")
}

/// Blocks SMTP, allows everything else.
pub struct PortFilter;

#[async_trait]
impl AccessFilter for PortFilter {
    async fn evaluate(
        &self,
        request: &ConnectPacket,
        _: Option<&ConnectionContext>,
    ) -> FilterVerdict {
        if request.port == 25 {
            FilterVerdict::Deny(CloseReason::ServerStreamBlockedAddress)
        } else {
            FilterVerdict::Allow(request.clone())
        }
    }
}

/// A server mux on one end of an in-memory transport.
pub async fn spawn_server(
    transport: (Read, Write),
    config: ServerConfig,
    connector: Arc<MockConnector>,
) -> Result<ServerMux, WispError> {
    let (read, write) = transport;
    let (mux, task) = ServerMux::new(read, write, config, Arc::new(PortFilter), connector).await?;
    tokio::spawn(task);
    Ok(mux)
}

/// A connected client and server pair.
pub async fn pair(
    server_config: ServerConfig,
    client_config: ClientConfig,
) -> (
    ClientMux,
    ServerMux,
    Arc<MockConnector>,
    flume::Receiver<Remote>,
) {
    let (client_end, server_end) = duplex();
    let (connector, remotes) = MockConnector::new();
    let server = spawn_server(server_end, server_config, connector.clone());
    let client = async {
        let (read, write) = client_end;
        let (mux, task) = ClientMux::new(read, write, client_config).await?;
        tokio::spawn(task);
        Ok::<_, WispError>(mux)
    };
    let (server, client) = tokio::join!(server, client);
    (
        client.expect("client handshake failed"),
        server.expect("server handshake failed"),
        connector,
        remotes,
    )
}

/// A server mux driven by a raw client that completed a version 2
/// handshake without accepting any extension.
pub async fn raw_client(
    config: ServerConfig,
) -> (
    RawPeer,
    ServerMux,
    Arc<MockConnector>,
    flume::Receiver<Remote>,
) {
    let (connector, remotes) = MockConnector::new();
    let (peer, server) = raw_client_with(duplex(), config, connector.clone()).await;
    (peer, server, connector, remotes)
}

/// [`raw_client`] over a caller-supplied transport and connector.
pub async fn raw_client_with(
    (client_end, server_end): ((Read, Write), (Read, Write)),
    config: ServerConfig,
    connector: Arc<MockConnector>,
) -> (RawPeer, ServerMux) {
    let mut peer = RawPeer::new(client_end);
    let window = config.buffer_size;
    let v2 = config.version.major >= 2;

    let server = spawn_server(server_end, config, connector);
    let handshake = async {
        if v2 {
            let info = peer.recv().await;
            assert!(matches!(info.payload, Payload::Info(_)), "expected INFO, got {:?}", info);
            peer.send(Packet::new_info(WispVersion::V2, Vec::new())).await;
        }
        assert_eq!(peer.recv().await, Packet::new_continue(0, window));
    };
    let (server, ()) = tokio::join!(server, handshake);
    (peer, server.expect("server handshake failed"))
}

/// A client mux driven by a raw version 1 server announcing `window`.
pub async fn raw_server(
    window: u32,
) -> (
    RawPeer,
    ClientMux,
    tokio::task::JoinHandle<Result<(), WispError>>,
) {
    let (client_end, server_end) = duplex();
    let mut peer = RawPeer::new(server_end);
    peer.send(Packet::new_continue(0, window)).await;
    let (read, write) = client_end;
    let (mux, task) = ClientMux::new(read, write, ClientConfig::default())
        .await
        .expect("client handshake failed");
    (peer, mux, tokio::spawn(task))
}
