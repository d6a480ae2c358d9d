use std::{collections::HashMap, future::Future, sync::Arc};

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::task::JoinHandle;
use rustc_hash::FxHashMap;
use tracing::{debug, info, trace, warn};

use super::{Command, Negotiated};
use crate::{
    extensions::{
        parse_raw_extensions, ClientExtension, ExtensionPayload, PasswordServerPayload,
        ServerExtension, ALL_KINDS,
    },
    flow::{BackpressureGate, GateTransition, ReceiveWindow},
    packet::{CloseReason, ConnectPacket, Packet, Payload, StreamType, WispVersion},
    queue::{stream_queue, QueueReceiver, QueueSender},
    stream::StreamState,
    transport::{write_packet, MuxWriter, TransportRead, TransportWrite},
    upstream::{
        close_reason_for_connect_error, AccessFilter, ConnectionContext, FilterVerdict,
        ProxySocket, SocketConnector, SocketRead, SocketWrite,
    },
    Result, WispError, DEFAULT_BUFFER_SIZE, DEFAULT_HIGH_WATER,
};

/// Server connection settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Per-stream window announced in the initial `CONTINUE`.
    pub buffer_size: u32,
    /// Highest protocol version to speak. Version 1 skips the `INFO` exchange.
    pub version: WispVersion,
    /// Offer UDP streams to version 2 clients.
    pub udp_extension: bool,
    /// Username to password map. When set, clients must authenticate.
    pub passwords: Option<HashMap<String, String>>,
    /// Message of the day sent to version 2 clients.
    pub motd: Option<String>,
    /// Outbound transport depth in bytes at which upstream reads pause.
    pub high_water: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            version: WispVersion::V2,
            udp_extension: true,
            passwords: None,
            motd: None,
            high_water: DEFAULT_HIGH_WATER,
        }
    }
}

impl ServerConfig {
    fn extensions(&self) -> Vec<ServerExtension> {
        let mut extensions = Vec::new();
        if self.udp_extension {
            extensions.push(ServerExtension::Udp);
        }
        if self.passwords.is_some() {
            extensions.push(ServerExtension::PasswordAuth(PasswordServerPayload {
                required: true,
            }));
        }
        if let Some(motd) = &self.motd {
            extensions.push(ServerExtension::Motd(motd.clone()));
        }
        extensions
    }
}

/// Server side of a Wisp connection.
///
/// The server owns every stream: it consults the [`AccessFilter`] for each
/// `CONNECT`, opens destinations through the [`SocketConnector`] and pumps
/// data in both directions until either end closes.
pub struct ServerMux {
    commands: flume::Sender<Command>,
    negotiated: Negotiated<ClientExtension>,
}

impl ServerMux {
    /// Perform the handshake over a freshly accepted transport. On failure
    /// the transport is closed.
    pub async fn new<R, W>(
        mut read: R,
        mut write: W,
        config: ServerConfig,
        filter: Arc<dyn AccessFilter>,
        connector: Arc<dyn SocketConnector>,
    ) -> Result<(Self, impl Future<Output = Result<()>> + Send)>
    where
        R: TransportRead,
        W: TransportWrite,
    {
        let (negotiated, pending) = match handshake(&mut read, &mut write, &config).await {
            Ok(negotiated) => negotiated,
            Err(err) => {
                let _ = write.close().await;
                return Err(err);
            }
        };

        let (commands_tx, commands_rx) = flume::unbounded();
        let (writer, writer_task) = MuxWriter::new(write);
        // stream pumps wait on the writer draining, so it runs on its own
        let writer_task = tokio::spawn(writer_task);

        let connection = ServerConnection {
            read,
            commands: commands_rx,
            links: StreamLinks {
                writer,
                commands: commands_tx.clone(),
                filter,
                connector,
                buffer_size: config.buffer_size,
                high_water: config.high_water,
            },
            streams: FxHashMap::default(),
            udp_allowed: negotiated.allows_udp(),
            pending,
        };

        let mux = Self {
            commands: commands_tx,
            negotiated,
        };
        Ok((mux, connection.run(writer_task)))
    }

    pub fn negotiated(&self) -> &Negotiated<ClientExtension> {
        &self.negotiated
    }

    /// Close every stream and the transport.
    pub async fn close(&self) -> Result<()> {
        self.commands
            .send_async(Command::Shutdown)
            .await
            .map_err(|_| WispError::MuxClosed)
    }
}

/// Returns the negotiated settings and, for a version 1 client, the first
/// frame it sent, which still has to be dispatched.
async fn handshake<R, W>(
    read: &mut R,
    write: &mut W,
    config: &ServerConfig,
) -> Result<(Negotiated<ClientExtension>, Option<Bytes>)>
where
    R: TransportRead,
    W: TransportWrite,
{
    if config.version.major < 2 {
        write_packet(write, Packet::new_continue(0, config.buffer_size)).await?;
        return Ok((Negotiated::v1(), None));
    }

    let offered = config.extensions();
    let info = Packet::new_info(
        config.version,
        offered.iter().map(ExtensionPayload::to_raw).collect(),
    );
    write_packet(write, info).await?;

    let frame = read.next().await.ok_or(WispError::TransportClosed)??;
    let answered = match Packet::decode(frame.clone()) {
        Ok(Packet {
            stream_id: 0,
            payload: Payload::Info(info),
        }) => Some((
            info.version,
            parse_raw_extensions::<ClientExtension>(info.extensions, ALL_KINDS)?,
        )),
        _ => None,
    };

    let Some((version, answered)) = answered else {
        if config.passwords.is_some() {
            return Err(WispError::PasswordAuthRequired);
        }
        debug!("client did not send INFO, falling back to version 1");
        write_packet(write, Packet::new_continue(0, config.buffer_size)).await?;
        return Ok((Negotiated::v1(), Some(frame)));
    };

    if let Some(passwords) = &config.passwords {
        let creds = answered
            .iter()
            .find_map(|ext| match ext {
                ClientExtension::PasswordAuth(creds) => Some(creds),
                _ => None,
            })
            .ok_or(WispError::PasswordAuthRequired)?;
        if passwords.get(&creds.username) != Some(&creds.password) {
            warn!("password authentication failed for user {}", creds.username);
            return Err(WispError::PasswordAuthFailed);
        }
    }

    let extensions = answered
        .into_iter()
        .filter(|ext| {
            ext.kind()
                .is_some_and(|kind| offered.iter().any(|o| o.kind() == Some(kind)))
        })
        .collect();
    write_packet(write, Packet::new_continue(0, config.buffer_size)).await?;

    Ok((
        Negotiated {
            version: version.min(config.version),
            extensions,
        },
        None,
    ))
}

struct ServerStreamEntry {
    stream_type: StreamType,
    host: String,
    state: StreamState,
    inbound: QueueSender,
}

/// What a stream task needs from its connection.
#[derive(Clone)]
struct StreamLinks {
    writer: MuxWriter,
    commands: flume::Sender<Command>,
    filter: Arc<dyn AccessFilter>,
    connector: Arc<dyn SocketConnector>,
    buffer_size: u32,
    high_water: usize,
}

impl StreamLinks {
    fn close(&self, id: u32, reason: CloseReason) {
        let _ = self.commands.send(Command::Close { id, reason });
    }
}

struct ServerConnection<R> {
    read: R,
    commands: flume::Receiver<Command>,
    links: StreamLinks,
    streams: FxHashMap<u32, ServerStreamEntry>,
    udp_allowed: bool,
    pending: Option<Bytes>,
}

impl<R: TransportRead> ServerConnection<R> {
    async fn run(mut self, mut writer_task: JoinHandle<Result<()>>) -> Result<()> {
        let mut writer_done = false;

        if let Some(frame) = self.pending.take() {
            self.dispatch(frame);
        }

        let result = loop {
            tokio::select! {
                frame = self.read.next() => match frame {
                    Some(Ok(frame)) => self.dispatch(frame),
                    Some(Err(err)) => break Err(err),
                    None => break Ok(()),
                },
                command = self.commands.recv_async() => match command {
                    Ok(Command::Shutdown) | Err(_) => {
                        self.teardown(CloseReason::Voluntary, true);
                        break Ok(());
                    }
                    Ok(command) => self.handle_command(command),
                },
                res = &mut writer_task, if !writer_done => {
                    writer_done = true;
                    break match res {
                        Ok(Err(err)) => Err(err),
                        _ => Err(WispError::TransportClosed),
                    };
                }
            }
        };

        self.teardown(CloseReason::Unexpected, false);
        if !writer_done {
            self.links.writer.close();
            let _ = writer_task.await;
        }
        info!("wisp connection closed");
        result
    }

    /// Route one frame. Never waits on a stream, so a slow destination
    /// cannot hold up the rest of the connection.
    fn dispatch(&mut self, frame: Bytes) {
        let packet = match Packet::decode(frame) {
            Ok(packet) => packet,
            Err(err) => {
                warn!("routing a packet failed - {}", err);
                return;
            }
        };
        let id = packet.stream_id;

        match packet.payload {
            Payload::Connect(request) => self.open_stream(id, request),
            Payload::Data(data) => {
                let Some(entry) = self.streams.get(&id) else {
                    warn!("received a DATA packet for stream {} which doesn't exist", id);
                    return;
                };
                // TCP queues are unbounded, the client's credit keeps them short
                if !entry.inbound.try_put(data) {
                    trace!("dropping DATA for stream {}: queue full or closed", id);
                }
            }
            Payload::Continue(_) => {
                warn!("protocol violation: client sent a CONTINUE packet");
            }
            Payload::Close(_) if id == 0 => {
                warn!("protocol violation: client sent a CLOSE packet for stream 0");
            }
            Payload::Close(close) => match self.streams.remove(&id) {
                Some(entry) => {
                    debug!(
                        "stream {} to {} closed by client: {:?}",
                        id, entry.host, close.reason
                    );
                    entry.inbound.close();
                }
                None => warn!("received a CLOSE packet for stream {} which doesn't exist", id),
            },
            Payload::Info(_) => warn!("protocol violation: INFO packet after handshake"),
        }
    }

    fn open_stream(&mut self, id: u32, request: ConnectPacket) {
        if id == 0 {
            warn!("protocol violation: CONNECT packet for stream 0");
            return;
        }
        if self.streams.contains_key(&id) {
            warn!("protocol violation: CONNECT packet for existing stream {}", id);
            return;
        }

        let request = ConnectPacket {
            host: request.host.trim().to_string(),
            ..request
        };
        info!(
            "opening new {:?} stream {} to {}:{}",
            request.stream_type, id, request.host, request.port
        );

        let refusal = match request.stream_type {
            StreamType::Other(_) => Some(CloseReason::ServerStreamInvalidInfo),
            StreamType::Udp if !self.udp_allowed => Some(CloseReason::ServerStreamInvalidInfo),
            _ => None,
        };
        if let Some(reason) = refusal {
            warn!(
                "refusing {:?} stream {}: not negotiated",
                request.stream_type, id
            );
            let _ = self.links.writer.send_packet(Packet::new_close(id, reason));
            return;
        }

        let context = ConnectionContext {
            stream_count: self.streams.len(),
            streams_to_host: self
                .streams
                .values()
                .filter(|entry| entry.host == request.host)
                .count(),
        };
        let capacity = match request.stream_type {
            StreamType::Udp => Some(self.links.buffer_size.max(1) as usize),
            _ => None,
        };
        let (inbound_tx, inbound_rx) = stream_queue(capacity);
        self.streams.insert(
            id,
            ServerStreamEntry {
                stream_type: request.stream_type,
                host: request.host.clone(),
                state: StreamState::Pending,
                inbound: inbound_tx,
            },
        );

        tokio::spawn(run_stream(
            id,
            request,
            context,
            inbound_rx,
            self.links.clone(),
        ));
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Close { id, reason } => {
                let Some(entry) = self.streams.remove(&id) else {
                    debug!("stream {} already closed", id);
                    return;
                };
                if entry.state == StreamState::Open {
                    info!("closing stream to {} for reason {:?}", entry.host, reason);
                } else {
                    debug!("refused stream to {}: {:?}", entry.host, reason);
                }
                entry.inbound.close();
                let _ = self.links.writer.send_packet(Packet::new_close(id, reason));
            }
            Command::Opened { id } => {
                if let Some(entry) = self.streams.get_mut(&id) {
                    entry.state = StreamState::Open;
                }
            }
            Command::Open { .. } | Command::Data { .. } | Command::Shutdown => {}
        }
    }

    fn teardown(&mut self, reason: CloseReason, notify_peer: bool) {
        for (id, entry) in self.streams.drain() {
            if notify_peer {
                let _ = self.links.writer.send_packet(Packet::new_close(id, reason));
            }
            entry.inbound.close();
        }
    }
}

/// Lifecycle of one server stream: filter, connect, then pump both
/// directions until either side ends.
async fn run_stream(
    id: u32,
    request: ConnectPacket,
    context: ConnectionContext,
    inbound: QueueReceiver,
    links: StreamLinks,
) {
    let destination = match links.filter.evaluate(&request, Some(&context)).await {
        FilterVerdict::Allow(destination) => destination,
        FilterVerdict::Deny(reason) => {
            warn!(
                "refusing to create a stream to {}:{}",
                request.host, request.port
            );
            links.close(id, reason);
            return;
        }
    };
    if inbound.is_closed() {
        return;
    }

    let ProxySocket {
        mut read,
        mut write,
    } = match links.connector.connect(&destination).await {
        Ok(socket) => socket,
        Err(err) => {
            warn!(
                "creating a stream to {}:{} failed - {}",
                request.host, request.port, err
            );
            links.close(id, close_reason_for_connect_error(&err));
            return;
        }
    };
    let _ = links.commands.send(Command::Opened { id });

    let window = (request.stream_type == StreamType::Tcp)
        .then(|| ReceiveWindow::new(links.buffer_size));
    let outcome = tokio::select! {
        outcome = socket_to_transport(id, read.as_mut(), &links) => outcome,
        outcome = transport_to_socket(id, &inbound, write.as_mut(), window, &links) => outcome,
    };

    if let Err(err) = write.close().await {
        trace!("closing socket for stream {} failed: {}", id, err);
    }
    if let Some(reason) = outcome {
        links.close(id, reason);
    }
}

/// Destination to client. Not credit-gated; pauses while the transport is
/// backed up.
async fn socket_to_transport(
    id: u32,
    read: &mut dyn SocketRead,
    links: &StreamLinks,
) -> Option<CloseReason> {
    let mut gate = BackpressureGate::new(links.high_water);
    loop {
        if gate.observe(links.writer.buffered_amount()) == Some(GateTransition::Pause) {
            trace!("stream {} paused, transport is backed up", id);
            links.writer.wait_drained(gate.low_water()).await;
            gate.observe(links.writer.buffered_amount());
            trace!("stream {} resumed", id);
        }

        match read.recv().await {
            Ok(Some(data)) => {
                if links.writer.send_packet(Packet::new_data(id, data)).is_err() {
                    return None;
                }
            }
            Ok(None) => return Some(CloseReason::Voluntary),
            Err(err) => {
                debug!("stream {} socket read failed: {}", id, err);
                return Some(CloseReason::Unexpected);
            }
        }
    }
}

/// Client to destination. Grants credit back every half window.
async fn transport_to_socket(
    id: u32,
    inbound: &QueueReceiver,
    write: &mut dyn SocketWrite,
    mut window: Option<ReceiveWindow>,
    links: &StreamLinks,
) -> Option<CloseReason> {
    while let Some(data) = inbound.get().await {
        if let Err(err) = write.send(data).await {
            debug!("stream {} socket write failed: {}", id, err);
            return Some(CloseReason::Unexpected);
        }
        if let Some(remaining) = window
            .as_mut()
            .and_then(|window| window.on_delivered(inbound.len()))
        {
            let _ = links
                .writer
                .send_packet(Packet::new_continue(id, remaining));
        }
    }
    None
}
