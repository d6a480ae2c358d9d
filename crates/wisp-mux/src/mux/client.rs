use std::{
    future::Future,
    pin::pin,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use bytes::Bytes;
use futures::StreamExt;
use rustc_hash::FxHashMap;
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

use super::{Command, Negotiated};
use crate::{
    extensions::{
        parse_raw_extensions, ClientExtension, ExtensionPayload, PasswordClientPayload,
        ServerExtension, ALL_KINDS,
    },
    flow::SendCredit,
    packet::{CloseReason, Packet, Payload, StreamType, WispVersion},
    queue::{stream_queue, QueueSender},
    stream::{MuxStream, StreamShared},
    transport::{read_packet, write_packet, MuxWriter, TransportRead, TransportWrite},
    Result, WispError,
};

/// Client connection settings.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Highest protocol version to speak.
    pub version: WispVersion,
    /// Accept the server's UDP extension.
    pub udp_extension: bool,
    /// Credentials for servers offering password authentication.
    pub credentials: Option<PasswordClientPayload>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            version: WispVersion::V2,
            udp_extension: true,
            credentials: None,
        }
    }
}

/// Client side of a Wisp connection.
///
/// Created by [`ClientMux::new`], which also returns the future driving the
/// connection. That future must be polled (usually spawned) for streams to
/// make progress; it resolves when the transport closes or the mux is
/// closed.
pub struct ClientMux {
    commands: flume::Sender<Command>,
    negotiated: Negotiated<ServerExtension>,
    closed: Arc<AtomicBool>,
}

impl ClientMux {
    /// Perform the handshake over a fresh transport.
    pub async fn new<R, W>(
        mut read: R,
        mut write: W,
        config: ClientConfig,
    ) -> Result<(Self, impl Future<Output = Result<()>> + Send)>
    where
        R: TransportRead,
        W: TransportWrite,
    {
        let (negotiated, window) = handshake(&mut read, &mut write, &config).await?;
        debug!(
            "wisp client connected: version {}.{}, buffer size {}, extensions {:?}",
            negotiated.version.major, negotiated.version.minor, window, negotiated.extensions
        );

        let (commands_tx, commands_rx) = flume::unbounded();
        let (writer, writer_task) = MuxWriter::new(write);
        let closed = Arc::new(AtomicBool::new(false));

        let connection = ClientConnection {
            read,
            writer,
            commands: commands_rx,
            streams: FxHashMap::default(),
            next_id: 1,
            window,
            closed: closed.clone(),
        };

        let mux = Self {
            commands: commands_tx,
            negotiated,
            closed,
        };
        Ok((mux, connection.run(writer_task)))
    }

    pub fn negotiated(&self) -> &Negotiated<ServerExtension> {
        &self.negotiated
    }

    /// The server's message of the day, if it sent one.
    pub fn motd(&self) -> Option<&str> {
        self.negotiated.extensions.iter().find_map(|ext| match ext {
            ServerExtension::Motd(motd) => Some(motd.as_str()),
            _ => None,
        })
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Open a new stream to `host:port`.
    pub async fn connect(
        &self,
        stream_type: StreamType,
        host: impl Into<String>,
        port: u16,
    ) -> Result<MuxStream> {
        if self.is_closed() {
            return Err(WispError::MuxClosed);
        }
        if stream_type == StreamType::Udp && !self.negotiated.allows_udp() {
            return Err(WispError::UdpExtensionNotSupported);
        }

        let (inbound_tx, inbound_rx) = stream_queue(None);
        let shared = Arc::new(StreamShared::default());
        let (reply, opened) = oneshot::channel();
        self.commands
            .send_async(Command::Open {
                stream_type,
                host: host.into(),
                port,
                inbound: inbound_tx,
                shared: shared.clone(),
                reply,
            })
            .await
            .map_err(|_| WispError::MuxClosed)?;
        let id = opened.await.map_err(|_| WispError::MuxClosed)??;

        Ok(MuxStream::new(
            id,
            stream_type,
            inbound_rx,
            self.commands.clone(),
            shared,
        ))
    }

    /// Close every stream and the transport.
    pub async fn close(&self) -> Result<()> {
        self.commands
            .send_async(Command::Shutdown)
            .await
            .map_err(|_| WispError::MuxClosed)
    }
}

/// Next free stream id after wrapping, skipping 0 and ids still in use.
fn allocate_id<V>(next_id: &mut u32, streams: &FxHashMap<u32, V>) -> Option<u32> {
    for _ in 0..streams.len() + 2 {
        let id = *next_id;
        *next_id = next_id.wrapping_add(1);
        if id != 0 && !streams.contains_key(&id) {
            return Some(id);
        }
    }
    None
}

async fn handshake<R, W>(
    read: &mut R,
    write: &mut W,
    config: &ClientConfig,
) -> Result<(Negotiated<ServerExtension>, u32)>
where
    R: TransportRead,
    W: TransportWrite,
{
    let (packet, _) = read_packet(read).await?;
    let negotiated = match packet.payload {
        Payload::Continue(cont) if packet.stream_id == 0 => {
            return Ok((Negotiated::v1(), cont.buffer_remaining));
        }
        Payload::Info(info) if packet.stream_id == 0 => {
            if config.version.major < 2 {
                // answer explicitly so a version 2 server does not wait on us
                write_packet(write, Packet::new_info(WispVersion::V1, Vec::new())).await?;
                Negotiated::v1()
            } else {
                let offered: Vec<ServerExtension> =
                    parse_raw_extensions(info.extensions, ALL_KINDS)?;
                let (reply, accepted) = select_extensions(&offered, config)?;
                let reply = reply.iter().map(ExtensionPayload::to_raw).collect();
                write_packet(write, Packet::new_info(config.version, reply)).await?;
                Negotiated {
                    version: info.version.min(config.version),
                    extensions: accepted,
                }
            }
        }
        other => {
            return Err(WispError::UnexpectedHandshakePacket(
                other.packet_type().name(),
            ))
        }
    };

    let (packet, _) = read_packet(read).await?;
    match packet.payload {
        Payload::Continue(cont) if packet.stream_id == 0 => Ok((negotiated, cont.buffer_remaining)),
        other => Err(WispError::UnexpectedHandshakePacket(
            other.packet_type().name(),
        )),
    }
}

/// Answer each offered extension we support. Returns our reply and the
/// server extensions that were accepted.
fn select_extensions(
    offered: &[ServerExtension],
    config: &ClientConfig,
) -> Result<(Vec<ClientExtension>, Vec<ServerExtension>)> {
    let mut reply = Vec::new();
    let mut accepted = Vec::new();
    for ext in offered {
        let answer = match ext {
            ServerExtension::Udp if config.udp_extension => Some(ClientExtension::Udp),
            ServerExtension::PasswordAuth(server) => match &config.credentials {
                Some(creds) => {
                    creds.validate()?;
                    Some(ClientExtension::PasswordAuth(creds.clone()))
                }
                None if server.required => return Err(WispError::PasswordAuthRequired),
                None => None,
            },
            ServerExtension::Motd(_) => Some(ClientExtension::Motd),
            _ => None,
        };
        if let Some(answer) = answer {
            reply.push(answer);
            accepted.push(ext.clone());
        }
    }
    Ok((reply, accepted))
}

struct ClientStreamEntry {
    credit: SendCredit,
    inbound: QueueSender,
    shared: Arc<StreamShared>,
}

struct ClientConnection<R> {
    read: R,
    writer: MuxWriter,
    commands: flume::Receiver<Command>,
    streams: FxHashMap<u32, ClientStreamEntry>,
    next_id: u32,
    /// Initial credit for new TCP streams.
    window: u32,
    closed: Arc<AtomicBool>,
}

impl<R: TransportRead> ClientConnection<R> {
    async fn run(mut self, writer_task: impl Future<Output = Result<()>> + Send) -> Result<()> {
        let mut writer_task = pin!(writer_task);
        let mut writer_done = false;

        let result = loop {
            tokio::select! {
                frame = self.read.next() => match frame {
                    Some(Ok(frame)) => self.dispatch(frame),
                    Some(Err(err)) => break Err(err),
                    None => break Err(WispError::TransportClosed),
                },
                command = self.commands.recv_async() => match command {
                    Ok(Command::Shutdown) | Err(_) => break Ok(()),
                    Ok(command) => self.handle_command(command),
                },
                res = &mut writer_task, if !writer_done => {
                    writer_done = true;
                    break res.and(Err(WispError::TransportClosed));
                }
            }
        };

        match &result {
            Ok(()) => self.teardown(CloseReason::Voluntary, true),
            Err(err) => {
                debug!("wisp client connection ended: {}", err);
                self.teardown(CloseReason::Unexpected, false);
            }
        }
        if !writer_done {
            self.writer.close();
            let _ = writer_task.await;
        }
        result
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Open {
                stream_type,
                host,
                port,
                inbound,
                shared,
                reply,
            } => {
                let Some(id) = allocate_id(&mut self.next_id, &self.streams) else {
                    let _ = reply.send(Err(WispError::StreamIdsExhausted));
                    return;
                };
                let credit = match stream_type {
                    StreamType::Udp => SendCredit::unlimited(),
                    _ => SendCredit::limited(self.window),
                };
                trace!("opening stream {} to {}:{}", id, host, port);
                self.streams.insert(
                    id,
                    ClientStreamEntry {
                        credit,
                        inbound,
                        shared,
                    },
                );
                let _ = self
                    .writer
                    .send_packet(Packet::new_connect(id, stream_type, host, port));
                if reply.send(Ok(id)).is_err() {
                    // the caller gave up before getting its stream
                    self.close_stream(id, CloseReason::Voluntary);
                }
            }
            Command::Data { id, data } => {
                let Some(entry) = self.streams.get_mut(&id) else {
                    debug!("dropping data for closed stream {}", id);
                    return;
                };
                match entry.credit.submit(data) {
                    Some(data) => {
                        let _ = self.writer.send_packet(Packet::new_data(id, data));
                    }
                    None => trace!(
                        "stream {} out of credit, {} packets queued",
                        id,
                        entry.credit.queued()
                    ),
                }
            }
            Command::Close { id, reason } => self.close_stream(id, reason),
            Command::Opened { .. } | Command::Shutdown => {}
        }
    }

    fn close_stream(&mut self, id: u32, reason: CloseReason) {
        let Some(entry) = self.streams.remove(&id) else {
            debug!("stream {} already closed", id);
            return;
        };
        entry.shared.mark_closed(reason);
        entry.inbound.close();
        let _ = self.writer.send_packet(Packet::new_close(id, reason));
    }

    fn dispatch(&mut self, frame: Bytes) {
        let packet = match Packet::decode(frame) {
            Ok(packet) => packet,
            Err(err) => {
                warn!("dropping malformed packet: {}", err);
                return;
            }
        };
        let id = packet.stream_id;

        match packet.payload {
            Payload::Data(data) => match self.streams.get(&id) {
                Some(entry) => {
                    entry.inbound.try_put(data);
                }
                None => warn!("received a DATA packet for stream {} which doesn't exist", id),
            },
            Payload::Continue(cont) if id == 0 => {
                debug!("server set buffer size to {}", cont.buffer_remaining);
                self.window = cont.buffer_remaining;
            }
            Payload::Continue(cont) => match self.streams.get_mut(&id) {
                Some(entry) => {
                    for data in entry.credit.grant(cont.buffer_remaining) {
                        let _ = self.writer.send_packet(Packet::new_data(id, data));
                    }
                }
                None => warn!("received a CONTINUE packet for stream {} which doesn't exist", id),
            },
            Payload::Close(_) if id == 0 => {
                warn!("protocol violation: server sent a CLOSE packet for stream 0");
            }
            Payload::Close(close) => match self.streams.remove(&id) {
                Some(entry) => {
                    debug!("stream {} closed by server: {:?}", id, close.reason);
                    entry.shared.mark_closed(close.reason);
                    entry.inbound.close();
                }
                None => warn!("received a CLOSE packet for stream {} which doesn't exist", id),
            },
            Payload::Connect(_) => warn!("protocol violation: server sent a CONNECT packet"),
            Payload::Info(_) => warn!("protocol violation: INFO packet after handshake"),
        }
    }

    fn teardown(&mut self, reason: CloseReason, notify_peer: bool) {
        self.closed.store(true, Ordering::Release);
        // open requests that never reached the loop fail with MuxClosed
        while self.commands.try_recv().is_ok() {}
        for (id, entry) in self.streams.drain() {
            if notify_peer {
                let _ = self.writer.send_packet(Packet::new_close(id, reason));
            }
            entry.shared.mark_closed(reason);
            entry.inbound.close();
        }
    }
}
