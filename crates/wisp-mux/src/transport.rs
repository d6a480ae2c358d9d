use std::{
    future::Future,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use bytes::Bytes;
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::Notify;
use tracing::trace;

use crate::{packet::Packet, Result, WispError};

/// Read half of a message transport. `None` means the transport closed.
pub trait TransportRead: Stream<Item = Result<Bytes>> + Unpin + Send + 'static {}
impl<T> TransportRead for T where T: Stream<Item = Result<Bytes>> + Unpin + Send + 'static {}

/// Write half of a message transport. Each item is one message.
pub trait TransportWrite: Sink<Bytes, Error = WispError> + Unpin + Send + 'static {}
impl<T> TransportWrite for T where T: Sink<Bytes, Error = WispError> + Unpin + Send + 'static {}

/// Read the next packet while a handshake is in progress.
pub(crate) async fn read_packet<R: TransportRead>(read: &mut R) -> Result<(Packet, Bytes)> {
    let frame = read.next().await.ok_or(WispError::TransportClosed)??;
    Ok((Packet::decode(frame.clone())?, frame))
}

pub(crate) async fn write_packet<W: TransportWrite>(write: &mut W, packet: Packet) -> Result<()> {
    write.send(packet.encode()).await
}

enum WriterCommand {
    Frame(Bytes),
    Close,
}

/// Shared handle to the single ordered writer of a transport.
///
/// Tracks how many bytes are queued but not yet accepted by the sink, which
/// is the depth the server's backpressure gate watches.
#[derive(Clone)]
pub(crate) struct MuxWriter {
    tx: flume::Sender<WriterCommand>,
    buffered: Arc<AtomicUsize>,
    drained: Arc<Notify>,
}

impl MuxWriter {
    pub fn new<W: TransportWrite>(sink: W) -> (Self, impl Future<Output = Result<()>> + Send) {
        let (tx, rx) = flume::unbounded();
        let buffered = Arc::new(AtomicUsize::new(0));
        let drained = Arc::new(Notify::new());
        let task = run_writer(sink, rx, buffered.clone(), drained.clone());
        (
            Self {
                tx,
                buffered,
                drained,
            },
            task,
        )
    }

    pub fn send_packet(&self, packet: Packet) -> Result<()> {
        let frame = packet.encode();
        let len = frame.len();
        self.buffered.fetch_add(len, Ordering::AcqRel);
        self.tx.send(WriterCommand::Frame(frame)).map_err(|_| {
            self.buffered.fetch_sub(len, Ordering::AcqRel);
            WispError::MuxClosed
        })
    }

    pub fn buffered_amount(&self) -> usize {
        self.buffered.load(Ordering::Acquire)
    }

    /// Wait until at most `level` bytes remain queued.
    pub async fn wait_drained(&self, level: usize) {
        loop {
            let notified = self.drained.notified();
            if self.buffered_amount() <= level {
                return;
            }
            notified.await;
        }
    }

    pub fn close(&self) {
        let _ = self.tx.send(WriterCommand::Close);
    }
}

async fn run_writer<W: TransportWrite>(
    mut sink: W,
    rx: flume::Receiver<WriterCommand>,
    buffered: Arc<AtomicUsize>,
    drained: Arc<Notify>,
) -> Result<()> {
    while let Ok(command) = rx.recv_async().await {
        match command {
            WriterCommand::Frame(frame) => {
                let len = frame.len();
                let sent = sink.send(frame).await;
                buffered.fetch_sub(len, Ordering::AcqRel);
                drained.notify_waiters();
                sent?;
            }
            WriterCommand::Close => {
                trace!("closing transport writer");
                break;
            }
        }
    }
    sink.close().await
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::packet::CloseReason;

    #[tokio::test]
    async fn buffered_amount_tracks_unsent_frames() {
        let (tx, rx) = flume::bounded::<Bytes>(0);
        let sink = Box::pin(tx.into_sink().sink_map_err(|_| WispError::TransportClosed));
        let (writer, task) = MuxWriter::new(sink);
        let task = tokio::spawn(task);

        let first = Packet::new_close(1, CloseReason::Voluntary);
        let second = Packet::new_close(2, CloseReason::Voluntary);
        let frame_len = first.encode().len();
        writer.send_packet(first.clone()).unwrap();
        writer.send_packet(second.clone()).unwrap();
        assert_eq!(writer.buffered_amount(), 2 * frame_len);

        assert_eq!(rx.recv_async().await.unwrap(), first.encode());
        tokio::time::timeout(Duration::from_secs(1), writer.wait_drained(frame_len))
            .await
            .unwrap();

        assert_eq!(rx.recv_async().await.unwrap(), second.encode());
        tokio::time::timeout(Duration::from_secs(1), writer.wait_drained(0))
            .await
            .unwrap();

        writer.close();
        task.await.unwrap().unwrap();
        assert!(writer.send_packet(Packet::new_close(3, CloseReason::Voluntary)).is_err());
    }
}
