//! Transport adapter for `tokio-websockets` connections.

use std::{
    pin::Pin,
    task::{Context, Poll},
};

use bytes::Bytes;
use futures::{
    stream::{SplitSink, SplitStream},
    Sink, Stream, StreamExt,
};
use pin_project::pin_project;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_websockets::{Message, WebSocketStream};
use tracing::trace;

use crate::{Result, WispError};

fn ws_error(err: tokio_websockets::Error) -> WispError {
    WispError::WsImplError(Box::new(err))
}

/// Split a websocket into Wisp transport halves.
pub fn split<S>(ws: WebSocketStream<S>) -> (WebSocketRead<S>, WebSocketWrite<S>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (write, read) = ws.split();
    (WebSocketRead { inner: read }, WebSocketWrite { inner: write })
}

#[pin_project]
pub struct WebSocketRead<S> {
    #[pin]
    inner: SplitStream<WebSocketStream<S>>,
}

impl<S: AsyncRead + AsyncWrite + Unpin> Stream for WebSocketRead<S> {
    type Item = Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();
        loop {
            let msg = match this.inner.as_mut().poll_next(cx) {
                Poll::Ready(Some(Ok(msg))) => msg,
                Poll::Ready(Some(Err(err))) => return Poll::Ready(Some(Err(ws_error(err)))),
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Pending => return Poll::Pending,
            };
            if msg.is_binary() {
                return Poll::Ready(Some(Ok(Bytes::copy_from_slice(msg.as_payload()))));
            }
            if msg.is_close() {
                return Poll::Ready(None);
            }
            trace!("ignoring non-binary websocket message");
        }
    }
}

#[pin_project]
pub struct WebSocketWrite<S> {
    #[pin]
    inner: SplitSink<WebSocketStream<S>, Message>,
}

impl<S: AsyncRead + AsyncWrite + Unpin> Sink<Bytes> for WebSocketWrite<S> {
    type Error = WispError;

    fn poll_ready(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<()>> {
        self.project().inner.poll_ready(cx).map_err(ws_error)
    }

    fn start_send(self: Pin<&mut Self>, item: Bytes) -> Result<()> {
        self.project()
            .inner
            .start_send(Message::binary(item))
            .map_err(ws_error)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<()>> {
        self.project().inner.poll_flush(cx).map_err(ws_error)
    }

    fn poll_close(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<()>> {
        self.project().inner.poll_close(cx).map_err(ws_error)
    }
}
