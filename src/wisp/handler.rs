//! Axum WebSocket handler for Wisp protocol

use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use anyhow::Context as _;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use bytes::Bytes;
use futures::channel::mpsc;
use futures::{Sink, SinkExt, Stream, StreamExt};
use futures_util::stream::{SplitSink, SplitStream};
use pin_project_lite::pin_project;
use tokio::time::{Instant, Interval};
use tracing::{debug, error, info, trace};
use wisp_mux::{ServerMux, WispError};

use super::config::WispConfig;
use super::filter::WispFilter;
use super::resolver::init_resolver;
use super::stream::TokioSocketConnector;

/// Application state for the Wisp handlers
#[derive(Clone)]
pub struct WispState {
    pub config: Arc<WispConfig>,
    pub filter: Arc<WispFilter>,
    pub connector: Arc<TokioSocketConnector>,
}

impl WispState {
    pub fn new(config: WispConfig) -> anyhow::Result<Self> {
        init_resolver(&config.dns_servers);
        let config = Arc::new(config);
        let filter = WispFilter::new(config.clone()).context("Invalid hostname filter")?;
        Ok(Self {
            connector: Arc::new(TokioSocketConnector::new(config.socket_buffer_size)),
            filter: Arc::new(filter),
            config,
        })
    }
}

/// Client address for logging. Forwarding headers are only believed when
/// the peer is a trusted proxy.
pub(crate) fn real_ip(
    config: &WispConfig,
    peer: Option<IpAddr>,
    headers: &HeaderMap,
) -> Option<IpAddr> {
    let trusted = peer.is_some_and(|ip| config.parse_real_ip_from.contains(&ip));
    if !config.parse_real_ip || !trusted {
        return peer;
    }
    let header = |name: &str| headers.get(name).and_then(|value| value.to_str().ok());
    header("x-forwarded-for")
        .and_then(|list| list.split(',').next())
        .or_else(|| header("x-real-ip"))
        .and_then(|ip| ip.trim().parse().ok())
        .or(peer)
}

/// Log prefix for one connection
pub(crate) fn connection_id(client_ip: Option<IpAddr>) -> String {
    let id = uuid::Uuid::new_v4();
    match client_ip {
        Some(ip) => format!("{} {}", ip, id),
        None => id.to_string(),
    }
}

/// Axum handler for Wisp WebSocket connections
pub async fn wisp_ws_handler(
    ws: WebSocketUpgrade,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    State(state): State<WispState>,
) -> impl IntoResponse {
    let peer = connect_info.map(|ConnectInfo(addr)| addr.ip());
    let id = connection_id(real_ip(&state.config, peer, &headers));
    info!("[{}] New Wisp WebSocket connection", id);
    ws.on_upgrade(move |socket| handle_wisp_connection(socket, state, id))
}

/// Handle a single Wisp WebSocket connection
async fn handle_wisp_connection(socket: WebSocket, state: WispState, id: String) {
    debug!("[{}] Wisp client connected", id);

    if let Err(e) = handle_wisp_inner(socket, state, &id).await {
        error!("[{}] Wisp connection error: {:#}", id, e);
    }

    debug!("[{}] Wisp client disconnected", id);
}

async fn handle_wisp_inner(socket: WebSocket, state: WispState, id: &str) -> anyhow::Result<()> {
    let (ws_write, ws_read) = socket.split();
    let ping_interval =
        (state.config.ping_interval > 0).then(|| Duration::from_secs(state.config.ping_interval));
    let (write, socket_task) = AxumWsWrite::new(ws_write, ping_interval, id.to_string());
    let socket_task = tokio::spawn(socket_task);

    let (mux, mux_task) = ServerMux::new(
        AxumWsRead::new(ws_read),
        write,
        state.config.server_config(),
        state.filter.clone(),
        state.connector.clone(),
    )
    .await
    .context("Wisp handshake failed")?;

    let negotiated = mux.negotiated();
    debug!(
        "[{}] Wisp mux created, version {}.{}, extensions: {:?}",
        id, negotiated.version.major, negotiated.version.minor, negotiated.extensions
    );

    // the mux lives as long as the connection; streams run on their own tasks
    let result = mux_task.await.context("Wisp transport failed");
    let _ = socket_task.await;
    result
}

// ============================================================================
// WebSocket Transport Adapter
// ============================================================================

pin_project! {
    /// Read half of an axum WebSocket as a Wisp transport
    pub struct AxumWsRead {
        #[pin]
        inner: SplitStream<WebSocket>,
    }
}

impl AxumWsRead {
    pub fn new(inner: SplitStream<WebSocket>) -> Self {
        Self { inner }
    }
}

impl Stream for AxumWsRead {
    type Item = Result<Bytes, WispError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();
        loop {
            let msg = match this.inner.as_mut().poll_next(cx) {
                Poll::Ready(Some(Ok(msg))) => msg,
                Poll::Ready(Some(Err(e))) => {
                    return Poll::Ready(Some(Err(WispError::WsImplError(Box::new(e)))));
                }
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Pending => return Poll::Pending,
            };
            match msg {
                Message::Binary(data) => return Poll::Ready(Some(Ok(data.into()))),
                Message::Text(text) => return Poll::Ready(Some(Ok(Bytes::from(text.into_bytes())))),
                Message::Close(_) => return Poll::Ready(None),
                // axum answers pings itself
                Message::Ping(_) | Message::Pong(_) => trace!("Skipping control frame"),
            }
        }
    }
}

pin_project! {
    /// Write half of an axum WebSocket as a Wisp transport.
    ///
    /// Frames go through a one-slot channel to the task that owns the
    /// socket, which also sends the keepalive pings.
    pub struct AxumWsWrite {
        #[pin]
        inner: mpsc::Sender<Message>,
    }
}

impl AxumWsWrite {
    /// Returns the sink and the task that must run for frames to reach the
    /// socket. The task ends once the sink is closed or dropped.
    pub fn new(
        socket: SplitSink<WebSocket, Message>,
        ping_interval: Option<Duration>,
        id: String,
    ) -> (Self, impl std::future::Future<Output = ()> + Send) {
        let (tx, rx) = mpsc::channel(0);
        let ping = ping_interval.map(|period| tokio::time::interval_at(Instant::now() + period, period));
        (Self { inner: tx }, drive_socket(socket, rx, ping, id))
    }
}

async fn next_ping(ping: &mut Option<Interval>) {
    match ping {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn drive_socket(
    mut socket: SplitSink<WebSocket, Message>,
    mut frames: mpsc::Receiver<Message>,
    mut ping: Option<Interval>,
    id: String,
) {
    loop {
        let sent = tokio::select! {
            frame = frames.next() => match frame {
                Some(frame) => socket.send(frame).await,
                None => break,
            },
            _ = next_ping(&mut ping) => {
                trace!("[{}] Sending WebSocket ping", id);
                socket.send(Message::Ping(Vec::new())).await
            }
        };
        if let Err(e) = sent {
            debug!("[{}] WebSocket send error: {}", id, e);
            return;
        }
    }
    let _ = socket.close().await;
}

fn ws_error(e: mpsc::SendError) -> WispError {
    WispError::WsImplError(Box::new(e))
}

impl Sink<Bytes> for AxumWsWrite {
    type Error = WispError;

    fn poll_ready(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.project().inner.poll_ready(cx).map_err(ws_error)
    }

    fn start_send(self: Pin<&mut Self>, item: Bytes) -> Result<(), Self::Error> {
        self.project()
            .inner
            .start_send(Message::Binary(item.to_vec()))
            .map_err(ws_error)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.project().inner.poll_flush(cx).map_err(ws_error)
    }

    fn poll_close(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.project().inner.poll_close(cx).map_err(ws_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, HeaderValue::from_static(value));
        }
        map
    }

    #[test]
    fn forwarded_address_from_trusted_proxy() {
        let config = WispConfig::default();
        let proxy = Some(IpAddr::from([127, 0, 0, 1]));
        assert_eq!(
            real_ip(&config, proxy, &headers(&[("x-forwarded-for", "203.0.113.7, 10.0.0.2")])),
            Some(IpAddr::from([203, 0, 113, 7]))
        );
        assert_eq!(
            real_ip(&config, proxy, &headers(&[("x-real-ip", "198.51.100.1")])),
            Some(IpAddr::from([198, 51, 100, 1]))
        );
        assert_eq!(
            real_ip(&config, proxy, &headers(&[("x-forwarded-for", "garbage")])),
            proxy
        );
    }

    #[test]
    fn forwarded_headers_ignored_from_untrusted_peers() {
        let spoofed = headers(&[("x-forwarded-for", "203.0.113.7")]);
        let peer = Some(IpAddr::from([192, 0, 2, 50]));
        assert_eq!(real_ip(&WispConfig::default(), peer, &spoofed), peer);
        assert_eq!(real_ip(&WispConfig::default(), None, &spoofed), None);

        let config = WispConfig {
            parse_real_ip: false,
            ..Default::default()
        };
        let proxy = Some(IpAddr::from([127, 0, 0, 1]));
        assert_eq!(real_ip(&config, proxy, &spoofed), proxy);
    }

    #[test]
    fn connection_id_leads_with_the_client_address() {
        let id = connection_id(Some(IpAddr::from([203, 0, 113, 7])));
        assert!(id.starts_with("203.0.113.7 "));
        assert!(uuid::Uuid::parse_str(&connection_id(None)).is_ok());
    }
}
