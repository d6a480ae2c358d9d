//! Legacy wsproxy endpoint: one TCP connection per WebSocket, no Wisp framing

use std::net::SocketAddr;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tracing::{debug, info, warn};
use wisp_mux::packet::{ConnectPacket, StreamType};
use wisp_mux::upstream::{AccessFilter, FilterVerdict, ProxySocket, SocketConnector};

use super::handler::{WispState, connection_id, real_ip};

/// Split `host:port`, accepting bracketed IPv6 hosts.
fn parse_target(target: &str) -> Option<(String, u16)> {
    let (host, port) = target.rsplit_once(':')?;
    let host = host.trim();
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    if host.is_empty() {
        return None;
    }
    Some((host.to_string(), port.trim().parse().ok()?))
}

/// Axum handler for `/wsproxy/{host}:{port}`
pub async fn wsproxy_handler(
    ws: WebSocketUpgrade,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    Path(target): Path<String>,
    State(state): State<WispState>,
) -> Response {
    let Some((host, port)) = parse_target(&target) else {
        return (StatusCode::BAD_REQUEST, "Expected /wsproxy/<host>:<port>").into_response();
    };
    let peer = connect_info.map(|ConnectInfo(addr)| addr.ip());
    let id = connection_id(real_ip(&state.config, peer, &headers));
    ws.on_upgrade(move |socket| handle_wsproxy(socket, host, port, state, id))
        .into_response()
}

async fn handle_wsproxy(
    mut socket: WebSocket,
    host: String,
    port: u16,
    state: WispState,
    id: String,
) {
    let request = ConnectPacket {
        stream_type: StreamType::Tcp,
        host,
        port,
    };

    let destination = match state.filter.evaluate(&request, None).await {
        FilterVerdict::Allow(destination) => destination,
        FilterVerdict::Deny(reason) => {
            info!(
                "[{}] Refusing to create a wsproxy connection to {}:{} ({:?})",
                id, request.host, request.port, reason
            );
            let _ = socket.send(Message::Close(None)).await;
            return;
        }
    };

    let ProxySocket {
        mut read,
        mut write,
    } = match state.connector.connect(&destination).await {
        Ok(socket) => socket,
        Err(e) => {
            warn!(
                "[{}] wsproxy connection to {}:{} failed: {}",
                id, request.host, request.port, e
            );
            let _ = socket.send(Message::Close(None)).await;
            return;
        }
    };
    debug!("[{}] wsproxy connected to {}:{}", id, request.host, request.port);

    let (mut ws_write, mut ws_read) = socket.split();

    let tcp_to_ws = async {
        loop {
            match read.recv().await {
                Ok(Some(data)) => {
                    if ws_write.send(Message::Binary(data.to_vec())).await.is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    debug!("[{}] wsproxy socket read error: {}", id, e);
                    break;
                }
            }
        }
        let _ = ws_write.close().await;
    };

    let ws_to_tcp = async {
        while let Some(Ok(msg)) = ws_read.next().await {
            let data = match msg {
                Message::Binary(data) => Bytes::from(data),
                Message::Text(text) => Bytes::from(text.into_bytes()),
                Message::Close(_) => break,
                Message::Ping(_) | Message::Pong(_) => continue,
            };
            if let Err(e) = write.send(data).await {
                debug!("[{}] wsproxy socket write error: {}", id, e);
                break;
            }
        }
        let _ = write.close().await;
    };

    tokio::select! {
        _ = tcp_to_ws => {}
        _ = ws_to_tcp => {}
    }
    debug!("[{}] wsproxy connection closed", id);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn targets() {
        assert_eq!(
            parse_target("example.com:443"),
            Some(("example.com".to_string(), 443))
        );
        assert_eq!(parse_target("[::1]:8080"), Some(("::1".to_string(), 8080)));
        assert_eq!(parse_target(" irc.libera.chat :6667"), Some(("irc.libera.chat".to_string(), 6667)));
        assert_eq!(parse_target("example.com"), None);
        assert_eq!(parse_target("example.com:http"), None);
        assert_eq!(parse_target(":80"), None);
        assert_eq!(parse_target("example.com:70000"), None);
    }
}
