//! Wisp protocol server implementation for proxying TCP/UDP connections.
//!
//! This module wires the `wisp-mux` engine to axum WebSockets and real
//! sockets: configuration, the destination filter, DNS, the tokio socket
//! connector and the legacy wsproxy endpoint.

mod config;
mod filter;
mod handler;
mod resolver;
mod stream;
mod wsproxy;

pub use config::{PortRange, WispConfig};
pub use filter::{FilterError, WispFilter};
pub use handler::{AxumWsRead, AxumWsWrite, WispState, wisp_ws_handler};
pub use resolver::{Resolver, get_resolver, init_resolver};
pub use stream::TokioSocketConnector;
pub use wsproxy::wsproxy_handler;
