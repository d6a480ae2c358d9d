//! Wisp proxy server: many TCP and UDP streams multiplexed over one
//! WebSocket, built on the `wisp-mux` protocol engine.

pub mod server;
pub mod wisp;
