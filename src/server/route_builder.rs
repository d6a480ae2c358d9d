use axum::{Router, routing::get};
use tower_http::services::ServeDir;

use crate::wisp::{WispState, wisp_ws_handler, wsproxy_handler};

const BANNER: &str = "Wisp server: connect a Wisp client to /wisp/\n";

async fn banner() -> &'static str {
    BANNER
}

/// Register all routes
pub fn build_router(state: WispState) -> Router {
    let static_dir = state.config.static_dir.clone();

    let router = Router::new()
        // Wisp WebSocket endpoint
        .route("/wisp/", get(wisp_ws_handler))
        // One TCP connection per WebSocket
        .route("/wsproxy/:target", get(wsproxy_handler))
        .with_state(state);

    match static_dir {
        Some(dir) => router.fallback_service(ServeDir::new(dir)),
        None => router.fallback(banner),
    }
}
