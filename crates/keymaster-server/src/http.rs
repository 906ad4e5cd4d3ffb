//! HTTP endpoint Gatekeepers post their encrypted requests to.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{Json, Router};
use axum::extract::{ConnectInfo, Form, State};
use axum::http::HeaderMap;
use axum::routing::post;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::service::KeymasterService;

/// Path the endpoint is mounted on.
pub const KEYMASTER_PATH: &str = "/keymaster/";

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<KeymasterService>,
}

/// Form body of a Gatekeeper request. Both fields are sealed tokens.
#[derive(Debug, Deserialize)]
pub struct KeymasterForm {
    pub message: String,
    #[serde(default)]
    pub data: Option<String>,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route(KEYMASTER_PATH, post(keymaster))
        .with_state(state)
}

/// Serve the router until `shutdown` resolves.
pub async fn serve(
    listener: TcpListener,
    router: Router,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "Keymaster listening");
    }
    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
}

/// First `X-Forwarded-For` hop when present, otherwise the peer address.
fn client_ip(headers: &HeaderMap, peer: SocketAddr) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|ip| !ip.is_empty())
        .map_or_else(|| peer.ip().to_string(), ToString::to_string)
}

/// `POST /keymaster/` - answers with `{"message": ..}` or `{"error": ..}`.
async fn keymaster(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Form(form): Form<KeymasterForm>,
) -> Json<Value> {
    let ip = client_ip(&headers, peer);
    match state
        .service
        .handle(&ip, &form.message, form.data.as_deref())
        .await
    {
        Ok(sealed) => Json(json!({ "message": sealed })),
        Err(e) => {
            warn!(ip = %ip, error = %e, "Rejected Gatekeeper request");
            Json(json!({ "error": e.to_string() }))
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn peer() -> SocketAddr {
        SocketAddr::from(([192, 0, 2, 7], 40_000))
    }

    #[test]
    fn peer_address_without_forwarding() {
        assert_eq!(client_ip(&HeaderMap::new(), peer()), "192.0.2.7");
    }

    #[test]
    fn forwarded_for_takes_first_hop() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            "203.0.113.9, 10.0.0.1".parse().unwrap(),
        );
        assert_eq!(client_ip(&headers, peer()), "203.0.113.9");
    }

    #[test]
    fn empty_forwarded_for_falls_back_to_peer() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", " ".parse().unwrap());
        assert_eq!(client_ip(&headers, peer()), "192.0.2.7");
    }
}
