use axum::{
    Json,
    extract::{ConnectInfo, Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
};
use futures::FutureExt;
use serde_json::json;
use std::any::Any;
use std::net::{IpAddr, SocketAddr};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info};

use crate::metrics::{REQUEST_LATENCY, REQUEST_TOTAL};
use crate::pipeline::Aborted;

const UNKNOWN_CLIENT: &str = "unknown";

/// Identity used for rate limiting.
///
/// The connection's peer address, unless that peer is a trusted proxy: then
/// the right-most `X-Forwarded-For` hop that is not itself trusted, or the
/// left-most hop when every entry is a proxy.
pub fn client_identity(req: &Request, trusted_proxies: &[IpAddr]) -> String {
    let Some(ConnectInfo(peer)) = req.extensions().get::<ConnectInfo<SocketAddr>>() else {
        return UNKNOWN_CLIENT.to_string();
    };
    let peer_ip = peer.ip();
    if !trusted_proxies.contains(&peer_ip) {
        return peer_ip.to_string();
    }

    let hops: Vec<IpAddr> = req
        .headers()
        .get_all("x-forwarded-for")
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|hop| hop.trim().parse().ok())
        .collect();

    hops.iter()
        .rev()
        .find(|ip| !trusted_proxies.contains(*ip))
        .or_else(|| hops.first())
        .copied()
        .unwrap_or(peer_ip)
        .to_string()
}

// Access log line and request metrics
pub async fn log_requests(State(trusted_proxies): State<Arc<[IpAddr]>>, req: Request, next: Next) -> Response {
    REQUEST_TOTAL.inc();
    let start = Instant::now();

    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let client = client_identity(&req, &trusted_proxies);

    let response = next.run(req).await;

    let elapsed = start.elapsed();
    REQUEST_LATENCY.observe(elapsed.as_secs_f64());
    info!(
        method = %method,
        path = %path,
        status = response.status().as_u16(),
        client = %client,
        latency_ms = elapsed.as_millis() as u64,
        "Request handled"
    );

    response
}

/// Turn a panicking handler into a 422 instead of a dropped connection.
pub async fn recover_panics(req: Request, next: Next) -> Response {
    match AssertUnwindSafe(next.run(req)).catch_unwind().await {
        Ok(response) => response,
        Err(panic) => {
            error!(panic = %panic_message(&*panic), "Recovered from handler panic");

            let body = json!({
                "message": "Request could not be processed",
                "code": 422,
            });
            let mut response = (StatusCode::UNPROCESSABLE_ENTITY, Json(body)).into_response();
            response.extensions_mut().insert(Aborted);
            response
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
