//! HTTP surface of a node.
//!
//! | Method | Path             | Body                          |
//! |--------|------------------|-------------------------------|
//! | GET    | `/getKV/:key`    |                               |
//! | PUT    | `/setKV`         | JSON object of key → value    |
//! | DELETE | `/deleteKV/:key` |                               |
//! | POST   | `/addNode`       | `RAFT_ADDR[=API_ADDR]`        |
//! | DELETE | `/removeNode`    | `RAFT_ADDR`                   |
//! | GET    | `/status`        |                               |
//!
//! A node added with a bare `RAFT_ADDR` joins as a voter but has no API
//! address in the member table. Followers cannot forward writes to it while
//! it leads; re-add it with `RAFT_ADDR=API_ADDR` to fix that.

use std::collections::BTreeMap;
use std::future::Future;
use std::net::SocketAddr;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::consensus::{Member, MemberParseError};
use crate::error::Error;
use crate::gateway::{Gateway, Origin, FORWARDED_HEADER};

pub fn router(gateway: Gateway) -> Router {
    Router::new()
        .route("/getKV/:key", get(get_kv))
        .route("/setKV", put(set_kv))
        .route("/deleteKV/:key", delete(delete_kv))
        .route("/addNode", post(add_node))
        .route("/removeNode", delete(remove_node))
        .route("/status", get(status))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(gateway)
}

/// Serves the API on `listener` until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, gateway: Gateway, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = listener.local_addr()?;
    info!(%addr, "http: listening");
    axum::serve(listener, router(gateway))
        .with_graceful_shutdown(shutdown)
        .await?;
    info!(%addr, "http: closed");
    Ok(())
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = match &self {
            Error::Relayed { status, body } => {
                let status = StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY);
                return (status, body.clone()).into_response();
            }
            Error::Halted(_) | Error::Stopped => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::BAD_REQUEST,
        };
        (status, self.to_string()).into_response()
    }
}

fn origin(headers: &HeaderMap) -> Origin {
    if headers.contains_key(FORWARDED_HEADER) {
        Origin::Peer
    } else {
        Origin::Client
    }
}

async fn get_kv(State(gateway): State<Gateway>, Path(key): Path<String>) -> Response {
    match gateway.get(&key) {
        Some(value) => (StatusCode::OK, value).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn set_kv(
    State(gateway): State<Gateway>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, Error> {
    let entries: BTreeMap<String, String> = serde_json::from_slice(&body).map_err(|err| {
        warn!(error = %err, "failed to read PUT body");
        Error::InvalidRequest(format!("body must be a JSON object of strings: {err}"))
    })?;
    gateway.set(entries, origin(&headers)).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn delete_kv(
    State(gateway): State<Gateway>,
    headers: HeaderMap,
    Path(key): Path<String>,
) -> Result<StatusCode, Error> {
    gateway.delete(key, origin(&headers)).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn add_node(
    State(gateway): State<Gateway>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, Error> {
    let spec = String::from_utf8_lossy(&body);
    let member: Member = spec
        .parse()
        .map_err(|err: MemberParseError| Error::InvalidRequest(err.to_string()))?;
    gateway.add_node(member, origin(&headers)).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn remove_node(
    State(gateway): State<Gateway>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, Error> {
    let spec = String::from_utf8_lossy(&body);
    let raft_addr: SocketAddr = spec
        .trim()
        .parse()
        .map_err(|_| Error::InvalidRequest(format!("expected a raft address, got {spec:?}")))?;
    gateway.remove_node(raft_addr, origin(&headers)).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn status(State(gateway): State<Gateway>) -> impl IntoResponse {
    Json(gateway.status())
}
