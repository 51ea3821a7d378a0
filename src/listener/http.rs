//! Identity and discovery HTTP endpoints.

use crate::db::{DbError, HostFilter, Store};
use crate::probe::{HEALTH_PATH, HOSTS_PATH};
use crate::protocol::{ErrorBody, IdentityDocument};

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use std::io;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tower_http::trace::TraceLayer;

/// Alias of the health endpoint kept for older peers.
pub const CHECK_PATH: &str = "/api/check";

/// Build the router serving this node's identity and known hosts.
pub fn identity_router(store: Store) -> Router {
    Router::new()
        .route(HEALTH_PATH, get(handle_identity))
        .route(CHECK_PATH, get(handle_identity))
        .route(HOSTS_PATH, get(handle_hosts))
        .layer(TraceLayer::new_for_http())
        .with_state(store)
}

/// Serve the identity endpoints until `stop` fires.
pub async fn serve_http(
    listener: TcpListener,
    store: Store,
    mut stop: broadcast::Receiver<()>,
) -> io::Result<()> {
    axum::serve(listener, identity_router(store))
        .with_graceful_shutdown(async move {
            let _ = stop.recv().await;
        })
        .await
}

pub async fn handle_identity(State(store): State<Store>) -> Response {
    match store.self_identity() {
        Ok(me) => Json(IdentityDocument::from(&me.host)).into_response(),
        Err(DbError::NotFound) => error_response("local identity not registered yet"),
        Err(e) => error_response(e),
    }
}

pub async fn handle_hosts(State(store): State<Store>) -> Response {
    match store.list_hosts(&HostFilter::default()) {
        Ok(hosts) => {
            let docs: Vec<IdentityDocument> = hosts.iter().map(IdentityDocument::from).collect();
            Json(docs).into_response()
        }
        Err(e) => error_response(e),
    }
}

fn error_response(message: impl ToString) -> Response {
    let body = ErrorBody {
        kind: "error".to_string(),
        message: message.to_string(),
    };
    (StatusCode::INTERNAL_SERVER_ERROR, Json(body)).into_response()
}
