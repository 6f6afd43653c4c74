//! HTTP-01 challenge responder
//!
//! Serves the key authorizations the Challenge controller presents into the
//! shared [`Http01Responder`]. Unknown tokens are answered with 404.

use std::net::SocketAddr;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use certwarden_issuer::acme::Http01Responder;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Key authorization for `token`, as plain text
async fn challenge_handler(
    State(responder): State<Http01Responder>,
    Path(token): Path<String>,
) -> Result<String, StatusCode> {
    match responder.key_authorization(&token) {
        Some(key_authorization) => {
            debug!(%token, "Answered HTTP-01 challenge");
            Ok(key_authorization)
        }
        None => Err(StatusCode::NOT_FOUND),
    }
}

/// Create the responder router
///
/// Routes:
/// - `GET /.well-known/acme-challenge/{token}` - key authorization for a presented token
pub fn http01_router(responder: Http01Responder) -> Router {
    Router::new()
        .route("/.well-known/acme-challenge/{token}", get(challenge_handler))
        .with_state(responder)
}

/// Serve the responder on `addr` until `shutdown` fires
pub async fn serve(
    addr: SocketAddr,
    responder: Http01Responder,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "HTTP-01 responder listening");
    axum::serve(listener, http01_router(responder))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}
