//! Shared server state, the axum application, and server startup.

use std::sync::Arc;

use crate::auth::IdentityVerifier;
use crate::router::Router;
use crate::{http, ws};

/// State shared by every handler.
pub struct AppState {
    /// The message router.
    pub router: Router,
    /// Resolves bearer credentials to identities.
    pub verifier: Arc<dyn IdentityVerifier>,
}

impl AppState {
    /// Bundles a router and a verifier.
    #[must_use]
    pub fn new(router: Router, verifier: Arc<dyn IdentityVerifier>) -> Self {
        Self { router, verifier }
    }
}

/// Builds the axum application.
pub fn app(state: Arc<AppState>) -> axum::Router {
    axum::Router::new()
        .route("/ws", axum::routing::get(ws::ws_handler))
        .route("/api/messages/send", axum::routing::post(http::send_message))
        .route("/api/messages/unread", axum::routing::get(http::fetch_unread))
        .route(
            "/api/messages/user-status/{identity}",
            axum::routing::get(http::user_status),
        )
        .route("/health", axum::routing::get(http::health))
        .with_state(state)
}

/// Starts the server on `addr` and returns the bound address and a join
/// handle.
///
/// Binding `127.0.0.1:0` picks a free port, which is how tests run the
/// server in-process.
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind to the given address.
pub async fn start_server_with_state(
    addr: &str,
    state: Arc<AppState>,
) -> Result<
    (std::net::SocketAddr, tokio::task::JoinHandle<()>),
    Box<dyn std::error::Error + Send + Sync>,
> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let bound_addr = listener.local_addr()?;
    let app = app(state);

    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "server error");
        }
    });

    Ok((bound_addr, handle))
}
