pub mod upload;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use axum::Router;
use axum::routing::post;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Shared state of the upload receiving server.
pub struct AppState {
    /// Directory uploads are assembled in.
    pub dir: PathBuf,
    /// In-flight uploads: upload id → uploaded filename.
    pub uploads: Mutex<HashMap<String, String>>,
}

impl AppState {
    pub fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            uploads: Mutex::new(HashMap::new()),
        }
    }
}

/// The chunked-upload router. Clients post chunks to `/upload` and the
/// finalization request to `/upload_complete/` (the transport client
/// derives the second path by appending `_complete/` to the destination).
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/upload", post(upload::receive_chunk))
        .route("/upload_complete/", post(upload::complete_upload))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Start the upload receiving server.
pub async fn serve(host: &str, port: u16, dir: PathBuf) -> Result<()> {
    let state = Arc::new(AppState::new(dir));
    let app = router(state);

    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    info!("arkflow upload receiver listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
