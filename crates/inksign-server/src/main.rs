//! InkSign HTTP Server
//!
//! A thin axum adapter over the signing engine. Documents, artifacts and
//! envelopes are kept on disk under the data directory:
//!
//! ```text
//! $INKSIGN_DATA_DIR/documents/{sha256}.blob
//! $INKSIGN_DATA_DIR/artifacts/{sha256}.blob
//! $INKSIGN_DATA_DIR/envelopes/{id}.json
//! $INKSIGN_DATA_DIR/envelopes/{id}.audit.jsonl
//! ```

mod api;
mod config;
mod error;

use api::AppState;
use axum::extract::DefaultBodyLimit;
use config::ServerConfig;
use inksign_core::{Engine, FileBlobStore, FileEnvelopeStore, StorageResult};
use inksign_render::{PdfCompositor, RenderOptions};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

fn build_engine(config: &ServerConfig, render: &RenderOptions) -> StorageResult<Engine> {
    let envelopes = FileEnvelopeStore::new(config.envelopes_dir())?;
    let documents = FileBlobStore::new(config.documents_dir())?;
    let artifacts = FileBlobStore::new(config.artifacts_dir())?;
    Ok(Engine::new(
        Arc::new(envelopes),
        Arc::new(documents),
        Arc::new(artifacts),
        Arc::new(PdfCompositor::new(render.clone())),
    ))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing; `log` records from the library crates are bridged in.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "inksign_server=info,inksign_core=info,inksign_render=info,tower_http=info".into()
            }),
        )
        .init();

    let config = ServerConfig::from_env()?;
    let render = RenderOptions {
        certificate_page: config.certificate_page,
        ..RenderOptions::default()
    };
    let engine = build_engine(&config, &render)?;
    let state = Arc::new(AppState::new(engine, render));

    let app = api::router(state)
        .layer(DefaultBodyLimit::max(config.max_upload_bytes))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    info!("InkSign server listening on {}", config.addr);
    info!("Data directory: {}", config.data_dir.display());

    let listener = tokio::net::TcpListener::bind(config.addr).await?;
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>()).await?;
    Ok(())
}
