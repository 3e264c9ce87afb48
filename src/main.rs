//! chunkdrop server binary.
//!
//! Serves a directory over HTTP: browsing clients list folders, download
//! published files and upload new ones in fixed-size chunks that are
//! assembled in a scratch directory and atomically published on finalize.

mod background;
mod chunk_store;
mod config;
mod error;
mod files;
mod http;
mod logging;
mod session;
mod status;
mod storage;
mod tls;
mod upload;

use axum::extract::{DefaultBodyLimit, Extension};
use axum::routing::{get, post, put};
use axum::{Router, middleware};
use axum_server::Handle;
use clap::Parser;
use shadow_rs::shadow;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tower_http::trace::{DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::{Level, info};

use crate::background::spawn_background_tasks;
use crate::chunk_store::ChunkStore;
use crate::config::Args;
use crate::http::build_cors_layer;
use crate::session::{UploadConfig, UploadManager};
use crate::status::ResourceStatus;
use crate::storage::Storage;

shadow!(build);

/// Starts the server and blocks until shutdown.
#[tokio::main]
async fn main() -> Result<(), std::io::Error> {
    logging::init_logging();

    let args = Args::parse();
    let (upload_enabled, download_enabled) = args.modes();
    let storage = Arc::new(Storage::open(PathBuf::from(&args.storage_dir)).await?);
    let resource_status = Arc::new(ResourceStatus::new());

    let chunk_store = ChunkStore::new(
        args.temp_dir
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(|| storage.default_temp_dir()),
    );
    let leftovers = chunk_store.prepare().await?;
    info!(
        root = ?storage.root_path(),
        scratch = ?chunk_store.root_path(),
        leftovers,
        "storage ready"
    );
    let manager = Arc::new(UploadManager::new(
        chunk_store,
        storage.clone(),
        resource_status.clone(),
        UploadConfig {
            max_total_size: args.upload_max_size,
            max_chunk_size: args.max_chunk_size,
            max_concurrent: args.upload_max_concurrent,
            idle_ttl: Duration::from_secs(args.upload_idle_ttl_secs),
        },
    ));

    let mut app = Router::new().route("/status", get(status::get_status));
    if upload_enabled {
        app = app.route("/file", post(upload::create_file)).route(
            "/file/{id}",
            put(upload::write_chunk)
                .post(upload::finalize_file)
                .layer(DefaultBodyLimit::disable()),
        );
    }
    if download_enabled {
        app = app
            .route("/files", post(files::list_files))
            .route("/files/{*path}", get(files::download_file));
    }

    let mut app = app
        .layer(middleware::from_fn(http::add_security_headers))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(http::make_request_span)
                .on_request(DefaultOnRequest::new().level(Level::DEBUG))
                .on_response(DefaultOnResponse::new().level(Level::DEBUG)),
        )
        .layer(Extension(storage))
        .layer(Extension(resource_status))
        .layer(Extension(manager.clone()));

    if let Some(cors_layer) = build_cors_layer(args.cors_origins.as_deref()) {
        app = app.layer(cors_layer);
    }

    let host = args
        .host
        .parse::<IpAddr>()
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidInput, err.to_string()))?;
    let addr = SocketAddr::new(host, args.port);
    let tls_config =
        tls::load_rustls_config(args.tls_cert.as_deref(), args.tls_key.as_deref()).await?;
    let handle = Handle::new();
    let shutdown = CancellationToken::new();

    let mut modes = Vec::new();
    if upload_enabled {
        modes.push("upload");
    }
    if download_enabled {
        modes.push("download");
    }
    let service = app.into_make_service_with_connect_info::<SocketAddr>();
    let sweeper = spawn_background_tasks(manager, shutdown.clone());

    let server = async {
        match tls_config {
            Some(config) => {
                info!(%addr, modes = modes.join(" / "), "starting HTTPS server");
                axum_server::bind_rustls(addr, config)
                    .handle(handle.clone())
                    .serve(service)
                    .await
            }
            None => {
                info!(%addr, modes = modes.join(" / "), "starting HTTP server");
                axum_server::bind(addr)
                    .handle(handle.clone())
                    .serve(service)
                    .await
            }
        }
    };

    tokio::spawn(shutdown_signal(handle.clone()));
    let result = server.await;
    shutdown.cancel();
    let _ = sweeper.await;
    result
}

async fn shutdown_signal(handle: Handle) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("received termination signal, shutting down");
    handle.graceful_shutdown(Some(Duration::from_secs(10)));
}
