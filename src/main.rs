//! NidoDrive server binary.
//!
//! Multi-user sandboxed file store over HTTP: every authenticated
//! account sees only its own subtree of a shared base directory. The
//! main entry point builds the Axum router, wires the authentication
//! gate, per-user storage and locking, configures TLS, and starts
//! HTTP/HTTPS listeners.

mod archive;
mod atomic;
mod auth;
mod background;
mod config;
mod error;
mod files;
mod http;
mod locking;
mod sandbox;
mod storage;
mod tls;
mod token;
mod users;
mod version;

use axum::extract::{DefaultBodyLimit, Extension, connect_info::ConnectInfo};
use axum::http::Request;
use axum::routing::{delete, get, post, put};
use axum::{Router, middleware};
use axum_server::Handle;
use clap::Parser;
use shadow_rs::shadow;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::Mutex;
use tower_http::trace::{DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::{Level, info, info_span};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::auth::AuthState;
use crate::background::spawn_background_tasks;
use crate::config::Args;
use crate::http::build_cors_layer;
use crate::locking::UserLocks;
use crate::storage::Storage;
use crate::token::TokenService;
use crate::users::{CredentialStore, MemoryCredentialStore};

shadow!(build);

/// Starts the NidoDrive server and blocks until shutdown.
#[tokio::main]
async fn main() -> Result<(), std::io::Error> {
    init_logging();

    let args = Args::parse();
    let storage = Arc::new(Storage::new(PathBuf::from(args.base_dir.clone())));
    storage.ensure_base().await?;

    let credential_store: Arc<dyn CredentialStore> = Arc::new(MemoryCredentialStore::seeded(
        &args.admin_user,
        &args.admin_pass,
    ));
    let auth_state = Arc::new(AuthState {
        tokens: TokenService::new(Duration::from_secs(args.token_ttl_secs)),
        login_attempts: Mutex::new(HashMap::new()),
        login_window: Duration::from_secs(args.login_window_secs),
        login_max_attempts: args.login_max_attempts,
        login_lockout: Duration::from_secs(args.login_lockout_secs),
    });
    let user_locks = Arc::new(UserLocks::new());

    let mut app = Router::new()
        .route(
            "/api/files",
            get(files::list_files).delete(files::delete_entry),
        )
        .route(
            "/api/files/upload",
            post(files::upload_file).layer(DefaultBodyLimit::max(args.upload_max_size as usize)),
        )
        .route("/api/files/download", get(files::download_file))
        .route("/api/files/mkdir", post(files::create_directory))
        .route("/api/files/rename", post(files::rename_entry))
        .route("/api/files/move", post(files::move_entry))
        .route("/api/auth/login", post(auth::auth_login))
        .route("/api/auth/register", post(auth::auth_register))
        .route(
            "/api/admin/users",
            post(users::admin_create_user).get(users::admin_list_users),
        )
        .route("/api/admin/users/{username}", delete(users::admin_delete_user))
        .route(
            "/api/admin/users/{username}/password",
            put(users::admin_change_password),
        )
        .route("/api/admin/users/{username}/role", put(users::admin_set_role))
        .route("/api/public/users-exist", get(users::users_exist))
        .route("/api/version", get(version::get_version_info))
        .layer(middleware::from_fn(auth::auth_middleware))
        .layer(middleware::from_fn(http::add_security_headers))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|request: &Request<_>| {
                    let forwarded_ip = request
                        .headers()
                        .get("x-forwarded-for")
                        .and_then(|v| v.to_str().ok())
                        .map(|s| s.split(',').next().unwrap_or("").trim().to_string());
                    let connect_ip = request
                        .extensions()
                        .get::<ConnectInfo<SocketAddr>>()
                        .map(|ConnectInfo(addr)| addr.to_string());
                    let client_ip = forwarded_ip
                        .or(connect_ip)
                        .unwrap_or_else(|| "unknown".to_string());

                    info_span!(
                        env!("CARGO_CRATE_NAME"),
                        client_ip,
                        method = ?request.method(),
                        path = ?request.uri().path(),
                    )
                })
                .on_request(DefaultOnRequest::new().level(Level::DEBUG))
                .on_response(DefaultOnResponse::new().level(Level::DEBUG)),
        )
        .layer(Extension(storage))
        .layer(Extension(auth_state.clone()))
        .layer(Extension(credential_store))
        .layer(Extension(user_locks));

    if let Some(cors_layer) = build_cors_layer(args.cors_origins.as_deref()) {
        app = app.layer(cors_layer);
    }

    let host = args
        .host
        .parse::<IpAddr>()
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidInput, err.to_string()))?;
    let http_addr = SocketAddr::new(host, args.http_port);
    let https_addr = SocketAddr::new(host, args.https_port);
    let tls_config =
        tls::build_rustls_config(args.tls_cert.as_deref(), args.tls_key.as_deref(), host).await?;
    let handle = Handle::new();

    info!("starting HTTP server at {}", http_addr);
    info!("starting HTTPS server at {}", https_addr);

    let http_server = axum_server::bind(http_addr)
        .handle(handle.clone())
        .serve(app.clone().into_make_service_with_connect_info::<SocketAddr>());
    let https_server = axum_server::bind_rustls(https_addr, tls_config)
        .handle(handle.clone())
        .serve(app.into_make_service_with_connect_info::<SocketAddr>());

    spawn_background_tasks(auth_state);
    tokio::select! {
        result = http_server => result?,
        result = https_server => result?,
        _ = shutdown_signal(handle) => {}
    }

    Ok(())
}

fn init_logging() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
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
