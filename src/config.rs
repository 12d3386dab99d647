//! CLI arguments and server configuration defaults.

use clap::Parser;
use shadow_rs::formatcp;

use crate::build;

const VERSION_INFO: &str = formatcp!(
    r#"{}\ncommit_hash: {}\nbuild_time: {}\nbuild_env: {},{}"#,
    build::PKG_VERSION,
    build::SHORT_COMMIT,
    build::BUILD_TIME,
    build::RUST_VERSION,
    build::RUST_CHANNEL
);

pub const DEFAULT_ADMIN_USER: &str = "admin";
pub const DEFAULT_ADMIN_PASS: &str = "admin";
pub const DEFAULT_TOKEN_TTL_SECS: u64 = 24 * 60 * 60;
pub const DEFAULT_LOGIN_MAX_ATTEMPTS: u32 = 5;
pub const DEFAULT_LOGIN_WINDOW_SECS: u64 = 5 * 60;
pub const DEFAULT_LOGIN_LOCKOUT_SECS: u64 = 10 * 60;
pub const DEFAULT_UPLOAD_MAX_SIZE: u64 = 10 * 1024 * 1024 * 1024;
pub const DEFAULT_LOCK_WAIT_TIMEOUT_SECS: u64 = 30;
pub const ARCHIVE_TEMP_PREFIX: &str = "nido-archive";
pub const ARCHIVE_TEMP_TTL_SECS: u64 = 60 * 60;
pub const ARCHIVE_CHUNK_SIZE: usize = 64 * 1024;
pub const LOGIN_PRUNE_INTERVAL_SECS: u64 = 300;
pub const ARCHIVE_CLEAN_INTERVAL_SECS: u64 = 900;

/// CLI arguments and environment configuration for the server.
#[derive(Parser, Debug)]
#[command(name = "nido-drive", version = VERSION_INFO, about = "NidoDrive multi-user file server")]
pub struct Args {
    #[arg(
        short = 'b',
        long,
        env = "NIDO_BASE_DIR",
        default_value = ".nido/data",
        help = "Base directory holding one storage root per user"
    )]
    pub base_dir: String,
    #[arg(
        long,
        env = "NIDO_ADMIN_USER",
        default_value = DEFAULT_ADMIN_USER,
        help = "Username of the initial admin account"
    )]
    pub admin_user: String,
    #[arg(
        long,
        env = "NIDO_ADMIN_PASS",
        default_value = DEFAULT_ADMIN_PASS,
        help = "Password of the initial admin account"
    )]
    pub admin_pass: String,
    #[arg(
        short = 'H',
        long,
        env = "NIDO_BIND",
        default_value = "0.0.0.0",
        help = "Bind address for HTTP/HTTPS"
    )]
    pub host: String,
    #[arg(
        short = 'p',
        long,
        env = "NIDO_HTTP_PORT",
        default_value_t = 5205,
        help = "HTTP port"
    )]
    pub http_port: u16,
    #[arg(
        short = 'P',
        long,
        env = "NIDO_HTTPS_PORT",
        default_value_t = 5206,
        help = "HTTPS port"
    )]
    pub https_port: u16,
    #[arg(short = 'c', long, env = "NIDO_TLS_CERT", help = "TLS cert path")]
    pub tls_cert: Option<String>,
    #[arg(short = 'k', long, env = "NIDO_TLS_KEY", help = "TLS key path")]
    pub tls_key: Option<String>,
    #[arg(long, env = "NIDO_CORS_ORIGINS", help = "Comma separated CORS origins")]
    pub cors_origins: Option<String>,
    #[arg(
        long,
        env = "NIDO_TOKEN_TTL_SECS",
        default_value_t = DEFAULT_TOKEN_TTL_SECS,
        help = "Bearer token validity window in seconds"
    )]
    pub token_ttl_secs: u64,
    #[arg(
        long,
        env = "NIDO_LOGIN_MAX_ATTEMPTS",
        default_value_t = DEFAULT_LOGIN_MAX_ATTEMPTS,
        help = "Max login attempts before lockout"
    )]
    pub login_max_attempts: u32,
    #[arg(
        long,
        env = "NIDO_LOGIN_WINDOW_SECS",
        default_value_t = DEFAULT_LOGIN_WINDOW_SECS,
        help = "Login attempt window in seconds"
    )]
    pub login_window_secs: u64,
    #[arg(
        long,
        env = "NIDO_LOGIN_LOCKOUT_SECS",
        default_value_t = DEFAULT_LOGIN_LOCKOUT_SECS,
        help = "Login lockout time after max attempts"
    )]
    pub login_lockout_secs: u64,
    #[arg(
        long,
        env = "NIDO_UPLOAD_MAX_SIZE",
        default_value_t = DEFAULT_UPLOAD_MAX_SIZE,
        help = "Max upload request size in bytes"
    )]
    pub upload_max_size: u64,
}
