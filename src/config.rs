//! 命令行参数与服务默认配置。

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

/// 存储根目录下的暂存目录名，不会被列出或下载。
pub const UPLOAD_TEMP_DIR: &str = ".upload_temp";
pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_MAX_CHUNK_SIZE: u64 = 16 * 1024 * 1024;
pub const DEFAULT_UPLOAD_MAX_SIZE: u64 = 0;
pub const DEFAULT_UPLOAD_MAX_CONCURRENT: u64 = 64;
pub const DEFAULT_UPLOAD_IDLE_TTL_SECS: u64 = 60 * 60;
pub const UPLOAD_SWEEP_INTERVAL_SECS: u64 = 60;
pub const TOO_MANY_UPLOADS_RETRY_SECS: u64 = 30;

/// CLI arguments and environment configuration for the server.
#[derive(Parser, Debug)]
#[command(name = "chunkdrop", version = VERSION_INFO, about = "Chunked upload file server")]
pub struct Args {
    #[arg(
        short = 's',
        long,
        env = "CHUNKDROP_STORAGE_DIR",
        default_value = ".",
        help = "Directory to serve and store uploads in"
    )]
    pub storage_dir: String,
    #[arg(
        short = 'u',
        long,
        env = "CHUNKDROP_UPLOAD",
        help = "Enable upload endpoints"
    )]
    pub upload: bool,
    #[arg(
        short = 'd',
        long,
        env = "CHUNKDROP_DOWNLOAD",
        help = "Enable listing and download endpoints (default when no mode is given)"
    )]
    pub download: bool,
    #[arg(
        short = 'b',
        long,
        env = "CHUNKDROP_BIND",
        default_value = "0.0.0.0",
        help = "Bind address"
    )]
    pub host: String,
    #[arg(
        short = 'p',
        long,
        env = "CHUNKDROP_PORT",
        default_value_t = DEFAULT_PORT,
        help = "Listen port"
    )]
    pub port: u16,
    #[arg(short = 'c', long, env = "CHUNKDROP_TLS_CERT", requires = "tls_key", help = "TLS cert path")]
    pub tls_cert: Option<String>,
    #[arg(short = 'k', long, env = "CHUNKDROP_TLS_KEY", requires = "tls_cert", help = "TLS key path")]
    pub tls_key: Option<String>,
    #[arg(long, env = "CHUNKDROP_CORS_ORIGINS", help = "Comma separated CORS origins")]
    pub cors_origins: Option<String>,
    #[arg(
        long,
        env = "CHUNKDROP_TEMP_DIR",
        help = "Scratch directory for in-progress uploads (must share a filesystem with the storage dir)"
    )]
    pub temp_dir: Option<String>,
    #[arg(
        long,
        env = "CHUNKDROP_MAX_CHUNK_SIZE",
        default_value_t = DEFAULT_MAX_CHUNK_SIZE,
        value_parser = clap::value_parser!(u64).range(1..),
        help = "Max bytes accepted in a single chunk"
    )]
    pub max_chunk_size: u64,
    #[arg(
        long,
        env = "CHUNKDROP_UPLOAD_MAX_SIZE",
        default_value_t = DEFAULT_UPLOAD_MAX_SIZE,
        help = "Max declared upload size in bytes (0 to disable)"
    )]
    pub upload_max_size: u64,
    #[arg(
        long,
        env = "CHUNKDROP_UPLOAD_MAX_CONCURRENT",
        default_value_t = DEFAULT_UPLOAD_MAX_CONCURRENT,
        help = "Max open upload sessions (0 to disable)"
    )]
    pub upload_max_concurrent: u64,
    #[arg(
        long,
        env = "CHUNKDROP_UPLOAD_IDLE_TTL_SECS",
        default_value_t = DEFAULT_UPLOAD_IDLE_TTL_SECS,
        help = "Idle seconds before an open upload is aborted (0 to disable)"
    )]
    pub upload_idle_ttl_secs: u64,
}

impl Args {
    /// 返回（上传，下载）模式开关；均未指定时仅开启下载。
    pub fn modes(&self) -> (bool, bool) {
        if !self.upload && !self.download {
            return (false, true);
        }
        (self.upload, self.download)
    }
}
