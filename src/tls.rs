//! TLS 证书加载。

use axum_server::tls_rustls::RustlsConfig;
use tracing::info;

/// 同时提供证书与私钥时返回 Rustls 配置，否则使用明文 HTTP。
pub async fn load_rustls_config(
    cert: Option<&str>,
    key: Option<&str>,
) -> Result<Option<RustlsConfig>, std::io::Error> {
    let (Some(cert), Some(key)) = (cert, key) else {
        return Ok(None);
    };
    let config = RustlsConfig::from_pem_file(cert, key).await?;
    info!(cert, "loaded TLS certificate");
    Ok(Some(config))
}
