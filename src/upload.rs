//! 分片上传处理器：`POST /file`、`PUT /file/{id}`、`POST /file/{id}`。

use axum::Error as AxumError;
use axum::body::{Body as AxumBody, Bytes};
use axum::extract::{Extension, Path};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Json as JsonResponse, Response};
use futures_util::stream::StreamExt;
use http_body_util::BodyExt;
use httpdate::fmt_http_date;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::fs;
use tracing::{debug, info, warn};

use crate::error::ApiError;
use crate::session::UploadManager;

#[derive(Deserialize)]
pub(crate) struct FileInit {
    name: String,
    size: u64,
    chunk: u64,
    #[serde(default)]
    path: Option<String>,
}

#[derive(Debug, Serialize)]
pub(crate) struct FinalizeResponse {
    name: String,
    size: u64,
}

/// 创建上传会话，响应体为纯文本会话 ID。
///
/// 浏览器客户端提交时不带 JSON Content-Type，因此手动解析请求体。
pub async fn create_file(
    Extension(manager): Extension<Arc<UploadManager>>,
    body: Bytes,
) -> Result<String, ApiError> {
    let FileInit {
        name,
        size,
        chunk,
        path,
    } = serde_json::from_slice(&body)
        .map_err(|err| ApiError::BadRequest(format!("invalid upload request: {err}")))?;
    let id = manager.create(&name, size, chunk, path.as_deref()).await?;
    Ok(id)
}

/// 追加一个分片，成功返回 204。
pub async fn write_chunk(
    Path(id): Path<String>,
    headers: HeaderMap,
    Extension(manager): Extension<Arc<UploadManager>>,
    body: AxumBody,
) -> Result<StatusCode, ApiError> {
    let range = parse_content_range(headers.get(header::CONTENT_RANGE))?;
    let limit = manager.config().max_chunk_size;

    let mut payload = Vec::new();
    let mut data_stream = BodyExt::into_data_stream(body);
    while let Some(chunk) = data_stream.next().await {
        let chunk = chunk.map_err(|err: AxumError| ApiError::BadRequest(err.to_string()))?;
        if payload.len() as u64 + chunk.len() as u64 > limit {
            warn!(upload_id = id, limit, "chunk body too large");
            return Err(ApiError::PayloadTooLarge("chunk too large".into()));
        }
        payload.extend_from_slice(&chunk);
    }

    let offset = match range {
        Some(ChunkRange { start, end }) => {
            if (end - start).saturating_add(1) != payload.len() as u64 {
                return Err(ApiError::BadRequest(
                    "Content-Range does not match body length".into(),
                ));
            }
            Some(start)
        }
        None => None,
    };

    let received = manager.append_chunk(&id, offset, &payload).await?;
    debug!(upload_id = id, bytes = payload.len(), received, "chunk accepted");
    Ok(StatusCode::NO_CONTENT)
}

/// 完成上传：校验字节数并原子发布文件。
pub async fn finalize_file(
    Path(id): Path<String>,
    Extension(manager): Extension<Arc<UploadManager>>,
) -> Result<Response, ApiError> {
    let published = manager.finalize(&id).await?;
    info!(
        upload_id = id,
        name = published.name,
        size = published.size,
        "upload finalized"
    );

    let mut response_headers = HeaderMap::new();
    if let Ok(metadata) = fs::metadata(&published.path).await
        && let Ok(modified) = metadata.modified()
    {
        let value = fmt_http_date(modified);
        response_headers.insert(
            header::LAST_MODIFIED,
            HeaderValue::from_str(&value)
                .map_err(|_| ApiError::Internal("failed to build response headers".into()))?,
        );
    }
    Ok((
        StatusCode::OK,
        response_headers,
        JsonResponse(FinalizeResponse {
            name: published.name,
            size: published.size,
        }),
    )
        .into_response())
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct ChunkRange {
    start: u64,
    end: u64,
}

/// 解析 `Content-Range: bytes <start>-<end>/<total|*>`（end 含）。
fn parse_content_range(value: Option<&HeaderValue>) -> Result<Option<ChunkRange>, ApiError> {
    let Some(value) = value else {
        return Ok(None);
    };
    let invalid = || ApiError::BadRequest("invalid Content-Range header".into());
    let value = value.to_str().map_err(|_| invalid())?;
    let range = value.trim().strip_prefix("bytes ").ok_or_else(invalid)?;
    let (span, total) = range.split_once('/').ok_or_else(invalid)?;
    let (start, end) = span.split_once('-').ok_or_else(invalid)?;
    let start: u64 = start.trim().parse().map_err(|_| invalid())?;
    let end: u64 = end.trim().parse().map_err(|_| invalid())?;
    if end < start {
        return Err(invalid());
    }
    let total = total.trim();
    if total != "*" {
        let total: u64 = total.parse().map_err(|_| invalid())?;
        if end >= total {
            return Err(invalid());
        }
    }
    Ok(Some(ChunkRange { start, end }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::tempdir;

    use crate::chunk_store::ChunkStore;
    use crate::files::{OptionalPathQuery, list_files};
    use crate::session::UploadConfig;
    use crate::status::ResourceStatus;
    use crate::storage::Storage;
    use axum::extract::Query;

    struct Fixture {
        _temp: tempfile::TempDir,
        storage: Arc<Storage>,
        manager: Arc<UploadManager>,
    }

    async fn fixture() -> Fixture {
        let temp = tempdir().expect("tempdir");
        let storage = Arc::new(
            Storage::open(temp.path().join("storage"))
                .await
                .expect("open storage"),
        );
        let store = ChunkStore::new(storage.default_temp_dir());
        store.prepare().await.expect("prepare");
        let manager = Arc::new(UploadManager::new(
            store,
            storage.clone(),
            Arc::new(ResourceStatus::new()),
            UploadConfig {
                max_total_size: 0,
                max_chunk_size: 8,
                max_concurrent: 0,
                idle_ttl: Duration::from_secs(3600),
            },
        ));
        Fixture {
            _temp: temp,
            storage,
            manager,
        }
    }

    async fn put_chunk(
        manager: &Arc<UploadManager>,
        id: &str,
        range: Option<&'static str>,
        body: &'static [u8],
    ) -> Result<StatusCode, ApiError> {
        let mut headers = HeaderMap::new();
        if let Some(range) = range {
            headers.insert(header::CONTENT_RANGE, HeaderValue::from_static(range));
        }
        write_chunk(
            Path(id.to_string()),
            headers,
            Extension(manager.clone()),
            AxumBody::from(body),
        )
        .await
    }

    #[tokio::test]
    async fn upload_flow_publishes_listable_file() {
        let fx = fixture().await;
        let id = create_file(
            Extension(fx.manager.clone()),
            Bytes::from_static(br#"{"size": 10, "chunk": 4, "name": "a.txt"}"#),
        )
        .await
        .expect("create");
        assert_eq!(id.len(), 32);

        for body in [&b"0123"[..], b"4567", b"89"] {
            let status = put_chunk(&fx.manager, &id, None, body).await.expect("put");
            assert_eq!(status, StatusCode::NO_CONTENT);
        }

        let response = finalize_file(Path(id.clone()), Extension(fx.manager.clone()))
            .await
            .expect("finalize");
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key(header::LAST_MODIFIED));

        let JsonResponse(entries) = list_files(
            Query(OptionalPathQuery {
                path: Some(".".into()),
            }),
            Extension(fx.storage.clone()),
            Bytes::new(),
        )
        .await
        .expect("list");
        let json = serde_json::to_value(&entries).expect("serialize");
        assert_eq!(json[0]["name"], "a.txt");
        assert_eq!(json[0]["dir"], false);
        assert_eq!(json[0]["sym"], false);
        assert_eq!(json[0]["size"], 10);
    }

    #[tokio::test]
    async fn create_file_rejects_malformed_bodies() {
        let fx = fixture().await;
        for body in [
            &br#"{"size": -1, "chunk": 4, "name": "a"}"#[..],
            br#"{"size": 1, "chunk": 4}"#,
            br#"{"size": 1, "chunk": 4, "name": "../a"}"#,
            b"not json",
        ] {
            let result = create_file(Extension(fx.manager.clone()), Bytes::from_static(body)).await;
            assert!(matches!(result, Err(ApiError::BadRequest(_))));
        }
        let result = create_file(
            Extension(fx.manager.clone()),
            Bytes::from_static(br#"{"size": 1, "chunk": 4, "name": "a", "path": "../.."}"#),
        )
        .await;
        assert!(matches!(result, Err(ApiError::Forbidden(_))));
    }

    #[tokio::test]
    async fn explicit_offsets_detect_gaps() {
        let fx = fixture().await;
        let id = fx.manager.create("gap.bin", 10, 4, None).await.expect("create");

        put_chunk(&fx.manager, &id, Some("bytes 0-3/10"), b"abcd")
            .await
            .expect("first chunk");
        let result = put_chunk(&fx.manager, &id, Some("bytes 5-8/10"), b"efgh").await;
        assert!(matches!(result, Err(ApiError::RangeNotSatisfiable(4))));

        let result = put_chunk(&fx.manager, &id, Some("bytes 4-9/10"), b"efgh").await;
        assert!(matches!(result, Err(ApiError::BadRequest(_))));

        put_chunk(&fx.manager, &id, Some("bytes 4-7/*"), b"efgh")
            .await
            .expect("second chunk");
    }

    #[tokio::test]
    async fn oversized_and_unknown_chunks_fail() {
        let fx = fixture().await;
        let id = fx.manager.create("big.bin", 32, 8, None).await.expect("create");
        let result = put_chunk(&fx.manager, &id, None, b"0123456789").await;
        assert!(matches!(result, Err(ApiError::PayloadTooLarge(_))));

        let result = put_chunk(&fx.manager, "missing", None, b"abc").await;
        assert!(matches!(result, Err(ApiError::NotFound(_))));

        let result = finalize_file(Path(id), Extension(fx.manager.clone())).await;
        assert!(matches!(result, Err(ApiError::PreconditionFailed(_))));
        assert!(
            fs::metadata(fx.storage.root_path().join("big.bin"))
                .await
                .is_err()
        );
    }

    #[test]
    fn content_range_parsing() {
        let parse = |value: &'static str| parse_content_range(Some(&HeaderValue::from_static(value)));
        assert_eq!(
            parse("bytes 0-3/10").expect("valid"),
            Some(ChunkRange { start: 0, end: 3 })
        );
        assert_eq!(
            parse("bytes 8-9/*").expect("valid"),
            Some(ChunkRange { start: 8, end: 9 })
        );
        for value in ["bytes 3-1/10", "bytes 0-10/10", "items 0-3/10", "bytes 0-3", "bytes a-3/10"] {
            assert!(parse(value).is_err(), "{value}");
        }
        assert!(matches!(parse_content_range(None), Ok(None)));
    }
}
