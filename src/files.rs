//! 目录列举与文件下载处理器。

use axum::body::{Body as AxumBody, Bytes};
use axum::extract::{Extension, Path, Query};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Json as JsonResponse, Response};
use futures_util::stream::StreamExt;
use httpdate::fmt_http_date;
use serde::Deserialize;
use std::sync::Arc;
use tokio::fs::File;
use tokio_util::io::ReaderStream;
use tracing::info;

use crate::error::ApiError;
use crate::status::ResourceStatus;
use crate::storage::{DirectoryEntry, Storage};

#[derive(Default, Deserialize)]
pub(crate) struct OptionalPathQuery {
    pub(crate) path: Option<String>,
}

/// 列出目录内容。路径取自查询参数 `path`，其次为 JSON 请求体 `{path}`，缺省为根目录。
pub async fn list_files(
    Query(query): Query<OptionalPathQuery>,
    Extension(storage): Extension<Arc<Storage>>,
    body: Bytes,
) -> Result<JsonResponse<Vec<DirectoryEntry>>, ApiError> {
    let path = match query.path {
        Some(path) => path,
        None if body.iter().all(u8::is_ascii_whitespace) => ".".to_string(),
        None => serde_json::from_slice::<OptionalPathQuery>(&body)
            .map_err(|err| ApiError::BadRequest(format!("invalid list request: {err}")))?
            .path
            .unwrap_or_else(|| ".".to_string()),
    };
    let entries = storage.list_dir(&path).await?;
    info!(path, count = entries.len(), "list files");
    Ok(JsonResponse(entries))
}

/// 下载已发布的文件。下载计数在响应体取走每个数据帧时累加，中断的下载只计已取走的部分。
pub async fn download_file(
    Path(path): Path<String>,
    Extension(storage): Extension<Arc<Storage>>,
    Extension(status): Extension<Arc<ResourceStatus>>,
) -> Result<Response, ApiError> {
    let target = storage.resolve_file(&path).await?;
    let file = File::open(&target)
        .await
        .map_err(|err| ApiError::Internal(err.to_string()))?;
    let metadata = file
        .metadata()
        .await
        .map_err(|err| ApiError::Internal(err.to_string()))?;
    let file_size = metadata.len();
    let mime = mime_guess::from_path(&target).first_or_octet_stream();

    let mut response_headers = HeaderMap::new();
    response_headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(mime.essence_str())
            .map_err(|_| ApiError::Internal("invalid MIME type".into()))?,
    );
    response_headers.insert(header::CONTENT_LENGTH, HeaderValue::from(file_size));
    if let Ok(modified) = metadata.modified()
        && let Ok(value) = HeaderValue::from_str(&fmt_http_date(modified))
    {
        response_headers.insert(header::LAST_MODIFIED, value);
    }

    info!(path, size = file_size, "download file");
    let stream = ReaderStream::new(file).inspect(move |chunk| {
        if let Ok(bytes) = chunk {
            status.record_download(bytes.len() as u64);
        }
    });
    Ok((
        StatusCode::OK,
        response_headers,
        AxumBody::from_stream(stream),
    )
        .into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;
    use tempfile::tempdir;

    async fn make_storage() -> (tempfile::TempDir, Arc<Storage>) {
        let temp = tempdir().expect("tempdir");
        let storage = Storage::open(temp.path().join("storage"))
            .await
            .expect("open storage");
        (temp, Arc::new(storage))
    }

    async fn list(
        storage: &Arc<Storage>,
        query: Option<&str>,
        body: &'static [u8],
    ) -> Result<Vec<DirectoryEntry>, ApiError> {
        list_files(
            Query(OptionalPathQuery {
                path: query.map(str::to_string),
            }),
            Extension(storage.clone()),
            Bytes::from_static(body),
        )
        .await
        .map(|JsonResponse(entries)| entries)
    }

    #[tokio::test]
    async fn list_files_accepts_query_or_body_path() {
        let (_temp, storage) = make_storage().await;
        std::fs::create_dir_all(storage.root_path().join("docs")).expect("mkdir");
        std::fs::write(storage.root_path().join("docs/readme.md"), b"# hi").expect("write");

        let root = list(&storage, None, b"").await.expect("list root");
        assert_eq!(root.len(), 1);
        assert!(root[0].is_directory);

        let by_query = list(&storage, Some("./docs"), b"").await.expect("query");
        assert_eq!(by_query[0].name, "readme.md");
        let by_body = list(&storage, None, br#"{"path": "docs"}"#).await.expect("body");
        assert_eq!(by_body[0].size_bytes, Some(4));

        let result = list(&storage, None, b"{").await;
        assert!(matches!(result, Err(ApiError::BadRequest(_))));
    }

    #[tokio::test]
    async fn list_files_rejects_traversal() {
        let (_temp, storage) = make_storage().await;
        for path in ["..", "../", "docs/../..", "./../storage", "..\\.."] {
            let result = list(&storage, Some(path), b"").await;
            assert!(matches!(result, Err(ApiError::Forbidden(_))), "{path}");
        }
        let result = list(&storage, None, br#"{"path": "../etc"}"#).await;
        assert!(matches!(result, Err(ApiError::Forbidden(_))));
    }

    #[tokio::test]
    async fn download_streams_file_and_counts_bytes() {
        let (_temp, storage) = make_storage().await;
        std::fs::write(storage.root_path().join("notes.txt"), b"hello world").expect("write");
        let status = Arc::new(ResourceStatus::new());

        let response = download_file(
            Path("./notes.txt".to_string()),
            Extension(storage.clone()),
            Extension(status.clone()),
        )
        .await
        .expect("download");
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE),
            Some(&HeaderValue::from_static("text/plain"))
        );
        let body = response
            .into_body()
            .collect()
            .await
            .expect("collect body")
            .to_bytes();
        assert_eq!(&body[..], b"hello world");
        assert_eq!(status.snapshot().download, 11);
    }

    #[tokio::test]
    async fn aborted_download_counts_only_pulled_frames() {
        let (_temp, storage) = make_storage().await;
        let payload = vec![b'x'; 256 * 1024];
        std::fs::write(storage.root_path().join("large.bin"), &payload).expect("write");
        let status = Arc::new(ResourceStatus::new());

        let response = download_file(
            Path("large.bin".to_string()),
            Extension(storage.clone()),
            Extension(status.clone()),
        )
        .await
        .expect("download");
        assert_eq!(status.snapshot().download, 0);

        let mut body = response.into_body();
        let frame = body
            .frame()
            .await
            .expect("first frame")
            .expect("frame ok")
            .into_data()
            .expect("data frame");
        drop(body);

        let counted = status.snapshot().download;
        assert_eq!(counted, frame.len() as u64);
        assert!(counted < payload.len() as u64);
    }

    #[tokio::test]
    async fn download_refuses_directories_and_scratch_files() {
        let (_temp, storage) = make_storage().await;
        let status = Arc::new(ResourceStatus::new());
        std::fs::create_dir_all(storage.root_path().join("docs")).expect("mkdir");
        std::fs::create_dir_all(storage.default_temp_dir()).expect("mkdir temp");
        std::fs::write(storage.default_temp_dir().join("abc.part"), b"partial").expect("write");

        let result = download_file(
            Path("docs".to_string()),
            Extension(storage.clone()),
            Extension(status.clone()),
        )
        .await;
        assert!(matches!(result, Err(ApiError::NotFound(_))));

        let result = download_file(
            Path(".upload_temp/abc.part".to_string()),
            Extension(storage.clone()),
            Extension(status.clone()),
        )
        .await;
        assert!(matches!(result, Err(ApiError::Forbidden(_))));
        assert_eq!(status.snapshot().download, 0);
    }
}
