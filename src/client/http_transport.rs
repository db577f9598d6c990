//! `TransferChannel` over HTTP multipart, plus the small admin calls the
//! upload form makes before it renders.

use crate::client::{
    request::{FileSource, UploadPayload},
    transfer::{
        ParsedResponse, ProgressSink, TransferChannel, TransferError, TransferProgress,
        parse_response,
    },
};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{StreamExt, TryStreamExt, stream::BoxStream};
use reqwest::{
    Body, Client, RequestBuilder,
    multipart::{Form, Part},
};
use serde::Deserialize;
use std::{
    io,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};
use tokio_util::{io::ReaderStream, sync::CancellationToken};
use tracing::debug;

/// Timeout of the admin status probe.
const ADMIN_CHECK_TIMEOUT: Duration = Duration::from_secs(5);
const STORAGE_INIT_TIMEOUT: Duration = Duration::from_secs(60);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Chunk size used when streaming an in-memory document.
const CHUNK_SIZE: usize = 64 * 1024;

/// `GET /admin/check` response.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdminCheck {
    pub is_admin: bool,
    #[serde(default)]
    pub source: Option<String>,
}

#[derive(Clone, Debug)]
pub struct HttpTransferChannel {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl HttpTransferChannel {
    /// Per-request timeouts are applied by the caller, so the client itself
    /// only bounds connection setup.
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> reqwest::Result<Self> {
        let client = Client::builder().connect_timeout(CONNECT_TIMEOUT).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
        })
    }

    fn build_url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    /// Ask the gateway whether the current token belongs to an admin.
    pub async fn check_admin(&self) -> Result<AdminCheck, TransferError> {
        let request = self.authorized(self.client.get(self.build_url("/admin/check")));
        let response = exchange(request, ADMIN_CHECK_TIMEOUT).await?;
        serde_json::from_value(response.body)
            .map_err(|e| TransferError::Network(format!("unexpected admin check response: {}", e)))
    }

    /// Provision the papers bucket ahead of the first upload.
    pub async fn init_storage(&self) -> Result<ParsedResponse, TransferError> {
        let request = self.authorized(self.client.post(self.build_url("/storage/init")));
        exchange(request, STORAGE_INIT_TIMEOUT).await
    }

    async fn build_form(
        &self,
        payload: &UploadPayload,
        progress: ProgressSink,
    ) -> Result<Form, TransferError> {
        let file = &payload.file;
        let total = file.size;
        let chunks: BoxStream<'static, io::Result<Bytes>> = match &file.source {
            FileSource::Path(path) => {
                let handle = tokio::fs::File::open(path).await.map_err(|e| {
                    TransferError::Network(format!("could not read {}: {}", path.display(), e))
                })?;
                ReaderStream::new(handle).boxed()
            }
            FileSource::Memory(data) => futures::stream::iter(memory_chunks(data.clone())).boxed(),
        };

        let sent = Arc::new(AtomicU64::new(0));
        let counted = chunks.inspect_ok(move |chunk| {
            let len = chunk.len() as u64;
            let bytes_sent = sent.fetch_add(len, Ordering::Relaxed) + len;
            progress(TransferProgress {
                bytes_sent: bytes_sent.min(total),
                total_bytes: total,
            });
        });

        let part = Part::stream_with_length(Body::wrap_stream(counted), total)
            .file_name(file.name.clone())
            .mime_str(&file.content_type)
            .map_err(|e| TransferError::Network(e.to_string()))?;

        let mut form = Form::new()
            .text("subjectId", payload.subject_id.clone())
            .text("year", payload.year.to_string());
        if let Some(topic) = &payload.topic {
            form = form.text("topic", topic.clone());
        }
        if let Some(sub_category_id) = &payload.sub_category_id {
            form = form.text("subCategoryId", sub_category_id.clone());
        }
        Ok(form.part("file", part))
    }
}

#[async_trait]
impl TransferChannel for HttpTransferChannel {
    async fn send(
        &self,
        payload: &UploadPayload,
        progress: ProgressSink,
        cancel: CancellationToken,
        timeout: Duration,
    ) -> Result<ParsedResponse, TransferError> {
        let form = self.build_form(payload, progress).await?;
        let request = self
            .authorized(self.client.post(self.build_url("/upload")))
            .multipart(form);

        debug!(file = %payload.file.name, size = payload.file.size, ?timeout, "sending upload");
        // Dropping the exchange future aborts the request and frees the connection.
        tokio::select! {
            _ = cancel.cancelled() => Err(TransferError::Cancelled),
            result = exchange(request, timeout) => result,
        }
    }
}

/// Send `request` and read the whole response within `timeout`.
async fn exchange(
    request: RequestBuilder,
    timeout: Duration,
) -> Result<ParsedResponse, TransferError> {
    let round_trip = async {
        let response = request.send().await.map_err(|e| classify(e, timeout))?;
        let status = response.status();
        let body = response.bytes().await.map_err(|e| classify(e, timeout))?;
        parse_response(
            status.as_u16(),
            status.canonical_reason().unwrap_or("Unknown"),
            &body,
        )
    };

    match tokio::time::timeout(timeout, round_trip).await {
        Ok(result) => result,
        Err(_) => Err(TransferError::Timeout(timeout)),
    }
}

fn classify(err: reqwest::Error, timeout: Duration) -> TransferError {
    if err.is_timeout() {
        TransferError::Timeout(timeout)
    } else {
        TransferError::Network(err.to_string())
    }
}

fn memory_chunks(data: Bytes) -> Vec<io::Result<Bytes>> {
    let mut chunks = Vec::with_capacity(data.len() / CHUNK_SIZE + 1);
    let mut offset = 0;
    while offset < data.len() {
        let end = (offset + CHUNK_SIZE).min(data.len());
        chunks.push(Ok(data.slice(offset..end)));
        offset = end;
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        client::request::{ACCEPTED_CONTENT_TYPE, DocumentFile},
        routes::routes::routes,
        services::{
            local_backend::LocalStorageBackend,
            metadata_service::tests::{memory_store, seed_subject},
            upload_gateway::tests::gateway_with,
        },
    };
    use axum::{Router, http::StatusCode, routing::post};
    use chrono::Duration as TtlDuration;
    use std::sync::Mutex;
    use tokio::net::TcpListener;

    async fn serve(app: Router) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn payload(data: Vec<u8>) -> UploadPayload {
        UploadPayload {
            file: DocumentFile::from_bytes("Term 1 Paper.pdf", ACCEPTED_CONTENT_TYPE, data),
            subject_id: "S1".into(),
            sub_category_id: None,
            year: 2023,
            topic: Some("Algebra".into()),
        }
    }

    fn recording_sink() -> (ProgressSink, Arc<Mutex<Vec<u64>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = seen.clone();
        let sink: ProgressSink = Arc::new(move |p: TransferProgress| {
            sink_seen.lock().unwrap().push(p.bytes_sent);
        });
        (sink, seen)
    }

    #[tokio::test]
    async fn uploads_to_real_gateway() {
        let dir = tempfile::tempdir().unwrap();
        let metadata = memory_store().await;
        seed_subject(&metadata, "S1", false).await;
        let admin = metadata.upsert_user("admin@example.com", true).await.unwrap();
        let token = metadata
            .create_session(admin.id, TtlDuration::hours(1))
            .await
            .unwrap();
        let backend = Arc::new(LocalStorageBackend::new(dir.path(), "http://localhost:3000"));
        let gateway = gateway_with(metadata.clone(), backend, None);
        let base = serve(routes(gateway.limits.body_limit()).with_state(gateway)).await;

        let channel = HttpTransferChannel::new(&base, Some(token)).unwrap();
        assert!(channel.check_admin().await.unwrap().is_admin);

        let size = 2 * 1024 * 1024;
        let (sink, seen) = recording_sink();
        let response = channel
            .send(
                &payload(vec![7u8; size]),
                sink,
                CancellationToken::new(),
                Duration::from_secs(30),
            )
            .await
            .unwrap();

        assert_eq!(response.status, 200);
        assert_eq!(response.body["success"], true);
        assert_eq!(response.body["paper"]["year"], 2023);
        let file_url = response.body["paper"]["fileUrl"].as_str().unwrap();
        let (_, key) = file_url.split_once("/papers/").unwrap();
        let (timestamp, name) = key.split_once('_').unwrap();
        assert!(timestamp.bytes().all(|b| b.is_ascii_digit()));
        assert_eq!(name, "Term_1_Paper.pdf");
        assert_eq!(metadata.count_papers().await.unwrap(), 1);

        let seen = seen.lock().unwrap();
        assert!(seen.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(seen.last().copied(), Some(size as u64));
    }

    #[tokio::test]
    async fn missing_token_is_a_server_error() {
        let metadata = memory_store().await;
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(LocalStorageBackend::new(dir.path(), "http://localhost"));
        let gateway = gateway_with(metadata, backend, None);
        let base = serve(routes(gateway.limits.body_limit()).with_state(gateway)).await;

        let channel = HttpTransferChannel::new(&base, None).unwrap();
        let (sink, _) = recording_sink();
        let err = channel
            .send(&payload(vec![1u8; 8]), sink, CancellationToken::new(), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::Server { status: 401, .. }));
    }

    #[tokio::test]
    async fn plain_text_responses_fall_back() {
        let app = Router::new().route(
            "/upload",
            post(|| async { (StatusCode::BAD_GATEWAY, "upstream unavailable") }),
        );
        let base = serve(app).await;

        let channel = HttpTransferChannel::new(&base, Some("t".into())).unwrap();
        let (sink, _) = recording_sink();
        let err = channel
            .send(&payload(vec![1u8; 8]), sink, CancellationToken::new(), Duration::from_secs(5))
            .await
            .unwrap_err();
        let TransferError::Server { status, body } = err else {
            panic!("expected server error");
        };
        assert_eq!(status, 502);
        assert_eq!(body["error"], "Server returned status 502: Bad Gateway");
    }

    #[tokio::test]
    async fn slow_server_times_out_and_cancel_aborts() {
        let app = Router::new().route(
            "/upload",
            post(|| async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                "late"
            }),
        );
        let base = serve(app).await;
        let channel = HttpTransferChannel::new(&base, None).unwrap();

        let (sink, _) = recording_sink();
        let err = channel
            .send(
                &payload(vec![1u8; 8]),
                sink,
                CancellationToken::new(),
                Duration::from_millis(200),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::Timeout(_)));

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });
        let (sink, _) = recording_sink();
        let err = channel
            .send(&payload(vec![1u8; 8]), sink, cancel, Duration::from_secs(10))
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::Cancelled));
    }

    #[test]
    fn memory_chunks_cover_the_buffer() {
        let data = Bytes::from(vec![3u8; CHUNK_SIZE * 2 + 5]);
        let chunks = memory_chunks(data);
        assert_eq!(chunks.len(), 3);
        let total: usize = chunks.iter().map(|c| c.as_ref().unwrap().len()).sum();
        assert_eq!(total, CHUNK_SIZE * 2 + 5);
    }
}
