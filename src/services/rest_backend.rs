//! Storage backend speaking the hosted storage REST API
//! (`/storage/v1/bucket`, `/storage/v1/object/...`) with a service key.

use crate::{
    models::bucket::{Bucket, BucketConfig},
    services::storage_backend::{
        BackendError, BackendResult, ObjectBody, PutObject, StorageBackend, StoredObject,
        looks_like_conflict,
    },
};
use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use reqwest::{Client, RequestBuilder, Response, header};
use serde_json::json;
use std::{io, time::Duration};
use tracing::debug;

/// Per-request ceiling; a single 50 MiB write must fit inside it.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone, Debug)]
pub struct RestStorageBackend {
    client: Client,
    base_url: String,
    service_key: String,
}

impl RestStorageBackend {
    pub fn new(base_url: impl Into<String>, service_key: impl Into<String>) -> BackendResult<Self> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .connect_timeout(CONNECT_TIMEOUT)
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            service_key: service_key.into(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/storage/v1{}", self.base_url, path)
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        request.bearer_auth(&self.service_key)
    }

    /// Turn a non-2xx response into [`BackendError::Status`].
    async fn check(response: Response) -> BackendResult<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response
            .text()
            .await
            .unwrap_or_else(|_| status.canonical_reason().unwrap_or("").to_string());
        Err(BackendError::Status {
            status: status.as_u16(),
            message,
        })
    }
}

#[async_trait]
impl StorageBackend for RestStorageBackend {
    fn name(&self) -> &'static str {
        "rest"
    }

    async fn list_buckets(&self) -> BackendResult<Vec<Bucket>> {
        let response = self
            .authorized(self.client.get(self.url("/bucket")))
            .send()
            .await?;
        Ok(Self::check(response).await?.json().await?)
    }

    async fn create_bucket(&self, config: &BucketConfig) -> BackendResult<()> {
        let response = self
            .authorized(self.client.post(self.url("/bucket")))
            .json(&json!({
                "name": config.name,
                "public": config.public,
                "file_size_limit": config.file_size_limit,
            }))
            .send()
            .await?;

        match Self::check(response).await {
            Ok(_) => Ok(()),
            Err(BackendError::Status { status, message })
                if looks_like_conflict(status, &message) =>
            {
                Err(BackendError::BucketAlreadyExists(config.name.clone()))
            }
            Err(err) => Err(err),
        }
    }

    async fn update_bucket(&self, config: &BucketConfig) -> BackendResult<()> {
        let response = self
            .authorized(self.client.put(self.url(&format!("/bucket/{}", config.name))))
            .json(&json!({
                "public": config.public,
                "file_size_limit": config.file_size_limit,
            }))
            .send()
            .await?;

        match Self::check(response).await {
            Ok(_) => Ok(()),
            Err(BackendError::Status { status: 404, .. }) => {
                Err(BackendError::BucketNotFound(config.name.clone()))
            }
            Err(err) => Err(err),
        }
    }

    async fn attach_public_policy(&self, bucket: &str) -> BackendResult<()> {
        let response = self
            .authorized(self.client.post(self.url(&format!("/bucket/{}/policy", bucket))))
            .json(&json!({
                "name": "public-access",
                "definition": {
                    "type": "object",
                    "properties": { "name": { "type": "string" } }
                },
                "allow": "select",
            }))
            .send()
            .await?;
        Self::check(response).await.map(|_| ())
    }

    async fn put_object(&self, request: PutObject<'_>) -> BackendResult<StoredObject> {
        let size_bytes = request.data.len() as u64;
        let response = self
            .authorized(
                self.client
                    .post(self.url(&format!("/object/{}/{}", request.bucket, request.key))),
            )
            .header(header::CONTENT_TYPE, request.content_type)
            .header(header::CACHE_CONTROL, "3600")
            .header("x-upsert", if request.upsert { "true" } else { "false" })
            .body(request.data)
            .send()
            .await?;

        let etag = response
            .headers()
            .get(header::ETAG)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.trim_matches('"').to_string());

        match Self::check(response).await {
            Ok(_) => {}
            Err(BackendError::Status { status, message })
                if looks_like_conflict(status, &message) =>
            {
                return Err(BackendError::ObjectAlreadyExists {
                    bucket: request.bucket.to_string(),
                    key: request.key.to_string(),
                });
            }
            Err(BackendError::Status { status: 404, message })
                if message.to_ascii_lowercase().contains("bucket") =>
            {
                return Err(BackendError::BucketNotFound(request.bucket.to_string()));
            }
            Err(err) => return Err(err),
        }

        debug!("stored {} bytes at {}/{}", size_bytes, request.bucket, request.key);
        Ok(StoredObject {
            key: request.key.to_string(),
            size_bytes,
            content_type: request.content_type.to_string(),
            etag,
        })
    }

    async fn get_object(&self, bucket: &str, key: &str) -> BackendResult<ObjectBody> {
        let response = self
            .authorized(self.client.get(self.url(&format!("/object/{}/{}", bucket, key))))
            .send()
            .await?;

        let response = match Self::check(response).await {
            Ok(response) => response,
            Err(BackendError::Status { status: 400 | 404, .. }) => {
                return Err(BackendError::ObjectNotFound {
                    bucket: bucket.to_string(),
                    key: key.to_string(),
                });
            }
            Err(err) => return Err(err),
        };

        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let size_bytes = response.content_length();
        let stream = response.bytes_stream().map_err(io::Error::other).boxed();

        Ok(ObjectBody {
            content_type,
            size_bytes,
            stream,
        })
    }

    fn public_url(&self, bucket: &str, key: &str) -> String {
        format!("{}/storage/v1/object/public/{}/{}", self.base_url, bucket, key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::{
        object_store::{ObjectStore, RetryPolicy},
        provisioner::{ProvisionOutcome, StorageProvisioner},
    };
    use axum::{
        Json, Router,
        extract::{Path, State},
        http::{HeaderMap, StatusCode},
        response::IntoResponse,
        routing::{get, post},
    };
    use bytes::Bytes;
    use serde_json::Value;
    use std::sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    };
    use tokio::net::TcpListener;

    /// In-process stand-in for the hosted storage API.
    #[derive(Clone, Default)]
    struct StubStorage {
        object_writes: Arc<Mutex<Vec<HeaderMap>>>,
        failing_writes: Arc<AtomicUsize>,
    }

    async fn list_buckets() -> Json<Value> {
        Json(json!([]))
    }

    async fn create_bucket() -> impl IntoResponse {
        (
            StatusCode::BAD_REQUEST,
            Json(json!({
                "statusCode": "409",
                "error": "Duplicate",
                "message": "The resource already exists",
            })),
        )
    }

    async fn put_object(
        State(stub): State<StubStorage>,
        Path((bucket, key)): Path<(String, String)>,
        headers: HeaderMap,
        body: Bytes,
    ) -> axum::response::Response {
        let upsert = headers
            .get("x-upsert")
            .is_some_and(|v| v.as_bytes() == b"true");
        stub.object_writes.lock().unwrap().push(headers);

        if bucket == "missing" {
            let body = json!({"statusCode": "404", "error": "Bucket not found"});
            return (StatusCode::NOT_FOUND, Json(body)).into_response();
        }
        if key.starts_with("taken") && !upsert {
            return (StatusCode::CONFLICT, "exists").into_response();
        }
        if stub
            .failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return StatusCode::SERVICE_UNAVAILABLE.into_response();
        }
        let stored = json!({"Key": format!("{bucket}/{key}"), "size": body.len()});
        ([("etag", "\"abc123\"")], Json(stored)).into_response()
    }

    async fn serve(stub: StubStorage) -> String {
        let app = Router::new()
            .route("/storage/v1/bucket", get(list_buckets).post(create_bucket))
            .route("/storage/v1/object/{bucket}/{key}", post(put_object))
            .with_state(stub);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn header<'a>(headers: &'a HeaderMap, name: &str) -> &'a str {
        headers.get(name).and_then(|v| v.to_str().ok()).unwrap_or("")
    }

    fn write<'a>(bucket: &'a str, key: &'a str) -> PutObject<'a> {
        PutObject {
            bucket,
            key,
            data: Bytes::from_static(b"%PDF-1.7"),
            content_type: "application/pdf",
            upsert: false,
        }
    }

    #[tokio::test]
    async fn duplicate_bucket_answer_counts_as_provisioned() {
        let base_url = serve(StubStorage::default()).await;
        let backend = Arc::new(RestStorageBackend::new(&base_url, "svc-key").unwrap());

        let err = backend
            .create_bucket(&BucketConfig::new("papers", 1024))
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::BucketAlreadyExists(name) if name == "papers"));

        let provisioner = StorageProvisioner::new(backend, BucketConfig::new("papers", 1024));
        assert_eq!(
            provisioner.ensure_bucket().await.unwrap(),
            ProvisionOutcome::CreatedConcurrently
        );
    }

    #[tokio::test]
    async fn retried_write_switches_to_upsert_and_sends_cache_header() {
        let stub = StubStorage::default();
        stub.failing_writes.store(1, Ordering::SeqCst);
        let base_url = serve(stub.clone()).await;
        let backend = Arc::new(RestStorageBackend::new(&base_url, "svc-key").unwrap());
        let store = ObjectStore::new(backend, "papers").with_retry_policy(RetryPolicy {
            max_attempts: 3,
            delay: Duration::from_millis(1),
        });

        let stored = store
            .put_with_retry(
                Bytes::from_static(b"%PDF-1.7"),
                "1700000000000_a.pdf",
                "application/pdf",
            )
            .await
            .unwrap();
        assert_eq!(stored.size_bytes, 8);
        assert_eq!(stored.etag.as_deref(), Some("abc123"));

        let writes = stub.object_writes.lock().unwrap().clone();
        let upserts: Vec<&str> = writes.iter().map(|h| header(h, "x-upsert")).collect();
        assert_eq!(upserts, vec!["false", "true"]);
        for headers in &writes {
            assert_eq!(header(headers, "cache-control"), "3600");
            assert_eq!(header(headers, "content-type"), "application/pdf");
            assert_eq!(header(headers, "authorization"), "Bearer svc-key");
        }
    }

    #[tokio::test]
    async fn write_errors_are_classified() {
        let base_url = serve(StubStorage::default()).await;
        let backend = RestStorageBackend::new(&base_url, "svc-key").unwrap();

        let err = backend
            .put_object(write("missing", "1_a.pdf"))
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::BucketNotFound(name) if name == "missing"));

        let err = backend
            .put_object(write("papers", "taken.pdf"))
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::ObjectAlreadyExists { key, .. } if key == "taken.pdf"));

        let mut upsert = write("papers", "taken.pdf");
        upsert.upsert = true;
        assert!(backend.put_object(upsert).await.is_ok());
    }

    #[test]
    fn public_url_uses_storage_origin() {
        let backend = RestStorageBackend::new("https://storage.example.com/", "key").unwrap();
        assert_eq!(
            backend.public_url("papers", "1700000000000_a.pdf"),
            "https://storage.example.com/storage/v1/object/public/papers/1700000000000_a.pdf"
        );
    }

    #[test]
    fn endpoint_urls_share_the_api_prefix() {
        let backend = RestStorageBackend::new("https://storage.example.com", "key").unwrap();
        assert_eq!(
            backend.url("/bucket"),
            "https://storage.example.com/storage/v1/bucket"
        );
    }
}
