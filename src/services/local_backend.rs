//! src/services/local_backend.rs
//!
//! LocalStorageBackend: buckets are directories beneath `base_path`, each
//! carrying a `.bucket.json` configuration file. Object payloads are sharded
//! beneath `base_path/{bucket}/{shard}/{shard}/{key}` with a hidden JSON
//! sidecar holding content type and etag.

use crate::{
    models::bucket::{Bucket, BucketConfig},
    services::storage_backend::{
        BackendError, BackendResult, ObjectBody, PutObject, StorageBackend, StoredObject,
    },
};
use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
};
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tokio_util::io::ReaderStream;
use tracing::debug;
use uuid::Uuid;

const BUCKET_CONFIG_FILE: &str = ".bucket.json";
const MAX_OBJECT_KEY_LEN: usize = 1024;
const BUCKET_NAME_MIN_LEN: usize = 3;
const BUCKET_NAME_MAX_LEN: usize = 63;

#[derive(Serialize, Deserialize)]
struct ObjectSidecar {
    content_type: String,
    etag: String,
    size_bytes: u64,
}

/// Filesystem-backed storage used for single-node deployments and tests.
#[derive(Clone, Debug)]
pub struct LocalStorageBackend {
    /// Base directory holding one directory per bucket.
    base_path: PathBuf,

    /// Origin prefixed to public object URLs (usually this gateway).
    public_base_url: String,
}

impl LocalStorageBackend {
    pub fn new(base_path: impl Into<PathBuf>, public_base_url: impl Into<String>) -> Self {
        Self {
            base_path: base_path.into(),
            public_base_url: public_base_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// Keys are a single path component. Without a separator, `.` and `..`
    /// can only traverse as the whole key, which the leading-dot rule covers.
    ///
    /// Leading dots are rejected as well so keys never collide with the
    /// hidden sidecar and temp files.
    fn ensure_key_safe(key: &str) -> BackendResult<()> {
        if key.is_empty() || key.len() > MAX_OBJECT_KEY_LEN {
            return Err(BackendError::InvalidObjectKey);
        }
        if key.starts_with('.') || key.contains('/') {
            return Err(BackendError::InvalidObjectKey);
        }
        if key
            .bytes()
            .any(|b| b.is_ascii_control() || b == b'\\' || b == b'\0')
        {
            return Err(BackendError::InvalidObjectKey);
        }
        Ok(())
    }

    /// Enforces S3-like naming rules: 3–63 characters of lowercase letters,
    /// digits, dots and hyphens, starting and ending alphanumerically.
    fn ensure_bucket_name_safe(name: &str) -> BackendResult<()> {
        let invalid = |reason: &str| BackendError::InvalidBucketName {
            name: name.to_string(),
            reason: reason.into(),
        };

        let len = name.len();
        if !(BUCKET_NAME_MIN_LEN..=BUCKET_NAME_MAX_LEN).contains(&len) {
            return Err(invalid("must be between 3 and 63 characters"));
        }
        if !name
            .chars()
            .all(|c| matches!(c, 'a'..='z' | '0'..='9' | '.' | '-'))
        {
            return Err(invalid(
                "allowed characters are lowercase letters, digits, dots, and hyphens",
            ));
        }
        if name.starts_with(['.', '-']) || name.ends_with(['.', '-']) {
            return Err(invalid("must start and end with a lowercase letter or digit"));
        }
        if name.contains("..") || name.contains("-.") || name.contains(".-") {
            return Err(invalid(
                "cannot contain consecutive dots or dot-hyphen combinations",
            ));
        }
        Ok(())
    }

    fn bucket_root(&self, bucket: &str) -> PathBuf {
        self.base_path.join(bucket)
    }

    /// Two-level shard identifiers from MD5(bucket/key).
    fn object_shards(bucket: &str, key: &str) -> (String, String) {
        let digest = md5::compute(format!("{}/{}", bucket, key));
        (format!("{:02x}", digest[0]), format!("{:02x}", digest[1]))
    }

    fn object_path(&self, bucket: &str, key: &str) -> PathBuf {
        let (shard_a, shard_b) = Self::object_shards(bucket, key);
        self.bucket_root(bucket).join(shard_a).join(shard_b).join(key)
    }

    fn sidecar_path(object_path: &Path, key: &str) -> PathBuf {
        object_path.with_file_name(format!(".{}.json", key))
    }

    async fn read_config(&self, bucket: &str) -> BackendResult<Bucket> {
        let path = self.bucket_root(bucket).join(BUCKET_CONFIG_FILE);
        let raw = fs::read(&path).await.map_err(|err| match err.kind() {
            ErrorKind::NotFound => BackendError::BucketNotFound(bucket.to_string()),
            _ => BackendError::Io(err),
        })?;
        Ok(serde_json::from_slice(&raw)?)
    }

    /// Write `contents` to `dir/name` via a temp file and rename.
    async fn write_atomic(dir: &Path, name: &str, contents: &[u8]) -> BackendResult<()> {
        let tmp_path = dir.join(format!(".tmp-{}", Uuid::new_v4()));
        let result = async {
            let mut file = File::create(&tmp_path).await?;
            file.write_all(contents).await?;
            file.sync_all().await?;
            fs::rename(&tmp_path, dir.join(name)).await
        }
        .await;
        if let Err(err) = result {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(BackendError::Io(err));
        }
        Ok(())
    }
}

#[async_trait]
impl StorageBackend for LocalStorageBackend {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn list_buckets(&self) -> BackendResult<Vec<Bucket>> {
        let mut entries = match fs::read_dir(&self.base_path).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let mut buckets = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if name.starts_with('.') {
                continue;
            }
            match self.read_config(&name).await {
                Ok(bucket) => buckets.push(bucket),
                Err(BackendError::BucketNotFound(_)) => {
                    debug!("skipping directory {} without bucket config", name)
                }
                Err(err) => return Err(err),
            }
        }
        buckets.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(buckets)
    }

    /// Stage the bucket directory (with its config) under a temp name and
    /// rename it into place. The rename fails when the bucket directory
    /// already exists, so exactly one concurrent creator wins.
    async fn create_bucket(&self, config: &BucketConfig) -> BackendResult<()> {
        Self::ensure_bucket_name_safe(&config.name)?;
        fs::create_dir_all(&self.base_path).await?;

        let staging = self.base_path.join(format!(".tmp-{}", Uuid::new_v4()));
        fs::create_dir(&staging).await?;
        let bucket = Bucket::from(config);
        if let Err(err) =
            Self::write_atomic(&staging, BUCKET_CONFIG_FILE, &serde_json::to_vec(&bucket)?).await
        {
            let _ = fs::remove_dir_all(&staging).await;
            return Err(err);
        }

        let root = self.bucket_root(&config.name);
        match fs::rename(&staging, &root).await {
            Ok(()) => Ok(()),
            Err(err) => {
                let _ = fs::remove_dir_all(&staging).await;
                if fs::try_exists(&root).await.unwrap_or(false) {
                    Err(BackendError::BucketAlreadyExists(config.name.clone()))
                } else {
                    Err(BackendError::Io(err))
                }
            }
        }
    }

    async fn update_bucket(&self, config: &BucketConfig) -> BackendResult<()> {
        Self::ensure_bucket_name_safe(&config.name)?;
        self.read_config(&config.name).await?;
        let bucket = Bucket::from(config);
        Self::write_atomic(
            &self.bucket_root(&config.name),
            BUCKET_CONFIG_FILE,
            &serde_json::to_vec(&bucket)?,
        )
        .await
    }

    async fn attach_public_policy(&self, bucket: &str) -> BackendResult<()> {
        let mut current = self.read_config(bucket).await?;
        if current.public {
            return Ok(());
        }
        current.public = true;
        Self::write_atomic(
            &self.bucket_root(bucket),
            BUCKET_CONFIG_FILE,
            &serde_json::to_vec(&current)?,
        )
        .await
    }

    /// Write bytes to a temp file, fsync, then move into place.
    ///
    /// Without `upsert` the final step is a hard link, which fails atomically
    /// when the key already exists.
    async fn put_object(&self, request: PutObject<'_>) -> BackendResult<StoredObject> {
        Self::ensure_key_safe(request.key)?;
        let bucket = self.read_config(request.bucket).await?;

        let size_bytes = request.data.len() as u64;
        if let Some(limit) = bucket.file_size_limit {
            if size_bytes > limit {
                return Err(BackendError::ObjectTooLarge {
                    size: size_bytes,
                    limit,
                });
            }
        }

        let file_path = self.object_path(request.bucket, request.key);
        let parent = file_path.parent().map(Path::to_path_buf).ok_or_else(|| {
            BackendError::Io(io::Error::new(
                ErrorKind::Other,
                "object path missing parent directory",
            ))
        })?;
        fs::create_dir_all(&parent).await?;

        let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));
        let written = async {
            let mut file = File::create(&tmp_path).await?;
            file.write_all(&request.data).await?;
            file.flush().await?;
            file.sync_all().await
        }
        .await;
        if let Err(err) = written {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(BackendError::Io(err));
        }

        let placed = if request.upsert {
            fs::rename(&tmp_path, &file_path).await
        } else {
            let linked = fs::hard_link(&tmp_path, &file_path).await;
            let _ = fs::remove_file(&tmp_path).await;
            linked
        };
        match placed {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                return Err(BackendError::ObjectAlreadyExists {
                    bucket: request.bucket.to_string(),
                    key: request.key.to_string(),
                });
            }
            Err(err) => {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(BackendError::Io(err));
            }
        }

        let etag = format!("{:x}", md5::compute(&request.data));
        let sidecar = ObjectSidecar {
            content_type: request.content_type.to_string(),
            etag: etag.clone(),
            size_bytes,
        };
        let sidecar_name = format!(".{}.json", request.key);
        Self::write_atomic(&parent, &sidecar_name, &serde_json::to_vec(&sidecar)?).await?;

        debug!(
            "stored {} bytes at {} (etag {})",
            size_bytes,
            file_path.display(),
            etag
        );

        Ok(StoredObject {
            key: request.key.to_string(),
            size_bytes,
            content_type: request.content_type.to_string(),
            etag: Some(etag),
        })
    }

    async fn get_object(&self, bucket: &str, key: &str) -> BackendResult<ObjectBody> {
        Self::ensure_key_safe(key)?;
        Self::ensure_bucket_name_safe(bucket)?;

        let file_path = self.object_path(bucket, key);
        let file = File::open(&file_path).await.map_err(|err| {
            if err.kind() == ErrorKind::NotFound {
                BackendError::ObjectNotFound {
                    bucket: bucket.to_string(),
                    key: key.to_string(),
                }
            } else {
                BackendError::Io(err)
            }
        })?;

        let sidecar = match fs::read(Self::sidecar_path(&file_path, key)).await {
            Ok(raw) => serde_json::from_slice::<ObjectSidecar>(&raw).ok(),
            Err(_) => None,
        };
        let size_bytes = match &sidecar {
            Some(meta) => Some(meta.size_bytes),
            None => file.metadata().await.ok().map(|m| m.len()),
        };

        Ok(ObjectBody {
            content_type: sidecar.map(|meta| meta.content_type),
            size_bytes,
            stream: ReaderStream::new(file).boxed(),
        })
    }

    fn public_url(&self, bucket: &str, key: &str) -> String {
        format!(
            "{}/storage/v1/object/public/{}/{}",
            self.public_base_url, bucket, key
        )
    }
}
