use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use thiserror::Error;
use tokio::fs;

use crate::config::StorageConfig;
use crate::services::retry::Transient;

// Object storage access for inbound documents.
//
// `ObjectFetcher` separates "the key does not exist" from failures: a missing
// object is a value (`FetchedObject::NotFound`) the consumer branches on, while
// `ObjectStoreError` only carries conditions that abort the fetch.

/// Outcome of a successful fetch call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchedObject {
    Found(Bytes),
    NotFound,
}

#[derive(Debug, Error)]
pub enum ObjectStoreError {
    #[error("invalid object key `{key}` in bucket `{bucket}`")]
    InvalidKey { bucket: String, key: String },
    #[error("unknown storage backend `{0}`")]
    UnknownBackend(String),
    #[error("io error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("permission denied for {0}")]
    PermissionDenied(String),
    #[error("object storage request failed: {0}")]
    Backend(String),
}

impl Transient for ObjectStoreError {
    fn is_transient(&self) -> bool {
        matches!(
            self,
            ObjectStoreError::Io { .. }
                | ObjectStoreError::PermissionDenied(_)
                | ObjectStoreError::Backend(_)
        )
    }
}

/// Read-only access to an object store.
#[async_trait::async_trait]
pub trait ObjectFetcher: Send + Sync {
    async fn fetch(&self, bucket: &str, key: &str) -> Result<FetchedObject, ObjectStoreError>;
}

/// Filesystem object store: objects live at `<root>/<bucket>/<key>`.
#[derive(Debug, Clone, bon::Builder)]
pub struct FsObjectStore {
    #[builder(into)]
    root: PathBuf,
}

impl FsObjectStore {
    fn object_path(&self, bucket: &str, key: &str) -> Result<PathBuf, ObjectStoreError> {
        validate_location(bucket, key)?;
        let mut path = self.root.clone();
        path.push(bucket);
        path.push(key);
        Ok(path)
    }
}

#[async_trait::async_trait]
impl ObjectFetcher for FsObjectStore {
    async fn fetch(&self, bucket: &str, key: &str) -> Result<FetchedObject, ObjectStoreError> {
        let path = self.object_path(bucket, key)?;
        match fs::read(&path).await {
            Ok(data) => Ok(FetchedObject::Found(Bytes::from(data))),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(FetchedObject::NotFound),
            Err(err) if err.kind() == io::ErrorKind::PermissionDenied => Err(
                ObjectStoreError::PermissionDenied(path.to_string_lossy().into_owned()),
            ),
            Err(source) => Err(ObjectStoreError::Io { path, source }),
        }
    }
}

/// Reject empty buckets and keys that would escape the bucket.
fn validate_location(bucket: &str, key: &str) -> Result<(), ObjectStoreError> {
    let invalid = || ObjectStoreError::InvalidKey {
        bucket: bucket.to_string(),
        key: key.to_string(),
    };
    if bucket.trim().is_empty() || key.trim().is_empty() || bucket.contains(['/', '\\']) {
        return Err(invalid());
    }
    if key.split('/').any(|segment| segment.is_empty()) {
        return Err(invalid());
    }
    let escapes = Path::new(key)
        .components()
        .any(|c| !matches!(c, Component::Normal(_)));
    if escapes {
        return Err(invalid());
    }
    Ok(())
}

/// Map an event's file reference to an object key.
///
/// `s3://bucket/key` yields `key`; references containing `.com/` yield what
/// follows the first `.com/`; anything else has leading slashes trimmed.
pub fn resolve_storage_key(reference: &str) -> Option<String> {
    let reference = reference.trim();
    let key = if let Some(rest) = reference.strip_prefix("s3://") {
        rest.split_once('/').map(|(_, key)| key).unwrap_or("")
    } else if let Some((_, key)) = reference.split_once(".com/") {
        key
    } else {
        reference
    };
    let key = key.trim_start_matches('/');
    if key.is_empty() {
        None
    } else {
        Some(key.to_string())
    }
}

#[cfg(feature = "s3")]
pub use s3::S3ObjectStore;

#[cfg(feature = "s3")]
mod s3 {
    use super::*;
    use aws_sdk_s3::Client;
    use aws_sdk_s3::config::Region;

    use crate::config::S3StorageConfig;

    /// S3-compatible object store. Missing keys (`NoSuchKey`) map to `NotFound`.
    #[derive(Debug, Clone)]
    pub struct S3ObjectStore {
        client: Client,
    }

    impl S3ObjectStore {
        pub async fn connect(cfg: Option<&S3StorageConfig>) -> Self {
            let shared = aws_config::defaults(aws_config::BehaviorVersion::latest())
                .load()
                .await;
            let mut builder = aws_sdk_s3::config::Builder::from(&shared);
            if let Some(cfg) = cfg {
                if let Some(region) = cfg.region.clone() {
                    builder = builder.region(Region::new(region));
                }
                if let Some(endpoint) = cfg.endpoint_url.as_deref() {
                    builder = builder.endpoint_url(endpoint);
                }
                builder = builder.force_path_style(cfg.force_path_style);
            }
            Self {
                client: Client::from_conf(builder.build()),
            }
        }
    }

    #[async_trait::async_trait]
    impl ObjectFetcher for S3ObjectStore {
        async fn fetch(&self, bucket: &str, key: &str) -> Result<FetchedObject, ObjectStoreError> {
            if bucket.trim().is_empty() || key.trim().is_empty() {
                return Err(ObjectStoreError::InvalidKey {
                    bucket: bucket.to_string(),
                    key: key.to_string(),
                });
            }
            let response = match self.client.get_object().bucket(bucket).key(key).send().await {
                Ok(response) => response,
                Err(err) => {
                    let missing = err
                        .as_service_error()
                        .map(|e| e.is_no_such_key())
                        .unwrap_or(false);
                    if missing {
                        return Ok(FetchedObject::NotFound);
                    }
                    return Err(ObjectStoreError::Backend(err.to_string()));
                }
            };
            let data = response
                .body
                .collect()
                .await
                .map_err(|e| ObjectStoreError::Backend(e.to_string()))?;
            Ok(FetchedObject::Found(data.into_bytes()))
        }
    }
}

/// Build the configured object fetcher.
pub async fn build_fetcher(
    cfg: &StorageConfig,
) -> Result<Arc<dyn ObjectFetcher>, ObjectStoreError> {
    match cfg.backend.as_str() {
        "fs" => Ok(Arc::new(FsObjectStore::builder().root(cfg.path.clone()).build())),
        #[cfg(feature = "s3")]
        "s3" => Ok(Arc::new(S3ObjectStore::connect(cfg.s3.as_ref()).await)),
        other => Err(ObjectStoreError::UnknownBackend(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn resolves_common_reference_shapes() {
        assert_eq!(
            resolve_storage_key("bucket.com/x/sample.pdf").as_deref(),
            Some("x/sample.pdf")
        );
        assert_eq!(
            resolve_storage_key("https://docs.s3.amazonaws.com/inbox/a.png").as_deref(),
            Some("inbox/a.png")
        );
        assert_eq!(
            resolve_storage_key("s3://docs/inbox/a.png").as_deref(),
            Some("inbox/a.png")
        );
        assert_eq!(resolve_storage_key("/inbox/a.jpg").as_deref(), Some("inbox/a.jpg"));
        assert_eq!(resolve_storage_key("s3://docs"), None);
        assert_eq!(resolve_storage_key("  "), None);
    }

    #[tokio::test]
    async fn fs_store_distinguishes_missing_objects() {
        let temp = TempDir::new().expect("temp dir");
        let bucket_dir = temp.path().join("docs").join("x");
        std::fs::create_dir_all(&bucket_dir).expect("bucket dir");
        std::fs::write(bucket_dir.join("sample.pdf"), b"%PDF-1.7").expect("write object");

        let store = FsObjectStore::builder().root(temp.path()).build();

        let found = store.fetch("docs", "x/sample.pdf").await.expect("fetch");
        assert_eq!(found, FetchedObject::Found(Bytes::from_static(b"%PDF-1.7")));

        let missing = store.fetch("docs", "x/absent.pdf").await.expect("fetch");
        assert_eq!(missing, FetchedObject::NotFound);
    }

    #[tokio::test]
    async fn fs_store_rejects_escaping_keys() {
        let temp = TempDir::new().expect("temp dir");
        let store = FsObjectStore::builder().root(temp.path()).build();

        for key in ["../secret", "a//b", "", "/etc/passwd"] {
            let err = store.fetch("docs", key).await.expect_err("invalid key");
            assert!(matches!(err, ObjectStoreError::InvalidKey { .. }), "{key}");
            assert!(!err.is_transient());
        }
        let err = store.fetch("", "a.pdf").await.expect_err("empty bucket");
        assert!(matches!(err, ObjectStoreError::InvalidKey { .. }));
    }
}
