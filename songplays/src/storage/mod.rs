pub mod writer;

use crate::utils::paths::split_s3_url;
use common::config::S3Config;
use common::{Error, Result};
use dashmap::DashMap;
use datafusion::execution::context::SessionContext;
use futures::TryStreamExt;
use object_store::aws::AmazonS3Builder;
use object_store::local::LocalFileSystem;
use object_store::path::Path as ObjectPath;
use object_store::{ObjectStore, PutPayload};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;
use url::Url;

pub use writer::{Materialized, PartitionedWriter, WriteMarker};

/// Resolves configured roots to object stores and keeps one store per bucket.
#[derive(Clone)]
pub struct StorageManager {
    s3_config: Option<S3Config>,
    object_store_cache: Arc<DashMap<String, Arc<dyn ObjectStore>>>,
    local: Arc<dyn ObjectStore>,
}

impl StorageManager {
    pub fn new(s3_config: Option<S3Config>) -> Self {
        Self {
            s3_config,
            object_store_cache: Arc::new(DashMap::new()),
            local: Arc::new(LocalFileSystem::new()),
        }
    }

    fn get_s3_store(&self, bucket: &str) -> Result<Arc<dyn ObjectStore>> {
        if let Some(store) = self.object_store_cache.get(bucket) {
            return Ok(store.clone());
        }

        let mut builder = AmazonS3Builder::new().with_bucket_name(bucket);
        if let Some(config) = &self.s3_config {
            builder = builder
                .with_region(&config.region)
                .with_access_key_id(&config.access_key)
                .with_secret_access_key(&config.secret_key)
                .with_allow_http(config.allow_http);
            if let Some(endpoint) = &config.endpoint {
                builder = builder.with_endpoint(endpoint);
            }
        }

        let store: Arc<dyn ObjectStore> = Arc::new(builder.build()?);
        self.object_store_cache
            .insert(bucket.to_string(), store.clone());
        Ok(store)
    }

    /// Source roots must exist; nothing is created on the read side.
    pub fn resolve_input(&self, root: &str) -> Result<StorageLocation> {
        self.resolve(root, false)
    }

    /// Output roots are created on demand for local paths.
    pub fn resolve_output(&self, root: &str) -> Result<StorageLocation> {
        self.resolve(root, true)
    }

    fn resolve(&self, root: &str, create: bool) -> Result<StorageLocation> {
        if root.starts_with("s3://") {
            let mut url = Url::parse(root)?;
            if !url.path().ends_with('/') {
                let path = format!("{}/", url.path());
                url.set_path(&path);
            }
            let (bucket, prefix) = split_s3_url(&url)?;
            return Ok(StorageLocation {
                url,
                prefix: ObjectPath::parse(prefix)?,
                store: self.get_s3_store(&bucket)?,
            });
        }

        let path = match Url::parse(root) {
            Ok(url) if url.scheme() == "file" => url
                .to_file_path()
                .map_err(|_| Error::InvalidUri(format!("'{}' is not a file path", root)))?,
            _ => PathBuf::from(root),
        };

        if create {
            std::fs::create_dir_all(&path)?;
        } else if !path.is_dir() {
            return Err(Error::SourceRead {
                path: root.to_string(),
                reason: "directory does not exist".to_string(),
            });
        }

        let absolute = std::fs::canonicalize(&path)?;
        let url = Url::from_directory_path(&absolute).map_err(|_| {
            Error::InvalidUri(format!("cannot build a url for {}", absolute.display()))
        })?;
        Ok(StorageLocation {
            url,
            prefix: ObjectPath::from_filesystem_path(&absolute)?,
            store: self.local.clone(),
        })
    }

    /// Makes every resolved bucket readable by the DataFusion session.
    pub fn register_object_stores(&self, ctx: &SessionContext) -> Result<()> {
        for entry in self.object_store_cache.iter() {
            let url = Url::parse(&format!("s3://{}", entry.key()))?;
            ctx.runtime_env()
                .register_object_store(&url, entry.value().clone());
            debug!(bucket = %entry.key(), "Registered object store");
        }
        Ok(())
    }
}

/// A directory-like prefix inside an object store, addressable by DataFusion
/// through its url.
#[derive(Clone, Debug)]
pub struct StorageLocation {
    url: Url,
    prefix: ObjectPath,
    store: Arc<dyn ObjectStore>,
}

impl StorageLocation {
    pub fn as_str(&self) -> &str {
        self.url.as_str()
    }

    pub fn local_path(&self) -> Option<PathBuf> {
        if self.url.scheme() == "file" {
            self.url.to_file_path().ok()
        } else {
            None
        }
    }

    pub fn child(&self, name: &str) -> Result<StorageLocation> {
        let name = name.trim_matches('/');
        Ok(StorageLocation {
            url: self.url.join(&format!("{}/", name))?,
            prefix: self.object_path(name)?,
            store: self.store.clone(),
        })
    }

    /// `relative` is already escaped; it is parsed, not re-encoded.
    pub fn object_path(&self, relative: &str) -> Result<ObjectPath> {
        let relative = relative.trim_matches('/');
        let prefix: &str = self.prefix.as_ref();
        let full = match (prefix.is_empty(), relative.is_empty()) {
            (true, _) => relative.to_string(),
            (false, true) => prefix.to_string(),
            (false, false) => format!("{}/{}", prefix, relative),
        };
        Ok(ObjectPath::parse(full)?)
    }

    /// Url of a single object below this location. `relative` is escaped
    /// already, so a literal `%` is encoded once more.
    pub fn file_url(&self, relative: &str) -> Result<Url> {
        let relative = relative.trim_start_matches('/').replace('%', "%25");
        Ok(self.url.join(&relative)?)
    }

    pub async fn put(&self, relative: &str, data: Vec<u8>) -> Result<ObjectPath> {
        let path = self.object_path(relative)?;
        self.store.put(&path, PutPayload::from(data)).await?;
        Ok(path)
    }

    pub async fn get(&self, relative: &str) -> Result<Vec<u8>> {
        let path = self.object_path(relative)?;
        let bytes = self.store.get(&path).await?.bytes().await?;
        Ok(bytes.to_vec())
    }

    pub async fn exists(&self, relative: &str) -> Result<bool> {
        let path = self.object_path(relative)?;
        match self.store.head(&path).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// All objects below this location, recursively, sorted by path.
    pub async fn list_files(&self) -> Result<Vec<ObjectPath>> {
        let mut files: Vec<ObjectPath> = self
            .store
            .list(Some(&self.prefix))
            .map_ok(|meta| meta.location)
            .try_collect()
            .await?;
        files.sort();
        Ok(files)
    }

    pub async fn delete_all(&self) -> Result<usize> {
        let files = self.list_files().await?;
        for file in &files {
            self.store.delete(file).await?;
        }
        Ok(files.len())
    }
}

impl std::fmt::Display for StorageLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.url.as_str())
    }
}
