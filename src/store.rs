//! Object store and bucket lookups backed by a local directory.
//!
//! Layout: `<root>/<namespace>-<bucket>/<prefix>/<file>`. A bucket is ready
//! as soon as its directory exists.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use futures::stream::{self, StreamExt, TryStreamExt};
use tracing::{debug, info, instrument};

use crate::contract::{BucketFinder, Store};
use crate::error::{AssetError, Result};
use crate::loader::safe_join;
use crate::model::BucketStatus;

pub struct DirectoryStore {
    root: PathBuf,
    base_url: String,
    upload_workers: usize,
}

impl DirectoryStore {
    /// `base_url` prefixes published URLs; pass a `file://` URL for local use.
    pub fn new(root: impl Into<PathBuf>, base_url: impl Into<String>, upload_workers: usize) -> Self {
        Self {
            root: root.into(),
            base_url: base_url.into(),
            upload_workers: upload_workers.max(1),
        }
    }

    pub fn remote_name(namespace: &str, name: &str) -> String {
        format!("{namespace}-{name}")
    }

    /// Create the bucket directory, making the bucket ready.
    pub async fn create_bucket(&self, namespace: &str, name: &str) -> Result<BucketStatus> {
        let remote_name = Self::remote_name(namespace, name);
        let dir = self.root.join(&remote_name);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| AssetError::io(&dir, e))?;
        info!(bucket = %remote_name, "Bucket created");
        Ok(self.status(remote_name))
    }

    fn status(&self, remote_name: String) -> BucketStatus {
        BucketStatus {
            url: format!("{}/{}", self.base_url.trim_end_matches('/'), remote_name),
            remote_name,
            ready: true,
        }
    }

    async fn bucket_dir(&self, bucket: &str) -> Result<PathBuf> {
        let dir = safe_join(&self.root, bucket)?;
        if !is_dir(&dir).await? {
            return Err(AssetError::Store(format!("bucket {bucket} does not exist")));
        }
        Ok(dir)
    }
}

async fn is_dir(path: &Path) -> Result<bool> {
    match tokio::fs::metadata(path).await {
        Ok(meta) => Ok(meta.is_dir()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(AssetError::io(path, e)),
    }
}

#[async_trait]
impl BucketFinder for DirectoryStore {
    async fn find_bucket(&self, namespace: &str, name: &str) -> Result<Option<BucketStatus>> {
        let remote_name = Self::remote_name(namespace, name);
        let dir = safe_join(&self.root, &remote_name)?;
        let exists = is_dir(&dir)
            .await
            .map_err(|e| AssetError::Bucket(e.to_string()))?;
        Ok(exists.then(|| self.status(remote_name)))
    }
}

#[async_trait]
impl Store for DirectoryStore {
    #[instrument(skip(self, base_path, files), fields(files = files.len()))]
    async fn put_objects(
        &self,
        bucket: &str,
        prefix: &str,
        base_path: &Path,
        files: &[String],
    ) -> Result<()> {
        let target = safe_join(&self.bucket_dir(bucket).await?, prefix)?;
        let base_path = base_path.to_path_buf();
        stream::iter(files.to_vec())
            .map(|file| {
                let target = target.clone();
                let base_path = base_path.clone();
                async move {
                    let src = safe_join(&base_path, &file)?;
                    let dest = safe_join(&target, &file)?;
                    if let Some(parent) = dest.parent() {
                        tokio::fs::create_dir_all(parent)
                            .await
                            .map_err(|e| AssetError::io(parent, e))?;
                    }
                    tokio::fs::copy(&src, &dest)
                        .await
                        .map_err(|e| AssetError::io(&src, e))?;
                    debug!(file = %file, "Object stored");
                    Ok::<_, AssetError>(())
                }
            })
            .buffer_unordered(self.upload_workers)
            .try_collect::<Vec<()>>()
            .await?;
        info!(bucket, prefix, "Objects uploaded");
        Ok(())
    }

    async fn list_objects(&self, bucket: &str, prefix: &str) -> Result<Vec<String>> {
        let dir = safe_join(&self.bucket_dir(bucket).await?, prefix)?;
        if !is_dir(&dir).await? {
            return Ok(Vec::new());
        }

        let mut keys = Vec::new();
        let mut pending = vec![(dir, String::new())];
        while let Some((current, relative)) = pending.pop() {
            let mut entries = tokio::fs::read_dir(&current)
                .await
                .map_err(|e| AssetError::io(&current, e))?;
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| AssetError::io(&current, e))?
            {
                let name = entry.file_name().to_string_lossy().into_owned();
                let child = if relative.is_empty() {
                    name
                } else {
                    format!("{relative}/{name}")
                };
                let file_type = entry
                    .file_type()
                    .await
                    .map_err(|e| AssetError::io(entry.path(), e))?;
                if file_type.is_dir() {
                    pending.push((entry.path(), child));
                } else {
                    keys.push(format!("{prefix}/{child}"));
                }
            }
        }
        keys.sort();
        Ok(keys)
    }

    async fn delete_objects(&self, bucket: &str, prefix: &str) -> Result<()> {
        let dir = safe_join(&self.bucket_dir(bucket).await?, prefix)?;
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {
                info!(bucket, prefix, "Objects deleted");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(AssetError::io(&dir, e)),
        }
    }

    async fn contains_all_objects(
        &self,
        bucket: &str,
        prefix: &str,
        files: &[String],
    ) -> Result<bool> {
        let existing = self.list_objects(bucket, prefix).await?;
        Ok(files
            .iter()
            .all(|file| existing.contains(&format!("{prefix}/{file}"))))
    }
}
