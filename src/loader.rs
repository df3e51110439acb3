//! Source loading: downloads an asset's source into a temporary directory and,
//! for packages, extracts the archive with path-traversal protection.
//!
//! The returned [`LoadedAsset`] owns its temporary directory. Call
//! [`LoadedAsset::clean`] when the pipeline run ends; dropping it removes the
//! directory as well, so an early return can never leak it.

use std::fs;
use std::io::Read;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use flate2::read::GzDecoder;
use futures::stream::{self, StreamExt, TryStreamExt};
use reqwest::{Client, Url};
use serde::Deserialize;
use tempfile::TempDir;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info, instrument, warn};

use crate::contract::Loader;
use crate::error::{AssetError, Result};
use crate::filter::PathFilter;
use crate::model::AssetMode;

/// File name used when the source URL has no usable last segment.
const DEFAULT_FILE_NAME: &str = "asset";

/// Parallel downloads for index-mode assets.
const INDEX_DOWNLOAD_CONCURRENCY: usize = 8;

/// Content of a loaded source, rooted in a temporary directory.
#[derive(Debug)]
pub struct LoadedAsset {
    dir: TempDir,
    files: Vec<String>,
}

impl LoadedAsset {
    pub fn new(dir: TempDir, files: Vec<String>) -> Self {
        Self { dir, files }
    }

    pub fn base_path(&self) -> &Path {
        self.dir.path()
    }

    /// Relative paths of the selected files, `/`-separated.
    pub fn files(&self) -> &[String] {
        &self.files
    }

    /// Remove the temporary directory and everything in it.
    pub fn clean(self) -> Result<()> {
        let path = self.dir.path().to_path_buf();
        self.dir.close().map_err(|e| AssetError::io(&path, e))?;
        debug!(path = %path.display(), "Removed temporary asset directory");
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct IndexDocument {
    #[serde(default)]
    files: Vec<IndexEntry>,
}

#[derive(Debug, Deserialize)]
struct IndexEntry {
    name: String,
}

/// HTTP-backed [`Loader`] supporting single files, archives and index documents.
pub struct ArchiveLoader {
    client: Client,
    temp_root: PathBuf,
    timeout: Duration,
}

impl ArchiveLoader {
    pub fn new(temp_root: impl Into<PathBuf>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AssetError::config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            temp_root: temp_root.into(),
            timeout,
        })
    }

    /// Working directory under `temp_root`; `name` only ever shapes the prefix.
    fn temp_dir(&self, name: &str) -> Result<TempDir> {
        fs::create_dir_all(&self.temp_root).map_err(|e| AssetError::io(&self.temp_root, e))?;
        tempfile::Builder::new()
            .prefix(&format!("{}-", dir_prefix(name)))
            .tempdir_in(&self.temp_root)
            .map_err(|e| AssetError::io(&self.temp_root, e))
    }

    /// Stream `url` into the file at `dest`.
    async fn download(&self, url: &str, dest: &Path) -> Result<()> {
        debug!(url, dest = %dest.display(), "Downloading source");
        let mut response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| AssetError::from_reqwest(url, self.timeout, e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!(url, status = %status, "Source download returned error status");
            return Err(AssetError::Status {
                url: url.to_string(),
                status: status.as_u16(),
                body,
            });
        }

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| AssetError::io(parent, e))?;
        }
        let mut file = tokio::fs::File::create(dest)
            .await
            .map_err(|e| AssetError::io(dest, e))?;
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| AssetError::from_reqwest(url, self.timeout, e))?
        {
            file.write_all(&chunk)
                .await
                .map_err(|e| AssetError::io(dest, e))?;
        }
        file.flush().await.map_err(|e| AssetError::io(dest, e))?;
        Ok(())
    }

    async fn load_single(&self, url: &str, name: &str) -> Result<LoadedAsset> {
        let dir = self.temp_dir(name)?;
        let file_name = file_name_from_url(url);
        self.download(url, &dir.path().join(&file_name)).await?;
        Ok(LoadedAsset::new(dir, vec![file_name]))
    }

    async fn load_package(&self, url: &str, name: &str, filter: &PathFilter) -> Result<LoadedAsset> {
        let work = self.temp_dir(name)?;
        let staging = self.temp_dir(&format!("{name}-archive"))?;

        let archive_path = staging.path().join(file_name_from_url(url));
        self.download(url, &archive_path).await?;

        let dest = work.path().to_path_buf();
        let source = archive_path.clone();
        let extracted = tokio::task::spawn_blocking(move || unpack(&source, &dest))
            .await
            .map_err(|e| AssetError::archive(&archive_path, format!("extraction task failed: {e}")))??;

        if let Err(e) = staging.close() {
            warn!(error = ?e, "Failed to remove archive staging directory");
        }

        let files = filter.apply(&extracted);
        info!(
            extracted = extracted.len(),
            selected = files.len(),
            "Package extracted"
        );
        Ok(LoadedAsset::new(work, files))
    }

    async fn load_index(&self, url: &str, name: &str, filter: &PathFilter) -> Result<LoadedAsset> {
        let work = self.temp_dir(name)?;
        let staging = self.temp_dir(&format!("{name}-index"))?;

        let index_path = staging.path().join(file_name_from_url(url));
        self.download(url, &index_path).await?;
        let raw = tokio::fs::read_to_string(&index_path)
            .await
            .map_err(|e| AssetError::io(&index_path, e))?;
        let index: IndexDocument =
            serde_yaml::from_str(&raw).map_err(|e| AssetError::parsing("index document", e))?;

        let base = Url::parse(url).map_err(|e| AssetError::parsing("source url", e))?;
        let mut targets = Vec::new();
        for entry in index.files.into_iter().filter(|e| filter.matches(&e.name)) {
            let dest = safe_join(work.path(), &entry.name)?;
            let file_url = base
                .join(&entry.name)
                .map_err(|e| AssetError::parsing("index entry url", e))?;
            targets.push((entry.name, file_url, dest));
        }

        let files: Vec<String> = stream::iter(targets)
            .map(|(name, file_url, dest)| async move {
                self.download(file_url.as_str(), &dest).await.map(|_| name)
            })
            .buffered(INDEX_DOWNLOAD_CONCURRENCY)
            .try_collect()
            .await?;

        if let Err(e) = staging.close() {
            warn!(error = ?e, "Failed to remove index staging directory");
        }
        Ok(LoadedAsset::new(work, files))
    }
}

#[async_trait]
impl Loader for ArchiveLoader {
    #[instrument(skip(self), fields(mode = ?mode))]
    async fn load(&self, url: &str, name: &str, mode: AssetMode, filter: &str) -> Result<LoadedAsset> {
        let filter = PathFilter::new(filter)?;
        let loaded = match mode {
            AssetMode::Single => self.load_single(url, name).await,
            AssetMode::Package => self.load_package(url, name, &filter).await,
            AssetMode::Index => self.load_index(url, name, &filter).await,
        };
        match &loaded {
            Ok(asset) => info!(
                files = asset.files().len(),
                base_path = %asset.base_path().display(),
                "Source loaded"
            ),
            Err(e) => error!(error = %e, "Source loading failed"),
        }
        loaded
    }
}

/// Last path segment of `url`, or `asset` when there is none.
pub fn file_name_from_url(url: &str) -> String {
    let path = Url::parse(url)
        .map(|u| u.path().to_string())
        .unwrap_or_else(|_| url.to_string());
    path.rsplit('/')
        .next()
        .filter(|s| !s.is_empty() && *s != "." && *s != "..")
        .unwrap_or(DEFAULT_FILE_NAME)
        .to_string()
}

/// Join `entry` onto `root`, rejecting results that leave `root`.
pub fn safe_join(root: &Path, entry: &str) -> Result<PathBuf> {
    let root = clean_path(root);
    let joined = clean_path(&root.join(entry));
    if !joined.starts_with(&root) {
        warn!(entry, root = %root.display(), "Rejected entry escaping destination");
        return Err(AssetError::PathTraversal {
            entry: entry.to_string(),
        });
    }
    Ok(joined)
}

/// Lexically normalize `path`: drop `.` and resolve `..` against prior segments.
fn clean_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => match out.components().next_back() {
                Some(Component::Normal(_)) => {
                    out.pop();
                }
                Some(Component::RootDir) | Some(Component::Prefix(_)) => {}
                _ => out.push(".."),
            },
            other => out.push(other.as_os_str()),
        }
    }
    out
}

fn relative_name(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

/// Extract `archive` into `dest`, choosing the format from its extension.
/// Returns the relative paths of the extracted regular files.
pub fn unpack(archive: &Path, dest: &Path) -> Result<Vec<String>> {
    let name = archive
        .file_name()
        .map(|n| n.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    let file = fs::File::open(archive).map_err(|e| AssetError::io(archive, e))?;

    if name.ends_with(".zip") {
        unpack_zip(archive, file, dest)
    } else if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
        unpack_tar(archive, GzDecoder::new(file), dest)
    } else if name.ends_with(".tar") {
        unpack_tar(archive, file, dest)
    } else {
        Err(AssetError::archive(archive, "unsupported archive extension"))
    }
}

fn unpack_zip(archive: &Path, file: fs::File, dest: &Path) -> Result<Vec<String>> {
    let mut zip = zip::ZipArchive::new(file).map_err(|e| AssetError::archive(archive, e.to_string()))?;
    let mut files = Vec::new();

    for i in 0..zip.len() {
        let mut entry = zip
            .by_index(i)
            .map_err(|e| AssetError::archive(archive, e.to_string()))?;
        let target = safe_join(dest, entry.name())?;

        if entry.is_dir() {
            fs::create_dir_all(&target).map_err(|e| AssetError::io(&target, e))?;
            continue;
        }
        write_entry(&mut entry, &target)?;
        files.push(relative_name(dest, &target));
    }
    Ok(files)
}

fn unpack_tar<R: Read>(archive: &Path, reader: R, dest: &Path) -> Result<Vec<String>> {
    let mut tar = tar::Archive::new(reader);
    let mut files = Vec::new();
    let entries = tar
        .entries()
        .map_err(|e| AssetError::archive(archive, e.to_string()))?;

    for entry in entries {
        let mut entry = entry.map_err(|e| AssetError::archive(archive, e.to_string()))?;
        let entry_name = entry
            .path()
            .map_err(|e| AssetError::archive(archive, e.to_string()))?
            .to_string_lossy()
            .into_owned();
        let target = safe_join(dest, &entry_name)?;

        let kind = entry.header().entry_type();
        if kind.is_dir() {
            fs::create_dir_all(&target).map_err(|e| AssetError::io(&target, e))?;
        } else if kind.is_file() {
            write_entry(&mut entry, &target)?;
            files.push(relative_name(dest, &target));
        } else {
            debug!(entry = %entry_name, kind = ?kind, "Skipping non-regular archive entry");
        }
    }
    Ok(files)
}

fn write_entry<R: Read>(reader: &mut R, target: &Path) -> Result<()> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent).map_err(|e| AssetError::io(parent, e))?;
    }
    let mut out = fs::File::create(target).map_err(|e| AssetError::io(target, e))?;
    std::io::copy(reader, &mut out).map_err(|e| AssetError::io(target, e))?;
    Ok(())
}

/// Reduce `name` to characters that cannot leave the parent directory.
fn dir_prefix(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}
