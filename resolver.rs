use crate::error::{Error, Result};
use crate::models::{
    strip_scheme, HandleScheme, ImageHandle, ResolvedHandle, CONTENT_SCHEME, FILE_SCHEME,
};
use async_trait::async_trait;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

/// Byte and file access used by the pipeline.
#[async_trait]
pub trait FileAccess: Send + Sync {
    async fn read_all_bytes(&self, path: &Path) -> io::Result<Vec<u8>>;

    /// Copies `src` (a path or a content-provider handle) to `dst`, returning the byte count.
    async fn copy(&self, src: &str, dst: &Path) -> io::Result<u64>;
}

/// File system access where `content://authority/path` handles are served
/// from `content_root/authority/path`.
#[derive(Debug, Clone)]
pub struct LocalFileAccess {
    content_root: PathBuf,
}

impl LocalFileAccess {
    pub fn new(content_root: impl Into<PathBuf>) -> Self {
        Self {
            content_root: content_root.into(),
        }
    }

    /// Maps a handle onto the file system. Content handles must stay below
    /// `content_root`: absolute remainders and `..` segments are refused.
    fn source_path(&self, src: &str) -> io::Result<PathBuf> {
        let Some(rest) = strip_scheme(src, CONTENT_SCHEME) else {
            return Ok(local_path(src));
        };
        let relative = Path::new(rest);
        let contained = relative.components().next().is_some()
            && relative
                .components()
                .all(|component| matches!(component, Component::Normal(_)));
        if !contained {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("content handle leaves the provider root: {src}"),
            ));
        }
        Ok(self.content_root.join(relative))
    }
}

#[async_trait]
impl FileAccess for LocalFileAccess {
    async fn read_all_bytes(&self, path: &Path) -> io::Result<Vec<u8>> {
        tokio::fs::read(path).await
    }

    async fn copy(&self, src: &str, dst: &Path) -> io::Result<u64> {
        tokio::fs::copy(self.source_path(src)?, dst).await
    }
}

pub struct Resolver {
    cache_dir: PathBuf,
    files: Arc<dyn FileAccess>,
}

impl Resolver {
    pub fn new(cache_dir: impl Into<PathBuf>, files: Arc<dyn FileAccess>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            files,
        }
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Turns a picker handle into something the decoder can read directly.
    ///
    /// Content-provider handles are copied into the cache directory on every
    /// call; resolved paths are never memoized.
    pub async fn resolve(&self, handle: &ImageHandle) -> Result<ResolvedHandle> {
        match handle.scheme {
            HandleScheme::RemoteUrl => Ok(ResolvedHandle::Remote(handle.raw.clone())),
            HandleScheme::FilePath => Ok(ResolvedHandle::LocalPath(local_path(&handle.raw))),
            HandleScheme::ContentProvider => self.stage_content(&handle.raw).await,
        }
    }

    async fn stage_content(&self, raw: &str) -> Result<ResolvedHandle> {
        let name = trailing_segment(raw)
            .ok_or_else(|| Error::Reference(format!("No file name in content handle {raw}")))?;
        tokio::fs::create_dir_all(&self.cache_dir).await.map_err(|e| {
            Error::Reference(format!(
                "Failed to create cache dir {}: {e}",
                self.cache_dir.display()
            ))
        })?;
        let dest = self.cache_dir.join(name);
        let copied = self.files.copy(raw, &dest).await.map_err(|e| {
            Error::Reference(format!("Failed to copy {raw} to {}: {e}", dest.display()))
        })?;
        log::debug!("Staged {raw} as {} ({copied} bytes)", dest.display());
        Ok(ResolvedHandle::LocalPath(dest))
    }
}

/// Plain paths pass through; `file://` URIs are percent-decoded.
fn local_path(raw: &str) -> PathBuf {
    let Some(rest) = strip_scheme(raw, FILE_SCHEME) else {
        return PathBuf::from(raw);
    };
    reqwest::Url::parse(raw)
        .ok()
        .and_then(|url| url.to_file_path().ok())
        .unwrap_or_else(|| PathBuf::from(rest))
}

/// Last `/`-separated segment of a handle, if it can name a file.
pub fn trailing_segment(raw: &str) -> Option<&str> {
    raw.rsplit('/')
        .next()
        .filter(|name| !name.is_empty() && *name != "." && *name != ".." && !name.contains('\\'))
}
