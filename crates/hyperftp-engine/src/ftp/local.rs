//! Local filesystem seam.
//!
//! The engine never touches `std::fs` directly; it goes through [`LocalFs`]
//! so callers can swap in their own storage (and tests can inject
//! failures).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::io;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncRead, AsyncWrite};

pub type LocalReader = Box<dyn AsyncRead + Send + Unpin>;
pub type LocalWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// One local directory entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalEntry {
    pub name: String,
    pub path: PathBuf,
    pub is_dir: bool,
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait LocalFs: Send + Sync {
    /// Children of `path`, sorted by name.
    async fn read_dir(&self, path: &Path) -> io::Result<Vec<LocalEntry>>;

    async fn metadata(&self, path: &Path) -> io::Result<LocalEntry>;

    async fn open_read(&self, path: &Path) -> io::Result<LocalReader>;

    /// Create or truncate `path` for writing.
    async fn create(&self, path: &Path) -> io::Result<LocalWriter>;

    async fn remove_file(&self, path: &Path) -> io::Result<()>;
}

/// `LocalFs` backed by `tokio::fs`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioFs;

#[async_trait]
impl LocalFs for TokioFs {
    async fn read_dir(&self, path: &Path) -> io::Result<Vec<LocalEntry>> {
        let mut dir = tokio::fs::read_dir(path).await?;
        let mut entries = Vec::new();
        while let Some(entry) = dir.next_entry().await? {
            let meta = entry.metadata().await?;
            entries.push(to_entry(entry.path(), &meta));
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    async fn metadata(&self, path: &Path) -> io::Result<LocalEntry> {
        let meta = tokio::fs::metadata(path).await?;
        Ok(to_entry(path.to_path_buf(), &meta))
    }

    async fn open_read(&self, path: &Path) -> io::Result<LocalReader> {
        let file = tokio::fs::File::open(path).await?;
        Ok(Box::new(file))
    }

    async fn create(&self, path: &Path) -> io::Result<LocalWriter> {
        let file = tokio::fs::File::create(path).await?;
        Ok(Box::new(file))
    }

    async fn remove_file(&self, path: &Path) -> io::Result<()> {
        tokio::fs::remove_file(path).await
    }
}

fn to_entry(path: PathBuf, meta: &std::fs::Metadata) -> LocalEntry {
    LocalEntry {
        name: path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default(),
        is_dir: meta.is_dir(),
        size: if meta.is_dir() { 0 } else { meta.len() },
        modified: meta.modified().ok().map(DateTime::<Utc>::from),
        path,
    }
}
