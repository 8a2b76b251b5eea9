pub mod cli;

use anyhow::Result;
use async_trait::async_trait;
use std::io::Read;

pub use cli::GitCli;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeStatus {
    Added,
    Modified,
    Deleted,
    TypeChanged,
}

impl ChangeStatus {
    /// Parses the single-letter status used by `git diff --name-status`.
    pub fn from_code(code: &str) -> Option<Self> {
        match code.chars().next()? {
            'A' => Some(Self::Added),
            'M' => Some(Self::Modified),
            'D' => Some(Self::Deleted),
            'T' => Some(Self::TypeChanged),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangedPath {
    pub path: String,
    pub status: ChangeStatus,
}

impl ChangedPath {
    pub fn new(path: impl Into<String>, status: ChangeStatus) -> Self {
        Self {
            path: path.into(),
            status,
        }
    }
}

/// One page of first-parent history, newest commit first.
#[derive(Debug, Clone, Default)]
pub struct RevListPage {
    pub commits: Vec<String>,
    /// Where the next page starts. `None` once the root commit was returned.
    pub next_cursor: Option<String>,
}

/// Tar-format byte stream. Dropping it closes the underlying source.
pub type ArchiveReader = Box<dyn Read + Send>;

/// Everything the indexer needs from the git host.
#[async_trait]
pub trait GitService: Send + Sync {
    /// Lists up to `page_size` commits of the first-parent ancestry starting at
    /// `cursor` (inclusive).
    async fn rev_list(&self, repo: &str, cursor: &str, page_size: usize) -> Result<RevListPage>;

    /// Paths changed between `base` and `head`. With no base, every file of
    /// `head` is reported as added.
    async fn changed_files(
        &self,
        repo: &str,
        base: Option<&str>,
        head: &str,
    ) -> Result<Vec<ChangedPath>>;

    /// Tar archive of `paths` at `commit`, or of the whole tree when `paths`
    /// is `None`.
    async fn archive(
        &self,
        repo: &str,
        commit: &str,
        paths: Option<&[String]>,
    ) -> Result<ArchiveReader>;
}
