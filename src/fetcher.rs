use std::io::Read;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::{Semaphore, mpsc};
use tokio_util::sync::CancellationToken;

use crate::config::FetcherConfig;
use crate::error::RockskipError;
use crate::git::{ArchiveReader, GitService};

/// Entries buffered between the tar reader and the consumer.
const ENTRY_BUFFER: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    pub path: String,
    /// Empty when the file exceeded the size cutoff.
    pub content: Vec<u8>,
}

pub type EntryReceiver = mpsc::Receiver<Result<ArchiveEntry>>;

/// Streams file contents out of `git archive`, with a process-wide cap on
/// concurrent fetches.
#[derive(Clone)]
pub struct ArchiveFetcher {
    git: Arc<dyn GitService>,
    permits: Arc<Semaphore>,
    max_total_paths_length: usize,
    max_file_size: u64,
}

impl ArchiveFetcher {
    pub fn new(git: Arc<dyn GitService>, config: &FetcherConfig) -> Self {
        Self {
            git,
            permits: Arc::new(Semaphore::new(config.max_concurrent_fetches.max(1))),
            max_total_paths_length: config.max_total_paths_length.max(1),
            max_file_size: config.max_file_size,
        }
    }

    /// Starts fetching `paths` at `commit`. The stream ends after the last
    /// entry, or with an error (`RockskipError::Cancelled` on cancellation).
    /// Consumers that stop early should `drain` the receiver or drop it.
    pub fn fetch(
        &self,
        repo: &str,
        commit: &str,
        paths: Vec<String>,
        cancel: CancellationToken,
    ) -> EntryReceiver {
        let (tx, rx) = mpsc::channel(ENTRY_BUFFER);
        let fetcher = self.clone();
        let repo = repo.to_string();
        let commit = commit.to_string();

        tokio::spawn(async move {
            if let Err(e) = fetcher.produce(&repo, &commit, paths, &tx, &cancel).await {
                let _ = tx.send(Err(e)).await;
            }
        });
        rx
    }

    async fn produce(
        &self,
        repo: &str,
        commit: &str,
        paths: Vec<String>,
        tx: &mpsc::Sender<Result<ArchiveEntry>>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let _permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(RockskipError::Cancelled.into()),
            permit = self.permits.clone().acquire_owned() => {
                permit.map_err(|_| RockskipError::ShuttingDown)?
            }
        };

        for batch in batch_paths(paths, self.max_total_paths_length) {
            if cancel.is_cancelled() {
                return Err(RockskipError::Cancelled.into());
            }
            tracing::debug!(repo = %repo, commit = %commit, paths = batch.len(), "Fetching archive batch");

            let reader = self
                .git
                .archive(repo, commit, Some(&batch))
                .await
                .with_context(|| format!("Failed to fetch archive of {repo}@{commit}"))?;

            let sender = tx.clone();
            let token = cancel.clone();
            let max_file_size = self.max_file_size;
            let keep_going = tokio::task::spawn_blocking(move || {
                read_entries(reader, max_file_size, &sender, &token)
            })
            .await
            .context("Archive reader task failed")??;

            if !keep_going {
                // Receiver is gone; nobody is listening.
                return Ok(());
            }
        }
        Ok(())
    }
}

/// Reads every entry of one tar stream into `tx`. Returns false when the
/// receiver was dropped.
fn read_entries(
    reader: ArchiveReader,
    max_file_size: u64,
    tx: &mpsc::Sender<Result<ArchiveEntry>>,
    cancel: &CancellationToken,
) -> Result<bool> {
    let mut archive = tar::Archive::new(reader);
    for entry in archive.entries().context("Failed to read archive")? {
        if cancel.is_cancelled() {
            return Err(RockskipError::Cancelled.into());
        }
        let mut entry = entry.context("Failed to read archive entry")?;
        let entry_type = entry.header().entry_type();
        if entry_type.is_dir()
            || entry_type.is_pax_global_extensions()
            || entry_type.is_pax_local_extensions()
        {
            continue;
        }

        let path = entry
            .path()
            .context("Archive entry has an invalid path")?
            .to_string_lossy()
            .into_owned();
        let size = entry.size();
        let mut content = Vec::new();
        if size <= max_file_size {
            content.reserve(size as usize);
            entry
                .read_to_end(&mut content)
                .with_context(|| format!("Failed to read {path} from archive"))?;
        } else {
            tracing::debug!(path = %path, size, "Archive entry over size limit");
        }

        if tx.blocking_send(Ok(ArchiveEntry { path, content })).is_err() {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Groups paths so the summed path length of each batch stays within
/// `max_total`. A path longer than the bound is sent alone.
pub fn batch_paths(paths: Vec<String>, max_total: usize) -> Vec<Vec<String>> {
    let mut batches = Vec::new();
    let mut current: Vec<String> = Vec::new();
    let mut current_len = 0;

    for path in paths {
        if !current.is_empty() && current_len + path.len() > max_total {
            batches.push(std::mem::take(&mut current));
            current_len = 0;
        }
        current_len += path.len();
        current.push(path);
    }
    if !current.is_empty() {
        batches.push(current);
    }
    batches
}

/// Consumes the rest of a stream so its producer can finish.
pub async fn drain(rx: &mut EntryReceiver) {
    while rx.recv().await.is_some() {}
}
