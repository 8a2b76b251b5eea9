pub mod locks;

use anyhow::{Context, Result};
use lru::LruCache;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::config::IndexerConfig;
use crate::error::{RockskipError, is_cancelled};
use crate::fetcher::{ArchiveFetcher, drain};
use crate::git::{ChangeStatus, GitService};
use crate::parser::SymbolParser;
use crate::storage::hops::{HopPlan, plan_hop};
use crate::storage::{CommitRecord, SENTINEL, SqliteStorage};
pub use locks::RepoLocks;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IndexStats {
    pub commits_indexed: usize,
    pub symbols_added: usize,
    pub symbols_deleted: usize,
    /// Deletions skipped because no visible row matched
    pub symbols_missing: usize,
    pub duration_ms: u64,
}

/// Brings a repository's symbol index up to a target commit.
#[derive(Clone)]
pub struct Indexer {
    git: Arc<dyn GitService>,
    fetcher: ArchiveFetcher,
    parser: SymbolParser,
    db_path: PathBuf,
    locks: RepoLocks,
    config: IndexerConfig,
}

impl Indexer {
    pub fn new(
        git: Arc<dyn GitService>,
        fetcher: ArchiveFetcher,
        parser: SymbolParser,
        db_path: PathBuf,
        locks: RepoLocks,
        config: &IndexerConfig,
    ) -> Self {
        Self {
            git,
            fetcher,
            parser,
            db_path,
            locks,
            config: config.clone(),
        }
    }

    pub fn locks(&self) -> &RepoLocks {
        &self.locks
    }

    /// Indexes every commit on the first-parent history of `commit` that is not
    /// indexed yet, oldest first. Each commit is written in its own
    /// transaction; on failure the commits written so far stay indexed.
    pub async fn index(
        &self,
        repo: &str,
        commit: &str,
        cancel: &CancellationToken,
    ) -> Result<IndexStats> {
        let _guard = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(RockskipError::Cancelled.into()),
            guard = self.locks.lock(repo) => guard,
        };
        let started = Instant::now();

        let mut run = IndexRun::start(self, repo, cancel).await?;
        let missing = run.missing_commits(commit).await?;
        if missing.is_empty() {
            tracing::debug!(repo = %repo, commit = %commit, "Already indexed");
            return Ok(IndexStats::default());
        }

        tracing::info!(repo = %repo, commit = %commit, missing = missing.len(), "Indexing commits");
        for hash in &missing {
            run.index_commit(hash)
                .await
                .with_context(|| format!("Failed to index {repo}@{hash}"))?;
        }

        let mut stats = run.stats;
        stats.duration_ms = started.elapsed().as_millis() as u64;
        tracing::info!(
            repo = %repo,
            commit = %commit,
            commits = stats.commits_indexed,
            added = stats.symbols_added,
            deleted = stats.symbols_deleted,
            missing = stats.symbols_missing,
            duration_ms = stats.duration_ms,
            "Indexing complete"
        );
        Ok(stats)
    }

    /// Fetches `paths` at `commit` and parses them. Paths missing from the
    /// archive are absent from the result.
    async fn parse_paths(
        &self,
        repo: &str,
        commit: &str,
        paths: Vec<String>,
        cancel: &CancellationToken,
    ) -> Result<HashMap<String, HashSet<String>>> {
        let mut symbols = HashMap::new();
        if paths.is_empty() {
            return Ok(symbols);
        }

        let parser = &self.parser;
        let in_flight = parser.pool().capacity() * 2;
        let mut rx = self.fetcher.fetch(repo, commit, paths, cancel.clone());
        let mut tasks: JoinSet<Result<(String, HashSet<String>)>> = JoinSet::new();

        let outcome = async {
            while let Some(entry) = rx.recv().await {
                let entry = entry?;
                while tasks.len() >= in_flight {
                    collect_parsed(&mut symbols, tasks.join_next().await)?;
                }
                let parser = parser.clone();
                let cancel = cancel.clone();
                tasks.spawn(async move {
                    let parsed = parser.parse(&entry.path, entry.content, &cancel).await?;
                    Ok((entry.path, parsed.into_iter().map(|s| s.name).collect()))
                });
            }
            while let Some(joined) = tasks.join_next().await {
                collect_parsed(&mut symbols, Some(joined))?;
            }
            Ok::<_, anyhow::Error>(())
        }
        .await;

        if let Err(e) = outcome {
            tasks.abort_all();
            if is_cancelled(&e) {
                drain(&mut rx).await;
            }
            return Err(e);
        }
        Ok(symbols)
    }
}

/// A connection that is moved onto a blocking thread for every call.
struct BlockingStorage {
    inner: Option<SqliteStorage>,
}

impl BlockingStorage {
    async fn call<T, F>(&mut self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&SqliteStorage) -> Result<T> + Send + 'static,
    {
        let storage = self
            .inner
            .take()
            .context("Storage connection lost after an earlier failure")?;
        let (storage, result) = tokio::task::spawn_blocking(move || {
            let result = f(&storage);
            (storage, result)
        })
        .await
        .context("Storage task panicked")?;
        self.inner = Some(storage);
        result
    }
}

type SymbolKey = (String, String);

/// State of one indexing run. Caches describe the index as of `tip`.
struct IndexRun<'a> {
    indexer: &'a Indexer,
    repo: &'a str,
    cancel: &'a CancellationToken,
    storage: BlockingStorage,
    repo_id: i64,
    tip: Option<CommitRecord>,
    tip_spine: Vec<i64>,
    path_symbols: LruCache<String, HashSet<String>>,
    symbol_ids: LruCache<SymbolKey, i64>,
    stats: IndexStats,
}

fn cache_capacity(size: usize) -> NonZeroUsize {
    NonZeroUsize::new(size).unwrap_or(NonZeroUsize::MIN)
}

impl<'a> IndexRun<'a> {
    async fn start(
        indexer: &'a Indexer,
        repo: &'a str,
        cancel: &'a CancellationToken,
    ) -> Result<Self> {
        let db_path = indexer.db_path.clone();
        let name = repo.to_string();
        let (storage, repo_id) = tokio::task::spawn_blocking(move || {
            let storage = SqliteStorage::open(&db_path)?;
            let repo_id = storage.ensure_repo(&name)?;
            Ok::<_, anyhow::Error>((storage, repo_id))
        })
        .await
        .context("Storage task panicked")??;

        Ok(Self {
            indexer,
            repo,
            cancel,
            storage: BlockingStorage {
                inner: Some(storage),
            },
            repo_id,
            tip: None,
            tip_spine: vec![SENTINEL],
            path_symbols: LruCache::new(cache_capacity(indexer.config.path_symbols_cache_size)),
            symbol_ids: LruCache::new(cache_capacity(indexer.config.symbol_id_cache_size)),
            stats: IndexStats::default(),
        })
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(RockskipError::Cancelled.into());
        }
        Ok(())
    }

    /// Walks history back from `target` until an indexed commit is found,
    /// which becomes the run's starting tip. Returns the unindexed commits,
    /// oldest first.
    async fn missing_commits(&mut self, target: &str) -> Result<Vec<String>> {
        let page_size = self.indexer.config.rev_list_page_size.max(1);
        let mut missing = Vec::new();
        let mut cursor = target.to_string();

        loop {
            self.check_cancelled()?;
            let page = self
                .indexer
                .git
                .rev_list(self.repo, &cursor, page_size)
                .await
                .with_context(|| format!("Failed to list revisions of {}@{cursor}", self.repo))?;

            let repo_id = self.repo_id;
            let hashes = page.commits.clone();
            let found = self
                .storage
                .call(move |s| {
                    for (i, hash) in hashes.iter().enumerate() {
                        if let Some(commit) = s.get_commit(repo_id, hash)? {
                            let spine = s.spine(commit.id)?;
                            return Ok(Some((i, commit, spine)));
                        }
                    }
                    Ok(None)
                })
                .await?;

            match found {
                Some((i, commit, spine)) => {
                    missing.extend(page.commits.into_iter().take(i));
                    self.tip = Some(commit);
                    self.tip_spine = spine;
                    break;
                }
                None => {
                    missing.extend(page.commits);
                    match page.next_cursor {
                        Some(next) => cursor = next,
                        None => break,
                    }
                }
            }
        }

        missing.reverse();
        Ok(missing)
    }

    async fn index_commit(&mut self, hash: &str) -> Result<()> {
        self.check_cancelled()?;
        let base = self.tip.as_ref().map(|t| t.hash.clone());
        let changes = self
            .indexer
            .git
            .changed_files(self.repo, base.as_deref(), hash)
            .await
            .context("Failed to list changed files")?;

        let mut added_paths = Vec::new();
        let mut modified_paths = Vec::new();
        let mut deleted_paths = Vec::new();
        for change in changes {
            match change.status {
                ChangeStatus::Added => added_paths.push(change.path),
                ChangeStatus::Modified => modified_paths.push(change.path),
                ChangeStatus::Deleted => deleted_paths.push(change.path),
                ChangeStatus::TypeChanged => {}
            }
        }

        let old_paths: Vec<String> = deleted_paths.iter().chain(&modified_paths).cloned().collect();
        let old = self.old_symbols(old_paths).await?;
        let new_paths: Vec<String> = added_paths.iter().chain(&modified_paths).cloned().collect();
        let (indexer, repo, cancel) = (self.indexer, self.repo, self.cancel);
        let mut new = indexer.parse_paths(repo, hash, new_paths, cancel).await?;

        let empty = HashSet::new();
        let mut to_delete: Vec<SymbolKey> = Vec::new();
        let mut to_add: Vec<SymbolKey> = Vec::new();
        for path in &deleted_paths {
            let names = old.get(path).unwrap_or(&empty);
            to_delete.extend(names.iter().map(|n| (path.clone(), n.clone())));
        }
        for path in &added_paths {
            let names = new.get(path).unwrap_or(&empty);
            to_add.extend(names.iter().map(|n| (path.clone(), n.clone())));
        }
        for path in &modified_paths {
            let before = old.get(path).unwrap_or(&empty);
            let after = new.get(path).unwrap_or(&empty);
            to_delete.extend(before.difference(after).map(|n| (path.clone(), n.clone())));
            to_add.extend(after.difference(before).map(|n| (path.clone(), n.clone())));
        }
        to_delete.sort();
        to_add.sort();

        let deletes = to_delete
            .into_iter()
            .map(|key| {
                let cached = self.symbol_ids.get(&key).copied();
                (key, cached)
            })
            .collect();
        let write = CommitWrite {
            repo: self.repo.to_string(),
            repo_id: self.repo_id,
            hash: hash.to_string(),
            plan: plan_hop(self.tip.as_ref(), &self.tip_spine),
            hops: self.tip_spine.clone(),
            deletes,
            adds: to_add,
        };
        let outcome = self.storage.call(move |s| write.apply(s)).await?;

        tracing::info!(
            repo = %self.repo,
            commit = %hash,
            height = outcome.commit.height,
            added_paths = added_paths.len(),
            modified_paths = modified_paths.len(),
            deleted_paths = deleted_paths.len(),
            symbols_added = outcome.inserted.len(),
            symbols_deleted = outcome.deleted.len(),
            "Indexed commit"
        );

        for path in deleted_paths {
            self.path_symbols.put(path, HashSet::new());
        }
        for path in added_paths.into_iter().chain(modified_paths) {
            let names = new.remove(&path).unwrap_or_default();
            self.path_symbols.put(path, names);
        }
        for key in &outcome.deleted {
            self.symbol_ids.pop(key);
        }
        self.stats.commits_indexed += 1;
        self.stats.symbols_added += outcome.inserted.len();
        self.stats.symbols_deleted += outcome.deleted.len();
        self.stats.symbols_missing += outcome.missing;
        for (key, id) in outcome.inserted {
            self.symbol_ids.put(key, id);
        }
        self.tip = Some(outcome.commit);
        self.tip_spine = outcome.spine;
        Ok(())
    }

    /// Symbol names per path as of the current tip.
    async fn old_symbols(&mut self, paths: Vec<String>) -> Result<HashMap<String, HashSet<String>>> {
        let mut symbols = HashMap::new();
        let mut misses = Vec::new();
        for path in paths {
            match self.path_symbols.get(&path) {
                Some(names) => {
                    symbols.insert(path, names.clone());
                }
                None => misses.push(path),
            }
        }
        if misses.is_empty() {
            return Ok(symbols);
        }

        let repo_id = self.repo_id;
        let hops = self.tip_spine.clone();
        let rows = self
            .storage
            .call(move |s| s.lookup_symbols_in_paths(repo_id, &hops, &misses))
            .await?;
        for (id, path, name) in rows {
            self.symbol_ids.put((path.clone(), name.clone()), id);
            symbols.entry(path).or_insert_with(HashSet::new).insert(name);
        }
        Ok(symbols)
    }
}

fn collect_parsed(
    symbols: &mut HashMap<String, HashSet<String>>,
    joined: Option<Result<Result<(String, HashSet<String>)>, JoinError>>,
) -> Result<()> {
    if let Some(joined) = joined {
        let (path, names) = joined.context("Parse task failed")??;
        symbols.insert(path, names);
    }
    Ok(())
}

/// Everything one commit writes, applied in a single transaction.
struct CommitWrite {
    repo: String,
    repo_id: i64,
    hash: String,
    plan: HopPlan,
    /// Spine of the tip the commit is appended to
    hops: Vec<i64>,
    deletes: Vec<(SymbolKey, Option<i64>)>,
    adds: Vec<SymbolKey>,
}

struct CommitOutcome {
    commit: CommitRecord,
    spine: Vec<i64>,
    inserted: Vec<(SymbolKey, i64)>,
    deleted: Vec<SymbolKey>,
    missing: usize,
}

impl CommitWrite {
    fn apply(self, s: &SqliteStorage) -> Result<CommitOutcome> {
        s.begin_transaction()?;
        let result = self.write(s).and_then(|outcome| {
            s.commit()?;
            Ok(outcome)
        });
        if result.is_err() {
            if let Err(e) = s.rollback() {
                tracing::warn!(error = %e, "Rollback failed");
            }
        }
        result
    }

    fn write(self, s: &SqliteStorage) -> Result<CommitOutcome> {
        let plan = self.plan;
        let commit_id = s.insert_commit(self.repo_id, &self.hash, plan.height, plan.ancestor)?;

        let mut deleted = Vec::with_capacity(self.deletes.len());
        let mut missing = 0;
        for ((path, name), cached) in self.deletes {
            let marked = match cached {
                Some(id) => s.mark_deleted(id, commit_id)?,
                None => false,
            };
            if !marked {
                match s.lookup_symbol(self.repo_id, &self.hops, &path, &name)? {
                    Some(id) => {
                        s.mark_deleted(id, commit_id)?;
                    }
                    None => {
                        tracing::warn!(
                            repo = %self.repo,
                            commit = %self.hash,
                            path = %path,
                            symbol = %name,
                            "Symbol to delete not found, skipping"
                        );
                        missing += 1;
                        continue;
                    }
                }
            }
            deleted.push((path, name));
        }

        let mut inserted = Vec::with_capacity(self.adds.len());
        for (path, name) in self.adds {
            let id = s.insert_symbol(self.repo_id, commit_id, &path, &name)?;
            inserted.push(((path, name), id));
        }

        s.append_hop(self.repo_id, &self.hops[..plan.fan_out], commit_id)?;
        let pruned = s.delete_redundant(self.repo_id, commit_id)?;
        if pruned > 0 {
            tracing::debug!(commit = %self.hash, pruned, "Removed redundant symbol rows");
        }
        let spine = s.spine(commit_id)?;

        Ok(CommitOutcome {
            commit: CommitRecord {
                id: commit_id,
                hash: self.hash,
                height: plan.height,
                ancestor: plan.ancestor,
            },
            spine,
            inserted,
            deleted,
            missing,
        })
    }
}
