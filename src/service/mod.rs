pub mod inflight;
pub mod metrics;

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use anyhow::{Context, Result};
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::error::RockskipError;
use crate::fetcher::{ArchiveFetcher, drain};
use crate::git::GitService;
use crate::indexer::{IndexStats, Indexer, RepoLocks};
use crate::parser::{ParserFactory, ParserPool, Symbol, SymbolParser};
use crate::search::{SearchArgs, SymbolHit, langs};
use crate::storage::{RepoRecord, SqliteStorage};
pub use inflight::{Claim, InflightIndexes};
pub use metrics::{Metrics, MetricsSnapshot, Operation};

/// A queued request to bring (repo, commit) up to date.
struct IndexRequest {
    handle: inflight::InflightHandle,
    enqueued_at: Instant,
}

/// State shared by the service front-end and its background tasks.
struct Shared {
    config: Config,
    db_path: PathBuf,
    indexer: Indexer,
    fetcher: ArchiveFetcher,
    parser: SymbolParser,
    inflight: InflightIndexes,
    metrics: Metrics,
    cleanup: Notify,
    root: CancellationToken,
}

/// Index and search front-end. Index requests are routed by repository to a
/// fixed set of workers, and concurrent requests for the same
/// (repo, commit) share one run.
pub struct Service {
    shared: Arc<Shared>,
    queues: Vec<mpsc::Sender<IndexRequest>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Service {
    /// Builds the components and starts the worker and cleanup tasks. Must be
    /// called inside a tokio runtime.
    pub fn new(config: Config, git: Arc<dyn GitService>, factory: ParserFactory) -> Result<Self> {
        let db_path = config.storage.resolved_db_path();
        // Create the schema up front so a bad path fails here.
        SqliteStorage::open(&db_path)?;

        let pool = ParserPool::new(factory, config.parser.pool_size)
            .context("Failed to start parser pool")?;
        let parser = SymbolParser::new(pool, &config.parser);
        let fetcher = ArchiveFetcher::new(git.clone(), &config.fetcher);
        let indexer = Indexer::new(
            git,
            fetcher.clone(),
            parser.clone(),
            db_path.clone(),
            RepoLocks::new(),
            &config.indexer,
        );

        let workers = config.service.index_workers.max(1);
        let queue_size = config.service.queue_size.max(1);
        let shared = Arc::new(Shared {
            config,
            db_path,
            indexer,
            fetcher,
            parser,
            inflight: InflightIndexes::new(),
            metrics: Metrics::new(),
            cleanup: Notify::new(),
            root: CancellationToken::new(),
        });

        let mut queues = Vec::with_capacity(workers);
        let mut tasks = Vec::with_capacity(workers + 1);
        for id in 0..workers {
            let (tx, rx) = mpsc::channel(queue_size);
            queues.push(tx);
            tasks.push(tokio::spawn(worker(shared.clone(), id, rx)));
        }
        tasks.push(tokio::spawn(cleanup_loop(shared.clone())));

        tracing::info!(
            workers,
            queue_size,
            db = %shared.db_path.display(),
            "Service started"
        );
        Ok(Self {
            shared,
            queues,
            tasks: Mutex::new(tasks),
        })
    }

    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    pub fn metrics(&self) -> &Metrics {
        &self.shared.metrics
    }

    /// Indexes `commit` and its missing first-parent ancestors. Joins the run
    /// already in flight for the same (repo, commit), if any; all callers see
    /// the same outcome.
    ///
    /// Cancelling `cancel` only stops this caller from waiting. The shared
    /// run keeps going while any other caller still waits on it.
    pub async fn index(
        &self,
        repo: &str,
        commit: &str,
        cancel: &CancellationToken,
    ) -> Result<IndexStats> {
        loop {
            if self.shared.root.is_cancelled() {
                return Err(RockskipError::ShuttingDown.into());
            }

            let waiter = match self.shared.inflight.claim(repo, commit, &self.shared.root) {
                Claim::Follower(waiter) => {
                    tracing::debug!(repo = %repo, commit = %commit, "Joining in-flight index run");
                    self.shared.metrics.record_coalesced();
                    waiter
                }
                Claim::Leader(handle, waiter) => {
                    let queue = &self.queues[route(repo, self.queues.len())];
                    let request = IndexRequest {
                        handle,
                        enqueued_at: Instant::now(),
                    };
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(RockskipError::Cancelled.into()),
                        sent = queue.send(request) => {
                            if sent.is_err() {
                                return Err(RockskipError::ShuttingDown.into());
                            }
                        }
                    }
                    waiter
                }
            };

            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(RockskipError::Cancelled.into()),
                outcome = waiter.wait() => outcome,
            };
            match outcome {
                // The caller that claimed the run gave up before handing it
                // to a worker; claim it again.
                Err(e) if matches!(
                    e.downcast_ref::<RockskipError>(),
                    Some(RockskipError::IndexingAborted { .. })
                ) && !self.shared.root.is_cancelled() =>
                {
                    tracing::debug!(repo = %repo, commit = %commit, "Index run abandoned, retrying");
                }
                outcome => return outcome,
            }
        }
    }

    /// Whether `commit` of `repo` is already in the index.
    async fn is_indexed(&self, repo: &str, commit: &str) -> Result<bool> {
        let db_path = self.shared.db_path.clone();
        let (repo, commit) = (repo.to_string(), commit.to_string());
        tokio::task::spawn_blocking(move || {
            let storage = SqliteStorage::open(&db_path)?;
            match storage.find_repo(&repo)? {
                Some(repo_id) => Ok(storage.get_commit(repo_id, &commit)?.is_some()),
                None => Ok(false),
            }
        })
        .await
        .context("Index lookup task panicked")?
    }

    /// Indexes `args.commit` if needed, then returns the matching symbols.
    /// The whole call is bounded by `args.timeout`, or the configured default
    /// when that is unset.
    pub async fn search(&self, args: SearchArgs, cancel: &CancellationToken) -> Result<Vec<Symbol>> {
        let metrics = &self.shared.metrics;
        let _in_flight = metrics.start(Operation::Search);
        let started = Instant::now();

        let limit = args
            .timeout
            .or_else(|| self.shared.config.search.default_timeout())
            .filter(|limit| !limit.is_zero());
        let result = match limit {
            Some(limit) => tokio::time::timeout(limit, self.run_search(args, cancel))
                .await
                .unwrap_or_else(|_| Err(RockskipError::TimedOut(limit).into())),
            None => self.run_search(args, cancel).await,
        };

        metrics.search_duration.observe(started.elapsed());
        if let Err(e) = &result {
            metrics.record_failure(Operation::Search);
            tracing::debug!(error = %e, "Search failed");
        }
        result
    }

    async fn run_search(&self, args: SearchArgs, cancel: &CancellationToken) -> Result<Vec<Symbol>> {
        args.validate()?;
        // Indexed commits are read directly, without waiting on a writer.
        if !self.is_indexed(&args.repo, &args.commit).await? {
            self.index(&args.repo, &args.commit, cancel).await?;
        }

        let db_path = self.shared.db_path.clone();
        let query = args.clone();
        let hits = tokio::task::spawn_blocking(move || {
            let storage = SqliteStorage::open(&db_path)?;
            if let Some(repo_id) = storage.find_repo(&query.repo)? {
                storage.touch_repo(repo_id)?;
            }
            storage.search(&query)
        })
        .await
        .context("Search task panicked")??;

        tracing::debug!(repo = %args.repo, commit = %args.commit, hits = hits.len(), "Search matched");
        self.hydrate(&args, hits, cancel).await
    }

    /// Re-parses the matched files to fill in line, kind and the other
    /// details the index does not store.
    async fn hydrate(
        &self,
        args: &SearchArgs,
        hits: Vec<SymbolHit>,
        cancel: &CancellationToken,
    ) -> Result<Vec<Symbol>> {
        if hits.is_empty() {
            return Ok(Vec::new());
        }

        let mut wanted: HashMap<&str, HashSet<&str>> = HashMap::new();
        let mut paths = Vec::new();
        for hit in &hits {
            let names = wanted.entry(hit.path.as_str()).or_insert_with(|| {
                paths.push(hit.path.clone());
                HashSet::new()
            });
            names.insert(hit.name.as_str());
        }

        let shared = &self.shared;
        let mut rx = shared
            .fetcher
            .fetch(&args.repo, &args.commit, paths, cancel.clone());
        let mut parsed: HashMap<String, Vec<Symbol>> = HashMap::new();
        let outcome = async {
            while let Some(entry) = rx.recv().await {
                let entry = entry?;
                let mut symbols = shared.parser.parse(&entry.path, entry.content, cancel).await?;
                let names = wanted.get(entry.path.as_str());
                symbols.retain(|s| names.is_some_and(|n| n.contains(s.name.as_str())));
                symbols.sort_by_key(|s| s.line);
                parsed.insert(entry.path, symbols);
            }
            Ok::<_, anyhow::Error>(())
        }
        .await;
        if outcome.is_err() {
            drain(&mut rx).await;
        }
        outcome?;

        Ok(hits
            .into_iter()
            .map(|hit| {
                parsed
                    .get_mut(&hit.path)
                    .and_then(|symbols| {
                        let pos = symbols.iter().position(|s| s.name == hit.name)?;
                        Some(symbols.remove(pos))
                    })
                    .unwrap_or_else(|| bare_symbol(hit))
            })
            .collect())
    }

    /// Known languages and the file globs each one covers.
    pub fn list_languages(&self) -> Vec<(&'static str, Vec<String>)> {
        langs::list()
    }

    pub async fn list_repos(&self) -> Result<Vec<RepoRecord>> {
        let db_path = self.shared.db_path.clone();
        tokio::task::spawn_blocking(move || SqliteStorage::open(&db_path)?.list_repos())
            .await
            .context("List task panicked")?
    }

    /// Removes a repository and everything indexed for it, waiting for any
    /// indexing run on it to finish first.
    pub async fn delete_repo(&self, repo: &str) -> Result<bool> {
        let locks = self.shared.indexer.locks().clone();
        let guard = locks.lock(repo).await;

        let db_path = self.shared.db_path.clone();
        let name = repo.to_string();
        let (deleted, remaining) = tokio::task::spawn_blocking(move || {
            let storage = SqliteStorage::open(&db_path)?;
            let deleted = storage.delete_repo(&name)?;
            Ok::<_, anyhow::Error>((deleted, storage.repo_count()?))
        })
        .await
        .context("Delete task panicked")??;

        drop(guard);
        locks.forget(repo);
        self.shared.metrics.set_repos(remaining);
        if deleted {
            tracing::info!(repo = %repo, "Deleted repository");
        }
        Ok(deleted)
    }

    /// Runs an eviction pass now instead of waiting for the cleanup task.
    pub async fn evict(&self) -> Result<usize> {
        self.shared.evict().await
    }

    /// Cancels in-flight work and waits for every background task to exit.
    pub async fn shutdown(&self) {
        self.shared.root.cancel();
        let tasks = {
            let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *tasks)
        };
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Service task panicked");
            }
        }
        tracing::info!("Service stopped");
    }
}

impl Drop for Service {
    fn drop(&mut self) {
        self.shared.root.cancel();
    }
}

impl Shared {
    async fn run_index(&self, request: IndexRequest) {
        let IndexRequest {
            handle,
            enqueued_at,
        } = request;
        self.metrics.queue_age.observe(enqueued_at.elapsed());

        // Every caller left while the request sat in the queue.
        if handle.token().is_cancelled() {
            tracing::debug!(repo = %handle.repo(), commit = %handle.commit(), "Skipping abandoned index request");
            let _ = handle.complete(Err(RockskipError::Cancelled.into()));
            return;
        }

        let _in_flight = self.metrics.start(Operation::Index);
        let started = Instant::now();
        let result = self
            .indexer
            .index(handle.repo(), handle.commit(), handle.token())
            .await;

        self.metrics.index_duration.observe(started.elapsed());
        match &result {
            Ok(_) => self.cleanup.notify_one(),
            Err(e) => {
                self.metrics.record_failure(Operation::Index);
                tracing::warn!(
                    repo = %handle.repo(),
                    commit = %handle.commit(),
                    error = %format!("{e:#}"),
                    "Indexing failed"
                );
            }
        }
        let _ = handle.complete(result);
    }

    /// Deletes least-recently-accessed repositories beyond the retention
    /// limit, skipping any that are being indexed.
    async fn evict(&self) -> Result<usize> {
        let keep = self.config.service.max_repos.max(1);
        let locks = self.indexer.locks().clone();
        let db_path = self.db_path.clone();

        let (evicted, remaining) = tokio::task::spawn_blocking(move || {
            let storage = SqliteStorage::open(&db_path)?;
            let mut evicted = 0;
            for (_, name) in storage.eviction_candidates(keep)? {
                let Some(guard) = locks.try_lock(&name) else {
                    tracing::debug!(repo = %name, "Skipping eviction of repository being indexed");
                    continue;
                };
                if storage.delete_repo(&name)? {
                    tracing::info!(repo = %name, "Evicted repository");
                    evicted += 1;
                }
                drop(guard);
                locks.forget(&name);
            }
            Ok::<_, anyhow::Error>((evicted, storage.repo_count()?))
        })
        .await
        .context("Eviction task panicked")??;

        self.metrics.record_evicted(evicted as u64);
        self.metrics.set_repos(remaining);
        Ok(evicted)
    }
}

async fn worker(shared: Arc<Shared>, id: usize, mut rx: mpsc::Receiver<IndexRequest>) {
    tracing::debug!(worker = id, "Index worker started");
    loop {
        let request = tokio::select! {
            biased;
            _ = shared.root.cancelled() => break,
            request = rx.recv() => match request {
                Some(request) => request,
                None => break,
            },
        };
        shared.run_index(request).await;
    }
    tracing::debug!(worker = id, "Index worker stopped");
}

async fn cleanup_loop(shared: Arc<Shared>) {
    loop {
        tokio::select! {
            biased;
            _ = shared.root.cancelled() => break,
            _ = shared.cleanup.notified() => {}
        }
        if let Err(e) = shared.evict().await {
            tracing::warn!(error = %format!("{e:#}"), "Eviction failed");
        }
    }
}

/// Worker queue for `repo`.
fn route(repo: &str, workers: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    repo.hash(&mut hasher);
    (hasher.finish() % workers.max(1) as u64) as usize
}

/// A matched row whose file no longer yields the symbol on re-parse.
fn bare_symbol(hit: SymbolHit) -> Symbol {
    let language = langs::for_path(&hit.path)
        .map(|lang| lang.name.to_string())
        .unwrap_or_default();
    Symbol {
        name: hit.name,
        path: hit.path,
        line: 0,
        kind: String::new(),
        language,
        parent: None,
        parent_kind: None,
        signature: None,
        pattern: None,
        file_limited: false,
    }
}
