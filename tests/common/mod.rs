#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::io::Cursor;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Result, bail};
use async_trait::async_trait;

use rockskip::config::Config;
use rockskip::git::{ArchiveReader, ChangeStatus, ChangedPath, GitService, RevListPage};
use rockskip::parser::{Parser, ParserFactory, Symbol};

type Tree = BTreeMap<String, Vec<u8>>;

/// Linear in-memory repositories. Commit `n` of a repo is named `c{n}`,
/// starting at 1.
#[derive(Default)]
pub struct FakeGit {
    repos: Mutex<HashMap<String, Vec<Tree>>>,
    fail_at: Mutex<Option<String>>,
    archive_delay: Mutex<Option<Duration>>,
    pub rev_list_calls: AtomicUsize,
    pub changed_files_calls: AtomicUsize,
    pub archive_calls: AtomicUsize,
}

pub fn hash(n: usize) -> String {
    format!("c{n}")
}

fn position(hash: &str) -> Option<usize> {
    hash.strip_prefix('c')?.parse::<usize>().ok()?.checked_sub(1)
}

impl FakeGit {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Appends a commit applying `changes` (`None` deletes the path) on top
    /// of the previous tree. Returns its hash.
    pub fn commit(&self, repo: &str, changes: &[(&str, Option<&str>)]) -> String {
        let mut repos = self.repos.lock().unwrap();
        let history = repos.entry(repo.to_string()).or_default();
        let mut tree = history.last().cloned().unwrap_or_default();
        for (path, content) in changes {
            match content {
                Some(content) => {
                    tree.insert(path.to_string(), content.as_bytes().to_vec());
                }
                None => {
                    tree.remove(*path);
                }
            }
        }
        history.push(tree);
        hash(history.len())
    }

    pub fn tree(&self, repo: &str, commit: &str) -> Tree {
        let repos = self.repos.lock().unwrap();
        repos[repo][position(commit).unwrap()].clone()
    }

    /// Makes `changed_files` fail for `commit`.
    pub fn fail_at(&self, commit: Option<&str>) {
        *self.fail_at.lock().unwrap() = commit.map(str::to_string);
    }

    pub fn set_archive_delay(&self, delay: Duration) {
        *self.archive_delay.lock().unwrap() = Some(delay);
    }

    fn lookup(&self, repo: &str, commit: &str) -> Result<Tree> {
        let repos = self.repos.lock().unwrap();
        let Some(history) = repos.get(repo) else {
            bail!("unknown repository {repo}");
        };
        match position(commit).and_then(|i| history.get(i)) {
            Some(tree) => Ok(tree.clone()),
            None => bail!("unknown commit {commit} in {repo}"),
        }
    }
}

#[async_trait]
impl GitService for FakeGit {
    async fn rev_list(&self, repo: &str, cursor: &str, page_size: usize) -> Result<RevListPage> {
        self.rev_list_calls.fetch_add(1, Ordering::SeqCst);
        self.lookup(repo, cursor)?;
        let start = position(cursor).unwrap_or_default();
        let end = start.saturating_sub(page_size.saturating_sub(1));
        let commits = (end..=start).rev().map(|i| hash(i + 1)).collect();
        let next_cursor = end.checked_sub(1).map(|i| hash(i + 1));
        Ok(RevListPage {
            commits,
            next_cursor,
        })
    }

    async fn changed_files(
        &self,
        repo: &str,
        base: Option<&str>,
        head: &str,
    ) -> Result<Vec<ChangedPath>> {
        self.changed_files_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_at.lock().unwrap().as_deref() == Some(head) {
            bail!("injected failure at {head}");
        }
        let old = match base {
            Some(base) => self.lookup(repo, base)?,
            None => Tree::new(),
        };
        let new = self.lookup(repo, head)?;

        let mut changes = Vec::new();
        for (path, content) in &new {
            match old.get(path) {
                None => changes.push(ChangedPath::new(path.clone(), ChangeStatus::Added)),
                Some(before) if before != content => {
                    changes.push(ChangedPath::new(path.clone(), ChangeStatus::Modified))
                }
                Some(_) => {}
            }
        }
        for path in old.keys().filter(|p| !new.contains_key(*p)) {
            changes.push(ChangedPath::new(path.clone(), ChangeStatus::Deleted));
        }
        Ok(changes)
    }

    async fn archive(
        &self,
        repo: &str,
        commit: &str,
        paths: Option<&[String]>,
    ) -> Result<ArchiveReader> {
        self.archive_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.archive_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let tree = self.lookup(repo, commit)?;
        let selected: Vec<(&String, &Vec<u8>)> = match paths {
            Some(paths) => paths
                .iter()
                .filter_map(|p| tree.get_key_value(p))
                .collect(),
            None => tree.iter().collect(),
        };

        let mut builder = tar::Builder::new(Vec::new());
        for (path, content) in selected {
            let mut header = tar::Header::new_gnu();
            header.set_size(content.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, path, content.as_slice())?;
        }
        Ok(Box::new(Cursor::new(builder.into_inner()?)))
    }
}

/// One symbol per non-empty line. Content starting with `!panic` panics and
/// `!fail` errors.
pub struct LineParser;

impl Parser for LineParser {
    fn parse(&mut self, path: &str, content: &[u8]) -> Result<Vec<Symbol>> {
        let text = String::from_utf8_lossy(content);
        if text.starts_with("!panic") {
            panic!("line parser panicked on {path}");
        }
        if text.starts_with("!fail") {
            bail!("line parser failed on {path}");
        }
        Ok(text
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(i, line)| Symbol {
                name: line.trim().to_string(),
                path: path.to_string(),
                line: i + 1,
                kind: "line".to_string(),
                language: "text".to_string(),
                parent: None,
                parent_kind: None,
                signature: None,
                pattern: None,
                file_limited: false,
            })
            .collect())
    }
}

pub fn line_factory() -> ParserFactory {
    Arc::new(|| Ok(Box::new(LineParser) as Box<dyn Parser>))
}

/// The (path, name) pairs a from-scratch parse of `tree` yields.
pub fn expected_symbols(tree: &Tree) -> BTreeSet<(String, String)> {
    let mut parser = LineParser;
    tree.iter()
        .flat_map(|(path, content)| parser.parse(path, content).unwrap_or_default())
        .map(|s| (s.path, s.name))
        .collect()
}

/// Small pools and pages so tests exercise paging, batching and reuse.
pub fn test_config(dir: &Path) -> Config {
    let mut config = Config::default();
    config.storage.db_path = Some(dir.join("rockskip.db"));
    config.service.index_workers = 2;
    config.service.queue_size = 4;
    config.indexer.rev_list_page_size = 3;
    config.fetcher.max_concurrent_fetches = 2;
    config.fetcher.max_total_paths_length = 16;
    config.parser.pool_size = 2;
    config
}
