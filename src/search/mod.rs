pub mod langs;
pub mod patterns;

use std::time::Duration;

use anyhow::{Context, Result};
use rusqlite::params_from_iter;
use rusqlite::types::Value;
use serde::Serialize;

use crate::storage::SqliteStorage;
use crate::storage::hops::{hops_json, visible_clause};

pub use patterns::PathMatcher;

#[derive(Debug, Clone, Default)]
pub struct SearchArgs {
    pub repo: String,
    pub commit: String,
    pub query: String,
    pub is_regexp: bool,
    pub case_sensitive: bool,
    pub include_patterns: Vec<String>,
    pub exclude_pattern: Option<String>,
    pub include_langs: Vec<String>,
    pub exclude_langs: Vec<String>,
    /// 0 means unlimited.
    pub limit: usize,
    /// Upper bound on the whole search, including any indexing it triggers.
    /// `None` falls back to the service default.
    pub timeout: Option<Duration>,
}

impl SearchArgs {
    pub fn new(repo: impl Into<String>, commit: impl Into<String>, query: impl Into<String>) -> Self {
        Self {
            repo: repo.into(),
            commit: commit.into(),
            query: query.into(),
            ..Self::default()
        }
    }

    /// Rejects malformed regular expressions before any work is done.
    pub fn validate(&self) -> Result<()> {
        if self.is_regexp {
            patterns::validate(&self.query, self.case_sensitive)?;
        }
        for pattern in self.include_patterns.iter().chain(&self.exclude_pattern) {
            patterns::validate(pattern, self.case_sensitive)?;
        }
        Ok(())
    }
}

/// A visible symbol row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SymbolHit {
    pub path: String,
    pub name: String,
}

/// Positional parameters and the conditions that reference them.
#[derive(Default)]
struct QueryBuilder {
    conditions: Vec<String>,
    params: Vec<Value>,
}

impl QueryBuilder {
    fn bind(&mut self, value: impl Into<Value>) -> String {
        self.params.push(value.into());
        format!("?{}", self.params.len())
    }

    fn push(&mut self, condition: String) {
        self.conditions.push(condition);
    }

    fn path_condition(&mut self, pattern: &str, case_sensitive: bool) -> Result<String> {
        let matcher = PathMatcher::compile(pattern, case_sensitive)?;
        let param = self.bind(matcher.value().to_string());
        Ok(matcher.condition("path", &param, case_sensitive))
    }

    fn suffix_any(&mut self, extensions: &[String]) -> String {
        let alternatives: Vec<String> = extensions
            .iter()
            .map(|ext| {
                let param = self.bind(ext.clone());
                format!("substr(lower(path), -length({param})) = {param}")
            })
            .collect();
        format!("({})", alternatives.join(" OR "))
    }
}

/// Compiles every filter of `args` into a single statement over the rows
/// visible at `spine`.
fn build_query(repo_id: i64, spine: &[i64], args: &SearchArgs) -> Result<(String, Vec<Value>)> {
    let mut q = QueryBuilder::default();

    let repo = q.bind(repo_id);
    q.push(format!("repo_id = {repo}"));
    let hops = q.bind(hops_json(spine)?);
    q.push(visible_clause("symbols", &hops));

    if !args.query.is_empty() {
        if args.is_regexp {
            patterns::validate(&args.query, args.case_sensitive)?;
            let param = q.bind(patterns::with_case(&args.query, args.case_sensitive));
            q.push(format!("name REGEXP {param}"));
        } else if args.case_sensitive {
            let param = q.bind(args.query.clone());
            q.push(format!("instr(name, {param}) > 0"));
        } else if !args.query.is_ascii() {
            // lower() leaves non-ASCII letters alone
            let param = q.bind(patterns::with_case(&regex::escape(&args.query), false));
            q.push(format!("name REGEXP {param}"));
        } else {
            let param = q.bind(args.query.to_ascii_lowercase());
            q.push(format!("instr(lower(name), {param}) > 0"));
        }
    }

    for pattern in &args.include_patterns {
        let condition = q.path_condition(pattern, args.case_sensitive)?;
        q.push(condition);
    }
    if let Some(pattern) = args.exclude_pattern.as_deref().filter(|p| !p.is_empty()) {
        let condition = q.path_condition(pattern, args.case_sensitive)?;
        q.push(format!("NOT ({condition})"));
    }

    if !args.include_langs.is_empty() {
        // Unknown names contribute no extensions.
        let extensions = langs::extensions_of(&args.include_langs);
        if extensions.is_empty() {
            q.push("0".to_string());
        } else {
            let condition = q.suffix_any(&extensions);
            q.push(condition);
        }
    }
    if !args.exclude_langs.is_empty() {
        let extensions = langs::extensions_of(&args.exclude_langs);
        if !extensions.is_empty() {
            let condition = q.suffix_any(&extensions);
            q.push(format!("NOT {condition}"));
        }
    }

    let mut sql = format!(
        "SELECT path, name FROM symbols WHERE {} ORDER BY path, name",
        q.conditions.join(" AND ")
    );
    if args.limit > 0 {
        let limit = q.bind(args.limit as i64);
        sql.push_str(&format!(" LIMIT {limit}"));
    }
    Ok((sql, q.params))
}

impl SqliteStorage {
    /// Symbol rows visible at `args.commit` that pass every filter.
    /// Fails if the commit has not been indexed.
    pub fn search(&self, args: &SearchArgs) -> Result<Vec<SymbolHit>> {
        let repo_id = self
            .find_repo(&args.repo)?
            .with_context(|| format!("Repository {} is not indexed", args.repo))?;
        let commit = self
            .get_commit(repo_id, &args.commit)?
            .with_context(|| format!("Commit {} of {} is not indexed", args.commit, args.repo))?;
        let spine = self.spine(commit.id)?;

        let (sql, params) = build_query(repo_id, &spine, args)?;
        let mut stmt = self.conn().prepare(&sql).context("Failed to prepare search query")?;
        let rows = stmt.query_map(params_from_iter(params), |row| {
            Ok(SymbolHit {
                path: row.get(0)?,
                name: row.get(1)?,
            })
        })?;
        let hits = rows
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Search query failed")?;
        Ok(hits)
    }
}
