//! Versioned symbol rows.
//!
//! Every commit points at an `ancestor` chosen so that following ancestors
//! from any commit (its *spine*) takes O(log height) steps. A symbol row
//! records, in `added` and `deleted`, the commits at which it became visible
//! or invisible. When a commit skips over part of its tip's spine, the events
//! recorded at the skipped hops are copied onto the new commit, so a row is
//! visible at `C` exactly when some `added` entry and no `deleted` entry lies
//! on `spine(C)`.

use anyhow::{Context, Result};
use rusqlite::{OptionalExtension, params};

use super::{CommitRecord, SqliteStorage};

/// Ancestor of a root commit.
pub const SENTINEL: i64 = 0;

/// Trailing zero bits of `n`, or 0 when `n <= 0`.
pub fn rank(n: i64) -> u32 {
    if n <= 0 { 0 } else { n.trailing_zeros() }
}

/// Placement of a commit appended on top of the current tip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HopPlan {
    pub height: i64,
    pub ancestor: i64,
    /// Number of leading tip-spine hops whose events are copied to the new commit.
    pub fan_out: usize,
}

/// `tip_spine` is `spine(tip)`, or `[SENTINEL]` when nothing is indexed yet.
pub fn plan_hop(tip: Option<&CommitRecord>, tip_spine: &[i64]) -> HopPlan {
    let height = tip.map_or(0, |t| t.height + 1);
    let fan_out = (rank(height + 1) as usize).min(tip_spine.len().saturating_sub(1));
    let ancestor = tip_spine.get(fan_out).copied().unwrap_or(SENTINEL);
    HopPlan {
        height,
        ancestor,
        fan_out,
    }
}

/// SQL condition selecting rows of `table` visible at the spine bound to
/// `hops_param` (a JSON array of commit ids).
pub(crate) fn visible_clause(table: &str, hops_param: &str) -> String {
    format!(
        "EXISTS (SELECT 1 FROM json_each({table}.added) WHERE value IN (SELECT value FROM json_each({hops_param}))) \
         AND NOT EXISTS (SELECT 1 FROM json_each({table}.deleted) WHERE value IN (SELECT value FROM json_each({hops_param})))"
    )
}

pub(crate) fn hops_json(hops: &[i64]) -> Result<String> {
    serde_json::to_string(hops).context("Failed to encode hops")
}

impl SqliteStorage {
    /// `[commit, ancestor(commit), …, SENTINEL]`.
    pub fn spine(&self, commit_id: i64) -> Result<Vec<i64>> {
        let mut stmt = self.conn().prepare_cached(
            "WITH RECURSIVE spine(id) AS (
                 SELECT ?1
                 UNION ALL
                 SELECT c.ancestor FROM commits c JOIN spine s ON c.id = s.id
             )
             SELECT id FROM spine ORDER BY id DESC",
        )?;
        let rows = stmt.query_map(params![commit_id], |row| row.get(0))?;
        let spine = rows.collect::<rusqlite::Result<Vec<i64>>>()?;
        Ok(spine)
    }

    pub fn insert_symbol(&self, repo_id: i64, commit_id: i64, path: &str, name: &str) -> Result<i64> {
        let mut stmt = self.conn().prepare_cached(
            "INSERT INTO symbols (repo_id, path, name, added, deleted)
             VALUES (?1, ?2, ?3, json_array(?4), '[]')",
        )?;
        stmt.execute(params![repo_id, path, name, commit_id])
            .with_context(|| format!("Failed to insert symbol {name} in {path}"))?;
        Ok(self.conn().last_insert_rowid())
    }

    /// Returns false if the row no longer exists.
    pub fn mark_deleted(&self, symbol_id: i64, commit_id: i64) -> Result<bool> {
        let mut stmt = self.conn().prepare_cached(
            "UPDATE symbols SET deleted = json_insert(deleted, '$[#]', ?2) WHERE id = ?1",
        )?;
        Ok(stmt.execute(params![symbol_id, commit_id])? > 0)
    }

    /// Copies every event recorded at one of `hops` onto `commit_id`.
    /// Returns the number of updated event sets.
    pub fn append_hop(&self, repo_id: i64, hops: &[i64], commit_id: i64) -> Result<usize> {
        if hops.is_empty() {
            return Ok(0);
        }
        let hops = hops_json(hops)?;
        let mut updated = 0;
        for column in ["added", "deleted"] {
            let sql = format!(
                "UPDATE symbols SET {column} = json_insert({column}, '$[#]', ?3)
                 WHERE repo_id = ?1
                   AND EXISTS (SELECT 1 FROM json_each(symbols.{column})
                               WHERE value IN (SELECT value FROM json_each(?2)))"
            );
            updated += self
                .conn()
                .prepare_cached(&sql)?
                .execute(params![repo_id, hops, commit_id])
                .with_context(|| format!("Failed to append hop to {column} events"))?;
        }
        Ok(updated)
    }

    /// Drops `commit_id` from rows both added and deleted at it, then removes
    /// rows left without any addition. Returns the number of removed rows.
    pub fn delete_redundant(&self, repo_id: i64, commit_id: i64) -> Result<usize> {
        self.conn().prepare_cached(
            "UPDATE symbols SET
                 added = (SELECT json_group_array(value) FROM json_each(symbols.added) WHERE value != ?2),
                 deleted = (SELECT json_group_array(value) FROM json_each(symbols.deleted) WHERE value != ?2)
             WHERE repo_id = ?1
               AND EXISTS (SELECT 1 FROM json_each(symbols.added) WHERE value = ?2)
               AND EXISTS (SELECT 1 FROM json_each(symbols.deleted) WHERE value = ?2)",
        )?
        .execute(params![repo_id, commit_id])?;

        let removed = self
            .conn()
            .prepare_cached("DELETE FROM symbols WHERE repo_id = ?1 AND json_array_length(added) = 0")?
            .execute(params![repo_id])?;
        Ok(removed)
    }

    /// Row id of `(path, name)` as visible at the commit whose spine is `hops`.
    pub fn lookup_symbol(&self, repo_id: i64, hops: &[i64], path: &str, name: &str) -> Result<Option<i64>> {
        let sql = format!(
            "SELECT id FROM symbols
             WHERE repo_id = ?1 AND path = ?2 AND name = ?3 AND {}
             LIMIT 1",
            visible_clause("symbols", "?4")
        );
        let id = self
            .conn()
            .prepare_cached(&sql)?
            .query_row(params![repo_id, path, name, hops_json(hops)?], |row| row.get(0))
            .optional()?;
        Ok(id)
    }

    /// `(id, path, name)` of every row in `paths` visible at the commit whose
    /// spine is `hops`.
    pub fn lookup_symbols_in_paths(
        &self,
        repo_id: i64,
        hops: &[i64],
        paths: &[String],
    ) -> Result<Vec<(i64, String, String)>> {
        if paths.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT id, path, name FROM symbols
             WHERE repo_id = ?1 AND path IN (SELECT value FROM json_each(?2)) AND {}",
            visible_clause("symbols", "?3")
        );
        let paths = serde_json::to_string(paths).context("Failed to encode paths")?;
        let mut stmt = self.conn().prepare_cached(&sql)?;
        let rows = stmt.query_map(params![repo_id, paths, hops_json(hops)?], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?))
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    #[test]
    fn test_rank() {
        let cases = [(0, 0), (1, 0), (2, 1), (4, 2), (8, 3), (64, 6), (96, 5), (123, 0), (-4, 0)];
        for (n, expected) in cases {
            assert_eq!(rank(n), expected, "rank({n})");
        }
        let ruler: Vec<u32> = (1..=9).map(rank).collect();
        assert_eq!(ruler, vec![0, 1, 0, 2, 0, 1, 0, 3, 0]);
    }

    #[test]
    fn test_plan_first_commit() {
        let plan = plan_hop(None, &[SENTINEL]);
        assert_eq!(
            plan,
            HopPlan {
                height: 0,
                ancestor: SENTINEL,
                fan_out: 0
            }
        );
    }

    #[test]
    fn test_spine_of_sentinel() {
        let storage = SqliteStorage::open_memory().unwrap();
        assert_eq!(storage.spine(SENTINEL).unwrap(), vec![SENTINEL]);
    }

    /// Applies commits the same way the indexer does, for a single file `f`.
    struct History {
        storage: SqliteStorage,
        repo: i64,
        tip: Option<CommitRecord>,
        commits: Vec<i64>,
    }

    impl History {
        fn new() -> Self {
            let storage = SqliteStorage::open_memory().unwrap();
            let repo = storage.ensure_repo("repo").unwrap();
            Self {
                storage,
                repo,
                tip: None,
                commits: Vec::new(),
            }
        }

        fn tip_spine(&self) -> Vec<i64> {
            match &self.tip {
                Some(tip) => self.storage.spine(tip.id).unwrap(),
                None => vec![SENTINEL],
            }
        }

        fn commit(&mut self, added: &[String], deleted: &[String]) {
            let s = &self.storage;
            let hops = self.tip_spine();
            let plan = plan_hop(self.tip.as_ref(), &hops);
            let hash = format!("c{}", plan.height);

            s.begin_transaction().unwrap();
            let id = s.insert_commit(self.repo, &hash, plan.height, plan.ancestor).unwrap();
            for name in deleted {
                let row = s.lookup_symbol(self.repo, &hops, "f", name).unwrap().unwrap();
                assert!(s.mark_deleted(row, id).unwrap());
            }
            for name in added {
                s.insert_symbol(self.repo, id, "f", name).unwrap();
            }
            s.append_hop(self.repo, &hops[..plan.fan_out], id).unwrap();
            s.delete_redundant(self.repo, id).unwrap();
            s.commit().unwrap();

            self.tip = s.get_commit(self.repo, &hash).unwrap();
            self.commits.push(id);
        }

        fn visible(&self, commit_id: i64) -> BTreeSet<String> {
            let spine = self.storage.spine(commit_id).unwrap();
            self.storage
                .lookup_symbols_in_paths(self.repo, &spine, &["f".to_string()])
                .unwrap()
                .into_iter()
                .map(|(_, _, name)| name)
                .collect()
        }
    }

    #[test]
    fn test_spine_is_logarithmic() {
        let mut history = History::new();
        for _ in 0..300 {
            history.commit(&[], &[]);
        }
        for (height, id) in history.commits.iter().enumerate() {
            let spine = history.storage.spine(*id).unwrap();
            assert_eq!(spine.last(), Some(&SENTINEL));
            assert_eq!(spine.first(), Some(id));
            let bound = 2 * (64 - (height as u64 + 1).leading_zeros()) as usize + 2;
            assert!(spine.len() <= bound, "height {height}: spine {spine:?}");
        }
    }

    #[test]
    fn test_visibility_across_history() {
        let mut history = History::new();
        let mut live: BTreeSet<String> = BTreeSet::new();
        let mut expected = Vec::new();

        for i in 0..70usize {
            let mut added = vec![format!("s{i}")];
            let mut deleted = Vec::new();
            if i % 3 == 0 && i >= 3 {
                deleted.push(format!("s{}", i - 3));
            }
            if i % 7 == 0 && i >= 7 {
                deleted.push(format!("s{}", i - 5));
            }
            // Bring back an old name after it was deleted.
            if i % 9 == 0 && i >= 12 && !live.contains(&format!("s{}", i - 12)) {
                added.push(format!("s{}", i - 12));
            }
            deleted.retain(|d| live.contains(d));
            deleted.dedup();

            for d in &deleted {
                live.remove(d);
            }
            for a in &added {
                live.insert(a.clone());
            }
            history.commit(&added, &deleted);
            expected.push(live.clone());
        }

        for (i, id) in history.commits.iter().enumerate() {
            assert_eq!(history.visible(*id), expected[i], "commit {i}");
        }
    }

    #[test]
    fn test_redundant_rows_are_pruned() {
        let mut history = History::new();
        history.commit(&["a".to_string()], &[]);
        // Height 1 has fan-out 1: the row added at the root is copied to the
        // new commit, which also deletes it.
        history.commit(&[], &["a".to_string()]);

        let rows: i64 = history
            .storage
            .conn()
            .query_row("SELECT COUNT(*) FROM symbols", [], |row| row.get(0))
            .unwrap();
        assert_eq!(rows, 1);
        assert!(history.visible(history.commits[1]).is_empty());
        assert_eq!(history.visible(history.commits[0]).len(), 1);
    }

    #[test]
    fn test_lookup_symbol_respects_deletion() {
        let mut history = History::new();
        history.commit(&["a".to_string(), "b".to_string()], &[]);
        history.commit(&[], &["a".to_string()]);
        history.commit(&[], &[]);

        let s = &history.storage;
        let root = s.spine(history.commits[0]).unwrap();
        let head = s.spine(history.commits[2]).unwrap();
        assert!(s.lookup_symbol(history.repo, &root, "f", "a").unwrap().is_some());
        assert!(s.lookup_symbol(history.repo, &head, "f", "a").unwrap().is_none());
        assert!(s.lookup_symbol(history.repo, &head, "f", "b").unwrap().is_some());
        assert!(s.lookup_symbol(history.repo, &head, "g", "b").unwrap().is_none());
    }
}
