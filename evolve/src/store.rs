//! SQLite-backed persistence for configurations, runs, best-config
//! pointers, and the evolution audit trail.
//!
//! This module is the only writer of these tables. Multi-statement updates
//! (config dedup-then-insert, the current pointer swap, best-config
//! updates) run inside transactions so concurrent writers cannot lose
//! updates or leave two configurations current for one scope.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use engine::core::params::EngineParams;
use rusqlite::{Connection, Row, params};
use sha2::{Digest, Sha256};

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS configs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    scope TEXT NOT NULL,
    version TEXT NOT NULL,
    params TEXT NOT NULL,
    config_hash TEXT NOT NULL,
    is_current INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL DEFAULT (datetime('now')),
    UNIQUE(scope, config_hash)
);

CREATE TABLE IF NOT EXISTS runs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id TEXT NOT NULL UNIQUE,
    scope TEXT NOT NULL,
    task_id TEXT NOT NULL,
    config_id INTEGER NOT NULL REFERENCES configs(id),
    passed INTEGER NOT NULL,
    progress REAL NOT NULL,
    turns INTEGER NOT NULL,
    duration_ms INTEGER NOT NULL,
    resource_units INTEGER NOT NULL,
    fail_reason TEXT,
    score INTEGER NOT NULL,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS best_configs (
    scope TEXT PRIMARY KEY,
    config_id INTEGER NOT NULL REFERENCES configs(id),
    run_id INTEGER NOT NULL REFERENCES runs(id),
    score INTEGER NOT NULL,
    pass_count INTEGER NOT NULL DEFAULT 0,
    total_runs INTEGER NOT NULL DEFAULT 0,
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS evolution_changes (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    scope TEXT NOT NULL,
    from_config_id INTEGER NOT NULL REFERENCES configs(id),
    to_config_id INTEGER REFERENCES configs(id),
    delta TEXT NOT NULL,
    reasoning TEXT NOT NULL,
    accepted INTEGER NOT NULL,
    reject_reason TEXT,
    observed_score_delta INTEGER,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE INDEX IF NOT EXISTS idx_configs_scope ON configs(scope);
CREATE INDEX IF NOT EXISTS idx_runs_scope ON runs(scope);
CREATE INDEX IF NOT EXISTS idx_runs_created ON runs(created_at DESC);
"#;

/// A persisted configuration version.
#[derive(Debug, Clone)]
pub struct ConfigRecord {
    pub id: i64,
    pub scope: String,
    pub params: EngineParams,
    pub config_hash: String,
    pub is_current: bool,
    pub created_at: String,
}

/// Input for persisting one completed run.
#[derive(Debug, Clone)]
pub struct RunInput {
    pub run_id: String,
    pub scope: String,
    pub task_id: String,
    pub config_id: i64,
    pub passed: bool,
    pub progress: f64,
    pub turns: u32,
    pub duration_ms: u64,
    pub resource_units: u64,
    pub fail_reason: Option<String>,
    pub score: i64,
}

/// A persisted run row.
#[derive(Debug, Clone)]
pub struct RunRecord {
    pub id: i64,
    pub run_id: String,
    pub scope: String,
    pub task_id: String,
    pub config_id: i64,
    pub passed: bool,
    pub progress: f64,
    pub turns: u32,
    pub duration_ms: u64,
    pub resource_units: u64,
    pub fail_reason: Option<String>,
    pub score: i64,
    pub created_at: String,
}

/// Per-scope pointer to the best-scoring configuration and run.
#[derive(Debug, Clone)]
pub struct BestConfigRecord {
    pub scope: String,
    pub config_id: i64,
    pub run_id: i64,
    pub score: i64,
    pub pass_count: i64,
    pub total_runs: i64,
    pub updated_at: String,
}

/// Input for one evolution audit entry.
#[derive(Debug, Clone)]
pub struct ChangeInput {
    pub scope: String,
    pub from_config_id: i64,
    pub to_config_id: Option<i64>,
    pub delta_json: String,
    pub reasoning: String,
    pub accepted: bool,
    pub reject_reason: Option<String>,
}

/// A persisted evolution audit entry. Append-only, never deleted.
#[derive(Debug, Clone)]
pub struct ChangeRecord {
    pub id: i64,
    pub scope: String,
    pub from_config_id: i64,
    pub to_config_id: Option<i64>,
    pub delta_json: String,
    pub reasoning: String,
    pub accepted: bool,
    pub reject_reason: Option<String>,
    pub observed_score_delta: Option<i64>,
    pub created_at: String,
}

/// Aggregate counters across the store.
#[derive(Debug, Clone)]
pub struct StoreStats {
    pub total_runs: u64,
    pub total_passes: u64,
    pub unique_tasks: u64,
    pub unique_configs: u64,
    pub by_scope: HashMap<String, BestConfigRecord>,
}

pub struct Store {
    conn: Connection,
}

impl Store {
    /// Open or create a store at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create {}", parent.display()))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("open store {}", path.display()))?;
        let store = Self { conn };
        store.init()?;
        Ok(store)
    }

    /// Open an in-memory store (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("open in-memory store")?;
        let store = Self { conn };
        store.init()?;
        Ok(store)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute("PRAGMA foreign_keys = ON", [])
            .context("enable foreign keys")?;
        self.conn
            .execute_batch(SCHEMA_SQL)
            .context("create schema")?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Config operations
    // ------------------------------------------------------------------

    /// Save a configuration, deduplicated by content hash: an identical
    /// parameter set returns the existing version instead of a new row.
    pub fn save_config(&mut self, scope: &str, params_in: &EngineParams) -> Result<ConfigRecord> {
        let hash = hash_params(params_in);
        let blob = serde_json::to_string(params_in).context("serialize params")?;

        let tx = self.conn.transaction().context("begin save_config")?;
        let existing = {
            let mut stmt = tx
                .prepare("SELECT * FROM configs WHERE scope = ?1 AND config_hash = ?2")
                .context("prepare dedup lookup")?;
            match stmt.query_row(params![scope, hash], row_to_config) {
                Ok(config) => Some(config),
                Err(rusqlite::Error::QueryReturnedNoRows) => None,
                Err(e) => return Err(e.into()),
            }
        };
        if let Some(existing) = existing {
            tx.commit().context("commit save_config")?;
            return Ok(existing);
        }

        tx.execute(
            r#"INSERT INTO configs (scope, version, params, config_hash, is_current)
               VALUES (?1, ?2, ?3, ?4, 0)"#,
            params![scope, params_in.version, blob, hash],
        )
        .context("insert config")?;
        let id = tx.last_insert_rowid();
        tx.commit().context("commit save_config")?;
        self.get_config(id)?
            .ok_or_else(|| anyhow!("config {id} missing after insert"))
    }

    /// Current configuration for a scope, creating and marking the default
    /// on first use.
    pub fn current_config(&mut self, scope: &str) -> Result<ConfigRecord> {
        if let Some(current) = self.find_current(scope)? {
            return Ok(current);
        }
        let saved = self.save_config(scope, &EngineParams::default())?;
        self.set_current(scope, saved.id)?;
        Ok(ConfigRecord {
            is_current: true,
            ..saved
        })
    }

    fn find_current(&self, scope: &str) -> Result<Option<ConfigRecord>> {
        let mut stmt = self
            .conn
            .prepare("SELECT * FROM configs WHERE scope = ?1 AND is_current = 1")
            .context("prepare current lookup")?;
        match stmt.query_row(params![scope], row_to_config) {
            Ok(config) => Ok(Some(config)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Atomically move the current pointer for a scope: exactly one config
    /// is current per scope after this returns.
    pub fn set_current(&mut self, scope: &str, config_id: i64) -> Result<()> {
        let tx = self.conn.transaction().context("begin set_current")?;
        tx.execute(
            "UPDATE configs SET is_current = 0 WHERE scope = ?1",
            params![scope],
        )
        .context("clear current flag")?;
        let updated = tx
            .execute(
                "UPDATE configs SET is_current = 1 WHERE id = ?1 AND scope = ?2",
                params![config_id, scope],
            )
            .context("set current flag")?;
        if updated != 1 {
            return Err(anyhow!("config {config_id} not found in scope {scope}"));
        }
        tx.commit().context("commit set_current")?;
        Ok(())
    }

    pub fn get_config(&self, id: i64) -> Result<Option<ConfigRecord>> {
        let mut stmt = self
            .conn
            .prepare("SELECT * FROM configs WHERE id = ?1")
            .context("prepare config lookup")?;
        match stmt.query_row(params![id], row_to_config) {
            Ok(config) => Ok(Some(config)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    // ------------------------------------------------------------------
    // Run operations
    // ------------------------------------------------------------------

    pub fn save_run(&mut self, input: &RunInput) -> Result<RunRecord> {
        self.conn
            .execute(
                r#"INSERT INTO runs
                   (run_id, scope, task_id, config_id, passed, progress, turns,
                    duration_ms, resource_units, fail_reason, score)
                   VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"#,
                params![
                    input.run_id,
                    input.scope,
                    input.task_id,
                    input.config_id,
                    input.passed as i32,
                    input.progress,
                    input.turns,
                    input.duration_ms as i64,
                    input.resource_units as i64,
                    input.fail_reason,
                    input.score,
                ],
            )
            .context("insert run")?;
        let id = self.conn.last_insert_rowid();
        self.get_run(id)?
            .ok_or_else(|| anyhow!("run {id} missing after insert"))
    }

    pub fn get_run(&self, id: i64) -> Result<Option<RunRecord>> {
        let mut stmt = self
            .conn
            .prepare("SELECT * FROM runs WHERE id = ?1")
            .context("prepare run lookup")?;
        match stmt.query_row(params![id], row_to_run) {
            Ok(run) => Ok(Some(run)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn recent_runs(&self, limit: u32) -> Result<Vec<RunRecord>> {
        let mut stmt = self
            .conn
            .prepare("SELECT * FROM runs ORDER BY id DESC LIMIT ?1")
            .context("prepare recent runs")?;
        let rows = stmt.query_map(params![limit], row_to_run)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    pub fn recent_runs_for_scope(&self, scope: &str, limit: u32) -> Result<Vec<RunRecord>> {
        let mut stmt = self
            .conn
            .prepare("SELECT * FROM runs WHERE scope = ?1 ORDER BY id DESC LIMIT ?2")
            .context("prepare scope runs")?;
        let rows = stmt.query_map(params![scope, limit], row_to_run)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    // ------------------------------------------------------------------
    // Best-config operations
    // ------------------------------------------------------------------

    pub fn best_for(&self, scope: &str) -> Result<Option<BestConfigRecord>> {
        let mut stmt = self
            .conn
            .prepare("SELECT * FROM best_configs WHERE scope = ?1")
            .context("prepare best lookup")?;
        match stmt.query_row(params![scope], row_to_best) {
            Ok(best) => Ok(Some(best)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Fold one run into the per-scope best record: counters always
    /// advance; the pointer moves only on a strictly better score. Runs
    /// inside one transaction so concurrent writers cannot lose updates.
    pub fn update_best_if_better(
        &mut self,
        scope: &str,
        config_id: i64,
        run_row_id: i64,
        score: i64,
        passed: bool,
    ) -> Result<()> {
        let tx = self.conn.transaction().context("begin best update")?;
        let existing = {
            let mut stmt = tx
                .prepare("SELECT * FROM best_configs WHERE scope = ?1")
                .context("prepare best lookup")?;
            match stmt.query_row(params![scope], row_to_best) {
                Ok(best) => Some(best),
                Err(rusqlite::Error::QueryReturnedNoRows) => None,
                Err(e) => return Err(e.into()),
            }
        };
        match existing {
            None => {
                tx.execute(
                    r#"INSERT INTO best_configs
                       (scope, config_id, run_id, score, pass_count, total_runs)
                       VALUES (?1, ?2, ?3, ?4, ?5, 1)"#,
                    params![scope, config_id, run_row_id, score, passed as i32],
                )
                .context("insert best")?;
            }
            Some(existing) if score > existing.score => {
                tx.execute(
                    r#"UPDATE best_configs
                       SET config_id = ?1, run_id = ?2, score = ?3,
                           pass_count = pass_count + ?4, total_runs = total_runs + 1,
                           updated_at = datetime('now')
                       WHERE scope = ?5"#,
                    params![config_id, run_row_id, score, passed as i32, scope],
                )
                .context("update best pointer")?;
            }
            Some(_) => {
                tx.execute(
                    r#"UPDATE best_configs
                       SET pass_count = pass_count + ?1, total_runs = total_runs + 1,
                           updated_at = datetime('now')
                       WHERE scope = ?2"#,
                    params![passed as i32, scope],
                )
                .context("update best counters")?;
            }
        }
        tx.commit().context("commit best update")?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Evolution audit trail
    // ------------------------------------------------------------------

    /// Append an evolution change entry; rejected proposals are recorded
    /// with their reason, never discarded.
    pub fn record_change(&mut self, input: &ChangeInput) -> Result<i64> {
        self.conn
            .execute(
                r#"INSERT INTO evolution_changes
                   (scope, from_config_id, to_config_id, delta, reasoning,
                    accepted, reject_reason)
                   VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"#,
                params![
                    input.scope,
                    input.from_config_id,
                    input.to_config_id,
                    input.delta_json,
                    input.reasoning,
                    input.accepted as i32,
                    input.reject_reason,
                ],
            )
            .context("insert evolution change")?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Fill in the observed score delta once the next run under the
    /// accepted configuration has completed.
    pub fn set_observed_delta(&mut self, change_id: i64, delta: i64) -> Result<()> {
        let updated = self
            .conn
            .execute(
                "UPDATE evolution_changes SET observed_score_delta = ?1 WHERE id = ?2",
                params![delta, change_id],
            )
            .context("update observed delta")?;
        if updated != 1 {
            return Err(anyhow!("evolution change {change_id} not found"));
        }
        Ok(())
    }

    pub fn recent_changes(&self, limit: u32) -> Result<Vec<ChangeRecord>> {
        let mut stmt = self
            .conn
            .prepare("SELECT * FROM evolution_changes ORDER BY id DESC LIMIT ?1")
            .context("prepare recent changes")?;
        let rows = stmt.query_map(params![limit], row_to_change)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    // ------------------------------------------------------------------
    // Stats
    // ------------------------------------------------------------------

    pub fn stats(&self) -> Result<StoreStats> {
        let (total_runs, total_passes, unique_tasks): (i64, i64, i64) = self
            .conn
            .query_row(
                r#"SELECT COUNT(*), COALESCE(SUM(passed), 0), COUNT(DISTINCT task_id)
                   FROM runs"#,
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .context("query run stats")?;
        let unique_configs: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM configs", [], |row| row.get(0))
            .context("query config count")?;

        let mut by_scope = HashMap::new();
        let mut stmt = self
            .conn
            .prepare("SELECT * FROM best_configs ORDER BY scope")
            .context("prepare best scan")?;
        let rows = stmt.query_map([], row_to_best)?;
        for best in rows {
            let best = best?;
            by_scope.insert(best.scope.clone(), best);
        }

        Ok(StoreStats {
            total_runs: total_runs as u64,
            total_passes: total_passes as u64,
            unique_tasks: unique_tasks as u64,
            unique_configs: unique_configs as u64,
            by_scope,
        })
    }
}

/// Content hash for dedup: sha256 over the canonical parameter JSON,
/// truncated to 16 hex chars.
pub fn hash_params(params_in: &EngineParams) -> String {
    let mut hasher = Sha256::new();
    hasher.update(params_in.canonical_json().as_bytes());
    let digest = hasher.finalize();
    hex::encode(&digest[..8])
}

fn row_to_config(row: &Row) -> rusqlite::Result<ConfigRecord> {
    let blob: String = row.get(3)?;
    let params_out: EngineParams = serde_json::from_str(&blob).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, Box::new(e))
    })?;
    Ok(ConfigRecord {
        id: row.get(0)?,
        scope: row.get(1)?,
        params: params_out,
        config_hash: row.get(4)?,
        is_current: row.get::<_, i32>(5)? != 0,
        created_at: row.get(6)?,
    })
}

fn row_to_run(row: &Row) -> rusqlite::Result<RunRecord> {
    Ok(RunRecord {
        id: row.get(0)?,
        run_id: row.get(1)?,
        scope: row.get(2)?,
        task_id: row.get(3)?,
        config_id: row.get(4)?,
        passed: row.get::<_, i32>(5)? != 0,
        progress: row.get(6)?,
        turns: row.get(7)?,
        duration_ms: row.get::<_, i64>(8)? as u64,
        resource_units: row.get::<_, i64>(9)? as u64,
        fail_reason: row.get(10)?,
        score: row.get(11)?,
        created_at: row.get(12)?,
    })
}

fn row_to_best(row: &Row) -> rusqlite::Result<BestConfigRecord> {
    Ok(BestConfigRecord {
        scope: row.get(0)?,
        config_id: row.get(1)?,
        run_id: row.get(2)?,
        score: row.get(3)?,
        pass_count: row.get(4)?,
        total_runs: row.get(5)?,
        updated_at: row.get(6)?,
    })
}

fn row_to_change(row: &Row) -> rusqlite::Result<ChangeRecord> {
    Ok(ChangeRecord {
        id: row.get(0)?,
        scope: row.get(1)?,
        from_config_id: row.get(2)?,
        to_config_id: row.get(3)?,
        delta_json: row.get(4)?,
        reasoning: row.get(5)?,
        accepted: row.get::<_, i32>(6)? != 0,
        reject_reason: row.get(7)?,
        observed_score_delta: row.get(8)?,
        created_at: row.get(9)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use engine::core::params::{ParamDelta, apply_delta};

    fn run_input(run_id: &str, scope: &str, config_id: i64, score: i64, passed: bool) -> RunInput {
        RunInput {
            run_id: run_id.to_string(),
            scope: scope.to_string(),
            task_id: "date-matcher".to_string(),
            config_id,
            passed,
            progress: if passed { 1.0 } else { 0.4 },
            turns: 10,
            duration_ms: 5_000,
            resource_units: 2_000,
            fail_reason: if passed {
                None
            } else {
                Some("verify-exhausted".to_string())
            },
            score,
        }
    }

    #[test]
    fn save_config_dedups_by_content_hash() {
        let mut store = Store::open_in_memory().expect("store");
        let params_in = EngineParams::default();

        let first = store.save_config("global", &params_in).expect("save");
        let second = store.save_config("global", &params_in).expect("save again");
        assert_eq!(first.id, second.id);

        // Identical parameters under a different version still dedup.
        let mut reversioned = params_in.clone();
        reversioned.version = "3.0.0".to_string();
        let third = store.save_config("global", &reversioned).expect("save");
        assert_eq!(first.id, third.id);

        let stats = store.stats().expect("stats");
        assert_eq!(stats.unique_configs, 1);
    }

    #[test]
    fn distinct_parameters_create_new_versions() {
        let mut store = Store::open_in_memory().expect("store");
        let base = EngineParams::default();
        let first = store.save_config("global", &base).expect("save");

        let delta = ParamDelta {
            sample_width: Some(3),
            reasoning: "wider".to_string(),
            ..ParamDelta::default()
        };
        let next = apply_delta(&base, &delta);
        let second = store.save_config("global", &next).expect("save");
        assert_ne!(first.id, second.id);
    }

    #[test]
    fn exactly_one_current_config_per_scope() {
        let mut store = Store::open_in_memory().expect("store");
        let first = store.current_config("global").expect("default");
        assert!(first.is_current);

        let delta = ParamDelta {
            max_turns: Some(30),
            reasoning: "more turns".to_string(),
            ..ParamDelta::default()
        };
        let next = apply_delta(&first.params, &delta);
        let second = store.save_config("global", &next).expect("save");
        store.set_current("global", second.id).expect("set current");

        let current = store.current_config("global").expect("current");
        assert_eq!(current.id, second.id);

        let count: i64 = store
            .conn
            .query_row(
                "SELECT COUNT(*) FROM configs WHERE scope = 'global' AND is_current = 1",
                [],
                |row| row.get(0),
            )
            .expect("count");
        assert_eq!(count, 1);

        // Scopes are independent.
        let other = store.current_config("refine").expect("other scope");
        assert_ne!(other.id, current.id);
    }

    #[test]
    fn set_current_rejects_cross_scope_ids() {
        let mut store = Store::open_in_memory().expect("store");
        let global = store.current_config("global").expect("default");
        assert!(store.set_current("refine", global.id).is_err());
    }

    #[test]
    fn save_run_round_trips() {
        let mut store = Store::open_in_memory().expect("store");
        let config = store.current_config("global").expect("config");
        let run = store
            .save_run(&run_input("run-1", "global", config.id, 1090, true))
            .expect("save run");
        assert!(run.passed);
        assert_eq!(run.score, 1090);
        assert_eq!(run.task_id, "date-matcher");

        let recent = store.recent_runs(10).expect("recent");
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].run_id, "run-1");
    }

    #[test]
    fn best_pointer_moves_only_on_strictly_better_scores() {
        let mut store = Store::open_in_memory().expect("store");
        let config = store.current_config("global").expect("config");

        let run1 = store
            .save_run(&run_input("run-1", "global", config.id, 80, false))
            .expect("run1");
        store
            .update_best_if_better("global", config.id, run1.id, 80, false)
            .expect("best1");

        let run2 = store
            .save_run(&run_input("run-2", "global", config.id, 1090, true))
            .expect("run2");
        store
            .update_best_if_better("global", config.id, run2.id, 1090, true)
            .expect("best2");

        let run3 = store
            .save_run(&run_input("run-3", "global", config.id, 900, true))
            .expect("run3");
        store
            .update_best_if_better("global", config.id, run3.id, 900, true)
            .expect("best3");

        let best = store.best_for("global").expect("best").expect("present");
        assert_eq!(best.run_id, run2.id);
        assert_eq!(best.score, 1090);
        assert_eq!(best.total_runs, 3);
        assert_eq!(best.pass_count, 2);
    }

    #[test]
    fn change_log_is_append_only_with_observed_delta() {
        let mut store = Store::open_in_memory().expect("store");
        let config = store.current_config("global").expect("config");

        let rejected = store
            .record_change(&ChangeInput {
                scope: "global".to_string(),
                from_config_id: config.id,
                to_config_id: None,
                delta_json: r#"{"max_turns": 200}"#.to_string(),
                reasoning: "huge jump".to_string(),
                accepted: false,
                reject_reason: Some("max_turns change too large".to_string()),
            })
            .expect("record rejected");

        let next = apply_delta(
            &config.params,
            &ParamDelta {
                sample_width: Some(2),
                reasoning: "sample more".to_string(),
                ..ParamDelta::default()
            },
        );
        let accepted_config = store.save_config("global", &next).expect("save");
        let accepted = store
            .record_change(&ChangeInput {
                scope: "global".to_string(),
                from_config_id: config.id,
                to_config_id: Some(accepted_config.id),
                delta_json: r#"{"sample_width": 2}"#.to_string(),
                reasoning: "sample more".to_string(),
                accepted: true,
                reject_reason: None,
            })
            .expect("record accepted");

        store.set_observed_delta(accepted, 120).expect("observed");

        let changes = store.recent_changes(10).expect("changes");
        assert_eq!(changes.len(), 2);
        let accepted_row = changes.iter().find(|c| c.id == accepted).expect("accepted");
        assert_eq!(accepted_row.observed_score_delta, Some(120));
        let rejected_row = changes.iter().find(|c| c.id == rejected).expect("rejected");
        assert!(!rejected_row.accepted);
        assert!(rejected_row.reject_reason.as_deref().unwrap().contains("too large"));
    }
}
