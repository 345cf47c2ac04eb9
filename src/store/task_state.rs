// =============================================================================
// Task State persistence — one durable row per scheduled task
// =============================================================================
//
// The scheduler writes a row after every state transition and loads all rows
// once at startup, so a restart resumes exactly where the previous process
// stopped. Earlier deployments kept per-task JSON files next to the database;
// `fold_in_legacy_file` imports such a file once and renames it out of the
// way.
// =============================================================================

use std::path::Path;

use rusqlite::params;
use tracing::{info, warn};

use super::Store;
use crate::errors::StoreError;
use crate::scheduler::task::TaskState;

impl Store {
    /// Load every persisted task state, keyed by task id in the returned vec.
    pub fn load_task_states(&self) -> Result<Vec<TaskState>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT task_id, tier, interval_ms, last_run_ms, last_success_ms,
                        consecutive_failures, disabled_until_ms
                 FROM task_state ORDER BY task_id",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok(TaskState {
                    task_id: row.get(0)?,
                    tier: row.get(1)?,
                    interval_ms: row.get(2)?,
                    last_run_ms: row.get(3)?,
                    last_success_ms: row.get(4)?,
                    consecutive_failures: row.get::<_, i64>(5)? as u32,
                    disabled_until_ms: row.get(6)?,
                })
            })?;
            rows.collect::<Result<Vec<_>, _>>().map_err(StoreError::from)
        })
    }

    /// Upsert one task state row.
    pub fn save_task_state(&self, state: &TaskState) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO task_state
                 (task_id, tier, interval_ms, last_run_ms, last_success_ms,
                  consecutive_failures, disabled_until_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(task_id) DO UPDATE SET
                     tier = excluded.tier,
                     interval_ms = excluded.interval_ms,
                     last_run_ms = excluded.last_run_ms,
                     last_success_ms = excluded.last_success_ms,
                     consecutive_failures = excluded.consecutive_failures,
                     disabled_until_ms = excluded.disabled_until_ms",
                params![
                    state.task_id,
                    state.tier,
                    state.interval_ms,
                    state.last_run_ms,
                    state.last_success_ms,
                    state.consecutive_failures as i64,
                    state.disabled_until_ms
                ],
            )?;
            Ok(())
        })
    }

    /// Import a legacy `task_state.json` file (a map of task id to state)
    /// into the table, then rename it to `.imported` so it is read only once.
    ///
    /// Existing table rows win over legacy entries. A malformed file is
    /// logged and left alone; it never blocks startup.
    pub fn fold_in_legacy_file(&self, path: impl AsRef<Path>) -> Result<usize, StoreError> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(0);
        }

        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "cannot read legacy task state file");
                return Ok(0);
            }
        };

        let legacy: std::collections::HashMap<String, TaskState> =
            match serde_json::from_str(&content) {
                Ok(m) => m,
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "legacy task state file is malformed — ignoring"
                    );
                    return Ok(0);
                }
            };

        let existing: std::collections::HashSet<String> = self
            .load_task_states()?
            .into_iter()
            .map(|t| t.task_id)
            .collect();

        let mut imported = 0usize;
        for (task_id, mut state) in legacy {
            if existing.contains(&task_id) {
                continue;
            }
            state.task_id = task_id;
            self.save_task_state(&state)?;
            imported += 1;
        }

        let imported_path = path.with_extension("json.imported");
        if let Err(e) = std::fs::rename(path, &imported_path) {
            warn!(path = %path.display(), error = %e, "failed to rename legacy task state file");
        } else {
            info!(
                imported,
                from = %path.display(),
                "legacy task state folded into the store"
            );
        }

        Ok(imported)
    }
}
