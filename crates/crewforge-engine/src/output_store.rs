use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};

use crewforge_core::error::{CrewError, Result};
use crewforge_core::types::{Inputs, TaskId, TaskOutput};

/// One persisted task execution.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredOutputRecord {
    pub task_id: TaskId,
    /// Position of the task in the crew's list.
    pub task_index: usize,
    pub expected_output: String,
    pub output: TaskOutput,
    /// Interpolation inputs active when the output was produced.
    pub inputs: Inputs,
    pub was_replayed: bool,
    pub timestamp: DateTime<Utc>,
}

impl StoredOutputRecord {
    pub fn new(
        task_id: TaskId,
        task_index: usize,
        expected_output: impl Into<String>,
        output: TaskOutput,
        inputs: Inputs,
    ) -> Self {
        Self {
            task_id,
            task_index,
            expected_output: expected_output.into(),
            output,
            inputs,
            was_replayed: false,
            timestamp: Utc::now(),
        }
    }

    pub fn replayed(mut self, was_replayed: bool) -> Self {
        self.was_replayed = was_replayed;
        self
    }
}

/// Task output store backed by SQLite.
///
/// Append-only during a run; `reset` empties it before a fresh kickoff.
pub struct OutputStore {
    conn: Mutex<Connection>,
}

fn storage_err(context: &str) -> impl Fn(rusqlite::Error) -> CrewError + '_ {
    move |e| CrewError::Storage(format!("{}: {}", context, e))
}

impl OutputStore {
    /// Open or create the store database.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                CrewError::Storage(format!("Failed to create store directory: {}", e))
            })?;
        }
        let conn = Connection::open(path).map_err(storage_err("Failed to open output store"))?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().map_err(storage_err("Failed to open output store"))?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;

             CREATE TABLE IF NOT EXISTS task_outputs (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 task_id TEXT NOT NULL,
                 task_index INTEGER NOT NULL,
                 expected_output TEXT NOT NULL,
                 output_json TEXT NOT NULL,
                 inputs_json TEXT NOT NULL,
                 was_replayed INTEGER NOT NULL DEFAULT 0,
                 timestamp TEXT NOT NULL
             );

             CREATE INDEX IF NOT EXISTS idx_task_outputs_task
                 ON task_outputs(task_id, id DESC);",
        )
        .map_err(storage_err("Failed to initialize output store schema"))?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn append(&self, record: &StoredOutputRecord) -> Result<()> {
        let output_json = serde_json::to_string(&record.output)?;
        let inputs_json = serde_json::to_string(&record.inputs)?;
        self.conn()
            .execute(
                "INSERT INTO task_outputs (task_id, task_index, expected_output, output_json, inputs_json, was_replayed, timestamp)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    record.task_id.to_string(),
                    record.task_index as i64,
                    record.expected_output,
                    output_json,
                    inputs_json,
                    record.was_replayed,
                    record.timestamp.to_rfc3339(),
                ],
            )
            .map_err(storage_err("Failed to append task output"))?;
        Ok(())
    }

    /// Every record in insertion order.
    pub fn load(&self) -> Result<Vec<StoredOutputRecord>> {
        self.query("ORDER BY id ASC", params![])
    }

    /// Most recent record for a task.
    pub fn latest_for(&self, task_id: TaskId) -> Result<Option<StoredOutputRecord>> {
        let mut records = self.query(
            "WHERE task_id = ?1 ORDER BY id DESC LIMIT 1",
            params![task_id.to_string()],
        )?;
        Ok(records.pop())
    }

    /// Drop records at or after `task_index`, ahead of a replay that rewrites them.
    pub fn truncate_from(&self, task_index: usize) -> Result<usize> {
        self.conn()
            .execute(
                "DELETE FROM task_outputs WHERE task_index >= ?1",
                params![task_index as i64],
            )
            .map_err(storage_err("Failed to truncate task outputs"))
    }

    pub fn reset(&self) -> Result<()> {
        self.conn()
            .execute("DELETE FROM task_outputs", [])
            .map_err(storage_err("Failed to reset output store"))?;
        Ok(())
    }

    fn query(&self, clause: &str, args: &[&dyn rusqlite::ToSql]) -> Result<Vec<StoredOutputRecord>> {
        let conn = self.conn();
        let sql = format!(
            "SELECT task_id, task_index, expected_output, output_json, inputs_json, was_replayed, timestamp
             FROM task_outputs {}",
            clause
        );
        let mut stmt = conn
            .prepare(&sql)
            .map_err(storage_err("Failed to prepare query"))?;

        type Row = (String, i64, String, String, String, bool, String);
        let rows = stmt
            .query_map(args, |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                    row.get(6)?,
                ))
            })
            .map_err(storage_err("Failed to query task outputs"))?
            .collect::<std::result::Result<Vec<Row>, _>>()
            .map_err(storage_err("Failed to read task output row"))?;

        rows.into_iter()
            .map(
                |(task_id, task_index, expected_output, output_json, inputs_json, was_replayed, ts)|
                 -> Result<StoredOutputRecord> {
                let task_id = TaskId::parse(&task_id).ok_or_else(|| {
                    CrewError::Storage(format!("Invalid task id in store: {}", task_id))
                })?;
                Ok(StoredOutputRecord {
                    task_id,
                    task_index: task_index as usize,
                    expected_output,
                    output: serde_json::from_str(&output_json)?,
                    inputs: serde_json::from_str(&inputs_json)?,
                    was_replayed,
                    timestamp: DateTime::parse_from_rfc3339(&ts)
                        .map(|dt| dt.with_timezone(&Utc))
                        .unwrap_or_else(|_| Utc::now()),
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(task_id: TaskId, index: usize, raw: &str) -> StoredOutputRecord {
        let mut inputs = Inputs::new();
        inputs.insert("topic".into(), serde_json::json!("AI"));
        StoredOutputRecord::new(
            task_id,
            index,
            "A report",
            TaskOutput::new("Research AI", raw, "Researcher"),
            inputs,
        )
    }

    #[test]
    fn test_append_and_load_in_order() {
        let store = OutputStore::open_in_memory().unwrap();
        let a = TaskId::new();
        let b = TaskId::new();
        store.append(&record(a, 0, "first")).unwrap();
        store.append(&record(b, 1, "second")).unwrap();

        let records = store.load().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].task_id, a);
        assert_eq!(records[0].output.raw, "first");
        assert_eq!(records[1].task_index, 1);
        assert_eq!(records[1].inputs["topic"], "AI");
        assert!(!records[1].was_replayed);
    }

    #[test]
    fn test_latest_for_picks_most_recent() {
        let store = OutputStore::open_in_memory().unwrap();
        let a = TaskId::new();
        store.append(&record(a, 0, "old")).unwrap();
        store.append(&record(a, 0, "new").replayed(true)).unwrap();

        let latest = store.latest_for(a).unwrap().unwrap();
        assert_eq!(latest.output.raw, "new");
        assert!(latest.was_replayed);
        assert!(store.latest_for(TaskId::new()).unwrap().is_none());
    }

    #[test]
    fn test_truncate_and_reset() {
        let store = OutputStore::open_in_memory().unwrap();
        for i in 0..3 {
            store.append(&record(TaskId::new(), i, "x")).unwrap();
        }
        assert_eq!(store.truncate_from(1).unwrap(), 2);
        assert_eq!(store.load().unwrap().len(), 1);

        store.reset().unwrap();
        assert!(store.load().unwrap().is_empty());
    }

    #[test]
    fn test_file_backed_store_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("outputs.db");
        let id = TaskId::new();
        {
            let store = OutputStore::open(&path).unwrap();
            store.append(&record(id, 0, "kept")).unwrap();
        }
        let reopened = OutputStore::open(&path).unwrap();
        assert_eq!(reopened.latest_for(id).unwrap().unwrap().output.raw, "kept");
    }
}
