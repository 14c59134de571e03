//! Query mode: one read-only statement against a SQLite snapshot.
//!
//! Runaway queries are bounded by a progress hook that SQLite invokes every
//! few VM steps. The hook is a trait object so callers can plug in any
//! cancellation policy; `StepBudget` is the one the driver installs.

use std::os::raw::c_int;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use base64::Engine as _;
use rusqlite::types::ValueRef;
use rusqlite::{Connection, ErrorCode, OpenFlags};
use serde_json::{Map, Value};

use crate::protocol::ResultProtocol;

const DEFAULT_INTERVAL: u64 = 1000;

/// Invoked periodically while a query runs.
pub trait ProgressHook: Send {
    /// `steps` is the running total of VM steps. Return `true` to abort.
    fn on_progress(&mut self, steps: u64) -> bool;

    /// Why the hook aborted, for the error report.
    fn reason(&self) -> String {
        "query cancelled by progress hook".to_string()
    }
}

/// Aborts once more than `budget` steps have run.
#[derive(Debug, Clone, Copy)]
pub struct StepBudget {
    budget: u64,
}

impl StepBudget {
    pub fn new(budget: u64) -> Self {
        Self { budget }
    }
}

impl ProgressHook for StepBudget {
    fn on_progress(&mut self, steps: u64) -> bool {
        steps > self.budget
    }

    fn reason(&self) -> String {
        format!(
            "query cancelled: exceeded step budget of {} operations",
            self.budget
        )
    }
}

pub struct QueryExecutor {
    hook: Box<dyn ProgressHook>,
    interval: u64,
}

impl QueryExecutor {
    pub fn new(hook: Box<dyn ProgressHook>) -> Self {
        Self {
            hook,
            interval: DEFAULT_INTERVAL,
        }
    }

    pub fn with_budget(budget: u64) -> Self {
        Self::new(Box::new(StepBudget::new(budget))).with_interval(budget.min(DEFAULT_INTERVAL))
    }

    /// Steps between two hook invocations.
    pub fn with_interval(mut self, interval: u64) -> Self {
        self.interval = interval.clamp(1, c_int::MAX as u64);
        self
    }

    pub fn run(self, db_path: &Path, sql: &str) -> ResultProtocol {
        match self.execute(db_path, sql) {
            Ok(rows) => ResultProtocol {
                stdout: String::new(),
                error: String::new(),
                return_obj: Some(Value::Array(rows)),
                plots: Vec::new(),
            },
            Err(message) => ResultProtocol {
                stdout: String::new(),
                error: message,
                return_obj: None,
                plots: Vec::new(),
            },
        }
    }

    fn execute(self, db_path: &Path, sql: &str) -> Result<Vec<Value>, String> {
        let conn = Connection::open_with_flags(
            db_path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|e| format!("QueryError: cannot open snapshot: {}", e))?;

        let reason = self.hook.reason();
        let cancelled = Arc::new(AtomicBool::new(false));
        let steps = Arc::new(AtomicU64::new(0));
        let interval = self.interval;
        let hook = Mutex::new(self.hook);
        {
            let cancelled = Arc::clone(&cancelled);
            let steps = Arc::clone(&steps);
            conn.progress_handler(
                interval as c_int,
                Some(move || {
                    let total = steps.fetch_add(interval, Ordering::Relaxed) + interval;
                    let mut hook = hook.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                    let abort = hook.on_progress(total);
                    if abort {
                        cancelled.store(true, Ordering::Relaxed);
                    }
                    abort
                }),
            );
        }

        let result = collect_rows(&conn, sql);
        conn.progress_handler(0, None::<fn() -> bool>);

        result.map_err(|e| {
            if cancelled.load(Ordering::Relaxed) || is_interrupt(&e) {
                format!(
                    "QueryCancelled: {} (after {} steps)",
                    reason,
                    steps.load(Ordering::Relaxed)
                )
            } else {
                format!("QueryError: {}", e)
            }
        })
    }
}

fn is_interrupt(err: &QueryFailure) -> bool {
    matches!(err, QueryFailure::Sqlite(rusqlite::Error::SqliteFailure(e, _)) if e.code == ErrorCode::OperationInterrupted)
}

enum QueryFailure {
    Sqlite(rusqlite::Error),
    NotReadOnly,
}

impl std::fmt::Display for QueryFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueryFailure::Sqlite(e) => write!(f, "{}", e),
            QueryFailure::NotReadOnly => f.write_str("statement is not read-only"),
        }
    }
}

impl From<rusqlite::Error> for QueryFailure {
    fn from(err: rusqlite::Error) -> Self {
        QueryFailure::Sqlite(err)
    }
}

fn collect_rows(conn: &Connection, sql: &str) -> Result<Vec<Value>, QueryFailure> {
    let mut stmt = conn.prepare(sql)?;
    if !stmt.readonly() {
        return Err(QueryFailure::NotReadOnly);
    }
    let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();

    let mut rows = stmt.query([])?;
    let mut records = Vec::new();
    while let Some(row) = rows.next()? {
        let mut record = Map::with_capacity(columns.len());
        for (index, name) in columns.iter().enumerate() {
            record.insert(name.clone(), value_to_json(row.get_ref(index)?));
        }
        records.push(Value::Object(record));
    }
    Ok(records)
}

fn value_to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        ValueRef::Text(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => {
            Value::String(base64::engine::general_purpose::STANDARD.encode(bytes))
        }
    }
}

pub fn run_query(db_path: &Path, sql: &str, step_budget: u64) -> ResultProtocol {
    QueryExecutor::with_budget(step_budget).run(db_path, sql)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::{tempdir, TempDir};

    fn snapshot() -> (TempDir, std::path::PathBuf) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.db");
        let conn = Connection::open(&path).unwrap();
        conn.execute_batch(
            "CREATE TABLE data (region TEXT, units INTEGER, price REAL, raw BLOB);
             INSERT INTO data VALUES ('north', 10, 2.5, x'0102'), ('south', 4, NULL, NULL);",
        )
        .unwrap();
        (dir, path)
    }

    #[test]
    fn test_rows_map_to_records() {
        let (_dir, db) = snapshot();
        let result = run_query(&db, "SELECT region, units, price, raw FROM data ORDER BY units", 100_000);
        assert_eq!(result.error, "");
        assert_eq!(
            result.return_obj,
            Some(json!([
                {"region": "south", "units": 4, "price": null, "raw": null},
                {"region": "north", "units": 10, "price": 2.5, "raw": "AQI="}
            ]))
        );
        assert!(result.plots.is_empty());
    }

    #[test]
    fn test_runaway_query_is_cancelled() {
        let (_dir, db) = snapshot();
        let sql = "WITH RECURSIVE c(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM c) SELECT count(*) FROM c";
        let result = run_query(&db, sql, 100_000);
        assert!(result.error.starts_with("QueryCancelled"), "{}", result.error);
        assert!(result.error.contains("100000"));
        assert!(result.return_obj.is_none());
    }

    #[test]
    fn test_writes_are_refused() {
        let (_dir, db) = snapshot();
        let result = run_query(&db, "DELETE FROM data", 100_000);
        assert!(!result.error.is_empty());

        let conn = Connection::open(&db).unwrap();
        let count: i64 = conn.query_row("SELECT count(*) FROM data", [], |r| r.get(0)).unwrap();
        assert_eq!(count, 2);
    }

    #[test]
    fn test_syntax_error_is_reported() {
        let (_dir, db) = snapshot();
        let result = run_query(&db, "SELEC nonsense", 100_000);
        assert!(result.error.starts_with("QueryError"));
    }

    struct CountingHook {
        calls: Arc<AtomicU64>,
    }

    impl ProgressHook for CountingHook {
        fn on_progress(&mut self, _steps: u64) -> bool {
            self.calls.fetch_add(1, Ordering::Relaxed);
            false
        }
    }

    #[test]
    fn test_custom_hook_is_invoked() {
        let (_dir, db) = snapshot();
        let calls = Arc::new(AtomicU64::new(0));
        let executor = QueryExecutor::new(Box::new(CountingHook {
            calls: Arc::clone(&calls),
        }))
        .with_interval(10);
        let sql = "WITH RECURSIVE c(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM c WHERE x < 1000) SELECT sum(x) AS total FROM c";
        let result = executor.run(&db, sql);
        assert_eq!(result.error, "");
        assert_eq!(result.return_obj, Some(json!([{"total": 500500}])));
        assert!(calls.load(Ordering::Relaxed) > 0);
    }

    #[test]
    fn test_missing_snapshot() {
        let dir = tempdir().unwrap();
        let result = run_query(&dir.path().join("absent.db"), "SELECT 1", 10);
        assert!(result.error.contains("cannot open snapshot"));
    }
}
