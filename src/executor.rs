//! Statement execution against whichever tier currently backs a database,
//! plus the access bookkeeping that drives promotion and write-through.

use std::sync::Arc;

use rusqlite::types::ValueRef;
use rusqlite::{Connection, OpenFlags};
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::error::{Error, Result};
use crate::registry::{DatabaseRecord, Registry};
use crate::stage::{is_write_statement, StageManager};

/// Statement arity accepted per request.
pub const MAX_STATEMENTS: usize = 16;

/// Concurrent connections a multi-statement query fans out over.
const QUERY_POOL_SIZE: usize = 10;

pub type Row = serde_json::Map<String, Value>;

/// Outcome of one write statement.
#[derive(Debug, Clone, Copy)]
pub struct Change {
    pub rows_affected: u64,
    pub last_insert_id: i64,
}

pub struct Executor {
    registry: Arc<Registry>,
    manager: Arc<StageManager>,
}

impl Executor {
    pub fn new(registry: Arc<Registry>, manager: Arc<StageManager>) -> Self {
        Self { registry, manager }
    }

    /// Read path: each statement runs on its own connection through a small
    /// worker pool. Slot order equals input order.
    pub async fn query(
        &self,
        name: &str,
        statements: Vec<String>,
    ) -> Result<Vec<std::result::Result<Vec<Row>, String>>> {
        check_arity(statements.len())?;
        let record = self.resolve(name).await?;
        let uri = self.connection_uri(&record).await?;

        let pool = QUERY_POOL_SIZE.min(statements.len());
        let semaphore = Arc::new(Semaphore::new(pool));
        let mut tasks: JoinSet<(usize, std::result::Result<Vec<Row>, String>)> = JoinSet::new();
        let total = statements.len();

        for (index, sql) in statements.into_iter().enumerate() {
            let uri = uri.clone();
            let semaphore = Arc::clone(&semaphore);
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await.expect("semaphore closed");
                let outcome = match tokio::task::spawn_blocking(move || run_query(&uri, &sql)).await
                {
                    Ok(Ok(rows)) => Ok(rows),
                    Ok(Err(err)) => Err(err.to_string()),
                    Err(join) => Err(join.to_string()),
                };
                (index, outcome)
            });
        }

        let mut slots: Vec<Option<std::result::Result<Vec<Row>, String>>> =
            (0..total).map(|_| None).collect();
        while let Some(joined) = tasks.join_next().await {
            let (index, outcome) = joined.map_err(|source| Error::TaskJoin { source })?;
            slots[index] = Some(outcome);
        }

        self.after_request(&record, false).await;

        Ok(slots
            .into_iter()
            .map(|slot| slot.unwrap_or_else(|| Err("statement did not run".to_string())))
            .collect())
    }

    /// Write path: statements run sequentially on one connection. A failing
    /// slot is reported in place and execution continues.
    pub async fn execute(
        &self,
        name: &str,
        statements: Vec<String>,
    ) -> Result<Vec<std::result::Result<Change, String>>> {
        check_arity(statements.len())?;
        let record = self.resolve(name).await?;
        let uri = self.connection_uri(&record).await?;

        let wrote = statements.iter().any(|sql| is_write_statement(sql));
        let results = tokio::task::spawn_blocking(move || run_execute(&uri, &statements))
            .await
            .map_err(|source| Error::TaskJoin { source })??;

        self.after_request(&record, wrote).await;
        Ok(results)
    }

    async fn resolve(&self, name: &str) -> Result<Arc<DatabaseRecord>> {
        self.registry
            .find_by_name(name)
            .await
            .ok_or_else(|| Error::DatabaseNotFound {
                name: name.to_string(),
            })
    }

    async fn connection_uri(&self, record: &Arc<DatabaseRecord>) -> Result<String> {
        let state = record.read().await;
        self.registry.stages().uri_for(&state.path, state.stage)
    }

    /// Access bookkeeping plus the write-through and promotion triggers.
    /// Background work is best-effort; failures are logged, not surfaced.
    async fn after_request(&self, record: &Arc<DatabaseRecord>, wrote: bool) {
        let count = record.touch().await;
        let settings = self.manager.settings();

        if wrote && settings.auto_sync_enabled {
            let manager = Arc::clone(&self.manager);
            let record = Arc::clone(record);
            tokio::spawn(async move {
                if let Err(err) = manager.sync_to_upper_stages(&record).await {
                    tracing::warn!(name = %record.name(), error = %err, "write-through sync failed");
                }
            });
        }

        if settings.auto_stage_movement && count >= settings.request_count_threshold {
            let manager = Arc::clone(&self.manager);
            let record = Arc::clone(record);
            tokio::spawn(async move {
                if let Err(err) = manager.promote_to_closer_stage(&record).await {
                    tracing::warn!(name = %record.name(), error = %err, "promotion failed");
                }
            });
        }
    }
}

fn check_arity(count: usize) -> Result<()> {
    if count == 0 || count > MAX_STATEMENTS {
        return Err(Error::InvalidStatementCount {
            count,
            max: MAX_STATEMENTS,
        });
    }
    Ok(())
}

fn run_query(uri: &str, sql: &str) -> Result<Vec<Row>> {
    let conn = Connection::open_with_flags(
        uri,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_URI,
    )?;
    let mut stmt = conn.prepare(sql)?;
    let columns: Vec<String> = stmt
        .column_names()
        .into_iter()
        .map(|name| name.to_string())
        .collect();

    let mut rows = stmt.query([])?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let mut map = Row::new();
        for (index, column) in columns.iter().enumerate() {
            map.insert(column.clone(), value_to_json(row.get_ref(index)?));
        }
        out.push(map);
    }
    Ok(out)
}

fn run_execute(uri: &str, statements: &[String]) -> Result<Vec<std::result::Result<Change, String>>> {
    let conn = Connection::open_with_flags(
        uri,
        OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_URI,
    )?;
    let mut results = Vec::with_capacity(statements.len());
    for sql in statements {
        match conn.execute(sql, []) {
            Ok(rows_affected) => results.push(Ok(Change {
                rows_affected: rows_affected as u64,
                last_insert_id: conn.last_insert_rowid(),
            })),
            Err(err) => results.push(Err(err.to_string())),
        }
    }
    Ok(results)
}

/// Result values are shaped for JSON transport: blobs become (lossy) strings
/// and 64-bit integers become doubles.
fn value_to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => serde_json::json!(i as f64),
        ValueRef::Real(f) => serde_json::json!(f),
        ValueRef::Text(text) => Value::String(String::from_utf8_lossy(text).into_owned()),
        ValueRef::Blob(blob) => Value::String(String::from_utf8_lossy(blob).into_owned()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Settings, StorageConfig};
    use crate::storage::Stages;
    use std::path::PathBuf;

    fn executor() -> Executor {
        crate::storage::memory::register().unwrap();
        let stages =
            Stages::without_remote(&StorageConfig::default(), PathBuf::from("/tmp")).unwrap();
        let registry = Arc::new(Registry::new(stages.clone()));
        // Background movement off: these tests pin placement.
        let settings = Settings {
            auto_stage_movement: false,
            auto_sync_enabled: false,
            ..Default::default()
        };
        let manager = Arc::new(StageManager::new(stages, settings, None));
        Executor::new(registry, manager)
    }

    #[tokio::test]
    async fn execute_then_query_roundtrip() {
        let exec = executor();
        exec.registry.create("exec_rt", 1).await.unwrap();

        let changes = exec
            .execute(
                "exec_rt",
                vec![
                    "CREATE TABLE t (n INTEGER, b BLOB)".to_string(),
                    "INSERT INTO t (n, b) VALUES (42, x'68690a')".to_string(),
                ],
            )
            .await
            .unwrap();
        assert_eq!(changes.len(), 2);
        let insert = changes[1].as_ref().unwrap();
        assert_eq!(insert.rows_affected, 1);
        assert_eq!(insert.last_insert_id, 1);

        let results = exec
            .query("exec_rt", vec!["SELECT n, b FROM t".to_string()])
            .await
            .unwrap();
        let rows = results[0].as_ref().unwrap();
        assert_eq!(rows.len(), 1);
        // 64-bit integers come back as doubles, blobs as strings.
        assert_eq!(rows[0]["n"], serde_json::json!(42.0));
        assert_eq!(rows[0]["b"], serde_json::json!("hi\n"));

        crate::storage::memory::remove("/exec_rt");
    }

    #[tokio::test]
    async fn query_slots_preserve_order_with_failures() {
        let exec = executor();
        exec.registry.create("exec_slots", 1).await.unwrap();
        exec.execute(
            "exec_slots",
            vec![
                "CREATE TABLE t (n INTEGER)".to_string(),
                "INSERT INTO t VALUES (7)".to_string(),
            ],
        )
        .await
        .unwrap();

        let mut statements: Vec<String> = (0..7).map(|_| "SELECT n FROM t".to_string()).collect();
        statements.insert(3, "SELECT broken FROM nowhere".to_string());
        let results = exec.query("exec_slots", statements).await.unwrap();

        assert_eq!(results.len(), 8);
        for (index, slot) in results.iter().enumerate() {
            if index == 3 {
                assert!(slot.is_err());
            } else {
                assert_eq!(slot.as_ref().unwrap()[0]["n"], serde_json::json!(7.0));
            }
        }

        crate::storage::memory::remove("/exec_slots");
    }

    #[tokio::test]
    async fn arity_and_missing_database_errors() {
        let exec = executor();

        assert!(matches!(
            exec.query("missing", vec!["SELECT 1".to_string()]).await,
            Err(Error::DatabaseNotFound { .. })
        ));
        assert!(matches!(
            exec.query("missing", vec![]).await,
            Err(Error::InvalidStatementCount { .. })
        ));
        assert!(matches!(
            exec.execute("missing", vec!["SELECT 1".to_string(); 17])
                .await,
            Err(Error::InvalidStatementCount { .. })
        ));
    }

    #[tokio::test]
    async fn execute_reports_per_statement_failures() {
        let exec = executor();
        exec.registry.create("exec_fail", 1).await.unwrap();

        let results = exec
            .execute(
                "exec_fail",
                vec![
                    "CREATE TABLE t (n INTEGER)".to_string(),
                    "INSERT INTO missing_table VALUES (1)".to_string(),
                    "INSERT INTO t VALUES (1)".to_string(),
                ],
            )
            .await
            .unwrap();
        assert!(results[0].is_ok());
        assert!(results[1].is_err());
        assert!(results[2].is_ok());

        crate::storage::memory::remove("/exec_fail");
    }

    #[tokio::test]
    async fn touch_counts_requests() {
        let exec = executor();
        let record = exec.registry.create("exec_touch", 1).await.unwrap();
        exec.execute("exec_touch", vec!["CREATE TABLE t (n INTEGER)".to_string()])
            .await
            .unwrap();
        exec.query("exec_touch", vec!["SELECT * FROM t".to_string()])
            .await
            .unwrap();
        assert_eq!(record.read().await.request_count, 2);

        crate::storage::memory::remove("/exec_touch");
    }
}
