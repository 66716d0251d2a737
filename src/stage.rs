//! The placement controller: promotion, demotion, write-through sync and
//! cross-tier copies.
//!
//! All SQLite work runs on blocking threads; record state is only touched
//! under the record's lock, so stage transitions for one database are
//! serialized.

use std::sync::Arc;
use std::time::Duration;

use rusqlite::{Connection, OpenFlags};

use crate::config::Settings;
use crate::error::{Error, Result};
use crate::registry::{DatabaseRecord, RecordState};
use crate::storage::client::ObjectStore;
use crate::storage::{memory, StorageKind, Stages};

const VACUUM_ATTEMPTS: usize = 3;
const VACUUM_BACKOFF: Duration = Duration::from_millis(100);

/// Statements whose leading keyword mutates data or schema.
const WRITE_KEYWORDS: [&str; 6] = ["INSERT", "UPDATE", "DELETE", "CREATE", "DROP", "ALTER"];

/// True when the statement's first token (case- and whitespace-insensitive)
/// is a mutating keyword.
pub fn is_write_statement(sql: &str) -> bool {
    sql.split_whitespace()
        .next()
        .map(|token| {
            let token = token.to_ascii_uppercase();
            WRITE_KEYWORDS.iter().any(|keyword| token == *keyword)
        })
        .unwrap_or(false)
}

/// Double-quote an identifier, doubling up internal quotes.
fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

#[derive(Clone)]
pub struct StageManager {
    stages: Stages,
    settings: Settings,
    store: Option<Arc<dyn ObjectStore>>,
}

impl StageManager {
    pub fn new(stages: Stages, settings: Settings, store: Option<Arc<dyn ObjectStore>>) -> Self {
        Self {
            stages,
            settings,
            store,
        }
    }

    pub fn stages(&self) -> &Stages {
        &self.stages
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn persistence_stage(&self) -> u8 {
        self.settings.persistence_stage
    }

    /// Move a database to `target`, copying its live contents first. On
    /// success the record points at the new tier with a reset counter; on
    /// failure it is left untouched.
    pub async fn move_to_stage(&self, record: &Arc<DatabaseRecord>, target: u8) -> Result<()> {
        let mut state = record.write().await;
        self.move_locked(record.name(), &mut state, target).await
    }

    async fn move_locked(&self, name: &str, state: &mut RecordState, target: u8) -> Result<()> {
        if !self.stages.contains(target) {
            return Err(Error::StageOutOfRange { stage: target });
        }
        let current = state.stage;
        if current == target {
            return Ok(());
        }

        self.run_copy(name, current, target).await?;

        state.stage = target;
        state.path = self.stages.path_for(name, target)?;
        state.request_count = 0;

        if target < current {
            // Fresh promotion copies get an integrity check. A failed check
            // is reported but the move stands.
            let this = self.clone();
            let name = name.to_string();
            let verdict = tokio::task::spawn_blocking(move || this.integrity_check(&name, target))
                .await
                .map_err(|source| Error::TaskJoin { source })?;
            match verdict {
                Ok(true) => {}
                Ok(false) => {
                    tracing::warn!(stage = target, "integrity check failed after promotion");
                }
                Err(err) => {
                    tracing::warn!(stage = target, error = %err, "integrity check could not run");
                }
            }
        }

        tracing::info!(name, from = current, to = target, "database moved between stages");
        Ok(())
    }

    /// Promote one tier closer to the client. No-op at the closest tier;
    /// aborted when the source does not answer a ping.
    pub async fn promote_to_closer_stage(&self, record: &Arc<DatabaseRecord>) -> Result<()> {
        let mut state = record.write().await;
        if state.stage == self.stages.closest() {
            return Ok(());
        }
        let Some(target) = self.stages.next_closer(state.stage) else {
            return Ok(());
        };

        state.request_count = 0;

        let uri = self.stages.uri_for(&state.path, state.stage)?;
        let probe = tokio::task::spawn_blocking(move || probe_connection(&uri))
            .await
            .map_err(|source| Error::TaskJoin { source })?;
        if let Err(err) = probe {
            tracing::warn!(
                name = %record.name(),
                stage = state.stage,
                error = %err,
                "promotion aborted; source stage unreachable"
            );
            return Err(err);
        }

        self.move_locked(record.name(), &mut state, target).await
    }

    /// Demote one tier farther from the client. Inactivity is re-checked
    /// under the record lock so a concurrent access wins the race.
    pub async fn demote_to_farther_stage(&self, record: &Arc<DatabaseRecord>) -> Result<()> {
        let mut state = record.write().await;
        if state.stage == self.stages.farthest() {
            return Ok(());
        }
        if state.last_accessed.elapsed() < self.settings.stage_timeout {
            tracing::debug!(name = %record.name(), "demotion skipped; database was accessed");
            return Ok(());
        }
        let Some(target) = self.stages.next_farther(state.stage) else {
            return Ok(());
        };
        let from = state.stage;

        if self.settings.auto_sync_enabled {
            for stage in self.stages.above(from, self.stages.farthest()) {
                self.run_copy(record.name(), from, stage).await?;
                self.run_verify(record.name(), from, stage).await?;
            }
        }

        state.request_count = 0;
        self.move_locked(record.name(), &mut state, target).await?;
        drop(state);

        // The vacated tier holds no authoritative copy below the persistence
        // stage; reclaim it.
        if from < self.persistence_stage() {
            if let Err(err) = self.remove_object(record.name(), from).await {
                tracing::debug!(name = %record.name(), stage = from, error = %err,
                    "could not reclaim vacated stage");
            }
        }
        Ok(())
    }

    /// Write-through: copy the database from its active stage to every tier
    /// strictly above, up to and including the persistence stage. Stops on
    /// the first failure.
    pub async fn sync_to_upper_stages(&self, record: &Arc<DatabaseRecord>) -> Result<()> {
        let state = record.write().await;
        let current = state.stage;
        for stage in self.stages.above(current, self.persistence_stage()) {
            self.run_copy(record.name(), current, stage).await?;
        }
        Ok(())
    }

    /// Reclaim a non-active tier's copy of the database. Deleting the active
    /// stage this way is refused; registry deletion uses [Self::remove_object]
    /// directly.
    pub async fn remove_from_stage(&self, record: &Arc<DatabaseRecord>, stage: u8) -> Result<()> {
        {
            let state = record.read().await;
            if state.stage == stage {
                return Err(Error::ActiveStage {
                    name: record.name().to_string(),
                    stage,
                });
            }
        }
        self.remove_object(record.name(), stage).await
    }

    /// Drop whatever `name` occupies on `stage`, regardless of the record's
    /// active placement. Missing objects are fine.
    pub async fn remove_object(&self, name: &str, stage: u8) -> Result<()> {
        match self.stages.kind_for(stage) {
            Some(StorageKind::Memory) => {
                memory::remove(&format!("/{name}"));
                Ok(())
            }
            Some(StorageKind::Local) => {
                let path = self.stages.path_for(name, stage)?;
                match std::fs::remove_file(&path) {
                    Ok(()) => Ok(()),
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
                    Err(source) => Err(Error::Io {
                        path: path.into(),
                        source,
                    }),
                }
            }
            Some(StorageKind::Remote) => {
                let store = self.remote_store()?;
                let key = Stages::remote_key(name);
                tokio::task::spawn_blocking(move || store.delete(&key))
                    .await
                    .map_err(|source| Error::TaskJoin { source })??;
                Ok(())
            }
            None => Err(Error::StageOutOfRange { stage }),
        }
    }

    fn remote_store(&self) -> Result<Arc<dyn ObjectStore>> {
        self.store.clone().ok_or_else(|| Error::Config {
            detail: "remote tier is not configured".to_string(),
        })
    }

    async fn run_copy(&self, name: &str, src: u8, dst: u8) -> Result<()> {
        let this = self.clone();
        let name = name.to_string();
        tokio::task::spawn_blocking(move || this.copy_database(&name, src, dst))
            .await
            .map_err(|source| Error::TaskJoin { source })?
    }

    async fn run_verify(&self, name: &str, src: u8, dst: u8) -> Result<()> {
        let this = self.clone();
        let name = name.to_string();
        tokio::task::spawn_blocking(move || this.verify_populated(&name, src, dst))
            .await
            .map_err(|source| Error::TaskJoin { source })?
    }

    /// Copy the live contents of `name` from `src` to `dst`.
    ///
    /// Same backend: engine-native `VACUUM INTO`. Memory source: vacuum to a
    /// scratch file on local disk first (the memory tier cannot be attached
    /// from another backend's connection), then continue from the scratch.
    /// Anything else: schema-and-rows replication.
    fn copy_database(&self, name: &str, src: u8, dst: u8) -> Result<()> {
        let src_kind = self
            .stages
            .kind_for(src)
            .ok_or(Error::StageOutOfRange { stage: src })?;
        let dst_kind = self
            .stages
            .kind_for(dst)
            .ok_or(Error::StageOutOfRange { stage: dst })?;
        let src_path = self.stages.path_for(name, src)?;
        let src_uri = self.stages.uri_for(&src_path, src)?;

        if src_kind == dst_kind {
            return self.vacuum_into(&src_uri, name, dst);
        }

        if src_kind == StorageKind::Memory {
            let scratch = self.stages.scratch_path();
            let scratch_uri = format!("file:{}?vfs=disk", scratch.display());
            let source = open_source(&src_uri)?;
            source.execute("VACUUM INTO ?1", rusqlite::params![scratch_uri])?;
            drop(source);

            let result = if dst_kind == StorageKind::Local {
                self.vacuum_into(&scratch_uri, name, dst)
            } else {
                let dst_path = self.stages.path_for(name, dst)?;
                let dst_uri = self.stages.uri_for(&dst_path, dst)?;
                cross_vfs_copy(&scratch_uri, &dst_uri)
            };
            let _ = std::fs::remove_file(&scratch);
            return result;
        }

        let dst_path = self.stages.path_for(name, dst)?;
        let dst_uri = self.stages.uri_for(&dst_path, dst)?;
        cross_vfs_copy(&src_uri, &dst_uri)
    }

    /// Engine-native backup into `dst`. The target must not exist, so it is
    /// deleted best-effort up front and again between attempts.
    fn vacuum_into(&self, src_uri: &str, name: &str, dst: u8) -> Result<()> {
        let dst_path = self.stages.path_for(name, dst)?;
        let dst_uri = self.stages.uri_for(&dst_path, dst)?;

        let _ = self.try_remove_target(name, dst);

        let source = open_source(src_uri)?;
        let mut attempt = 0;
        loop {
            match source.execute("VACUUM INTO ?1", rusqlite::params![dst_uri]) {
                Ok(_) => return Ok(()),
                Err(err)
                    if attempt + 1 < VACUUM_ATTEMPTS
                        && err.to_string().contains("output file already exists") =>
                {
                    attempt += 1;
                    let _ = self.try_remove_target(name, dst);
                    std::thread::sleep(VACUUM_BACKOFF);
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    fn try_remove_target(&self, name: &str, stage: u8) -> Result<()> {
        match self.stages.kind_for(stage) {
            Some(StorageKind::Memory) => {
                memory::remove(&format!("/{name}"));
                Ok(())
            }
            Some(StorageKind::Local) => {
                let path = self.stages.path_for(name, stage)?;
                let _ = std::fs::remove_file(path);
                Ok(())
            }
            Some(StorageKind::Remote) => {
                let store = self.remote_store()?;
                store.delete(&Stages::remote_key(name))?;
                Ok(())
            }
            None => Err(Error::StageOutOfRange { stage }),
        }
    }

    fn integrity_check(&self, name: &str, stage: u8) -> Result<bool> {
        let path = self.stages.path_for(name, stage)?;
        let uri = self.stages.uri_for(&path, stage)?;
        let conn = open_source(&uri)?;
        let status: String = conn.query_row("PRAGMA integrity_check", [], |row| row.get(0))?;
        Ok(status == "ok")
    }

    /// After a sync the destination must hold user tables whenever the
    /// source does.
    fn verify_populated(&self, name: &str, src: u8, dst: u8) -> Result<()> {
        if user_table_count(self, name, src)? == 0 {
            return Ok(());
        }
        if user_table_count(self, name, dst)? == 0 {
            return Err(Error::Integrity {
                name: name.to_string(),
                detail: format!("stage {dst} holds no user tables after sync"),
            });
        }
        Ok(())
    }
}

fn user_table_count(manager: &StageManager, name: &str, stage: u8) -> Result<u64> {
    let path = manager.stages.path_for(name, stage)?;
    let uri = manager.stages.uri_for(&path, stage)?;
    let conn = open_source(&uri)?;
    let count: u64 = conn.query_row(
        "SELECT count(*) FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%'",
        [],
        |row| row.get(0),
    )?;
    Ok(count)
}

fn open_source(uri: &str) -> Result<Connection> {
    Ok(Connection::open_with_flags(
        uri,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_URI,
    )?)
}

fn open_target(uri: &str) -> Result<Connection> {
    Ok(Connection::open_with_flags(
        uri,
        OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_URI,
    )?)
}

fn probe_connection(uri: &str) -> Result<()> {
    let conn = open_source(uri)?;
    conn.query_row("SELECT 1", [], |_| Ok(()))?;
    Ok(())
}

/// Schema-and-rows replication between backends that cannot share a native
/// backup. Everything lands in one destination transaction; any table- or
/// row-level error rolls the whole copy back.
fn cross_vfs_copy(src_uri: &str, dst_uri: &str) -> Result<()> {
    let source = open_source(src_uri)?;
    let mut target = open_target(dst_uri)?;
    let tx = target.transaction()?;

    replicate_contents(&source, &tx)?;

    tx.commit()?;
    Ok(())
}

fn replicate_contents(source: &Connection, tx: &rusqlite::Transaction<'_>) -> Result<()> {
    let tables: Vec<(String, String)> = source
        .prepare(
            "SELECT name, sql FROM sqlite_master \
             WHERE type = 'table' AND name NOT LIKE 'sqlite_%'",
        )?
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<rusqlite::Result<_>>()?;

    for (table, create_sql) in &tables {
        let quoted = quote_ident(table);
        tx.execute_batch(&format!("DROP TABLE IF EXISTS {quoted}"))?;
        tx.execute_batch(create_sql)?;

        let columns: Vec<String> = source
            .prepare(&format!("PRAGMA table_info({quoted})"))?
            .query_map([], |row| row.get(1))?
            .collect::<rusqlite::Result<_>>()?;
        let column_list = columns
            .iter()
            .map(|column| quote_ident(column))
            .collect::<Vec<_>>()
            .join(", ");
        let placeholders = (1..=columns.len())
            .map(|i| format!("?{i}"))
            .collect::<Vec<_>>()
            .join(", ");

        let mut select = source.prepare(&format!("SELECT {column_list} FROM {quoted}"))?;
        let mut insert = tx.prepare(&format!(
            "INSERT INTO {quoted} ({column_list}) VALUES ({placeholders})"
        ))?;

        let mut rows = select.query([])?;
        while let Some(row) = rows.next()? {
            let values: Vec<rusqlite::types::Value> = (0..columns.len())
                .map(|i| row.get(i))
                .collect::<rusqlite::Result<_>>()?;
            insert.execute(rusqlite::params_from_iter(values))?;
        }
    }

    // User-defined indexes are replayed after the data; a failing index is
    // skipped rather than failing the copy.
    let indexes: Vec<(String, String)> = source
        .prepare(
            "SELECT name, sql FROM sqlite_master \
             WHERE type = 'index' AND sql IS NOT NULL AND name NOT LIKE 'sqlite_%'",
        )?
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<rusqlite::Result<_>>()?;
    for (index, create_sql) in indexes {
        if let Err(err) = tx.execute_batch(&create_sql) {
            tracing::warn!(index = %index, error = %err, "skipping index during copy");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageConfig;
    use crate::registry::Registry;

    fn manager_with(dir: &std::path::Path) -> (StageManager, Registry) {
        crate::storage::memory::register().unwrap();
        crate::storage::local::register().unwrap();
        let local_dir = crate::storage::local::prepare_directory(dir).unwrap();
        let stages =
            Stages::without_remote(&StorageConfig::default(), local_dir).unwrap();
        let mut settings = Settings::default();
        settings.persistence_stage = 2;
        settings.default_creation_stage = 1;
        let manager = StageManager::new(stages.clone(), settings, None);
        (manager, Registry::new(stages))
    }

    #[test]
    fn write_statement_classification() {
        for sql in [
            "INSERT INTO t VALUES (1)",
            "  update t set a = 1",
            "Delete FROM t",
            "\tCREATE TABLE t (id INTEGER)",
            "drop table t",
            "ALTER TABLE t ADD COLUMN b",
        ] {
            assert!(is_write_statement(sql), "{sql}");
        }
        for sql in ["SELECT * FROM t", "  pragma user_version", "EXPLAIN SELECT 1", ""] {
            assert!(!is_write_statement(sql), "{sql}");
        }
    }

    #[test]
    fn identifier_quoting() {
        assert_eq!(quote_ident("plain"), "\"plain\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn move_between_memory_and_local_preserves_rows() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, registry) = manager_with(dir.path());

        let record = registry.create("mover", 1).await.unwrap();
        {
            let state = record.read().await;
            let uri = manager.stages().uri_for(&state.path, state.stage).unwrap();
            let conn = open_target(&uri).unwrap();
            conn.execute_batch(
                "CREATE TABLE x (id INTEGER, label TEXT); \
                 INSERT INTO x VALUES (1, 'one'); \
                 INSERT INTO x VALUES (2, 'tw\"o'); \
                 CREATE INDEX x_id ON x (id);",
            )
            .unwrap();
        }

        manager.move_to_stage(&record, 2).await.unwrap();
        {
            let state = record.read().await;
            assert_eq!(state.stage, 2);
            assert_eq!(state.request_count, 0);
            assert!(state.path.ends_with("mover.db"));

            let uri = manager.stages().uri_for(&state.path, state.stage).unwrap();
            let conn = open_source(&uri).unwrap();
            let count: u64 = conn
                .query_row("SELECT count(*) FROM x", [], |row| row.get(0))
                .unwrap();
            assert_eq!(count, 2);
        }

        // Round-trip back to memory and read again.
        manager.move_to_stage(&record, 1).await.unwrap();
        let state = record.read().await;
        assert_eq!(state.stage, 1);
        let uri = manager.stages().uri_for(&state.path, state.stage).unwrap();
        let conn = open_source(&uri).unwrap();
        let label: String = conn
            .query_row("SELECT label FROM x WHERE id = 2", [], |row| row.get(0))
            .unwrap();
        assert_eq!(label, "tw\"o");

        crate::storage::memory::remove("/mover");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn move_to_unknown_stage_leaves_record_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, registry) = manager_with(dir.path());
        let record = registry.create("fixed", 1).await.unwrap();

        assert!(matches!(
            manager.move_to_stage(&record, 7).await,
            Err(Error::StageOutOfRange { .. })
        ));
        assert_eq!(record.read().await.stage, 1);

        crate::storage::memory::remove("/fixed");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn remove_from_active_stage_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, registry) = manager_with(dir.path());
        let record = registry.create("active", 1).await.unwrap();

        assert!(matches!(
            manager.remove_from_stage(&record, 1).await,
            Err(Error::ActiveStage { .. })
        ));
        assert!(manager.remove_from_stage(&record, 2).await.is_ok());

        crate::storage::memory::remove("/active");
    }
}
