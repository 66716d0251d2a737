//! The database registry: name → placement record plus lifecycle operations.

use std::sync::Arc;
use std::time::Instant;

use time::OffsetDateTime;
use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::{Error, Result};
use crate::stage::StageManager;
use crate::storage::Stages;

pub const MAX_NAME_LEN: usize = 128;

/// Mutable placement state, guarded by the record's reader-writer lock.
#[derive(Debug)]
pub struct RecordState {
    pub stage: u8,
    pub path: String,
    pub last_accessed: Instant,
    pub last_accessed_at: OffsetDateTime,
    pub request_count: u64,
}

/// One registered database. The name never changes; everything else is
/// mutated under the lock — counters and timestamps by the executor, stage
/// and path by the stage manager.
#[derive(Debug)]
pub struct DatabaseRecord {
    name: String,
    state: RwLock<RecordState>,
}

impl DatabaseRecord {
    pub fn new(name: impl Into<String>, stage: u8, path: String) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            state: RwLock::new(RecordState {
                stage,
                path,
                last_accessed: Instant::now(),
                last_accessed_at: OffsetDateTime::now_utc(),
                request_count: 0,
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn read(&self) -> RwLockReadGuard<'_, RecordState> {
        self.state.read().await
    }

    pub async fn write(&self) -> RwLockWriteGuard<'_, RecordState> {
        self.state.write().await
    }

    /// Stamp an access and bump the request counter, returning the new count.
    pub async fn touch(&self) -> u64 {
        let mut state = self.state.write().await;
        state.last_accessed = Instant::now();
        state.last_accessed_at = OffsetDateTime::now_utc();
        state.request_count += 1;
        state.request_count
    }
}

/// A point-in-time view of a record, for listings.
#[derive(Debug, Clone)]
pub struct RecordSnapshot {
    pub name: String,
    pub stage: u8,
    pub last_accessed_at: OffsetDateTime,
    pub request_count: u64,
}

pub struct Registry {
    stages: Stages,
    records: RwLock<Vec<Arc<DatabaseRecord>>>,
}

impl Registry {
    pub fn new(stages: Stages) -> Self {
        Self {
            stages,
            records: RwLock::new(Vec::new()),
        }
    }

    pub fn stages(&self) -> &Stages {
        &self.stages
    }

    pub async fn records(&self) -> Vec<Arc<DatabaseRecord>> {
        self.records.read().await.clone()
    }

    pub async fn list(&self) -> Vec<RecordSnapshot> {
        let records = self.records().await;
        let mut snapshots = Vec::with_capacity(records.len());
        for record in records {
            let state = record.read().await;
            snapshots.push(RecordSnapshot {
                name: record.name().to_string(),
                stage: state.stage,
                last_accessed_at: state.last_accessed_at,
                request_count: state.request_count,
            });
        }
        snapshots
    }

    pub async fn find_by_name(&self, name: &str) -> Option<Arc<DatabaseRecord>> {
        self.records
            .read()
            .await
            .iter()
            .find(|record| record.name() == name)
            .cloned()
    }

    /// Create a database on `stage` and register it. The backing object is
    /// initialized with one create-then-drop schema statement; object stores
    /// do not materialize a key until the first write, so this is what makes
    /// the database exist on the remote tier.
    pub async fn create(&self, name: &str, stage: u8) -> Result<Arc<DatabaseRecord>> {
        validate_name(name)?;
        if !self.stages.contains(stage) {
            return Err(Error::StageOutOfRange { stage });
        }
        if self.find_by_name(name).await.is_some() {
            return Err(Error::DatabaseExists {
                name: name.to_string(),
            });
        }

        let path = self.stages.path_for(name, stage)?;
        let uri = self.stages.uri_for(&path, stage)?;
        tokio::task::spawn_blocking(move || initialize_database(&uri))
            .await
            .map_err(|source| Error::TaskJoin { source })??;

        let record = DatabaseRecord::new(name, stage, path);
        {
            let mut records = self.records.write().await;
            // Re-check under the write lock; a concurrent create may have won.
            if records.iter().any(|existing| existing.name() == name) {
                return Err(Error::DatabaseExists {
                    name: name.to_string(),
                });
            }
            records.push(Arc::clone(&record));
        }

        tracing::info!(name = %record.name(), stage, "database created");
        Ok(record)
    }

    /// Register an already-materialized database (startup hydration from the
    /// remote tier). Existing names are left untouched.
    pub async fn adopt(&self, name: &str, stage: u8) -> Result<Option<Arc<DatabaseRecord>>> {
        validate_name(name)?;
        let path = self.stages.path_for(name, stage)?;
        let mut records = self.records.write().await;
        if records.iter().any(|existing| existing.name() == name) {
            return Ok(None);
        }
        let record = DatabaseRecord::new(name, stage, path);
        records.push(Arc::clone(&record));
        Ok(Some(record))
    }

    /// Tear down a database on every tier from the persistence stage down to
    /// its active one, then unlink the record. Per-stage failures are logged
    /// and skipped.
    pub async fn delete(&self, manager: &StageManager, record: &Arc<DatabaseRecord>) -> Result<()> {
        {
            let state = record.write().await;
            let top = manager.persistence_stage().max(state.stage);
            for stage in self.stages.descending(top, state.stage) {
                if let Err(err) = manager.remove_object(record.name(), stage).await {
                    tracing::warn!(
                        name = %record.name(),
                        stage,
                        error = %err,
                        "failed to remove database from stage"
                    );
                }
            }
        }

        let mut records = self.records.write().await;
        let before = records.len();
        records.retain(|existing| existing.name() != record.name());
        if records.len() == before {
            return Err(Error::DatabaseNotFound {
                name: record.name().to_string(),
            });
        }
        tracing::info!(name = %record.name(), "database deleted");
        Ok(())
    }
}

/// Open a connection through the stage's VFS and force one schema operation.
fn initialize_database(uri: &str) -> Result<()> {
    let conn = rusqlite::Connection::open_with_flags(
        uri,
        rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
            | rusqlite::OpenFlags::SQLITE_OPEN_CREATE
            | rusqlite::OpenFlags::SQLITE_OPEN_URI,
    )?;
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS init_probe (id INTEGER); DROP TABLE init_probe;",
    )?;
    Ok(())
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::InvalidName {
            name: name.to_string(),
            reason: "name must not be empty",
        });
    }
    if name.len() > MAX_NAME_LEN {
        return Err(Error::InvalidName {
            name: name.to_string(),
            reason: "name exceeds 128 characters",
        });
    }
    if name.contains('/') || name.contains('\\') {
        return Err(Error::InvalidName {
            name: name.to_string(),
            reason: "name must not contain path separators",
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageConfig;
    use std::path::PathBuf;

    fn test_stages() -> Stages {
        Stages::without_remote(&StorageConfig::default(), PathBuf::from("/tmp")).unwrap()
    }

    #[test]
    fn name_validation() {
        assert!(validate_name("users").is_ok());
        assert!(validate_name("with-dash_and.dot").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("a/b").is_err());
        assert!(validate_name("a\\b").is_err());
        assert!(validate_name(&"x".repeat(129)).is_err());
        assert!(validate_name(&"x".repeat(128)).is_ok());
    }

    #[tokio::test]
    async fn create_rejects_duplicates_and_bad_stages() {
        crate::storage::memory::register().unwrap();
        let registry = Registry::new(test_stages());

        let record = registry.create("dup", 1).await.unwrap();
        assert_eq!(record.name(), "dup");
        assert_eq!(record.read().await.stage, 1);

        assert!(matches!(
            registry.create("dup", 1).await,
            Err(Error::DatabaseExists { .. })
        ));
        assert!(matches!(
            registry.create("other", 9).await,
            Err(Error::StageOutOfRange { .. })
        ));

        crate::storage::memory::remove("/dup");
    }

    #[tokio::test]
    async fn adopt_skips_existing_records() {
        let registry = Registry::new(test_stages());
        assert!(registry.adopt("seen", 2).await.unwrap().is_some());
        assert!(registry.adopt("seen", 2).await.unwrap().is_none());
        assert!(registry.find_by_name("seen").await.is_some());
    }

    #[tokio::test]
    async fn touch_bumps_counter_and_timestamp() {
        let record = DatabaseRecord::new("t", 1, "/t".to_string());
        assert_eq!(record.touch().await, 1);
        assert_eq!(record.touch().await, 2);
        let state = record.read().await;
        assert_eq!(state.request_count, 2);
    }
}
