//! Storage backends and the tier table.
//!
//! Each backend implements the same capability set behind a SQLite VFS name;
//! everything above this module addresses tiers by index only.

pub mod client;
pub mod local;
pub mod lock;
pub mod memory;
pub mod remote;

use std::path::PathBuf;

use crate::config::StorageConfig;
use crate::error::{Error, Result};

/// The backend family a tier is served by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageKind {
    Memory,
    Local,
    Remote,
}

impl StorageKind {
    /// The VFS name connections select via `file:…?vfs=<name>`.
    pub fn vfs_name(self) -> &'static str {
        match self {
            StorageKind::Memory => "memory",
            StorageKind::Local => "disk",
            StorageKind::Remote => "r2",
        }
    }
}

#[derive(Debug, Clone)]
pub struct StageDescriptor {
    pub index: u8,
    pub kind: StorageKind,
}

/// The ordered tier table. Lower index = closer to the client (faster, more
/// volatile); higher = farther (slower, more durable).
#[derive(Debug, Clone)]
pub struct Stages {
    tiers: Vec<StageDescriptor>,
    local_dir: PathBuf,
}

impl Stages {
    /// Build the table from configuration. `local_dir` must already be the
    /// prepared (absolute) storage directory.
    pub fn new(config: &StorageConfig, local_dir: PathBuf) -> Result<Self> {
        let mut tiers = vec![
            StageDescriptor {
                index: config.memory.stage_number,
                kind: StorageKind::Memory,
            },
            StageDescriptor {
                index: config.local.stage_number,
                kind: StorageKind::Local,
            },
            StageDescriptor {
                index: config.remote.stage_number,
                kind: StorageKind::Remote,
            },
        ];
        tiers.sort_by_key(|tier| tier.index);
        if tiers.windows(2).any(|pair| pair[0].index == pair[1].index) {
            return Err(Error::Config {
                detail: "storage stage numbers must be distinct".to_string(),
            });
        }
        Ok(Self { tiers, local_dir })
    }

    /// A tier table without the remote backend, for deployments (and tests)
    /// that run on memory + disk only.
    pub fn without_remote(config: &StorageConfig, local_dir: PathBuf) -> Result<Self> {
        let mut stages = Self::new(config, local_dir)?;
        stages.tiers.retain(|tier| tier.kind != StorageKind::Remote);
        Ok(stages)
    }

    pub fn contains(&self, stage: u8) -> bool {
        self.kind_for(stage).is_some()
    }

    pub fn kind_for(&self, stage: u8) -> Option<StorageKind> {
        self.tiers
            .iter()
            .find(|tier| tier.index == stage)
            .map(|tier| tier.kind)
    }

    /// The stage closest to the client.
    pub fn closest(&self) -> u8 {
        self.tiers.first().map(|tier| tier.index).unwrap_or(0)
    }

    /// The stage farthest from the client.
    pub fn farthest(&self) -> u8 {
        self.tiers.last().map(|tier| tier.index).unwrap_or(0)
    }

    pub fn next_closer(&self, stage: u8) -> Option<u8> {
        self.tiers
            .iter()
            .rev()
            .find(|tier| tier.index < stage)
            .map(|tier| tier.index)
    }

    pub fn next_farther(&self, stage: u8) -> Option<u8> {
        self.tiers
            .iter()
            .find(|tier| tier.index > stage)
            .map(|tier| tier.index)
    }

    /// Stage indices strictly above `stage`, up to and including `limit`.
    pub fn above(&self, stage: u8, limit: u8) -> Vec<u8> {
        self.tiers
            .iter()
            .filter(|tier| tier.index > stage && tier.index <= limit)
            .map(|tier| tier.index)
            .collect()
    }

    /// Stage indices from `from` down to and including `to`, descending.
    pub fn descending(&self, from: u8, to: u8) -> Vec<u8> {
        self.tiers
            .iter()
            .rev()
            .filter(|tier| tier.index <= from && tier.index >= to)
            .map(|tier| tier.index)
            .collect()
    }

    /// The record `path` convention for a database on `stage`.
    pub fn path_for(&self, name: &str, stage: u8) -> Result<String> {
        match self.kind_for(stage) {
            Some(StorageKind::Memory) => Ok(format!("/{name}")),
            Some(StorageKind::Local) => Ok(self
                .local_dir
                .join(format!("{name}.db"))
                .to_string_lossy()
                .into_owned()),
            Some(StorageKind::Remote) => Ok(name.to_string()),
            None => Err(Error::StageOutOfRange { stage }),
        }
    }

    /// The connection URI for a record path on `stage`.
    pub fn uri_for(&self, path: &str, stage: u8) -> Result<String> {
        match self.kind_for(stage) {
            Some(StorageKind::Memory) => Ok(format!("file:{path}?vfs=memory")),
            Some(StorageKind::Local) => Ok(format!("file:{path}?vfs=disk")),
            Some(StorageKind::Remote) => Ok(format!("file:{path}.db?vfs=r2")),
            None => Err(Error::StageOutOfRange { stage }),
        }
    }

    /// The object key a database occupies on the remote tier.
    pub fn remote_key(name: &str) -> String {
        format!("{name}.db")
    }

    /// A fresh scratch file path inside the managed local directory. The
    /// `temp_` prefix keeps scratch files out of database listings.
    pub fn scratch_path(&self) -> PathBuf {
        self.local_dir.join(format!("temp_{}.db", uuid::Uuid::new_v4()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageConfig;

    fn stages() -> Stages {
        Stages::new(&StorageConfig::default(), PathBuf::from("/var/lib/persisto")).unwrap()
    }

    #[test]
    fn ordering_and_neighbors() {
        let stages = stages();
        assert_eq!(stages.closest(), 1);
        assert_eq!(stages.farthest(), 3);
        assert_eq!(stages.next_closer(3), Some(2));
        assert_eq!(stages.next_closer(1), None);
        assert_eq!(stages.next_farther(1), Some(2));
        assert_eq!(stages.next_farther(3), None);
        assert_eq!(stages.above(1, 3), vec![2, 3]);
        assert_eq!(stages.above(3, 3), Vec::<u8>::new());
        assert_eq!(stages.descending(3, 2), vec![3, 2]);
    }

    #[test]
    fn duplicate_indices_are_rejected() {
        let mut config = StorageConfig::default();
        config.local.stage_number = config.memory.stage_number;
        assert!(Stages::new(&config, PathBuf::new()).is_err());
    }

    #[test]
    fn path_conventions() {
        let stages = stages();
        assert_eq!(stages.path_for("users", 1).unwrap(), "/users");
        assert_eq!(
            stages.path_for("users", 2).unwrap(),
            "/var/lib/persisto/users.db"
        );
        assert_eq!(stages.path_for("users", 3).unwrap(), "users");
        assert!(stages.path_for("users", 9).is_err());
    }

    #[test]
    fn uri_conventions() {
        let stages = stages();
        assert_eq!(stages.uri_for("/users", 1).unwrap(), "file:/users?vfs=memory");
        assert_eq!(
            stages.uri_for("/var/lib/persisto/users.db", 2).unwrap(),
            "file:/var/lib/persisto/users.db?vfs=disk"
        );
        assert_eq!(stages.uri_for("users", 3).unwrap(), "file:users.db?vfs=r2");
    }
}
