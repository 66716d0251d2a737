use std::path::PathBuf;

use snafu::Snafu;

use crate::storage::client::StoreError;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("database {name} not found"))]
    DatabaseNotFound { name: String },

    #[snafu(display("database {name} already exists"))]
    DatabaseExists { name: String },

    #[snafu(display("invalid database name {name:?}: {reason}"))]
    InvalidName { name: String, reason: &'static str },

    #[snafu(display("stage {stage} is not a configured tier"))]
    StageOutOfRange { stage: u8 },

    #[snafu(display("stage {stage} is the active stage of {name}"))]
    ActiveStage { name: String, stage: u8 },

    #[snafu(display("expected between 1 and {max} statements, got {count}"))]
    InvalidStatementCount { count: usize, max: usize },

    #[snafu(display("sqlite error: {source}"))]
    Sqlite { source: rusqlite::Error },

    #[snafu(display("object store error: {source}"))]
    Store { source: StoreError },

    #[snafu(display("i/o error on {}: {source}", path.display()))]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("integrity check failed for {name}: {detail}"))]
    Integrity { name: String, detail: String },

    #[snafu(display("invalid configuration: {detail}"))]
    Config { detail: String },

    #[snafu(display("failed to register vfs {name}: {source}"))]
    VfsRegister {
        name: &'static str,
        source: sqlite_vfs::RegisterError,
    },

    #[snafu(display("background task panicked: {source}"))]
    TaskJoin { source: tokio::task::JoinError },

    #[snafu(display("server i/o error: {source}"))]
    Server { source: std::io::Error },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl From<rusqlite::Error> for Error {
    fn from(source: rusqlite::Error) -> Self {
        Self::Sqlite { source }
    }
}

impl From<StoreError> for Error {
    fn from(source: StoreError) -> Self {
        Self::Store { source }
    }
}
