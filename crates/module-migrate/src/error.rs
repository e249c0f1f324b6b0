use std::path::PathBuf;

use thiserror::Error;

/// An aggregated error type for configuration, file and database operations.
#[derive(Debug, Error)]
pub enum Error {
    #[error("config file not found: {}", path.display())]
    ConfigNotFound { path: PathBuf },
    #[error("failed to read config file {}: {source}", path.display())]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {}: {source}", path.display())]
    ConfigParse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("failed to connect to the database: {0}")]
    Connection(#[source] sqlx::Error),
    #[error("{0}")]
    Database(sqlx::Error),
    #[error("error applying migration {name}: {error}")]
    Migration {
        version: u64,
        name: String,
        #[source]
        error: sqlx::Error,
    },
    #[error("error reverting migration {name}: {error}")]
    Revert {
        version: u64,
        name: String,
        #[source]
        error: sqlx::Error,
    },
    #[error("migration version {version} is dirty, it must be fixed manually")]
    Dirty { version: u64 },
    #[error("applied version {version} has no local migration file")]
    UnknownVersion { version: u64 },
    #[error("missing down migration for {version}_{name}")]
    MissingDownFile { version: u64, name: String },
    #[error("duplicate migration version {version}")]
    DuplicateVersion { version: u64 },
    #[error("invalid migration name `{0}`")]
    InvalidMigrationName(String),
    #[error("migration file already exists: {}", path.display())]
    MigrationExists { path: PathBuf },
    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to format timestamp: {0}")]
    Timestamp(#[from] time::error::Format),
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        Self::Database(err)
    }
}

impl Error {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
