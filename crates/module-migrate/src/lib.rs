//! # Module Migrate
//!
//! Per-module SQL schema migrations that use [SQLx](https://github.com/launchbadge/sqlx).
//!
//! Every module of an application owns a `config.yaml` and a directory of
//! `<version>_<name>.up.sql` / `<version>_<name>.down.sql` pairs. The applied
//! version is kept in a single-row bookkeeping table in the module's schema,
//! together with a `dirty` flag that is raised while a migration is running.
//!
#![warn(clippy::pedantic)]
#![allow(
    clippy::cast_possible_truncation,
    clippy::cast_possible_wrap,
    clippy::cast_sign_loss,
    clippy::cast_lossless,
    clippy::unreadable_literal,
    clippy::doc_markdown,
    clippy::module_name_repetitions
)]

pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod report;
pub mod runner;
pub mod source;

pub use config::ModuleConfig;
pub use db::MigrationState;
pub use engine::{Engine, Outcome};
pub use error::Error;

#[cfg(all(feature = "cli", feature = "postgres"))]
pub mod cli;

/// The default bookkeeping table used when a module does not configure one.
pub const DEFAULT_MIGRATIONS_TABLE: &str = "schema_migrations";

/// Commonly used types and functions.
pub mod prelude {
    pub use super::db::{MigrationState, VersionTable};
    pub use super::engine::{Engine, Outcome};
    pub use super::report::{PendingOutcome, PendingReport, StatusReport};
    pub use super::runner::RunReport;
    pub use super::source::{Direction, MigrationFile};
    pub use super::Error;
    pub use super::ModuleConfig;
}
