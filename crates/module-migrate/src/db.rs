//! Database-specific items.

#[cfg(feature = "postgres")]
pub mod postgres;

use async_trait::async_trait;

/// The persisted migration state of a module.
///
/// A missing row (`Option::None` wherever this is returned) means
/// that no migration has been applied yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MigrationState {
    /// The highest applied migration version.
    pub version: u64,
    /// Whether the last apply or revert of `version` was interrupted.
    pub dirty: bool,
}

impl MigrationState {
    #[must_use]
    pub fn clean(version: u64) -> Self {
        Self {
            version,
            dirty: false,
        }
    }

    #[must_use]
    pub fn dirty(version: u64) -> Self {
        Self {
            version,
            dirty: true,
        }
    }
}

/// Bookkeeping operations on a connection that holds a single-row
/// `(version, dirty)` table.
///
/// Table names are used as-is in queries, **DO NOT USE UNTRUSTED STRINGS**.
#[async_trait(?Send)]
pub trait VersionTable: Sized {
    async fn ensure_version_table(&mut self, table_name: &str) -> Result<(), sqlx::Error>;

    // Should acquire a database lock so that only one migration process
    // can run at a time. [`Engine`](crate::Engine) holds it while applying
    // or reverting migrations.
    async fn lock(&mut self, table_name: &str) -> Result<(), sqlx::Error>;

    async fn unlock(&mut self, table_name: &str) -> Result<(), sqlx::Error>;

    async fn read_version(
        &mut self,
        table_name: &str,
    ) -> Result<Option<MigrationState>, sqlx::Error>;

    // Replaces the stored row, `None` clears the table.
    async fn write_version(
        &mut self,
        table_name: &str,
        state: Option<MigrationState>,
    ) -> Result<(), sqlx::Error>;

    // Runs a whole migration script, which may contain several statements.
    async fn execute_script(&mut self, sql: &str) -> Result<(), sqlx::Error>;

    async fn close(self) -> Result<(), sqlx::Error>;
}
