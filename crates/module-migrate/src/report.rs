//! Read-only comparison of migration files against the persisted state.

use std::{fmt, path::PathBuf};

use crate::{
    db::{MigrationState, VersionTable},
    engine::Engine,
    source::{self, Direction, MigrationFile, MigrationScan},
    Error,
};

/// The state of a module's database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusReport {
    /// Number of `*.sql` files in the migrations directory.
    pub files: usize,
    pub state: Option<MigrationState>,
}

impl StatusReport {
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.state.map_or(false, |s| s.dirty)
    }
}

impl fmt::Display for StatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.state {
            None => f.write_str(
                "no migrations applied yet, database is empty and ready for the first migration",
            ),
            Some(MigrationState {
                version,
                dirty: true,
            }) => write!(
                f,
                "migration version {version} is dirty (incomplete), it needs to be fixed manually"
            ),
            Some(MigrationState { version, .. }) => {
                write!(f, "current migration version {version}, database is up to date")
            }
        }
    }
}

/// Migrations that have not been applied yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingReport {
    /// Number of parsed up migrations.
    pub total: usize,
    /// Up migrations whose name has no numeric version.
    pub skipped: Vec<PathBuf>,
    pub outcome: PendingOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingOutcome {
    /// There are no migration files at all.
    NoFiles,
    /// The state is dirty, nothing was compared.
    Dirty { version: u64 },
    /// Pending migrations in ascending order.
    Pending {
        current: Option<u64>,
        files: Vec<MigrationFile>,
    },
}

impl PendingReport {
    /// Number of pending migrations, zero if the state is dirty.
    #[must_use]
    pub fn count(&self) -> usize {
        match &self.outcome {
            PendingOutcome::Pending { files, .. } => files.len(),
            _ => 0,
        }
    }

    #[must_use]
    pub fn is_dirty(&self) -> bool {
        matches!(self.outcome, PendingOutcome::Dirty { .. })
    }
}

impl fmt::Display for PendingReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.outcome {
            PendingOutcome::NoFiles => f.write_str("no migrations found"),
            PendingOutcome::Dirty { version } => {
                write!(f, "database has dirty migration version {version}")
            }
            PendingOutcome::Pending { current: None, .. } => {
                write!(f, "all {} migrations are pending", self.total)
            }
            PendingOutcome::Pending { files, .. } if files.is_empty() => {
                f.write_str("no pending migrations, database is up to date")
            }
            PendingOutcome::Pending { files, .. } => {
                write!(f, "{} of {} migrations are pending", files.len(), self.total)
            }
        }
    }
}

/// Read the module's state.
///
/// # Errors
///
/// File and database errors are returned.
pub async fn status<C: VersionTable>(engine: &mut Engine<C>) -> Result<StatusReport, Error> {
    let files = source::count_sql_files(engine.source())?;
    let state = engine.current_version().await?;

    Ok(StatusReport { files, state })
}

/// List pending migrations.
///
/// # Errors
///
/// File and database errors are returned.
pub async fn pending<C: VersionTable>(engine: &mut Engine<C>) -> Result<PendingReport, Error> {
    let scan = source::scan(engine.source(), Direction::Up)?;

    if scan.files.is_empty() {
        return Ok(reconcile(scan, None));
    }

    let state = engine.current_version().await?;

    Ok(reconcile(scan, state))
}

/// Compare scanned up migrations against a state.
///
/// A migration is pending if its version is above the current one,
/// or if nothing was applied yet.
#[must_use]
pub fn reconcile(scan: MigrationScan, state: Option<MigrationState>) -> PendingReport {
    let MigrationScan { mut files, skipped } = scan;
    let total = files.len();

    let outcome = if files.is_empty() {
        PendingOutcome::NoFiles
    } else {
        match state {
            Some(MigrationState {
                version,
                dirty: true,
            }) => PendingOutcome::Dirty { version },
            state => {
                let current = state.map(|s| s.version);
                files.retain(|f| current.map_or(true, |current| f.version > current));
                source::sort_ascending(&mut files);
                PendingOutcome::Pending { current, files }
            }
        }
    };

    PendingReport {
        total,
        skipped,
        outcome,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn scan(versions: &[u64]) -> MigrationScan {
        MigrationScan {
            files: versions
                .iter()
                .map(|&version| MigrationFile {
                    version,
                    name: format!("m{version}"),
                    direction: Direction::Up,
                    path: Path::new("migrations").join(format!("{version}_m{version}.up.sql")),
                })
                .collect(),
            skipped: Vec::new(),
        }
    }

    fn pending_versions(report: &PendingReport) -> Vec<u64> {
        match &report.outcome {
            PendingOutcome::Pending { files, .. } => files.iter().map(|f| f.version).collect(),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn everything_pending_without_state() {
        let report = reconcile(scan(&[3, 1, 2]), None);
        assert_eq!(pending_versions(&report), [1, 2, 3]);
        assert_eq!(report.count(), 3);
        assert_eq!(report.to_string(), "all 3 migrations are pending");
    }

    #[test]
    fn pending_above_current_version() {
        let report = reconcile(scan(&[30, 10, 20]), Some(MigrationState::clean(10)));
        assert_eq!(pending_versions(&report), [20, 30]);
        assert_eq!(report.to_string(), "2 of 3 migrations are pending");

        let report = reconcile(scan(&[30, 10, 20]), Some(MigrationState::clean(30)));
        assert_eq!(report.count(), 0);
        assert_eq!(
            report.to_string(),
            "no pending migrations, database is up to date"
        );
    }

    #[test]
    fn dirty_state_stops_comparison() {
        let report = reconcile(scan(&[1, 2]), Some(MigrationState::dirty(1)));
        assert_eq!(report.outcome, PendingOutcome::Dirty { version: 1 });
        assert!(report.is_dirty());
        assert_eq!(report.count(), 0);
    }

    #[test]
    fn no_files() {
        let report = reconcile(scan(&[]), Some(MigrationState::clean(1)));
        assert_eq!(report.outcome, PendingOutcome::NoFiles);
    }

    #[test]
    fn status_lines() {
        let status = |state| StatusReport { files: 4, state }.to_string();

        assert!(status(None).contains("ready for the first migration"));
        assert!(status(Some(MigrationState::dirty(7))).contains("fixed manually"));
        assert!(status(Some(MigrationState::clean(7))).contains("up to date"));
    }
}
