//! `up` and `down` with before/after bookkeeping.

use std::fmt;

use itertools::Itertools;

use crate::{
    db::{MigrationState, VersionTable},
    engine::{Engine, Outcome},
    source::{self, Direction},
    Error,
};

/// What an `up` or `down` run did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub direction: Direction,
    pub before: Option<MigrationState>,
    pub after: Option<MigrationState>,
    /// Applied migrations in ascending order, or reverted ones
    /// in descending order.
    pub changed: Vec<String>,
}

impl RunReport {
    fn unchanged(direction: Direction, state: Option<MigrationState>) -> Self {
        Self {
            direction,
            before: state,
            after: state,
            changed: Vec::new(),
        }
    }

    /// Whether the state is dirty and needs to be fixed by hand.
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.after.map_or(false, |s| s.dirty)
    }

    /// The version after the run, `None` if no migration is applied.
    #[must_use]
    pub fn version(&self) -> Option<u64> {
        self.after.map(|s| s.version)
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.direction, self.after) {
            (_, Some(MigrationState {
                version,
                dirty: true,
            })) => write!(f, "migration version {version} is dirty (incomplete)"),
            (Direction::Up, None) => f.write_str("no migrations found, database is empty"),
            (Direction::Down, None) => f.write_str("rollback completed, database is empty"),
            (Direction::Up, Some(state)) if self.changed.is_empty() => write!(
                f,
                "no pending changes, current version: {}",
                state.version
            ),
            (Direction::Up, Some(state)) => {
                write!(f, "migration completed, current version: {}", state.version)
            }
            (Direction::Down, Some(state)) => {
                write!(f, "rollback completed, current version: {}", state.version)
            }
        }
    }
}

/// Apply all pending migrations.
///
/// A dirty state is reported, not returned as an error, and nothing is applied.
///
/// `before` is read outside the migration lock, so migrations applied by a
/// concurrent process in between are listed as applied by this run too.
///
/// # Errors
///
/// File, database and migration errors are returned.
pub async fn up<C: VersionTable>(engine: &mut Engine<C>) -> Result<RunReport, Error> {
    let before = engine.current_version().await?;

    if let Some(state) = before.filter(|s| s.dirty) {
        tracing::warn!(
            version = state.version,
            "migration state is dirty, fix it manually before applying migrations"
        );
        return Ok(RunReport::unchanged(Direction::Up, before));
    }

    match engine.apply_all().await {
        Ok(Outcome::Changed(count)) => tracing::info!(count, "migrations applied"),
        Ok(Outcome::NoChange) => tracing::info!("no pending migrations"),
        // Another process left it dirty in the meantime,
        // the state is read again below.
        Err(Error::Dirty { .. }) => {}
        Err(err) => return Err(err),
    }

    let after = engine.current_version().await?;

    let changed = match after {
        Some(MigrationState {
            version: after_version,
            dirty: false,
        }) => {
            let before_version = before.map_or(0, |s| s.version);
            source::list_up_files(engine.source())?
                .into_iter()
                .filter(|f| f.version > before_version && f.version <= after_version)
                .sorted_by_key(|f| f.version)
                .map(|f| f.id())
                .collect()
        }
        _ => Vec::new(),
    };

    Ok(RunReport {
        direction: Direction::Up,
        before,
        after,
        changed,
    })
}

/// Revert the `steps` most recent migrations.
///
/// `steps = 0` succeeds without touching anything. A dirty state is
/// reported, not returned as an error, and nothing is reverted.
///
/// # Errors
///
/// File, database and revert errors are returned, including
/// [`Error::MissingDownFile`].
pub async fn down<C: VersionTable>(
    engine: &mut Engine<C>,
    steps: u64,
) -> Result<RunReport, Error> {
    let before = engine.current_version().await?;

    if steps == 0 {
        tracing::info!("no steps requested, nothing to revert");
        return Ok(RunReport::unchanged(Direction::Down, before));
    }

    if let Some(state) = before.filter(|s| s.dirty) {
        tracing::warn!(
            version = state.version,
            "migration state is dirty, fix it manually before reverting migrations"
        );
        return Ok(RunReport::unchanged(Direction::Down, before));
    }

    match engine.revert_steps(steps).await {
        Ok(Outcome::Changed(count)) => tracing::info!(count, "migrations reverted"),
        Ok(Outcome::NoChange) => tracing::info!("no migrations to revert"),
        Err(Error::Dirty { .. }) => {}
        Err(err) => return Err(err),
    }

    let after = engine.current_version().await?;

    let changed = match (before, after) {
        (_, Some(MigrationState { dirty: true, .. })) | (None, _) => Vec::new(),
        (Some(before), after) => {
            let after_version = after.map_or(0, |s| s.version);
            source::list_down_files(engine.source())?
                .into_iter()
                .filter(|f| f.version <= before.version && f.version > after_version)
                .sorted_by_key(|f| std::cmp::Reverse(f.version))
                .map(|f| f.id())
                .collect()
        }
    };

    Ok(RunReport {
        direction: Direction::Down,
        before,
        after,
        changed,
    })
}
