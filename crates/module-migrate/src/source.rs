//! Migration files on disk.
//!
//! A migration directory holds pairs of plain SQL files named
//! `<version>_<name>.up.sql` and `<version>_<name>.down.sql`, where the version
//! is a numeric timestamp. Directory listings come back in no particular order,
//! so callers sort explicitly with [`sort_ascending`] or [`sort_descending`].

use std::{
    fmt, fs,
    path::{Path, PathBuf},
    sync::OnceLock,
};

use itertools::Itertools;
use regex::Regex;
use time::{macros::format_description, OffsetDateTime};

use crate::Error;

/// Whether a file applies or reverts a migration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Up,
    Down,
}

impl Direction {
    /// The file name suffix of this direction.
    #[must_use]
    pub fn suffix(self) -> &'static str {
        match self {
            Direction::Up => ".up.sql",
            Direction::Down => ".down.sql",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Up => f.write_str("up"),
            Direction::Down => f.write_str("down"),
        }
    }
}

/// A single parsed migration file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationFile {
    pub version: u64,
    pub name: String,
    pub direction: Direction,
    pub path: PathBuf,
}

impl MigrationFile {
    /// The file name without the direction suffix, e.g. `20240101000000_init`.
    #[must_use]
    pub fn id(&self) -> String {
        self.path
            .file_name()
            .and_then(|name| name.to_str())
            .and_then(|name| name.strip_suffix(self.direction.suffix()))
            .map_or_else(|| format!("{}_{}", self.version, self.name), str::to_string)
    }

    /// Read the SQL contents of the file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read.
    pub fn read(&self) -> Result<String, Error> {
        fs::read_to_string(&self.path).map_err(|err| Error::io(&self.path, err))
    }
}

/// The result of scanning a migration directory.
#[derive(Debug, Default, Clone)]
pub struct MigrationScan {
    /// Files that parsed, in directory order.
    pub files: Vec<MigrationFile>,
    /// Files with the right suffix whose version prefix is not a number.
    pub skipped: Vec<PathBuf>,
}

/// Parse `<version>_<name><suffix>` into a version and a name.
///
/// Returns `None` if the suffix does not match or the leading token
/// is not an unsigned integer.
#[must_use]
pub fn parse_file_name(file_name: &str, direction: Direction) -> Option<(u64, String)> {
    let stem = file_name.strip_suffix(direction.suffix())?;

    let (prefix, name) = match stem.split_once('_') {
        Some((prefix, name)) => (prefix, name),
        None => (stem, ""),
    };

    if prefix.is_empty() || !prefix.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }

    let version = prefix.parse().ok()?;

    Some((version, name.to_string()))
}

/// Scan a directory non-recursively for migrations of the given direction.
///
/// A missing directory scans as empty. Files with the right suffix but
/// a non-numeric version are reported in [`MigrationScan::skipped`].
///
/// # Errors
///
/// Returns an error if the directory cannot be read, or if two files
/// share the same version.
pub fn scan(dir: &Path, direction: Direction) -> Result<MigrationScan, Error> {
    let mut scan = MigrationScan::default();

    if !dir.exists() {
        return Ok(scan);
    }

    for entry in fs::read_dir(dir).map_err(|err| Error::io(dir, err))? {
        let entry = entry.map_err(|err| Error::io(dir, err))?;
        let path = entry.path();

        if path.is_dir() {
            continue;
        }

        let file_name = entry.file_name();
        let Some(file_name) = file_name.to_str() else {
            tracing::warn!(path = ?path, "ignoring migration file with a non UTF-8 name");
            continue;
        };

        if !file_name.ends_with(direction.suffix()) {
            continue;
        }

        match parse_file_name(file_name, direction) {
            Some((version, name)) => scan.files.push(MigrationFile {
                version,
                name,
                direction,
                path,
            }),
            None => {
                tracing::warn!(
                    path = ?path,
                    "migration file name does not start with a numeric version, skipping"
                );
                scan.skipped.push(path);
            }
        }
    }

    if let Some(duplicate) = scan.files.iter().duplicates_by(|f| f.version).next() {
        return Err(Error::DuplicateVersion {
            version: duplicate.version,
        });
    }

    Ok(scan)
}

/// List all `*.up.sql` migrations in the directory.
///
/// # Errors
///
/// See [`scan`].
pub fn list_up_files(dir: &Path) -> Result<Vec<MigrationFile>, Error> {
    scan(dir, Direction::Up).map(|scan| scan.files)
}

/// List all `*.down.sql` migrations in the directory.
///
/// # Errors
///
/// See [`scan`].
pub fn list_down_files(dir: &Path) -> Result<Vec<MigrationFile>, Error> {
    scan(dir, Direction::Down).map(|scan| scan.files)
}

/// Count every `*.sql` file in the directory, regardless of its name.
///
/// # Errors
///
/// Returns an error if the directory exists but cannot be read.
pub fn count_sql_files(dir: &Path) -> Result<usize, Error> {
    if !dir.exists() {
        return Ok(0);
    }

    let mut count = 0;

    for entry in fs::read_dir(dir).map_err(|err| Error::io(dir, err))? {
        let entry = entry.map_err(|err| Error::io(dir, err))?;
        if entry.path().is_file() && entry.file_name().to_string_lossy().ends_with(".sql") {
            count += 1;
        }
    }

    Ok(count)
}

pub fn sort_ascending(files: &mut [MigrationFile]) {
    files.sort_by_key(|f| f.version);
}

pub fn sort_descending(files: &mut [MigrationFile]) {
    files.sort_by_key(|f| std::cmp::Reverse(f.version));
}

/// Find the down file for each of the given up migrations, in the same order.
///
/// # Errors
///
/// [`Error::MissingDownFile`] for the first migration without a down file
/// of the same version and name.
pub fn check_pairs<'a>(
    up: &[&MigrationFile],
    down: &'a [MigrationFile],
) -> Result<Vec<&'a MigrationFile>, Error> {
    up.iter()
        .map(|mig| {
            down.iter()
                .find(|d| d.version == mig.version && d.name == mig.name)
                .ok_or_else(|| Error::MissingDownFile {
                    version: mig.version,
                    name: mig.name.clone(),
                })
        })
        .collect()
}

/// Paths of a newly scaffolded migration pair.
#[derive(Debug, Clone)]
pub struct CreatedMigration {
    pub version: u64,
    pub up: PathBuf,
    pub down: PathBuf,
}

fn name_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new("^[A-Za-z_][A-Za-z0-9_]*$").expect("valid regex"))
}

/// Scaffold an empty up/down pair stamped with `now`.
///
/// The migrations directory is created if it does not exist.
///
/// # Errors
///
/// The name must be a valid identifier, and neither file may exist yet.
pub fn create(dir: &Path, name: &str, now: OffsetDateTime) -> Result<CreatedMigration, Error> {
    if !name_regex().is_match(name) {
        return Err(Error::InvalidMigrationName(name.to_string()));
    }

    let stamp = now.format(format_description!(
        "[year][month][day][hour][minute][second]"
    ))?;
    let created_at = now.format(format_description!(
        "[year]-[month]-[day] [hour]:[minute]:[second]"
    ))?;

    let version = stamp
        .parse()
        .map_err(|_| Error::InvalidMigrationName(stamp.clone()))?;

    fs::create_dir_all(dir).map_err(|err| Error::io(dir, err))?;

    let up = dir.join(format!("{stamp}_{name}{}", Direction::Up.suffix()));
    let down = dir.join(format!("{stamp}_{name}{}", Direction::Down.suffix()));

    for path in [&up, &down] {
        if path.exists() {
            return Err(Error::MigrationExists { path: path.clone() });
        }
    }

    fs::write(
        &up,
        format!(
            "-- Migration: {name}\n-- Created at: {created_at}\n\n-- Write your up migration here\n"
        ),
    )
    .map_err(|err| Error::io(&up, err))?;

    fs::write(
        &down,
        format!(
            "-- Rollback: {name}\n-- Created at: {created_at}\n\n-- Write your down migration here\n"
        ),
    )
    .map_err(|err| Error::io(&down, err))?;

    tracing::info!(version, name, "created migration");

    Ok(CreatedMigration { version, up, down })
}

/// Whether the script contains anything besides whitespace and `--` comments.
#[must_use]
pub fn is_blank_script(sql: &str) -> bool {
    sql.lines()
        .map(str::trim)
        .all(|line| line.is_empty() || line.starts_with("--"))
}
