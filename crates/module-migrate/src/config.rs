//! Per-module configuration.
//!
//! Every module lives in `<modules_dir>/<name>/` and is configured by a
//! `config.yaml` next to its code. Any scalar value may reference the
//! environment with `${VAR}` or `${VAR:default}`.

use std::{
    fs,
    path::{Path, PathBuf},
    sync::OnceLock,
    time::Duration,
};

use regex::{Captures, Regex};
use serde::Deserialize;

use crate::{Error, DEFAULT_MIGRATIONS_TABLE};

/// The file name of a module configuration.
pub const CONFIG_FILE: &str = "config.yaml";

const DEFAULT_PORT: u16 = 5432;
const DEFAULT_MAX_OPEN_CONNS: u32 = 10;
const DEFAULT_MAX_IDLE_CONNS: u32 = 2;
const DEFAULT_SSL_MODE: &str = "disable";

/// A YAML scalar that is kept as text until placeholders are expanded.
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(try_from = "serde_yaml::Value")]
struct Scalar(String);

impl TryFrom<serde_yaml::Value> for Scalar {
    type Error = String;

    fn try_from(value: serde_yaml::Value) -> Result<Self, Self::Error> {
        match value {
            serde_yaml::Value::Null => Ok(Self(String::new())),
            serde_yaml::Value::Bool(b) => Ok(Self(b.to_string())),
            serde_yaml::Value::Number(n) => Ok(Self(n.to_string())),
            serde_yaml::Value::String(s) => Ok(Self(s)),
            other => Err(format!("expected a scalar value, found {other:?}")),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawModuleConfig {
    module: RawModule,
    database: RawDatabase,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawModule {
    name: Scalar,
    version: Scalar,
    enabled: Scalar,
    description: Scalar,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawDatabase {
    connection: RawConnection,
    migration: RawMigration,
    performance: RawPerformance,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawConnection {
    driver: Scalar,
    host: Scalar,
    port: Scalar,
    database: Scalar,
    username: Scalar,
    password: Scalar,
    schema: Scalar,
    auto_create: Scalar,
    ssl_mode: Scalar,
    timezone: Scalar,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawMigration {
    path: Scalar,
    table: Scalar,
    schema: Scalar,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawPerformance {
    max_open_conns: Scalar,
    max_idle_conns: Scalar,
    conn_max_lifetime: Scalar,
}

/// Configuration of a single module.
#[derive(Debug, Clone)]
pub struct ModuleConfig {
    pub module: ModuleInfo,
    pub database: DatabaseConfig,
    /// The directory of the module itself.
    pub root: PathBuf,
}

#[derive(Debug, Clone)]
pub struct ModuleInfo {
    pub name: String,
    pub version: String,
    pub enabled: bool,
    pub description: String,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub connection: ConnectionConfig,
    pub migration: MigrationConfig,
    pub performance: PerformanceConfig,
}

#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub driver: String,
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: String,
    pub password: String,
    pub schema: String,
    /// Create the schema on connect if it is missing.
    pub auto_create: bool,
    pub ssl_mode: String,
    pub timezone: String,
}

#[derive(Debug, Clone)]
pub struct MigrationConfig {
    /// Migrations directory, relative paths are relative to the working directory.
    pub path: Option<PathBuf>,
    pub table: String,
    pub schema: String,
}

#[derive(Debug, Clone)]
pub struct PerformanceConfig {
    pub max_open_conns: u32,
    pub max_idle_conns: u32,
    pub conn_max_lifetime: Option<Duration>,
}

fn placeholder_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::([^}]*))?\}").expect("valid regex")
    })
}

fn identifier_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new("^[A-Za-z_][A-Za-z0-9_]*$").expect("valid regex"))
}

/// Replace every `${VAR}` and `${VAR:default}` in `value`.
///
/// Unset and empty variables both resolve to the default,
/// or to an empty string without one.
pub fn interpolate(value: &str, lookup: impl Fn(&str) -> Option<String>) -> String {
    placeholder_regex()
        .replace_all(value, |caps: &Captures<'_>| {
            lookup(&caps[1])
                .filter(|v| !v.is_empty())
                .or_else(|| caps.get(2).map(|m| m.as_str().to_string()))
                .unwrap_or_default()
        })
        .into_owned()
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "t" | "true" | "yes" | "on" => Some(true),
        "0" | "f" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

impl ModuleConfig {
    /// Load `<modules_dir>/<module>/config.yaml`, expanding placeholders
    /// from the process environment.
    ///
    /// # Errors
    ///
    /// The file must exist, be valid YAML and describe a valid configuration.
    pub fn load(modules_dir: &Path, module: &str) -> Result<Self, Error> {
        let root = modules_dir.join(module);
        let path = root.join(CONFIG_FILE);

        if !path.is_file() {
            return Err(Error::ConfigNotFound { path });
        }

        let contents = fs::read_to_string(&path).map_err(|source| Error::ConfigRead {
            path: path.clone(),
            source,
        })?;

        let config = Self::from_yaml(&contents, &path, root, |var| std::env::var(var).ok())?;

        tracing::debug!(module = %config.module.name, path = ?path, "loaded module config");

        Ok(config)
    }

    /// Parse a module configuration from YAML.
    ///
    /// `path` is only used for error messages, `root` is the module directory.
    ///
    /// # Errors
    ///
    /// See [`ModuleConfig::load`].
    pub fn from_yaml(
        contents: &str,
        path: &Path,
        root: PathBuf,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, Error> {
        let raw: RawModuleConfig = if contents.trim().is_empty() {
            RawModuleConfig::default()
        } else {
            serde_yaml::from_str(contents).map_err(|source| Error::ConfigParse {
                path: path.to_path_buf(),
                source,
            })?
        };

        let expand = |s: &Scalar| interpolate(&s.0, &lookup);

        let name = match expand(&raw.module.name) {
            name if name.is_empty() => root
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            name => name,
        };

        let conn = &raw.database.connection;
        let connection = ConnectionConfig {
            driver: expand(&conn.driver),
            host: expand(&conn.host),
            port: expand(&conn.port).trim().parse().unwrap_or(DEFAULT_PORT),
            database: expand(&conn.database),
            username: expand(&conn.username),
            password: expand(&conn.password),
            schema: expand(&conn.schema),
            auto_create: parse_bool(&expand(&conn.auto_create)).unwrap_or(true),
            ssl_mode: match expand(&conn.ssl_mode) {
                mode if mode.is_empty() => DEFAULT_SSL_MODE.to_string(),
                mode => mode,
            },
            timezone: expand(&conn.timezone),
        };

        let mig = &raw.database.migration;
        let migration = MigrationConfig {
            path: Some(expand(&mig.path))
                .filter(|p| !p.is_empty())
                .map(PathBuf::from),
            table: match expand(&mig.table) {
                table if table.is_empty() => DEFAULT_MIGRATIONS_TABLE.to_string(),
                table => table,
            },
            schema: expand(&mig.schema),
        };

        let perf = &raw.database.performance;
        let lifetime = expand(&perf.conn_max_lifetime);
        let performance = PerformanceConfig {
            max_open_conns: expand(&perf.max_open_conns)
                .trim()
                .parse()
                .unwrap_or(DEFAULT_MAX_OPEN_CONNS),
            max_idle_conns: expand(&perf.max_idle_conns)
                .trim()
                .parse()
                .unwrap_or(DEFAULT_MAX_IDLE_CONNS),
            conn_max_lifetime: if lifetime.is_empty() {
                None
            } else {
                humantime::parse_duration(&lifetime).ok()
            },
        };

        let config = Self {
            module: ModuleInfo {
                name,
                version: expand(&raw.module.version),
                enabled: parse_bool(&expand(&raw.module.enabled)).unwrap_or(true),
                description: expand(&raw.module.description),
            },
            database: DatabaseConfig {
                connection,
                migration,
                performance,
            },
            root,
        };

        config.validate()?;

        Ok(config)
    }

    fn validate(&self) -> Result<(), Error> {
        let migration = &self.database.migration;

        match self.database.connection.driver.as_str() {
            "" | "postgres" | "postgresql" => {}
            driver => {
                return Err(Error::InvalidConfig(format!(
                    "unsupported database driver `{driver}`, only postgres is supported"
                )))
            }
        }

        if !identifier_regex().is_match(&migration.table) {
            return Err(Error::InvalidConfig(format!(
                "invalid migration table name `{}`",
                migration.table
            )));
        }

        for schema in [&migration.schema, &self.database.connection.schema] {
            if !schema.is_empty() && !identifier_regex().is_match(schema) {
                return Err(Error::InvalidConfig(format!(
                    "invalid schema name `{schema}`"
                )));
            }
        }

        Ok(())
    }

    /// The migrations directory, `<module>/migrations` if none is configured.
    #[must_use]
    pub fn migration_path(&self) -> PathBuf {
        self.database
            .migration
            .path
            .clone()
            .unwrap_or_else(|| self.root.join("migrations"))
    }

    /// The bookkeeping table, qualified with the migration schema if one is set.
    #[must_use]
    pub fn migration_table(&self) -> String {
        let migration = &self.database.migration;
        if migration.schema.is_empty() {
            migration.table.clone()
        } else {
            format!("{}.{}", migration.schema, migration.table)
        }
    }

    /// A connection URL for display purposes, the password is redacted.
    #[must_use]
    pub fn database_url(&self) -> String {
        let c = &self.database.connection;
        let mut url = format!(
            "postgresql://{}:***@{}:{}/{}?sslmode={}",
            c.username, c.host, c.port, c.database, c.ssl_mode
        );
        if !c.schema.is_empty() {
            url.push_str("&search_path=");
            url.push_str(&c.schema);
        }
        url
    }

    /// Connection options for the module's database.
    ///
    /// # Errors
    ///
    /// The SSL mode must be one understood by PostgreSQL.
    #[cfg(feature = "postgres")]
    pub fn connect_options(&self) -> Result<sqlx::postgres::PgConnectOptions, Error> {
        use sqlx::postgres::{PgConnectOptions, PgSslMode};

        let c = &self.database.connection;

        let ssl_mode: PgSslMode = c.ssl_mode.parse().map_err(|_| {
            Error::InvalidConfig(format!("invalid ssl_mode `{}`", c.ssl_mode))
        })?;

        let mut options = PgConnectOptions::new()
            .host(&c.host)
            .port(c.port)
            .username(&c.username)
            .password(&c.password)
            .database(&c.database)
            .ssl_mode(ssl_mode);

        if !c.schema.is_empty() {
            options = options.options([("search_path", c.schema.as_str())]);
        }

        if !c.timezone.is_empty() {
            options = options.options([("timezone", c.timezone.as_str())]);
        }

        Ok(options)
    }
}

/// List the modules in `modules_dir` that have a configuration file,
/// sorted by name.
///
/// # Errors
///
/// Returns an error if the directory cannot be read.
pub fn available_modules(modules_dir: &Path) -> Result<Vec<String>, Error> {
    let mut modules = Vec::new();

    for entry in fs::read_dir(modules_dir).map_err(|err| Error::io(modules_dir, err))? {
        let entry = entry.map_err(|err| Error::io(modules_dir, err))?;
        let path = entry.path();

        if path.is_dir() && path.join(CONFIG_FILE).is_file() {
            modules.push(entry.file_name().to_string_lossy().into_owned());
        }
    }

    modules.sort();

    Ok(modules)
}
