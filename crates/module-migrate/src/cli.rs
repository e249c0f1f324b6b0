use crate::{
    config::{self, ModuleConfig},
    report::{self, PendingOutcome, PendingReport, StatusReport},
    runner::{self, RunReport},
    source::{self, CreatedMigration, Direction},
    Engine, Error,
};
use clap::Parser;
use comfy_table::{Cell, CellAlignment, ContentArrangement, Table};
use sqlx::PgConnection;
use std::{future::Future, io, path::PathBuf, process};
use time::OffsetDateTime;
use tracing::Instrument;
use tracing_subscriber::{
    fmt::format::FmtSpan, prelude::__tracing_subscriber_SubscriberExt, util::SubscriberInitExt,
    EnvFilter,
};

/// Manage the database migrations of every module.
#[derive(Debug, clap::Parser)]
#[command(name = "migrate", version)]
pub struct Migrate {
    /// Disable colors in messages.
    #[arg(long, global = true)]
    no_colors: bool,
    /// Enable the logging of tracing spans.
    #[arg(long, global = true)]
    verbose: bool,
    /// Log all SQL statements.
    #[arg(long, global = true)]
    log_statements: bool,
    /// Exit with an error if a migration state is dirty.
    #[arg(long, global = true)]
    fail_on_dirty: bool,
    /// The directory that contains one directory per module.
    #[arg(long, env = "MODULES_DIR", default_value = "modules", global = true)]
    modules_dir: PathBuf,
    #[command(subcommand)]
    operation: Operation,
}

#[derive(Debug, clap::Subcommand)]
enum Operation {
    /// Apply all pending migrations.
    Up {
        #[command(flatten)]
        target: Target,
    },
    /// Revert the most recent migrations of a module.
    Down {
        /// The module to revert migrations of.
        #[arg(long, short)]
        module: String,
        /// Number of migrations to revert.
        #[arg(long, short, default_value_t = 1)]
        steps: u64,
    },
    /// Add an empty up and down migration pair to a module.
    #[command(visible_aliases = ["new"])]
    Create {
        /// The module to add the migration to.
        #[arg(long, short)]
        module: String,
        /// The name of the migration.
        #[arg(long, short)]
        name: String,
    },
    /// Show the applied migration version of a module.
    Status {
        /// The module to inspect.
        #[arg(long, short)]
        module: String,
    },
    /// List migrations that have not been applied yet.
    Pending {
        #[command(flatten)]
        target: Target,
    },
}

#[derive(Debug, Clone, clap::Args)]
#[group(required = true, multiple = false)]
struct Target {
    /// A single module.
    #[arg(long, short)]
    module: Option<String>,
    /// Every module with a configuration file.
    #[arg(long, short)]
    all: bool,
}

/// How a single module operation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Finished {
    Clean,
    Dirty,
}

/// Run the migration CLI.
///
/// # Panics
///
/// This function assumes that it has control over the entire application.
///
/// It will happily alter global state (tracing), or terminate the process.
pub fn run() {
    // Load `.env` before parsing so that it can provide `MODULES_DIR`.
    let dotenv = dotenv::dotenv();

    let migrate = Migrate::parse();
    setup_logging(&migrate);

    if let Err(err) = dotenv {
        tracing::debug!(error = %err, "no .env file loaded");
    }

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(error) => {
            tracing::error!(error = %error, "failed to start the runtime");
            process::exit(1);
        }
    };

    let code = runtime.block_on(execute(&migrate));
    process::exit(code);
}

async fn execute(migrate: &Migrate) -> i32 {
    match &migrate.operation {
        Operation::Up { target } => {
            for_target(migrate, target, "applying migrations", |module| async move {
                up(migrate, &module).await
            })
            .await
        }
        Operation::Pending { target } => {
            for_target(migrate, target, "listing pending migrations", |module| async move {
                pending(migrate, &module).await
            })
            .await
        }
        Operation::Down { module, steps } => {
            let res = down(migrate, module, *steps)
                .instrument(tracing::info_span!("module", module = %module))
                .await;
            finish(migrate, module, "error reverting migrations", res)
        }
        Operation::Create { module, name } => {
            let res = create(migrate, module, name).map(|_| Finished::Clean);
            finish(migrate, module, "error creating migration", res)
        }
        Operation::Status { module } => {
            let res = status(migrate, module)
                .instrument(tracing::info_span!("module", module = %module))
                .await;
            finish(migrate, module, "error retrieving migration status", res)
        }
    }
}

/// Run an operation for one module or for all of them.
///
/// With `--all`, a failing module is logged and the remaining ones still run.
async fn for_target<F, Fut>(migrate: &Migrate, target: &Target, action: &str, op: F) -> i32
where
    F: Fn(String) -> Fut,
    Fut: Future<Output = Result<Finished, Error>>,
{
    if let Some(module) = &target.module {
        let res = op(module.clone())
            .instrument(tracing::info_span!("module", module = %module))
            .await;
        return finish(migrate, module, &format!("error {action}"), res);
    }

    let modules = match config::available_modules(&migrate.modules_dir) {
        Ok(m) => m,
        Err(error) => {
            tracing::error!(error = %error, "failed to list modules");
            return 1;
        }
    };

    let mut failed = 0;
    let mut dirty = 0;

    tracing::info!(count = modules.len(), "{action} for all modules");

    for module in &modules {
        println!("\n== module: {module}");

        let res = op(module.clone())
            .instrument(tracing::info_span!("module", module = %module))
            .await;

        match res {
            Ok(Finished::Clean) => {}
            Ok(Finished::Dirty) => dirty += 1,
            Err(error) => {
                tracing::error!(module = %module, error = %error, "error {action}, skipping module");
                failed += 1;
            }
        }
    }

    if failed > 0 {
        tracing::error!(failed, total = modules.len(), "some modules failed");
        1
    } else if dirty > 0 && migrate.fail_on_dirty {
        1
    } else {
        0
    }
}

fn finish(migrate: &Migrate, module: &str, message: &str, res: Result<Finished, Error>) -> i32 {
    match res {
        Ok(Finished::Clean) => 0,
        Ok(Finished::Dirty) => i32::from(migrate.fail_on_dirty),
        Err(error) => {
            tracing::error!(module, error = %error, "{message}");
            1
        }
    }
}

fn load_config(migrate: &Migrate, module: &str) -> Result<ModuleConfig, Error> {
    let config = ModuleConfig::load(&migrate.modules_dir, module)?;
    tracing::debug!(
        module,
        migrations = ?config.migration_path(),
        table = %config.migration_table(),
        "resolved module"
    );
    Ok(config)
}

async fn open(migrate: &Migrate, config: &ModuleConfig) -> Result<Engine<PgConnection>, Error> {
    tracing::info!(module = %config.module.name, url = %config.database_url(), "connecting");
    Engine::open_module(config, migrate.log_statements).await
}

async fn up(migrate: &Migrate, module: &str) -> Result<Finished, Error> {
    let config = load_config(migrate, module)?;

    if !config.module.enabled {
        tracing::info!(module, "module is disabled, skipping");
        return Ok(Finished::Clean);
    }

    let path = config.migration_path();
    println!("migration path: {}", path.display());

    std::fs::create_dir_all(&path).map_err(|err| Error::Io {
        path: path.clone(),
        source: err,
    })?;

    let mut engine = open(migrate, &config).await?;
    let res = runner::up(&mut engine).await;
    let closed = engine.close().await;

    let report = res?;
    closed?;

    print_run_report(&report);

    Ok(if report.is_dirty() {
        Finished::Dirty
    } else {
        Finished::Clean
    })
}

async fn down(migrate: &Migrate, module: &str, steps: u64) -> Result<Finished, Error> {
    let config = load_config(migrate, module)?;

    println!("migration path: {}", config.migration_path().display());
    println!("steps to roll back: {steps}");

    let mut engine = open(migrate, &config).await?;
    let res = runner::down(&mut engine, steps).await;
    let closed = engine.close().await;

    let report = res?;
    closed?;

    print_run_report(&report);

    Ok(if report.is_dirty() {
        Finished::Dirty
    } else {
        Finished::Clean
    })
}

fn create(migrate: &Migrate, module: &str, name: &str) -> Result<CreatedMigration, Error> {
    let config = load_config(migrate, module)?;
    let created = source::create(&config.migration_path(), name, OffsetDateTime::now_utc())?;

    println!("created {}", created.up.display());
    println!("created {}", created.down.display());

    Ok(created)
}

async fn status(migrate: &Migrate, module: &str) -> Result<Finished, Error> {
    let config = load_config(migrate, module)?;

    println!("migration path: {}", config.migration_path().display());

    let mut engine = open(migrate, &config).await?;
    let res = report::status(&mut engine).await;
    let closed = engine.close().await;

    let status = res?;
    closed?;

    print_status(&status);

    Ok(if status.is_dirty() {
        Finished::Dirty
    } else {
        Finished::Clean
    })
}

async fn pending(migrate: &Migrate, module: &str) -> Result<Finished, Error> {
    let config = load_config(migrate, module)?;
    let path = config.migration_path();

    // No files means nothing to compare, so do not connect at all.
    let scan = source::scan(&path, Direction::Up)?;
    let state = if scan.files.is_empty() {
        None
    } else {
        let mut engine = open(migrate, &config).await?;
        let res = engine.current_version().await;
        let closed = engine.close().await;

        let state = res?;
        closed?;
        state
    };

    let report = report::reconcile(scan, state);

    print_pending(module, &report);

    Ok(if report.is_dirty() {
        Finished::Dirty
    } else {
        Finished::Clean
    })
}

fn centered(content: impl ToString) -> Cell {
    Cell::new(content).set_alignment(CellAlignment::Center)
}

fn print_run_report(report: &RunReport) {
    println!("{report}");

    if report.changed.is_empty() {
        return;
    }

    let mut table = Table::new();

    table
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(Vec::from([
            centered("Old Version"),
            centered("New Version"),
            centered(match report.direction {
                Direction::Up => "Applied Migrations",
                Direction::Down => "Reverted Migrations",
            }),
        ]));

    let version = |state: Option<crate::MigrationState>| {
        state.map_or_else(String::new, |s| s.version.to_string())
    };

    for (idx, name) in report.changed.iter().enumerate() {
        if idx == 0 {
            table.add_row(Vec::from([
                centered(version(report.before)),
                centered(version(report.after)),
                Cell::new(name),
            ]));
        } else {
            table.add_row(Vec::from([centered(""), centered(""), Cell::new(name)]));
        }
    }

    println!("{table}");
}

fn print_status(status: &StatusReport) {
    println!("migration files: {}", status.files);
    println!("{status}");
}

fn print_pending(module: &str, report: &PendingReport) {
    for path in &report.skipped {
        println!("warning: ignored {} (no numeric version)", path.display());
    }

    match &report.outcome {
        PendingOutcome::NoFiles => {
            println!("no migrations in module {module}");
            return;
        }
        PendingOutcome::Dirty { .. } => {
            println!("migration files: {}", report.total);
            println!("{report}");
            return;
        }
        PendingOutcome::Pending { current, .. } => {
            println!("migration files: {}", report.total);
            if let Some(current) = current {
                println!("current applied version: {current}");
            }
        }
    }

    println!("{report}");

    if let PendingOutcome::Pending { files, .. } = &report.outcome {
        if files.is_empty() {
            return;
        }

        let mut table = Table::new();

        table
            .set_content_arrangement(ContentArrangement::Dynamic)
            .set_header(Vec::from([centered("Version"), centered("Name")]));

        for file in files {
            table.add_row(Vec::from([centered(file.version), Cell::new(file.id())]));
        }

        println!("{table}");
        println!("pending migrations: {}", report.count());
    }
}

fn setup_logging(migrate: &Migrate) {
    let format = tracing_subscriber::fmt::format().with_ansi(colors(migrate));

    let verbose = migrate.verbose;

    let span_events = if verbose {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    let registry = tracing_subscriber::registry();

    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(f) => f,
        Err(_) => EnvFilter::default().add_directive(tracing::Level::INFO.into()),
    };

    if verbose {
        registry
            .with(env_filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(io::stderr)
                    .with_span_events(span_events)
                    .event_format(format.pretty()),
            )
            .init();
    } else {
        registry
            .with(env_filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(io::stderr)
                    .with_span_events(span_events)
                    .event_format(format),
            )
            .init();
    }
}

fn colors(matches: &Migrate) -> bool {
    if matches.no_colors {
        return false;
    }

    atty::is(atty::Stream::Stdout)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use std::{cell::RefCell, fs, path::Path};
    use tempfile::TempDir;

    fn modules(configs: &[(&str, &str)]) -> TempDir {
        let dir = TempDir::new().unwrap();
        for (name, config) in configs {
            fs::create_dir(dir.path().join(name)).unwrap();
            fs::write(dir.path().join(name).join("config.yaml"), config).unwrap();
        }
        dir
    }

    fn parse(dir: &Path, args: &[&str]) -> Migrate {
        let modules_dir = dir.display().to_string();
        let mut argv = vec!["migrate", "--modules-dir", modules_dir.as_str()];
        argv.extend_from_slice(args);
        Migrate::try_parse_from(argv).unwrap()
    }

    fn target(migrate: &Migrate) -> &Target {
        match &migrate.operation {
            Operation::Up { target } | Operation::Pending { target } => target,
            other => panic!("unexpected operation: {other:?}"),
        }
    }

    fn outcome(module: &str) -> Result<Finished, Error> {
        match module {
            "broken" => Err(Error::InvalidConfig("broken module".into())),
            "dirty" => Ok(Finished::Dirty),
            _ => Ok(Finished::Clean),
        }
    }

    async fn run_all(migrate: &Migrate) -> (Vec<String>, i32) {
        let seen = RefCell::new(Vec::new());
        let code = for_target(migrate, target(migrate), "applying migrations", |module| {
            seen.borrow_mut().push(module.clone());
            let res = outcome(&module);
            async move { res }
        })
        .await;
        (seen.into_inner(), code)
    }

    #[tokio::test]
    async fn all_modules_run_after_a_failure() {
        let dir = modules(&[("broken", ""), ("dirty", ""), ("fine", "")]);

        let (seen, code) = run_all(&parse(dir.path(), &["up", "--all"])).await;

        assert_eq!(seen, ["broken", "dirty", "fine"]);
        assert_eq!(code, 1);
    }

    #[tokio::test]
    async fn dirty_modules_fail_only_when_asked() {
        let dir = modules(&[("dirty", ""), ("fine", "")]);

        let (seen, code) = run_all(&parse(dir.path(), &["pending", "--all"])).await;
        assert_eq!(seen, ["dirty", "fine"]);
        assert_eq!(code, 0);

        let (_, code) = run_all(&parse(dir.path(), &["--fail-on-dirty", "up", "--all"])).await;
        assert_eq!(code, 1);
    }

    #[tokio::test]
    async fn single_module_target() {
        let dir = modules(&[("broken", ""), ("fine", "")]);

        let (seen, code) = run_all(&parse(dir.path(), &["up", "-m", "fine"])).await;
        assert_eq!(seen, ["fine"]);
        assert_eq!(code, 0);

        let (seen, code) = run_all(&parse(dir.path(), &["up", "-m", "broken"])).await;
        assert_eq!(seen, ["broken"]);
        assert_eq!(code, 1);
    }

    #[tokio::test]
    async fn missing_modules_dir_fails() {
        let dir = TempDir::new().unwrap();

        let (seen, code) = run_all(&parse(&dir.path().join("nope"), &["up", "--all"])).await;
        assert!(seen.is_empty());
        assert_eq!(code, 1);
    }

    #[test]
    fn exit_codes() {
        let dir = TempDir::new().unwrap();
        let migrate = parse(dir.path(), &["status", "-m", "book"]);
        let strict = parse(dir.path(), &["--fail-on-dirty", "status", "-m", "book"]);

        assert_eq!(finish(&migrate, "book", "failed", Ok(Finished::Clean)), 0);
        assert_eq!(finish(&migrate, "book", "failed", Ok(Finished::Dirty)), 0);
        assert_eq!(finish(&strict, "book", "failed", Ok(Finished::Clean)), 0);
        assert_eq!(finish(&strict, "book", "failed", Ok(Finished::Dirty)), 1);
        assert_eq!(finish(&migrate, "book", "failed", outcome("broken")), 1);
    }

    #[tokio::test]
    async fn pending_without_files_does_not_connect() {
        let config = "database:\n  connection:\n    host: unreachable.invalid\n    port: 1\n";
        let dir = modules(&[("book", config)]);
        let migrate = parse(dir.path(), &["pending", "-m", "book"]);

        assert_eq!(pending(&migrate, "book").await.unwrap(), Finished::Clean);
    }

    #[tokio::test]
    async fn up_skips_disabled_modules() {
        let dir = modules(&[("book", "module:\n  enabled: false\n")]);
        let migrate = parse(dir.path(), &["up", "-m", "book"]);

        // Returns before connecting, so no database is needed.
        let finished = up(&migrate, "book").await.unwrap();

        assert_eq!(finished, Finished::Clean);
        assert!(!dir.path().join("book").join("migrations").exists());
    }

    #[test]
    fn command_tree_is_valid() {
        Migrate::command().debug_assert();
    }

    #[test]
    fn parses_operations() {
        let m = Migrate::try_parse_from(["migrate", "down", "-m", "book"]).unwrap();
        assert!(matches!(m.operation, Operation::Down { ref module, steps: 1 } if module == "book"));

        let m = Migrate::try_parse_from(["migrate", "up", "--all"]).unwrap();
        assert!(matches!(m.operation, Operation::Up { target: Target { module: None, all: true } }));

        let m = Migrate::try_parse_from([
            "migrate", "create", "--module", "book", "--name", "add_index",
        ])
        .unwrap();
        assert!(matches!(m.operation, Operation::Create { ref name, .. } if name == "add_index"));
    }

    #[test]
    fn target_is_required_and_exclusive() {
        assert!(Migrate::try_parse_from(["migrate", "up"]).is_err());
        assert!(Migrate::try_parse_from(["migrate", "pending", "-m", "book", "--all"]).is_err());
        assert!(Migrate::try_parse_from(["migrate", "status"]).is_err());
    }
}
