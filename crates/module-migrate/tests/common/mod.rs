#![allow(dead_code)]

use std::{cell::RefCell, fs, path::Path, rc::Rc};

use async_trait::async_trait;
use module_migrate::{db::VersionTable, Engine, MigrationState};
use tempfile::TempDir;

/// What the in-memory database saw.
#[derive(Debug, Default)]
pub struct Shared {
    pub tables: Vec<String>,
    pub state: Option<MigrationState>,
    pub executed: Vec<String>,
    /// Scripts containing this text fail.
    pub fail_on: Option<String>,
    pub locked: bool,
    pub lock_count: usize,
    pub closed: bool,
}

/// A connection that keeps the bookkeeping row in memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryConnection {
    pub shared: Rc<RefCell<Shared>>,
}

impl MemoryConnection {
    pub fn with_state(state: Option<MigrationState>) -> Self {
        let conn = Self::default();
        conn.shared.borrow_mut().state = state;
        conn
    }

    pub fn state(&self) -> Option<MigrationState> {
        self.shared.borrow().state
    }

    pub fn executed(&self) -> Vec<String> {
        self.shared.borrow().executed.clone()
    }
}

#[async_trait(?Send)]
impl VersionTable for MemoryConnection {
    async fn ensure_version_table(&mut self, table_name: &str) -> Result<(), sqlx::Error> {
        let mut shared = self.shared.borrow_mut();
        if !shared.tables.iter().any(|t| t == table_name) {
            shared.tables.push(table_name.to_string());
        }
        Ok(())
    }

    async fn lock(&mut self, _table_name: &str) -> Result<(), sqlx::Error> {
        let mut shared = self.shared.borrow_mut();
        assert!(!shared.locked, "lock acquired twice");
        shared.locked = true;
        shared.lock_count += 1;
        Ok(())
    }

    async fn unlock(&mut self, _table_name: &str) -> Result<(), sqlx::Error> {
        self.shared.borrow_mut().locked = false;
        Ok(())
    }

    async fn read_version(
        &mut self,
        _table_name: &str,
    ) -> Result<Option<MigrationState>, sqlx::Error> {
        Ok(self.shared.borrow().state)
    }

    async fn write_version(
        &mut self,
        _table_name: &str,
        state: Option<MigrationState>,
    ) -> Result<(), sqlx::Error> {
        self.shared.borrow_mut().state = state;
        Ok(())
    }

    async fn execute_script(&mut self, sql: &str) -> Result<(), sqlx::Error> {
        let mut shared = self.shared.borrow_mut();
        if let Some(fail_on) = &shared.fail_on {
            if sql.contains(fail_on.as_str()) {
                return Err(sqlx::Error::Protocol(format!("script failed: {fail_on}")));
            }
        }
        shared.executed.push(sql.trim().to_string());
        Ok(())
    }

    async fn close(self) -> Result<(), sqlx::Error> {
        self.shared.borrow_mut().closed = true;
        Ok(())
    }
}

/// Write an up/down pair whose scripts name the migration.
pub fn write_pair(dir: &Path, id: &str) {
    write_up(dir, id);
    write_down(dir, id);
}

pub fn write_up(dir: &Path, id: &str) {
    fs::write(dir.join(format!("{id}.up.sql")), format!("-- up\nUP {id};\n")).unwrap();
}

pub fn write_down(dir: &Path, id: &str) {
    fs::write(
        dir.join(format!("{id}.down.sql")),
        format!("-- down\nDOWN {id};\n"),
    )
    .unwrap();
}

/// A migrations directory holding the given pairs.
pub fn migrations(ids: &[&str]) -> TempDir {
    let dir = TempDir::new().unwrap();
    for id in ids {
        write_pair(dir.path(), id);
    }
    dir
}

pub async fn engine(dir: &Path, conn: &MemoryConnection) -> Engine<MemoryConnection> {
    Engine::new(conn.clone(), dir, "schema_migrations")
        .await
        .unwrap()
}

pub fn ids(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| (*s).to_string()).collect()
}
