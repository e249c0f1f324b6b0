use std::time::Duration;

use async_trait::async_trait;
use sqlx::{
    postgres::PgConnectOptions, query, query_as, query_scalar, ConnectOptions, Connection,
    Executor, PgConnection,
};

use super::MigrationState;

/// Open a connection for migration work.
///
/// Statement logging is disabled unless `log_statements` is set.
///
/// # Errors
///
/// An error is returned on connection failure.
pub async fn connect(
    options: &PgConnectOptions,
    log_statements: bool,
) -> Result<PgConnection, sqlx::Error> {
    let options = if log_statements {
        let info = "INFO".parse();
        let warn = "WARN".parse();
        match (info, warn) {
            (Ok(info), Ok(warn)) => options
                .clone()
                .log_statements(info)
                .log_slow_statements(warn, Duration::from_secs(1)),
            _ => options.clone(),
        }
    } else {
        options.clone().disable_statement_logging()
    };

    let mut conn = PgConnection::connect_with(&options).await?;
    conn.execute(
        r#"--sql
        SET client_min_messages TO WARNING;
        "#,
    )
    .await?;

    Ok(conn)
}

/// Create the schema if it does not exist yet.
///
/// The schema name is used as-is, **DO NOT USE UNTRUSTED STRINGS**.
///
/// # Errors
///
/// Database errors are returned.
pub async fn ensure_schema(conn: &mut PgConnection, schema: &str) -> Result<(), sqlx::Error> {
    query(&format!("CREATE SCHEMA IF NOT EXISTS {schema}"))
        .execute(conn)
        .await?;
    Ok(())
}

#[async_trait(?Send)]
impl super::VersionTable for PgConnection {
    async fn ensure_version_table(&mut self, table_name: &str) -> Result<(), sqlx::Error> {
        query(&format!(
            r#"
                CREATE TABLE IF NOT EXISTS {table_name} (
                    version BIGINT NOT NULL PRIMARY KEY,
                    dirty BOOLEAN NOT NULL
                );
                "#,
        ))
        .execute(self)
        .await?;

        Ok(())
    }

    async fn lock(&mut self, table_name: &str) -> Result<(), sqlx::Error> {
        let lock_id = lock_id(self, table_name).await?;

        // create an application lock over the database
        // this function will not return until the lock is acquired

        // https://www.postgresql.org/docs/current/explicit-locking.html#ADVISORY-LOCKS
        // https://www.postgresql.org/docs/current/functions-admin.html#FUNCTIONS-ADVISORY-LOCKS-TABLE

        // language=SQL
        let _ = query("SELECT pg_advisory_lock($1)")
            .bind(lock_id)
            .execute(self)
            .await?;

        Ok(())
    }

    async fn unlock(&mut self, table_name: &str) -> Result<(), sqlx::Error> {
        let lock_id = lock_id(self, table_name).await?;

        // language=SQL
        let _ = query("SELECT pg_advisory_unlock($1)")
            .bind(lock_id)
            .execute(self)
            .await?;

        Ok(())
    }

    async fn read_version(
        &mut self,
        table_name: &str,
    ) -> Result<Option<MigrationState>, sqlx::Error> {
        let row: Option<(i64, bool)> = query_as(&format!(
            r#"
            SELECT
                version,
                dirty
            FROM
                {table_name}
            LIMIT 1
            "#,
        ))
        .fetch_optional(self)
        .await?;

        Ok(row.map(|(version, dirty)| MigrationState {
            version: version as u64,
            dirty,
        }))
    }

    async fn write_version(
        &mut self,
        table_name: &str,
        state: Option<MigrationState>,
    ) -> Result<(), sqlx::Error> {
        let mut tx = self.begin().await?;

        query(&format!("TRUNCATE {table_name}"))
            .execute(&mut *tx)
            .await?;

        if let Some(state) = state {
            query(&format!(
                r#"
                    INSERT INTO {table_name} ( version, dirty )
                    VALUES ( $1, $2 )
                "#,
            ))
            .bind(state.version as i64)
            .bind(state.dirty)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await
    }

    async fn execute_script(&mut self, sql: &str) -> Result<(), sqlx::Error> {
        // Unprepared so that scripts may hold several statements.
        (&mut *self).execute(sql).await?;
        Ok(())
    }

    async fn close(self) -> Result<(), sqlx::Error> {
        Connection::close(self).await
    }
}

async fn lock_id(conn: &mut PgConnection, table_name: &str) -> Result<i64, sqlx::Error> {
    let database_name: String = query_scalar("SELECT current_database()")
        .fetch_one(conn)
        .await?;

    Ok(generate_lock_id(&format!("{database_name}:{table_name}")))
}

// inspired from rails: https://github.com/rails/rails/blob/6e49cc77ab3d16c06e12f93158eaf3e507d4120e/activerecord/lib/active_record/migration.rb#L1308
fn generate_lock_id(key: &str) -> i64 {
    const CRC_IEEE: crc::Crc<u32> = crc::Crc::<u32>::new(&crc::CRC_32_ISO_HDLC);
    // 0x20871d5f chosen by fair dice roll
    0x20871d5f * (CRC_IEEE.checksum(key.as_bytes()) as i64)
}
