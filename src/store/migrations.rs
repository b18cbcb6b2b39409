//! Version-tracked schema migrations for the account store.
//!
//! `run_migrations()` reads the highest applied version from `_migrations`
//! and applies only the newer steps, in order.

use libsql::Connection;

use crate::error::DatabaseError;

struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// Ordered schema steps. Append only.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "mail_accounts",
        sql: r#"
            CREATE TABLE IF NOT EXISTS mail_accounts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user TEXT NOT NULL,
                protocol TEXT NOT NULL,
                host TEXT NOT NULL,
                mail_user TEXT NOT NULL,
                password TEXT NOT NULL,
                folder TEXT NOT NULL DEFAULT 'INBOX',
                last_uid INTEGER NOT NULL DEFAULT 0,
                mark_seen INTEGER NOT NULL DEFAULT 0,
                mark_deleted INTEGER NOT NULL DEFAULT 0,
                active INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );
            CREATE INDEX IF NOT EXISTS idx_mail_accounts_user ON mail_accounts(user);

            CREATE TABLE IF NOT EXISTS mail_filters (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                account_id INTEGER NOT NULL REFERENCES mail_accounts(id) ON DELETE CASCADE,
                position INTEGER NOT NULL,
                path TEXT NOT NULL,
                grouping INTEGER NOT NULL DEFAULT 0,
                active INTEGER NOT NULL DEFAULT 1
            );
            CREATE INDEX IF NOT EXISTS idx_mail_filters_account ON mail_filters(account_id);

            CREATE TABLE IF NOT EXISTS mail_filter_rules (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                filter_id INTEGER NOT NULL REFERENCES mail_filters(id) ON DELETE CASCADE,
                position INTEGER NOT NULL,
                field TEXT NOT NULL,
                operation TEXT NOT NULL,
                value TEXT NOT NULL,
                active INTEGER NOT NULL DEFAULT 1
            );
            CREATE INDEX IF NOT EXISTS idx_mail_filter_rules_filter ON mail_filter_rules(filter_id);
        "#,
    },
    Migration {
        version: 2,
        name: "import_error_ledger",
        sql: r#"
            CREATE TABLE IF NOT EXISTS mail_import_errors (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                account_id INTEGER NOT NULL REFERENCES mail_accounts(id) ON DELETE CASCADE,
                uid TEXT NOT NULL,
                subject TEXT NOT NULL,
                trace TEXT NOT NULL,
                created_at TEXT NOT NULL,
                UNIQUE (account_id, uid)
            );
            CREATE INDEX IF NOT EXISTS idx_mail_import_errors_account
                ON mail_import_errors(account_id);
        "#,
    },
];

const VERSION_TABLE: &str = "CREATE TABLE IF NOT EXISTS _migrations (
    version INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
)";

/// Bring the schema up to the newest version.
///
/// Each step runs in its own transaction together with its version row, so
/// an interrupted upgrade resumes at the failed step.
pub async fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute(VERSION_TABLE, ())
        .await
        .map_err(|e| DatabaseError::Migration(format!("version table: {e}")))?;

    let applied = applied_version(conn).await?;
    let pending: Vec<&Migration> = MIGRATIONS.iter().filter(|m| m.version > applied).collect();
    if pending.is_empty() {
        tracing::debug!(version = applied, "Account schema up to date");
        return Ok(());
    }

    for step in pending {
        tracing::info!(version = step.version, name = step.name, "Upgrading account schema");
        apply(conn, step).await?;
    }
    Ok(())
}

async fn apply(conn: &Connection, step: &Migration) -> Result<(), DatabaseError> {
    let failed =
        |e: libsql::Error| DatabaseError::Migration(format!("V{} {}: {e}", step.version, step.name));

    let tx = conn.transaction().await.map_err(failed)?;
    tx.execute_batch(step.sql).await.map_err(failed)?;
    tx.execute(
        "INSERT INTO _migrations (version, name) VALUES (?1, ?2)",
        libsql::params![step.version, step.name],
    )
    .await
    .map_err(failed)?;
    tx.commit().await.map_err(failed)
}

/// Highest recorded version; 0 on a fresh database.
async fn applied_version(conn: &Connection) -> Result<i64, DatabaseError> {
    let failed = |e: libsql::Error| DatabaseError::Migration(format!("schema version: {e}"));
    let mut rows = conn
        .query("SELECT MAX(version) FROM _migrations", ())
        .await
        .map_err(failed)?;
    match rows.next().await.map_err(failed)? {
        Some(row) => Ok(row.get::<Option<i64>>(0).map_err(failed)?.unwrap_or(0)),
        None => Ok(0),
    }
}
