//! libSQL backend for [`AccountStore`].
//!
//! The import engine runs on blocking threads, so every trait method drives
//! libsql's async API to completion on the runtime captured when the store
//! was opened. Calling them from inside an async task would block that
//! worker; use `tokio::task::spawn_blocking`.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use secrecy::{ExposeSecret, SecretString};
use tokio::runtime::Handle;
use tracing::{debug, info};

use super::AccountStore;
use super::migrations;
use crate::account::{MailAccount, MailFilter, MailFilterRule, MailImportError, MailProtocol};
use crate::error::DatabaseError;

/// libSQL account store. Holds a single reused connection.
pub struct LibSqlAccountStore {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
    handle: Handle,
}

impl LibSqlAccountStore {
    /// Open (or create) a local database file and run migrations.
    pub async fn open(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;
        let store = Self::from_database(db).await?;
        info!(path = %path.display(), "Account database opened");
        Ok(store)
    }

    /// Create an in-memory database (for tests).
    pub async fn open_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;
        Self::from_database(db).await
    }

    async fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        migrations::run_migrations(&conn).await?;
        Ok(Self {
            db: Arc::new(db),
            conn,
            handle: Handle::current(),
        })
    }

    // ── Async operations ────────────────────────────────────────────

    async fn insert_async(&self, account: &MailAccount) -> Result<i64, DatabaseError> {
        let tx = self
            .conn
            .transaction()
            .await
            .map_err(|e| DatabaseError::Query(format!("Failed to begin transaction: {e}")))?;

        tx.execute(
            "INSERT INTO mail_accounts (user, protocol, host, mail_user, password, folder, last_uid, mark_seen, mark_deleted, active) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                account.user.as_str(),
                account.protocol.as_str(),
                account.host.as_str(),
                account.mail_user.as_str(),
                account.password.expose_secret(),
                account.folder.as_str(),
                i64::from(account.last_uid),
                account.mark_seen as i64,
                account.mark_deleted as i64,
                account.active as i64,
            ],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("Failed to insert mail account: {e}")))?;
        let account_id = tx.last_insert_rowid();

        for (position, filter) in account.filters.iter().enumerate() {
            tx.execute(
                "INSERT INTO mail_filters (account_id, position, path, grouping, active) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    account_id,
                    position as i64,
                    filter.path.as_str(),
                    filter.grouping as i64,
                    filter.active as i64,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("Failed to insert mail filter: {e}")))?;
            let filter_id = tx.last_insert_rowid();

            for (rule_position, rule) in filter.rules.iter().enumerate() {
                tx.execute(
                    "INSERT INTO mail_filter_rules (filter_id, position, field, operation, value, active) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        filter_id,
                        rule_position as i64,
                        rule.field.as_str(),
                        rule.operation.as_str(),
                        rule.value.as_str(),
                        rule.active as i64,
                    ],
                )
                .await
                .map_err(|e| DatabaseError::Query(format!("Failed to insert filter rule: {e}")))?;
            }
        }

        for error in &account.import_errors {
            insert_import_error(&tx, account_id, error).await?;
        }

        tx.commit()
            .await
            .map_err(|e| DatabaseError::Query(format!("Failed to commit mail account: {e}")))?;
        debug!(account = account_id, filters = account.filters.len(), "Mail account stored");
        Ok(account_id)
    }

    async fn load_async(&self, id: i64) -> Result<MailAccount, DatabaseError> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, user, protocol, host, mail_user, password, folder, last_uid, mark_seen, mark_deleted, active FROM mail_accounts WHERE id = ?1",
                params![id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("Failed to query mail account: {e}")))?;

        let row = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("Failed to read mail account: {e}")))?
            .ok_or_else(|| DatabaseError::NotFound {
                entity: "mail_account".into(),
                id: id.to_string(),
            })?;
        let mut account = row_to_account(&row)
            .map_err(|e| DatabaseError::Serialization(format!("Invalid mail account row: {e}")))?;

        account.filters = self.load_filters(id).await?;
        account.import_errors = self.load_import_errors(id).await?;
        Ok(account)
    }

    async fn load_filters(&self, account_id: i64) -> Result<Vec<MailFilter>, DatabaseError> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, path, grouping, active FROM mail_filters WHERE account_id = ?1 ORDER BY position",
                params![account_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("Failed to query mail filters: {e}")))?;

        let mut filters = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("Failed to read mail filter: {e}")))?
        {
            let filter = row_to_filter(&row)
                .map_err(|e| DatabaseError::Serialization(format!("Invalid mail filter row: {e}")))?;
            filters.push(filter);
        }

        for filter in &mut filters {
            filter.rules = self.load_rules(filter.id).await?;
        }
        Ok(filters)
    }

    async fn load_rules(&self, filter_id: i64) -> Result<Vec<MailFilterRule>, DatabaseError> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, field, operation, value, active FROM mail_filter_rules WHERE filter_id = ?1 ORDER BY position",
                params![filter_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("Failed to query filter rules: {e}")))?;

        let mut rules = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("Failed to read filter rule: {e}")))?
        {
            rules.push(row_to_rule(&row).map_err(|e| {
                DatabaseError::Serialization(format!("Invalid filter rule row: {e}"))
            })?);
        }
        Ok(rules)
    }

    async fn load_import_errors(
        &self,
        account_id: i64,
    ) -> Result<Vec<MailImportError>, DatabaseError> {
        let mut rows = self
            .conn
            .query(
                "SELECT uid, subject, trace, created_at FROM mail_import_errors WHERE account_id = ?1 ORDER BY id",
                params![account_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("Failed to query import errors: {e}")))?;

        let mut errors = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("Failed to read import error: {e}")))?
        {
            let created: String = row
                .get(3)
                .map_err(|e| DatabaseError::Serialization(format!("Invalid import error row: {e}")))?;
            errors.push(MailImportError {
                uid: row.get(0).map_err(|e| {
                    DatabaseError::Serialization(format!("Invalid import error row: {e}"))
                })?,
                subject: row.get(1).map_err(|e| {
                    DatabaseError::Serialization(format!("Invalid import error row: {e}"))
                })?,
                trace: row.get(2).map_err(|e| {
                    DatabaseError::Serialization(format!("Invalid import error row: {e}"))
                })?,
                date: parse_datetime(&created),
            });
        }
        Ok(errors)
    }

    async fn update_async(&self, account: &MailAccount) -> Result<(), DatabaseError> {
        let changed = self
            .conn
            .execute(
                "UPDATE mail_accounts SET user = ?2, protocol = ?3, host = ?4, mail_user = ?5, password = ?6, folder = ?7, last_uid = ?8, mark_seen = ?9, mark_deleted = ?10, active = ?11, updated_at = ?12 WHERE id = ?1",
                params![
                    account.id,
                    account.user.as_str(),
                    account.protocol.as_str(),
                    account.host.as_str(),
                    account.mail_user.as_str(),
                    account.password.expose_secret(),
                    account.folder.as_str(),
                    i64::from(account.last_uid),
                    account.mark_seen as i64,
                    account.mark_deleted as i64,
                    account.active as i64,
                    Utc::now().to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("Failed to update mail account: {e}")))?;

        if changed == 0 {
            return Err(DatabaseError::NotFound {
                entity: "mail_account".into(),
                id: account.id.to_string(),
            });
        }

        for error in &account.import_errors {
            insert_import_error(&self.conn, account.id, error).await?;
        }
        Ok(())
    }

    async fn list_active_async(&self) -> Result<Vec<MailAccount>, DatabaseError> {
        let mut rows = self
            .conn
            .query("SELECT id FROM mail_accounts WHERE active = 1 ORDER BY id", ())
            .await
            .map_err(|e| DatabaseError::Query(format!("Failed to list mail accounts: {e}")))?;

        let mut ids = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("Failed to read mail account id: {e}")))?
        {
            ids.push(row.get::<i64>(0).map_err(|e| {
                DatabaseError::Serialization(format!("Invalid mail account id: {e}"))
            })?);
        }

        let mut accounts = Vec::with_capacity(ids.len());
        for id in ids {
            accounts.push(self.load_async(id).await?);
        }
        Ok(accounts)
    }
}

impl AccountStore for LibSqlAccountStore {
    fn insert(&self, account: &MailAccount) -> Result<i64, DatabaseError> {
        self.handle.block_on(self.insert_async(account))
    }

    fn load(&self, id: i64) -> Result<MailAccount, DatabaseError> {
        self.handle.block_on(self.load_async(id))
    }

    fn update(&self, account: &MailAccount) -> Result<(), DatabaseError> {
        self.handle.block_on(self.update_async(account))
    }

    fn list_active(&self) -> Result<Vec<MailAccount>, DatabaseError> {
        self.handle.block_on(self.list_active_async())
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Ledger rows are unique per account and UID; repeats are ignored.
async fn insert_import_error(
    conn: &Connection,
    account_id: i64,
    error: &MailImportError,
) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT OR IGNORE INTO mail_import_errors (account_id, uid, subject, trace, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            account_id,
            error.uid.as_str(),
            error.subject.as_str(),
            error.trace.as_str(),
            error.date.to_rfc3339(),
        ],
    )
    .await
    .map_err(|e| DatabaseError::Query(format!("Failed to record import error: {e}")))?;
    Ok(())
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

/// Column order: 0:id, 1:user, 2:protocol, 3:host, 4:mail_user, 5:password,
/// 6:folder, 7:last_uid, 8:mark_seen, 9:mark_deleted, 10:active
fn row_to_account(row: &libsql::Row) -> Result<MailAccount, String> {
    let protocol: String = row.get(2).map_err(|e| e.to_string())?;
    let protocol: MailProtocol = protocol.parse()?;
    let password: String = row.get(5).map_err(|e| e.to_string())?;
    let last_uid: i64 = row.get(7).map_err(|e| e.to_string())?;

    let mut account = MailAccount::new(
        row.get::<String>(1).map_err(|e| e.to_string())?,
        protocol,
        row.get::<String>(3).map_err(|e| e.to_string())?,
        row.get::<String>(4).map_err(|e| e.to_string())?,
        SecretString::from(password),
    );
    account.id = row.get(0).map_err(|e| e.to_string())?;
    account.folder = row.get(6).map_err(|e| e.to_string())?;
    account.last_uid = u32::try_from(last_uid).map_err(|e| e.to_string())?;
    account.mark_seen = row.get::<i64>(8).map_err(|e| e.to_string())? != 0;
    account.mark_deleted = row.get::<i64>(9).map_err(|e| e.to_string())? != 0;
    account.active = row.get::<i64>(10).map_err(|e| e.to_string())? != 0;
    Ok(account)
}

fn row_to_filter(row: &libsql::Row) -> Result<MailFilter, libsql::Error> {
    let mut filter = MailFilter::new(row.get::<String>(1)?);
    filter.id = row.get(0)?;
    filter.grouping = row.get::<i64>(2)? != 0;
    filter.active = row.get::<i64>(3)? != 0;
    Ok(filter)
}

fn row_to_rule(row: &libsql::Row) -> Result<MailFilterRule, libsql::Error> {
    Ok(MailFilterRule {
        id: row.get(0)?,
        field: row.get(1)?,
        operation: row.get(2)?,
        value: row.get(3)?,
        active: row.get::<i64>(4)? != 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::{RuleField, RuleOperation};

    fn runtime() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()
            .unwrap()
    }

    fn sample_account() -> MailAccount {
        let mut account = MailAccount::new(
            "bob",
            MailProtocol::Imaps,
            "imap.example.com:1993",
            "bob@example.com",
            SecretString::from("s3cret"),
        );
        account.mark_seen = true;
        account.filters = vec![
            MailFilter::new("/invoices")
                .with_grouping(true)
                .with_rule(MailFilterRule::new(
                    RuleField::Subject,
                    RuleOperation::Contains,
                    "invoice",
                ))
                .with_rule(MailFilterRule::new(
                    RuleField::From,
                    RuleOperation::Equals,
                    "billing@example.com",
                )),
            MailFilter::new("/other"),
        ];
        account
    }

    fn ledger_entry(uid: &str) -> MailImportError {
        MailImportError {
            uid: uid.into(),
            subject: "broken".into(),
            trace: "Failed to parse message: Empty message".into(),
            date: Utc::now(),
        }
    }

    #[test]
    fn insert_and_load_round_trip() {
        let rt = runtime();
        let store = rt.block_on(LibSqlAccountStore::open_memory()).unwrap();

        let id = store.insert(&sample_account()).unwrap();
        let loaded = store.load(id).unwrap();

        assert_eq!(loaded.id, id);
        assert_eq!(loaded.protocol, MailProtocol::Imaps);
        assert_eq!(loaded.endpoint(), ("imap.example.com".to_string(), 1993));
        assert_eq!(loaded.password.expose_secret(), "s3cret");
        assert!(loaded.mark_seen);
        assert_eq!(loaded.filters.len(), 2);
        assert_eq!(loaded.filters[0].path, "/invoices");
        assert!(loaded.filters[0].grouping);
        assert_eq!(loaded.filters[0].rules.len(), 2);
        assert_eq!(loaded.filters[0].rules[1].field, "FROM");
        assert_eq!(loaded.filters[0].rules[1].value, "billing@example.com");
        assert!(loaded.filters[1].rules.is_empty());
    }

    #[test]
    fn missing_account_is_not_found() {
        let rt = runtime();
        let store = rt.block_on(LibSqlAccountStore::open_memory()).unwrap();
        assert!(matches!(store.load(42), Err(DatabaseError::NotFound { .. })));
        let mut ghost = sample_account();
        ghost.id = 42;
        assert!(matches!(
            store.update(&ghost),
            Err(DatabaseError::NotFound { .. })
        ));
    }

    #[test]
    fn update_persists_cursor_and_ledger_once() {
        let rt = runtime();
        let store = rt.block_on(LibSqlAccountStore::open_memory()).unwrap();
        let id = store.insert(&sample_account()).unwrap();

        let mut account = store.load(id).unwrap();
        account.last_uid = 17;
        account.record_import_error(ledger_entry("12"));
        store.update(&account).unwrap();
        // Same ledger written again.
        store.update(&account).unwrap();

        let reloaded = store.load(id).unwrap();
        assert_eq!(reloaded.last_uid, 17);
        assert_eq!(reloaded.import_errors.len(), 1);
        assert_eq!(reloaded.import_errors[0].uid, "12");
    }

    #[test]
    fn list_active_skips_inactive_accounts() {
        let rt = runtime();
        let store = rt.block_on(LibSqlAccountStore::open_memory()).unwrap();
        let mut off = sample_account();
        off.active = false;
        store.insert(&off).unwrap();
        let on = store.insert(&sample_account()).unwrap();

        let active = store.list_active().unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, on);
        assert_eq!(active[0].filters.len(), 2);
    }

    #[test]
    fn file_database_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("accounts.db");
        let rt = runtime();

        let id = {
            let store = rt.block_on(LibSqlAccountStore::open(&path)).unwrap();
            store.insert(&sample_account()).unwrap()
        };
        let store = rt.block_on(LibSqlAccountStore::open(&path)).unwrap();
        assert_eq!(store.load(id).unwrap().user, "bob");
    }
}
