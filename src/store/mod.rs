//! Persistence of mail accounts, their filters and import ledgers.

pub mod libsql_backend;
pub mod memory;
pub mod migrations;

use crate::account::MailAccount;
use crate::error::DatabaseError;

pub use libsql_backend::LibSqlAccountStore;
pub use memory::MemoryAccountStore;

/// Blocking account persistence used by the import engine.
///
/// `update` writes the account's settings and run state (cursor and
/// ledger). Filters are written once by `insert`.
pub trait AccountStore: Send + Sync {
    /// Store a new account with its filters. Returns the assigned id.
    fn insert(&self, account: &MailAccount) -> Result<i64, DatabaseError>;

    fn load(&self, id: i64) -> Result<MailAccount, DatabaseError>;

    fn update(&self, account: &MailAccount) -> Result<(), DatabaseError>;

    /// Active accounts in id order.
    fn list_active(&self) -> Result<Vec<MailAccount>, DatabaseError>;
}
