//! In-memory account store.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use super::AccountStore;
use crate::account::MailAccount;
use crate::error::DatabaseError;

#[derive(Default)]
struct State {
    next_id: i64,
    accounts: BTreeMap<i64, MailAccount>,
    updates: usize,
}

/// Accounts kept in a map, for tests and embedding.
#[derive(Default)]
pub struct MemoryAccountStore {
    state: Mutex<State>,
}

impl MemoryAccountStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `update` calls so far.
    pub fn update_count(&self) -> usize {
        self.lock().updates
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn not_found(id: i64) -> DatabaseError {
    DatabaseError::NotFound {
        entity: "mail_account".into(),
        id: id.to_string(),
    }
}

impl AccountStore for MemoryAccountStore {
    fn insert(&self, account: &MailAccount) -> Result<i64, DatabaseError> {
        let mut state = self.lock();
        state.next_id += 1;
        let id = state.next_id;
        let mut stored = account.clone();
        stored.id = id;
        state.accounts.insert(id, stored);
        Ok(id)
    }

    fn load(&self, id: i64) -> Result<MailAccount, DatabaseError> {
        self.lock()
            .accounts
            .get(&id)
            .cloned()
            .ok_or_else(|| not_found(id))
    }

    fn update(&self, account: &MailAccount) -> Result<(), DatabaseError> {
        let mut state = self.lock();
        let stored = state
            .accounts
            .get_mut(&account.id)
            .ok_or_else(|| not_found(account.id))?;
        let filters = std::mem::take(&mut stored.filters);
        *stored = MailAccount {
            filters,
            ..account.clone()
        };
        state.updates += 1;
        Ok(())
    }

    fn list_active(&self) -> Result<Vec<MailAccount>, DatabaseError> {
        Ok(self
            .lock()
            .accounts
            .values()
            .filter(|a| a.active)
            .cloned()
            .collect())
    }
}
