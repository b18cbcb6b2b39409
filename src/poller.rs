//! Fixed-interval import driver.
//!
//! Every tick loads the active accounts and runs each import on the blocking
//! pool, one account after another. A cycle finishes before the next tick is
//! awaited, so an account never has two runs in flight.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::import::{ImportOrchestrator, RunReport};
use crate::store::AccountStore;

/// Spawn the import poller.
///
/// Returns a `JoinHandle` and a shutdown flag. Set the flag to stop polling.
pub fn spawn_import_poller(
    engine: Arc<ImportOrchestrator>,
    accounts: Arc<dyn AccountStore>,
    interval: Duration,
) -> (JoinHandle<()>, Arc<AtomicBool>) {
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_flag = Arc::clone(&shutdown);

    let handle = tokio::spawn(async move {
        info!(interval_secs = interval.as_secs(), "Import poller started");
        let mut tick = tokio::time::interval(interval);

        loop {
            tick.tick().await;

            if shutdown.load(Ordering::Relaxed) {
                info!("Import poller shutting down");
                return;
            }

            poll_once(&engine, &accounts).await;
        }
    });

    (handle, shutdown_flag)
}

/// Run one import cycle over every active account.
pub async fn poll_once(
    engine: &Arc<ImportOrchestrator>,
    accounts: &Arc<dyn AccountStore>,
) -> Vec<RunReport> {
    let store = Arc::clone(accounts);
    let active = match tokio::task::spawn_blocking(move || store.list_active()).await {
        Ok(Ok(active)) => active,
        Ok(Err(e)) => {
            error!(error = %e, "Failed to load mail accounts");
            return Vec::new();
        }
        Err(e) => {
            error!("Account load task panicked: {e}");
            return Vec::new();
        }
    };
    debug!(accounts = active.len(), "Import cycle");

    let mut reports = Vec::with_capacity(active.len());
    for account in active {
        let id = account.id;
        let engine = Arc::clone(engine);
        match tokio::task::spawn_blocking(move || engine.run_account_id(id)).await {
            Ok(Ok(report)) => {
                if report.imported > 0 || report.failed > 0 {
                    info!(
                        account = id,
                        imported = report.imported,
                        failed = report.failed,
                        "Import run finished"
                    );
                }
                reports.push(report);
            }
            Ok(Err(e)) => warn!(account = id, error = %e, "Import run aborted"),
            Err(e) => error!(account = id, "Import task panicked: {e}"),
        }
    }
    reports
}

#[cfg(test)]
mod tests {
    use secrecy::SecretString;

    use super::*;
    use crate::account::{MailAccount, MailProtocol};
    use crate::config::EngineConfig;
    use crate::connector::MemoryMailbox;
    use crate::repository::{GuessMimeTypes, MemoryRepository};
    use crate::store::MemoryAccountStore;

    fn setup() -> (MemoryMailbox, Arc<MemoryAccountStore>, Arc<ImportOrchestrator>) {
        let mailbox = MemoryMailbox::new();
        let store = Arc::new(MemoryAccountStore::new());
        let engine = Arc::new(ImportOrchestrator::new(
            Arc::new(mailbox.clone()),
            Arc::new(MemoryRepository::new()),
            store.clone(),
            Arc::new(GuessMimeTypes),
            EngineConfig::default(),
        ));
        (mailbox, store, engine)
    }

    fn account(user: &str) -> MailAccount {
        MailAccount::new(user, MailProtocol::Imap, "memory", user, SecretString::from("pw"))
    }

    #[tokio::test]
    async fn cycle_runs_active_accounts_only() {
        let (mailbox, store, engine) = setup();
        mailbox.add_message("Subject: one\r\n\r\nbody\r\n");
        let active = store.insert(&account("bob")).unwrap();
        let mut idle = account("ann");
        idle.active = false;
        store.insert(&idle).unwrap();

        let accounts: Arc<dyn AccountStore> = store.clone();
        let reports = poll_once(&engine, &accounts).await;
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].account_id, active);
        assert_eq!(reports[0].imported, 1);

        let again = poll_once(&engine, &accounts).await;
        assert_eq!(again[0].imported, 0);
    }

    #[tokio::test]
    async fn aborted_run_does_not_stop_cycle() {
        let (mailbox, store, engine) = setup();
        mailbox.set_reachable(false);
        store.insert(&account("bob")).unwrap();
        let accounts: Arc<dyn AccountStore> = store.clone();
        assert!(poll_once(&engine, &accounts).await.is_empty());
    }

    #[tokio::test]
    async fn poller_stops_on_shutdown() {
        let (_, store, engine) = setup();
        let (handle, shutdown) = spawn_import_poller(engine, store, Duration::from_millis(10));
        shutdown.store(true, Ordering::Relaxed);
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
