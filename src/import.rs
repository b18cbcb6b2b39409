//! Import runs: one account, one folder, every new message.
//!
//! A run connects, selects candidates, and pushes each message through
//! parse → route → resolve path → store mail → store attachments. Message
//! failures are recorded in the account's ledger and never stop the run;
//! connection and persistence failures do. The account is written back after
//! every committed message and every new ledger entry.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::account::{MailAccount, MailImportError};
use crate::attachments::{self, AttachmentTarget};
use crate::config::EngineConfig;
use crate::connector::{self, Connector, Flag, MailSession, MessageUid};
use crate::error::{ConnectionError, DatabaseError, ImportError, MessageError, RepositoryError};
use crate::fetcher;
use crate::mail::{OutlookMessage, RtfConverter, parse_mime, parse_outlook};
use crate::path::{self, escape_name, mail_node_name};
use crate::repository::{MimeTypeTable, NodeRef, Repository};
use crate::store::AccountStore;

/// Summary of one account run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunReport {
    pub account_id: i64,
    pub candidates: usize,
    /// Mail nodes created, one per destination.
    pub imported: usize,
    /// Destinations that already held the message.
    pub skipped: usize,
    /// Messages whose pipeline failed.
    pub failed: usize,
    /// Rendered error of the last message-level failure.
    pub last_error: Option<String>,
}

/// Per-message counters.
#[derive(Debug, Default)]
struct Stored {
    created: usize,
    duplicates: usize,
}

/// What the pipeline learned before it finished or failed.
#[derive(Debug, Default)]
struct Observed {
    seen: Option<bool>,
    subject: Option<String>,
}

/// Drives import runs against shared collaborators.
pub struct ImportOrchestrator {
    connector: Arc<dyn Connector>,
    repository: Arc<dyn Repository>,
    accounts: Arc<dyn AccountStore>,
    mime_types: Arc<dyn MimeTypeTable>,
    config: EngineConfig,
}

impl ImportOrchestrator {
    pub fn new(
        connector: Arc<dyn Connector>,
        repository: Arc<dyn Repository>,
        accounts: Arc<dyn AccountStore>,
        mime_types: Arc<dyn MimeTypeTable>,
        config: EngineConfig,
    ) -> Self {
        Self {
            connector,
            repository,
            accounts,
            mime_types,
            config,
        }
    }

    /// Load the account and run it. Inactive accounts are skipped.
    pub fn run_account_id(&self, id: i64) -> Result<RunReport, ImportError> {
        let mut account = self.accounts.load(id).map_err(|e| match e {
            DatabaseError::NotFound { .. } => ImportError::AccountNotFound(id),
            other => ImportError::Persistence(other),
        })?;
        if !account.active {
            info!(account = id, "Skipping inactive mail account");
            return Ok(RunReport {
                account_id: id,
                ..RunReport::default()
            });
        }
        self.run(&mut account)
    }

    /// Import new messages of `account`, updating its cursor and ledger.
    pub fn run(&self, account: &mut MailAccount) -> Result<RunReport, ImportError> {
        info!(
            account = account.id,
            user = %account.user,
            protocol = %account.protocol,
            folder = %account.folder,
            "Starting mail import"
        );
        let session = self.connector.connect(account)?;
        let folder = account.folder.clone();
        let expunge = account.mark_deleted;

        let report = connector::with_folder(session, &folder, expunge, |session| {
            let uids = fetcher::candidates(session, account)?;
            let mut report = RunReport {
                account_id: account.id,
                candidates: uids.len(),
                ..RunReport::default()
            };
            for uid in &uids {
                self.process(session, account, uid, &mut report)?;
            }
            Ok::<_, ImportError>(report)
        })?;

        info!(
            account = account.id,
            candidates = report.candidates,
            imported = report.imported,
            skipped = report.skipped,
            failed = report.failed,
            last_uid = account.last_uid,
            "Mail import finished"
        );
        Ok(report)
    }

    /// Log in and open the account's folder, then close it again.
    pub fn test_connection(&self, account: &MailAccount) -> Result<(), ConnectionError> {
        connector::test_connection(self.connector.as_ref(), account)
    }

    /// Store an Outlook message and its file attachments under `folder`.
    ///
    /// The node is named after the escaped subject. Returns `None` when a
    /// node already exists at that path.
    pub fn import_outlook_message(
        &self,
        folder: &str,
        message: &OutlookMessage,
        rtf: Option<&dyn RtfConverter>,
        owner: &str,
    ) -> Result<Option<NodeRef>, RepositoryError> {
        let mail = parse_outlook(message, rtf);
        let path = format!("{}/{}", folder.trim_end_matches('/'), escape_name(&mail.subject));
        if self.repository.has_node(&path)? {
            info!(path = %path, "Outlook message already imported");
            return Ok(None);
        }

        let node = self.repository.create_mail(&mail.at_path(&path), owner)?;
        let report = attachments::import_outlook_attachments(
            &AttachmentTarget {
                repository: self.repository.as_ref(),
                mime_types: self.mime_types.as_ref(),
                mail_path: &node.path,
                subject: &mail.subject,
                owner,
            },
            &message.attachments,
        )?;
        debug!(
            path = %node.path,
            attachments = report.stored.len(),
            rejected = report.rejected.len(),
            "Outlook message imported"
        );
        Ok(Some(node))
    }

    // ── Per-message pipeline ────────────────────────────────────────

    fn process(
        &self,
        session: &mut dyn MailSession,
        account: &mut MailAccount,
        uid: &MessageUid,
        report: &mut RunReport,
    ) -> Result<(), ImportError> {
        let mut observed = Observed::default();
        let imported = self.import_message(session, account, uid, &mut observed);
        let flagged = apply_flags(session, account, uid, observed.seen);

        match &imported {
            Ok(stored) => {
                report.imported += stored.created;
                report.skipped += stored.duplicates;
                if let Some(cursor) = uid.cursor()
                    && account.advance_cursor(cursor)
                {
                    self.accounts.update(account)?;
                }
            }
            Err(_) => report.failed += 1,
        }

        for error in [imported.err(), flagged.err()].into_iter().flatten() {
            self.record_failure(account, uid, observed.subject.as_deref(), error, report)?;
        }
        Ok(())
    }

    fn import_message(
        &self,
        session: &mut dyn MailSession,
        account: &MailAccount,
        uid: &MessageUid,
        observed: &mut Observed,
    ) -> Result<Stored, MessageError> {
        let uid_text = uid.to_string();
        let raw = session.fetch(uid).map_err(|source| MessageError::Fetch {
            uid: uid_text.clone(),
            source,
        })?;
        observed.seen = Some(raw.seen);

        let parsed = parse_mime(&raw.bytes, raw.internal_date, raw.size).map_err(|source| {
            MessageError::Parse {
                uid: uid_text.clone(),
                source,
            }
        })?;
        observed.subject = Some(parsed.mail.subject.clone());

        let repo = self.repository.as_ref();
        let inbox = self.config.user_inbox(&account.user);
        let mut stored = Stored::default();

        for dest in path::destinations(account, &parsed.mail, &inbox) {
            let repo_err = |path: &str| {
                let uid = uid_text.clone();
                let path = path.to_string();
                move |source: RepositoryError| MessageError::Repository { uid, path, source }
            };

            let folder = path::resolve_folder(repo, &dest, parsed.mail.received_date)
                .map_err(repo_err(&dest.base))?;
            let mail_path = format!("{folder}/{}", mail_node_name(&uid_text, &parsed.mail.subject));

            if repo.has_node(&mail_path).map_err(repo_err(&mail_path))? {
                debug!(uid = %uid, path = %mail_path, "Message already imported");
                stored.duplicates += 1;
                continue;
            }

            let node = repo
                .create_mail(&parsed.mail.at_path(&mail_path), &account.user)
                .map_err(repo_err(&mail_path))?;
            let attached = attachments::import_mime_attachments(
                &AttachmentTarget {
                    repository: repo,
                    mime_types: self.mime_types.as_ref(),
                    mail_path: &node.path,
                    subject: &parsed.mail.subject,
                    owner: &account.user,
                },
                &parsed.root,
            )
            .map_err(repo_err(&node.path))?;

            debug!(
                uid = %uid,
                path = %node.path,
                attachments = attached.stored.len(),
                rejected = attached.rejected.len(),
                "Message imported"
            );
            stored.created += 1;
        }
        Ok(stored)
    }

    fn record_failure(
        &self,
        account: &mut MailAccount,
        uid: &MessageUid,
        subject: Option<&str>,
        error: MessageError,
        report: &mut RunReport,
    ) -> Result<(), ImportError> {
        let trace = format!("{:#}", anyhow::Error::new(error));
        warn!(account = account.id, uid = %uid, error = %trace, "Failed to import message");
        report.last_error = Some(trace.clone());

        let entry = MailImportError {
            uid: uid.to_string(),
            subject: subject.unwrap_or_default().to_string(),
            trace,
            date: Utc::now(),
        };
        if account.record_import_error(entry) {
            self.accounts.update(account)?;
        }
        Ok(())
    }
}

/// Seen follows the account policy, or is restored to its fetched state.
/// Deleted is set when the account asks for it.
fn apply_flags(
    session: &mut dyn MailSession,
    account: &MailAccount,
    uid: &MessageUid,
    seen: Option<bool>,
) -> Result<(), MessageError> {
    let flag_err = |source: ConnectionError| MessageError::Flags {
        uid: uid.to_string(),
        source,
    };
    let seen = if account.mark_seen { Some(true) } else { seen };
    if let Some(seen) = seen {
        session.set_flag(uid, Flag::Seen, seen).map_err(flag_err)?;
    }
    if account.mark_deleted {
        session.set_flag(uid, Flag::Deleted, true).map_err(flag_err)?;
    }
    Ok(())
}
