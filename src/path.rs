//! Destination routing and repository path resolution for imported mail.

use chrono::{DateTime, Datelike, Utc};
use tracing::debug;

use crate::account::MailAccount;
use crate::error::RepositoryError;
use crate::filter;
use crate::mail::CanonicalMail;
use crate::repository::{Repository, ensure_folder};

/// A folder a message should be stored under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    pub base: String,
    /// Nest under `year/month/day` of the received date.
    pub grouping: bool,
    /// Create the base folder when it is missing.
    pub create_base: bool,
}

/// Route `mail` for `account`.
///
/// Without filters the message goes to the owner's inbox (compatibility
/// mode), grouped by date. Otherwise it goes to every active filter whose
/// rules match, possibly none.
pub fn destinations(account: &MailAccount, mail: &CanonicalMail, inbox: &str) -> Vec<Destination> {
    if account.filters.is_empty() {
        debug!(account = account.id, "Import in compatibility mode");
        return vec![Destination {
            base: inbox.to_string(),
            grouping: true,
            create_base: true,
        }];
    }

    account
        .filters
        .iter()
        .filter(|f| f.active && filter::matches(mail, &f.rules))
        .map(|f| Destination {
            base: f.path.clone(),
            grouping: f.grouping,
            create_base: false,
        })
        .collect()
}

/// Materialize the folder for `dest` and return its path.
pub fn resolve_folder<R: Repository + ?Sized>(
    repo: &R,
    dest: &Destination,
    received: DateTime<Utc>,
) -> Result<String, RepositoryError> {
    if dest.create_base {
        repo.create_missing_folders(&dest.base)?;
    }
    if dest.grouping {
        group_path(repo, &dest.base, received)
    } else {
        Ok(dest.base.clone())
    }
}

/// `base/yyyy/m/d` (UTC, no zero padding), creating each level if absent.
pub fn group_path<R: Repository + ?Sized>(
    repo: &R,
    base: &str,
    date: DateTime<Utc>,
) -> Result<String, RepositoryError> {
    let mut path = base.trim_end_matches('/').to_string();
    for level in [date.year() as u32, date.month(), date.day()] {
        path = format!("{path}/{level}");
        ensure_folder(repo, &path)?;
    }
    Ok(path)
}

/// Make `name` usable as a single repository path segment.
pub fn escape_name(name: &str) -> String {
    let replaced: String = name
        .trim()
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => ' ',
            c if c.is_control() => ' ',
            c => c,
        })
        .collect();
    replaced.split(' ').filter(|s| !s.is_empty()).collect::<Vec<_>>().join(" ")
}

/// Node name of an imported mail: `<uid>-<subject>`, escaped as a whole
/// since POP3 UIDs may carry any printable character.
pub fn mail_node_name(uid: &str, subject: &str) -> String {
    escape_name(&format!("{uid}-{subject}"))
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use secrecy::SecretString;

    use super::*;
    use crate::account::{MailFilter, MailFilterRule, MailProtocol, RuleField, RuleOperation};
    use crate::error::RepositoryError;
    use crate::repository::{MemoryRepository, NodeRef, NewDocument};

    fn account() -> MailAccount {
        MailAccount::new(
            "bob",
            MailProtocol::Imap,
            "imap.example.com",
            "bob",
            SecretString::from("pw"),
        )
    }

    // ── Routing ─────────────────────────────────────────────────────

    #[test]
    fn compatibility_mode_without_filters() {
        let dests = destinations(&account(), &CanonicalMail::new("s", "c"), "/mail/bob/Inbox");
        assert_eq!(
            dests,
            vec![Destination {
                base: "/mail/bob/Inbox".into(),
                grouping: true,
                create_base: true,
            }]
        );
    }

    #[test]
    fn every_matching_filter_is_a_destination() {
        let mut acc = account();
        acc.filters = vec![
            MailFilter::new("/invoices").with_rule(MailFilterRule::new(
                RuleField::Subject,
                RuleOperation::Contains,
                "invoice",
            )),
            MailFilter::new("/all").with_grouping(true),
            MailFilter::new("/never").with_rule(MailFilterRule::new(
                RuleField::Subject,
                RuleOperation::Equals,
                "nope",
            )),
        ];
        let dests = destinations(&acc, &CanonicalMail::new("Invoice 42", ""), "/unused");
        let bases: Vec<_> = dests.iter().map(|d| d.base.as_str()).collect();
        assert_eq!(bases, vec!["/invoices", "/all"]);
        assert!(dests[1].grouping);
        assert!(!dests[0].create_base);
    }

    #[test]
    fn inactive_filters_route_nowhere() {
        let mut acc = account();
        let mut f = MailFilter::new("/x");
        f.active = false;
        acc.filters = vec![f];
        assert!(destinations(&acc, &CanonicalMail::new("s", ""), "/inbox").is_empty());
    }

    // ── Grouping ────────────────────────────────────────────────────

    #[test]
    fn grouped_path_creates_levels() {
        let repo = MemoryRepository::new();
        repo.create_missing_folders("/mail/bob/Inbox").unwrap();
        let date = Utc.with_ymd_and_hms(2024, 3, 5, 12, 0, 0).unwrap();
        let path = group_path(&repo, "/mail/bob/Inbox", date).unwrap();
        assert_eq!(path, "/mail/bob/Inbox/2024/3/5");
        for p in ["/mail/bob/Inbox/2024", "/mail/bob/Inbox/2024/3", path.as_str()] {
            assert!(repo.has_node(p).unwrap(), "{p} missing");
        }
        // Idempotent.
        assert_eq!(group_path(&repo, "/mail/bob/Inbox", date).unwrap(), path);
    }

    /// Reports folders missing but another writer always wins the create.
    struct RacingRepo(MemoryRepository);

    impl Repository for RacingRepo {
        fn has_node(&self, _path: &str) -> Result<bool, RepositoryError> {
            Ok(false)
        }
        fn create_folder(&self, path: &str) -> Result<NodeRef, RepositoryError> {
            Err(RepositoryError::ItemExists(path.to_string()))
        }
        fn create_mail(&self, mail: &CanonicalMail, owner: &str) -> Result<NodeRef, RepositoryError> {
            self.0.create_mail(mail, owner)
        }
        fn create_document(&self, doc: NewDocument<'_>) -> Result<NodeRef, RepositoryError> {
            self.0.create_document(doc)
        }
        fn get_content(&self, path: &str) -> Result<Vec<u8>, RepositoryError> {
            self.0.get_content(path)
        }
        fn path_from_uuid(&self, uuid: &str) -> Result<String, RepositoryError> {
            self.0.path_from_uuid(uuid)
        }
        fn uuid_from_path(&self, path: &str) -> Result<String, RepositoryError> {
            self.0.uuid_from_path(path)
        }
        fn get_mail(&self, id: &str) -> Result<CanonicalMail, RepositoryError> {
            self.0.get_mail(id)
        }
        fn mail_attachments(&self, mail_path: &str) -> Result<Vec<NodeRef>, RepositoryError> {
            self.0.mail_attachments(mail_path)
        }
    }

    #[test]
    fn lost_creation_race_is_success() {
        let repo = RacingRepo(MemoryRepository::new());
        let date = Utc.with_ymd_and_hms(2023, 12, 31, 23, 59, 0).unwrap();
        assert_eq!(
            group_path(&repo, "/base/", date).unwrap(),
            "/base/2023/12/31"
        );
    }

    #[test]
    fn other_create_errors_propagate() {
        let repo = MemoryRepository::new();
        let date = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        // Base folder does not exist, so creating the year level fails.
        assert!(matches!(
            group_path(&repo, "/missing", date),
            Err(RepositoryError::NotFound(_))
        ));
    }

    // ── Naming ──────────────────────────────────────────────────────

    #[test]
    fn names_are_escaped() {
        assert_eq!(escape_name("  Re: a/b  *urgent*  "), "Re a b urgent");
        assert_eq!(escape_name("tab\there"), "tab here");
        assert_eq!(mail_node_name("42", "Q3 report"), "42-Q3 report");
        assert_eq!(mail_node_name("7", "a|b"), "7-a b");
    }

    #[test]
    fn pop3_uid_with_slash_stays_one_segment() {
        let name = mail_node_name("AAB/cd+Ef", "Hello");
        assert_eq!(name, "AAB cd+Ef-Hello");

        let repo = MemoryRepository::new();
        repo.create_missing_folders("/mail/bob/Inbox").unwrap();
        let path = format!("/mail/bob/Inbox/{name}");
        let node = repo
            .create_mail(&CanonicalMail::new("Hello", "x").at_path(&path), "bob")
            .unwrap();
        assert_eq!(node.path, path);
    }
}
