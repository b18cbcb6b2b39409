//! Selection of the messages an import run should look at.

use tracing::debug;

use crate::account::MailAccount;
use crate::connector::{MailSession, MessageUid};
use crate::error::ConnectionError;

/// Candidate messages for `account` in ascending order.
///
/// Cursor-capable protocols resume after `last_uid`. Anything the server
/// returns below the cursor is dropped, since a `n:*` range always includes
/// the newest message. Other protocols get every message without the seen
/// flag.
pub fn candidates(
    session: &mut dyn MailSession,
    account: &MailAccount,
) -> Result<Vec<MessageUid>, ConnectionError> {
    if !account.protocol.supports_uid_cursor() {
        let uids = session.unseen_messages()?;
        debug!(account = account.id, candidates = uids.len(), "Unseen messages selected");
        return Ok(uids);
    }

    let start = account.last_uid.saturating_add(1);
    let mut uids: Vec<MessageUid> = session
        .messages_from_uid(start)?
        .into_iter()
        .filter(|uid| uid.cursor().is_some_and(|n| n >= start))
        .collect();
    uids.sort();
    uids.dedup();
    debug!(
        account = account.id,
        start,
        candidates = uids.len(),
        "Messages selected after cursor"
    );
    Ok(uids)
}

#[cfg(test)]
mod tests {
    use secrecy::SecretString;

    use super::*;
    use crate::account::MailProtocol;
    use crate::connector::{Connector, MemoryMailbox};

    fn account(protocol: MailProtocol, last_uid: u32) -> MailAccount {
        let mut acc = MailAccount::new("bob", protocol, "memory", "bob", SecretString::from("pw"));
        acc.last_uid = last_uid;
        acc
    }

    #[test]
    fn resumes_after_cursor() {
        let mailbox = MemoryMailbox::new();
        for body in ["a", "b", "c", "d"] {
            mailbox.add_message(body);
        }
        let acc = account(MailProtocol::Imap, 2);
        let mut s = mailbox.connect(&acc).unwrap();
        assert_eq!(
            candidates(s.as_mut(), &acc).unwrap(),
            vec![MessageUid::Imap(3), MessageUid::Imap(4)]
        );
    }

    #[test]
    fn newest_below_cursor_is_dropped() {
        let mailbox = MemoryMailbox::new();
        mailbox.add_message("a");
        mailbox.add_message("b");
        let acc = account(MailProtocol::Imaps, 2);
        let mut s = mailbox.connect(&acc).unwrap();
        assert!(candidates(s.as_mut(), &acc).unwrap().is_empty());
    }

    #[test]
    fn cursorless_takes_all_messages() {
        let mailbox = MemoryMailbox::new();
        mailbox.add_message("a");
        mailbox.add_message("b");
        let acc = account(MailProtocol::Pop3, 99);
        let mut s = mailbox.connect(&acc).unwrap();
        assert_eq!(candidates(s.as_mut(), &acc).unwrap().len(), 2);
    }
}
