//! In-memory mailbox that behaves like a small IMAP or POP3 server.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};

use super::{Connector, Flag, MailSession, MessageUid, RawMessage};
use crate::account::MailAccount;
use crate::error::ConnectionError;

#[derive(Debug, Clone)]
struct StoredMessage {
    uid: u32,
    bytes: Vec<u8>,
    seen: bool,
    deleted: bool,
    internal_date: Option<DateTime<Utc>>,
}

#[derive(Debug)]
struct State {
    separator: char,
    folders: Vec<String>,
    messages: Vec<StoredMessage>,
    next_uid: u32,
    reachable: bool,
    failing: HashSet<u32>,
    closes: Vec<bool>,
    logouts: usize,
}

/// Shared mailbox state. Clones see the same messages.
///
/// Sessions for IMAP accounts address messages by numeric UID; sessions for
/// POP3 accounts see the same UIDs as opaque strings and no seen flags.
#[derive(Debug, Clone)]
pub struct MemoryMailbox {
    state: Arc<Mutex<State>>,
}

impl Default for MemoryMailbox {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryMailbox {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                separator: '/',
                folders: vec!["INBOX".to_string()],
                messages: Vec::new(),
                next_uid: 1,
                reachable: true,
                failing: HashSet::new(),
                closes: Vec::new(),
                logouts: 0,
            })),
        }
    }

    /// Use `separator` as the folder hierarchy separator.
    pub fn with_separator(self, separator: char) -> Self {
        self.lock().separator = separator;
        self
    }

    /// Add a folder, named with the native separator.
    pub fn add_folder(&self, name: &str) {
        self.lock().folders.push(name.to_string());
    }

    /// Deliver a message. Returns its UID.
    pub fn add_message(&self, raw: impl Into<Vec<u8>>) -> u32 {
        self.deliver(raw.into(), None)
    }

    /// Deliver a message with a known arrival date.
    pub fn add_message_at(&self, raw: impl Into<Vec<u8>>, date: DateTime<Utc>) -> u32 {
        self.deliver(raw.into(), Some(date))
    }

    /// Make every fetch of `uid` fail.
    pub fn fail_fetch(&self, uid: u32) {
        self.lock().failing.insert(uid);
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.lock().reachable = reachable;
    }

    pub fn set_seen(&self, uid: u32, seen: bool) {
        if let Some(m) = self.lock().messages.iter_mut().find(|m| m.uid == uid) {
            m.seen = seen;
        }
    }

    pub fn is_seen(&self, uid: u32) -> Option<bool> {
        self.lock().messages.iter().find(|m| m.uid == uid).map(|m| m.seen)
    }

    pub fn is_deleted(&self, uid: u32) -> Option<bool> {
        self.lock().messages.iter().find(|m| m.uid == uid).map(|m| m.deleted)
    }

    /// UIDs still present in the mailbox.
    pub fn uids(&self) -> Vec<u32> {
        self.lock().messages.iter().map(|m| m.uid).collect()
    }

    /// `expunge` argument of every folder close, in order.
    pub fn closes(&self) -> Vec<bool> {
        self.lock().closes.clone()
    }

    pub fn logouts(&self) -> usize {
        self.lock().logouts
    }

    fn deliver(&self, bytes: Vec<u8>, internal_date: Option<DateTime<Utc>>) -> u32 {
        let mut state = self.lock();
        let uid = state.next_uid;
        state.next_uid += 1;
        state.messages.push(StoredMessage {
            uid,
            bytes,
            seen: false,
            deleted: false,
            internal_date,
        });
        uid
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Connector for MemoryMailbox {
    fn connect(&self, account: &MailAccount) -> Result<Box<dyn MailSession>, ConnectionError> {
        if !self.lock().reachable {
            let (host, port) = account.endpoint();
            return Err(ConnectionError::Connect {
                host,
                port,
                reason: "connection refused".into(),
            });
        }
        Ok(Box::new(MemorySession {
            mailbox: self.clone(),
            numeric: account.protocol.supports_uid_cursor(),
        }))
    }
}

struct MemorySession {
    mailbox: MemoryMailbox,
    numeric: bool,
}

impl MemorySession {
    fn uid_of(&self, uid: u32) -> MessageUid {
        if self.numeric {
            MessageUid::Imap(uid)
        } else {
            MessageUid::Pop3(uid.to_string())
        }
    }

    fn number(uid: &MessageUid) -> Result<u32, ConnectionError> {
        match uid {
            MessageUid::Imap(n) => Ok(*n),
            MessageUid::Pop3(s) => s
                .parse()
                .map_err(|_| ConnectionError::MessageNotFound(s.clone())),
        }
    }
}

impl MailSession for MemorySession {
    fn separator(&mut self, top: &str) -> Result<Option<char>, ConnectionError> {
        if !self.numeric {
            return Ok(None);
        }
        let state = self.mailbox.lock();
        let sep = state.separator;
        let exists = state
            .folders
            .iter()
            .any(|f| f.split(sep).next() == Some(top));
        if exists {
            Ok(Some(sep))
        } else {
            Err(ConnectionError::FolderNotFound(top.to_string()))
        }
    }

    fn open_folder(&mut self, folder: &str) -> Result<(), ConnectionError> {
        let state = self.mailbox.lock();
        let exists = state
            .folders
            .iter()
            .any(|f| f == folder || (f == "INBOX" && folder.eq_ignore_ascii_case("INBOX")));
        if exists {
            Ok(())
        } else {
            Err(ConnectionError::FolderNotFound(folder.to_string()))
        }
    }

    fn messages_from_uid(&mut self, start: u32) -> Result<Vec<MessageUid>, ConnectionError> {
        let state = self.mailbox.lock();
        let mut uids: Vec<u32> = state
            .messages
            .iter()
            .map(|m| m.uid)
            .filter(|uid| *uid >= start)
            .collect();
        // `n:*` always matches the newest message, like a real server.
        if uids.is_empty()
            && let Some(newest) = state.messages.last()
        {
            uids.push(newest.uid);
        }
        Ok(uids.into_iter().map(|uid| self.uid_of(uid)).collect())
    }

    fn unseen_messages(&mut self) -> Result<Vec<MessageUid>, ConnectionError> {
        let numeric = self.numeric;
        let uids: Vec<u32> = self
            .mailbox
            .lock()
            .messages
            .iter()
            .filter(|m| !m.deleted && (!numeric || !m.seen))
            .map(|m| m.uid)
            .collect();
        Ok(uids.into_iter().map(|uid| self.uid_of(uid)).collect())
    }

    fn fetch(&mut self, uid: &MessageUid) -> Result<RawMessage, ConnectionError> {
        let number = Self::number(uid)?;
        let state = self.mailbox.lock();
        if state.failing.contains(&number) {
            return Err(ConnectionError::Protocol {
                command: "UID FETCH".into(),
                reason: format!("message {number} unavailable"),
            });
        }
        let message = state
            .messages
            .iter()
            .find(|m| m.uid == number)
            .ok_or_else(|| ConnectionError::MessageNotFound(uid.to_string()))?;
        Ok(RawMessage {
            uid: uid.clone(),
            bytes: message.bytes.clone(),
            seen: self.numeric && message.seen,
            internal_date: message.internal_date,
            size: Some(message.bytes.len() as u64),
        })
    }

    fn set_flag(&mut self, uid: &MessageUid, flag: Flag, value: bool) -> Result<(), ConnectionError> {
        let number = Self::number(uid)?;
        let numeric = self.numeric;
        let mut state = self.mailbox.lock();
        let message = state
            .messages
            .iter_mut()
            .find(|m| m.uid == number)
            .ok_or_else(|| ConnectionError::MessageNotFound(uid.to_string()))?;
        match flag {
            Flag::Seen if numeric => message.seen = value,
            Flag::Seen => {}
            Flag::Deleted => message.deleted = value,
        }
        Ok(())
    }

    fn close_folder(&mut self, expunge: bool) -> Result<(), ConnectionError> {
        let mut state = self.mailbox.lock();
        state.closes.push(expunge);
        if expunge {
            state.messages.retain(|m| !m.deleted);
        } else if !self.numeric {
            // POP3 forgets pending deletes on RSET.
            for m in &mut state.messages {
                m.deleted = false;
            }
        }
        Ok(())
    }

    fn logout(&mut self) -> Result<(), ConnectionError> {
        self.mailbox.lock().logouts += 1;
        Ok(())
    }
}
