//! Blocking POP3 client session.
//!
//! POP3 exposes a single folder, no flags and only opaque `UIDL` values.
//! Deletions are applied by the server at `QUIT` unless `RSET` undoes them.

use std::collections::HashMap;
use std::io::{Read, Write};

use tracing::debug;

use super::stream::Wire;
use super::{Flag, MailSession, MessageUid, RawMessage};
use crate::error::ConnectionError;

pub struct Pop3Session<S: Read + Write> {
    wire: Wire<S>,
    /// `(message number, UIDL)` in message-number order.
    listing: Vec<(u32, String)>,
    sizes: HashMap<u32, u64>,
    deleted: bool,
}

impl<S: Read + Write + Send> Pop3Session<S> {
    /// Read the greeting and authenticate with `USER`/`PASS`.
    pub fn login(stream: S, user: &str, password: &str) -> Result<Self, ConnectionError> {
        let mut session = Self {
            wire: Wire::new(stream),
            listing: Vec::new(),
            sizes: HashMap::new(),
            deleted: false,
        };

        let greeting = session.wire.read_text_line()?;
        if !greeting.starts_with("+OK") {
            return Err(ConnectionError::Protocol {
                command: "greeting".into(),
                reason: greeting,
            });
        }

        let auth_failed = |e: ConnectionError| match e {
            ConnectionError::Protocol { reason, .. } => ConnectionError::AuthFailed {
                user: user.to_string(),
                reason,
            },
            other => other,
        };
        session.command(&format!("USER {user}")).map_err(auth_failed)?;
        session.command(&format!("PASS {password}")).map_err(auth_failed)?;
        debug!(user, "POP3 login succeeded");
        Ok(session)
    }

    /// Single-line command. Returns the text after `+OK`.
    fn command(&mut self, cmd: &str) -> Result<String, ConnectionError> {
        self.wire.write_line(cmd)?;
        let line = self.wire.read_text_line()?;
        if let Some(rest) = line.strip_prefix("+OK") {
            return Ok(rest.trim().to_string());
        }
        let verb = cmd.split(' ').next().unwrap_or(cmd);
        Err(ConnectionError::Protocol {
            command: verb.to_string(),
            reason: line.strip_prefix("-ERR").unwrap_or(&line).trim().to_string(),
        })
    }

    /// Multi-line command. Returns the dot-unstuffed body lines.
    fn multiline(&mut self, cmd: &str) -> Result<Vec<Vec<u8>>, ConnectionError> {
        self.command(cmd)?;
        let mut lines = Vec::new();
        loop {
            let mut line = self.wire.read_line()?;
            if line == b"." {
                return Ok(lines);
            }
            if line.starts_with(b"..") {
                line.remove(0);
            }
            lines.push(line);
        }
    }

    fn number_of(&self, uid: &MessageUid) -> Result<u32, ConnectionError> {
        let MessageUid::Pop3(wanted) = uid else {
            return Err(ConnectionError::MessageNotFound(uid.to_string()));
        };
        self.listing
            .iter()
            .find(|(_, u)| u == wanted)
            .map(|(n, _)| *n)
            .ok_or_else(|| ConnectionError::MessageNotFound(wanted.clone()))
    }
}

impl<S: Read + Write + Send> MailSession for Pop3Session<S> {
    fn separator(&mut self, _top: &str) -> Result<Option<char>, ConnectionError> {
        Ok(None)
    }

    fn open_folder(&mut self, folder: &str) -> Result<(), ConnectionError> {
        if !folder.eq_ignore_ascii_case("INBOX") {
            return Err(ConnectionError::FolderNotFound(folder.to_string()));
        }

        self.listing = self
            .multiline("UIDL")?
            .iter()
            .filter_map(|line| {
                let line = String::from_utf8_lossy(line);
                let (num, uid) = line.trim().split_once(' ')?;
                Some((num.parse().ok()?, uid.trim().to_string()))
            })
            .collect();
        self.sizes = self
            .multiline("LIST")?
            .iter()
            .filter_map(|line| {
                let line = String::from_utf8_lossy(line);
                let (num, size) = line.trim().split_once(' ')?;
                Some((num.parse().ok()?, size.trim().parse().ok()?))
            })
            .collect();
        self.listing.sort_by_key(|(n, _)| *n);
        debug!(messages = self.listing.len(), "POP3 mailbox listed");
        Ok(())
    }

    fn messages_from_uid(&mut self, _start: u32) -> Result<Vec<MessageUid>, ConnectionError> {
        Err(ConnectionError::Protocol {
            command: "UID SEARCH".into(),
            reason: "POP3 has no numeric UIDs".into(),
        })
    }

    fn unseen_messages(&mut self) -> Result<Vec<MessageUid>, ConnectionError> {
        Ok(self
            .listing
            .iter()
            .map(|(_, uid)| MessageUid::Pop3(uid.clone()))
            .collect())
    }

    fn fetch(&mut self, uid: &MessageUid) -> Result<RawMessage, ConnectionError> {
        let number = self.number_of(uid)?;
        let mut bytes = Vec::new();
        for line in self.multiline(&format!("RETR {number}"))? {
            bytes.extend_from_slice(&line);
            bytes.extend_from_slice(b"\r\n");
        }
        Ok(RawMessage {
            uid: uid.clone(),
            size: self.sizes.get(&number).copied().or(Some(bytes.len() as u64)),
            bytes,
            seen: false,
            internal_date: None,
        })
    }

    fn set_flag(&mut self, uid: &MessageUid, flag: Flag, value: bool) -> Result<(), ConnectionError> {
        if flag == Flag::Deleted && value {
            let number = self.number_of(uid)?;
            self.command(&format!("DELE {number}"))?;
            self.deleted = true;
        }
        Ok(())
    }

    fn close_folder(&mut self, expunge: bool) -> Result<(), ConnectionError> {
        if self.deleted && !expunge {
            self.command("RSET")?;
        }
        self.deleted = false;
        self.listing.clear();
        self.sizes.clear();
        Ok(())
    }

    fn logout(&mut self) -> Result<(), ConnectionError> {
        match self.command("QUIT") {
            Ok(_) | Err(ConnectionError::Closed) => Ok(()),
            Err(e) => Err(e),
        }
    }
}
