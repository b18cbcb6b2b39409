//! Blocking IMAP4rev1 client session.

use std::io::{Read, Write};

use chrono::{DateTime, Utc};
use tracing::debug;

use super::stream::Wire;
use super::{Flag, MailSession, MessageUid, RawMessage};
use crate::error::ConnectionError;

/// One untagged response, with any literals it carried.
#[derive(Debug, Default)]
struct Untagged {
    text: String,
    literals: Vec<Vec<u8>>,
}

/// Session over any duplex stream, normally a [`super::stream::MailStream`].
pub struct ImapSession<S: Read + Write> {
    wire: Wire<S>,
    tag: u32,
    selected: bool,
}

impl<S: Read + Write + Send> ImapSession<S> {
    /// Read the greeting and authenticate with `LOGIN`.
    pub fn login(stream: S, user: &str, password: &str) -> Result<Self, ConnectionError> {
        let mut session = Self {
            wire: Wire::new(stream),
            tag: 1,
            selected: false,
        };

        let greeting = session.wire.read_text_line()?;
        if !(greeting.starts_with("* OK") || greeting.starts_with("* PREAUTH")) {
            return Err(ConnectionError::Protocol {
                command: "greeting".into(),
                reason: greeting,
            });
        }

        session
            .command(&format!("LOGIN {} {}", quote(user), quote(password)))
            .map_err(|e| match e {
                ConnectionError::Protocol { reason, .. } => ConnectionError::AuthFailed {
                    user: user.to_string(),
                    reason,
                },
                other => other,
            })?;
        debug!(user, "IMAP login succeeded");
        Ok(session)
    }

    /// Send a tagged command and collect untagged responses until completion.
    fn command(&mut self, cmd: &str) -> Result<Vec<Untagged>, ConnectionError> {
        let tag = format!("A{}", self.tag);
        self.tag += 1;
        self.wire.write_line(&format!("{tag} {cmd}"))?;

        let prefix = format!("{tag} ");
        let mut responses = Vec::new();
        loop {
            let line = self.wire.read_text_line()?;
            if let Some(status) = line.strip_prefix(&prefix) {
                if status.starts_with("OK") {
                    return Ok(responses);
                }
                return Err(ConnectionError::Protocol {
                    command: verb(cmd).to_string(),
                    reason: status.to_string(),
                });
            }
            if line.starts_with('+') {
                continue;
            }

            let mut untagged = Untagged {
                text: line,
                literals: Vec::new(),
            };
            while let Some(len) = literal_len(&untagged.text) {
                untagged.literals.push(self.wire.read_exact(len)?);
                let rest = self.wire.read_text_line()?;
                untagged.text.push(' ');
                untagged.text.push_str(&rest);
            }
            responses.push(untagged);
        }
    }
}

impl<S: Read + Write + Send> MailSession for ImapSession<S> {
    fn separator(&mut self, top: &str) -> Result<Option<char>, ConnectionError> {
        let responses = self.command(&format!("LIST \"\" {}", quote(top)))?;
        responses
            .iter()
            .find_map(|r| r.text.strip_prefix("* LIST "))
            .map(parse_list_separator)
            .ok_or_else(|| ConnectionError::FolderNotFound(top.to_string()))
    }

    fn open_folder(&mut self, folder: &str) -> Result<(), ConnectionError> {
        self.command(&format!("SELECT {}", quote(folder)))
            .map_err(|e| match e {
                ConnectionError::Protocol { .. } => ConnectionError::FolderNotFound(folder.to_string()),
                other => other,
            })?;
        self.selected = true;
        Ok(())
    }

    fn messages_from_uid(&mut self, start: u32) -> Result<Vec<MessageUid>, ConnectionError> {
        let responses = self.command(&format!("UID SEARCH UID {start}:*"))?;
        Ok(parse_search(&responses))
    }

    fn unseen_messages(&mut self) -> Result<Vec<MessageUid>, ConnectionError> {
        let responses = self.command("UID SEARCH UNSEEN")?;
        Ok(parse_search(&responses))
    }

    fn fetch(&mut self, uid: &MessageUid) -> Result<RawMessage, ConnectionError> {
        let id = imap_uid(uid)?;
        let responses = self.command(&format!(
            "UID FETCH {id} (UID FLAGS INTERNALDATE RFC822.SIZE BODY.PEEK[])"
        ))?;
        let fetched = responses
            .into_iter()
            .find(|r| r.text.contains(" FETCH ") && !r.literals.is_empty())
            .ok_or_else(|| ConnectionError::MessageNotFound(id.to_string()))?;

        let seen = flags_of(&fetched.text)
            .is_some_and(|flags| flags.split_whitespace().any(|f| f.eq_ignore_ascii_case("\\Seen")));
        let internal_date = quoted_attr(&fetched.text, "INTERNALDATE").and_then(parse_internal_date);
        let size = numeric_attr(&fetched.text, "RFC822.SIZE");
        let bytes = fetched.literals.into_iter().next().unwrap_or_default();

        Ok(RawMessage {
            uid: uid.clone(),
            size: size.or(Some(bytes.len() as u64)),
            bytes,
            seen,
            internal_date,
        })
    }

    fn set_flag(&mut self, uid: &MessageUid, flag: Flag, value: bool) -> Result<(), ConnectionError> {
        let id = imap_uid(uid)?;
        let op = if value { '+' } else { '-' };
        self.command(&format!("UID STORE {id} {op}FLAGS.SILENT ({})", flag.imap_name()))?;
        Ok(())
    }

    fn close_folder(&mut self, expunge: bool) -> Result<(), ConnectionError> {
        if !self.selected {
            return Ok(());
        }
        self.selected = false;
        // Without CLOSE the deleted messages stay in the folder.
        if expunge {
            self.command("CLOSE")?;
        }
        Ok(())
    }

    fn logout(&mut self) -> Result<(), ConnectionError> {
        match self.command("LOGOUT") {
            Ok(_) | Err(ConnectionError::Closed) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

// ── Response parsing ────────────────────────────────────────────────

fn imap_uid(uid: &MessageUid) -> Result<u32, ConnectionError> {
    match uid {
        MessageUid::Imap(id) => Ok(*id),
        MessageUid::Pop3(other) => Err(ConnectionError::MessageNotFound(other.clone())),
    }
}

/// Quote an IMAP string argument.
fn quote(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}

/// Command name used in error reports. `UID` commands keep their sub-command.
fn verb(cmd: &str) -> &str {
    let mut words = cmd.splitn(3, ' ');
    match (words.next(), words.next()) {
        (Some("UID"), Some(sub)) => &cmd[..4 + sub.len()],
        (Some(first), _) => first,
        _ => cmd,
    }
}

/// Length of a literal announced at the end of `line` (`{n}` or `{n+}`).
fn literal_len(line: &str) -> Option<usize> {
    let inner = line.strip_suffix('}')?;
    let open = inner.rfind('{')?;
    inner[open + 1..].trim_end_matches('+').parse().ok()
}

fn parse_search(responses: &[Untagged]) -> Vec<MessageUid> {
    responses
        .iter()
        .filter_map(|r| r.text.strip_prefix("* SEARCH"))
        .flat_map(|rest| rest.split_whitespace())
        .filter_map(|n| n.parse().ok())
        .map(MessageUid::Imap)
        .collect()
}

/// Separator from the remainder of a `LIST` line: `(flags) "sep" name`.
fn parse_list_separator(rest: &str) -> Option<char> {
    let after_flags = rest.split_once(')')?.1.trim_start();
    if after_flags.starts_with("NIL") {
        return None;
    }
    let quoted = after_flags.strip_prefix('"')?;
    let mut chars = quoted.chars();
    match chars.next()? {
        '\\' => chars.next(),
        c => Some(c),
    }
}

fn flags_of(text: &str) -> Option<&str> {
    let start = text.find("FLAGS (")? + "FLAGS (".len();
    let end = text[start..].find(')')?;
    Some(&text[start..start + end])
}

fn quoted_attr<'a>(text: &'a str, name: &str) -> Option<&'a str> {
    let start = text.find(&format!("{name} \""))? + name.len() + 2;
    let end = text[start..].find('"')?;
    Some(&text[start..start + end])
}

fn numeric_attr(text: &str, name: &str) -> Option<u64> {
    let start = text.find(&format!("{name} "))? + name.len() + 1;
    let digits: String = text[start..].chars().take_while(char::is_ascii_digit).collect();
    digits.parse().ok()
}

/// `05-Mar-2024 12:00:00 +0000` (day may be space padded).
fn parse_internal_date(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_str(value.trim(), "%d-%b-%Y %H:%M:%S %z")
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::connector::stream::Scripted;

    const GREETING: &str = "* OK IMAP4rev1 ready\r\n";

    fn session(script: &str) -> (ImapSession<Scripted>, std::sync::Arc<std::sync::Mutex<Vec<u8>>>) {
        let scripted = Scripted::new(script);
        let output = scripted.output.clone();
        (ImapSession::login(scripted, "bob", "pw").unwrap(), output)
    }

    // ── Login ───────────────────────────────────────────────────────

    #[test]
    fn login_quotes_credentials() {
        let scripted = Scripted::new(&format!("{GREETING}A1 OK LOGIN completed\r\n"));
        let output = scripted.output.clone();
        ImapSession::login(scripted, "bob@example.com", "p\"w\\").unwrap();
        assert_eq!(
            Scripted::sent(&output),
            "A1 LOGIN \"bob@example.com\" \"p\\\"w\\\\\"\r\n"
        );
    }

    #[test]
    fn rejected_login_is_auth_failure() {
        let scripted = Scripted::new(&format!(
            "{GREETING}A1 NO [AUTHENTICATIONFAILED] Invalid credentials\r\n"
        ));
        match ImapSession::login(scripted, "bob", "bad") {
            Err(ConnectionError::AuthFailed { user, reason }) => {
                assert_eq!(user, "bob");
                assert!(reason.contains("Invalid credentials"));
            }
            other => panic!("unexpected: {:?}", other.err()),
        }
    }

    #[test]
    fn bad_greeting_is_rejected() {
        let scripted = Scripted::new("* BYE go away\r\n");
        assert!(matches!(
            ImapSession::login(scripted, "bob", "pw"),
            Err(ConnectionError::Protocol { .. })
        ));
    }

    // ── Folder operations ───────────────────────────────────────────

    #[test]
    fn list_reports_separator() {
        let (mut s, _) = session(&format!(
            "{GREETING}A1 OK\r\n* LIST (\\HasChildren) \".\" \"INBOX\"\r\nA2 OK LIST done\r\n\
             * LIST (\\Noselect) NIL \"\"\r\nA3 OK\r\nA4 OK\r\n"
        ));
        assert_eq!(s.separator("INBOX").unwrap(), Some('.'));
        assert_eq!(s.separator("").unwrap(), None);
        assert!(matches!(
            s.separator("Missing"),
            Err(ConnectionError::FolderNotFound(_))
        ));
    }

    #[test]
    fn select_failure_is_missing_folder() {
        let (mut s, _) = session(&format!(
            "{GREETING}A1 OK\r\nA2 NO [NONEXISTENT] Unknown Mailbox\r\n"
        ));
        assert!(matches!(
            s.open_folder("Nope"),
            Err(ConnectionError::FolderNotFound(name)) if name == "Nope"
        ));
    }

    #[test]
    fn uid_search_results() {
        let (mut s, output) = session(&format!(
            "{GREETING}A1 OK\r\n* SEARCH 4 9 12\r\nA2 OK SEARCH completed\r\n* SEARCH\r\nA3 OK\r\n"
        ));
        assert_eq!(
            s.messages_from_uid(4).unwrap(),
            vec![MessageUid::Imap(4), MessageUid::Imap(9), MessageUid::Imap(12)]
        );
        assert!(s.unseen_messages().unwrap().is_empty());
        let sent = Scripted::sent(&output);
        assert!(sent.contains("A2 UID SEARCH UID 4:*\r\n"));
        assert!(sent.contains("A3 UID SEARCH UNSEEN\r\n"));
    }

    #[test]
    fn absurd_literal_length_is_rejected() {
        let (mut s, _) = session(&format!(
            "{GREETING}A1 OK\r\n\
             * 1 FETCH (UID 4 BODY[] {{18446744073709551615}}\r\nshort)\r\n"
        ));
        assert!(matches!(
            s.fetch(&MessageUid::Imap(4)),
            Err(ConnectionError::Protocol { .. })
        ));
    }

    #[test]
    fn fetch_reads_literal_and_metadata() {
        let body = "Subject: hi\r\n\r\nbody\r\n";
        let (mut s, output) = session(&format!(
            "{GREETING}A1 OK\r\n\
             * 1 FETCH (UID 4 FLAGS (\\Seen \\Answered) INTERNALDATE \" 5-Mar-2024 12:30:00 +0100\" RFC822.SIZE 2048 BODY[] {{{}}}\r\n{body})\r\n\
             A2 OK FETCH completed\r\n",
            body.len()
        ));
        let msg = s.fetch(&MessageUid::Imap(4)).unwrap();
        assert_eq!(msg.bytes, body.as_bytes());
        assert!(msg.seen);
        assert_eq!(msg.size, Some(2048));
        assert_eq!(
            msg.internal_date,
            Some(Utc.with_ymd_and_hms(2024, 3, 5, 11, 30, 0).unwrap())
        );
        assert!(Scripted::sent(&output).contains("BODY.PEEK[]"));
    }

    #[test]
    fn fetch_without_data_is_not_found() {
        let (mut s, _) = session(&format!("{GREETING}A1 OK\r\nA2 OK FETCH completed\r\n"));
        assert!(matches!(
            s.fetch(&MessageUid::Imap(99)),
            Err(ConnectionError::MessageNotFound(_))
        ));
    }

    #[test]
    fn flags_close_and_logout() {
        let (mut s, output) = session(&format!(
            "{GREETING}A1 OK\r\nA2 OK\r\nA3 OK\r\nA4 OK\r\nA5 OK\r\n* BYE\r\nA6 OK\r\n"
        ));
        s.open_folder("INBOX").unwrap();
        s.set_flag(&MessageUid::Imap(7), Flag::Seen, false).unwrap();
        s.set_flag(&MessageUid::Imap(7), Flag::Deleted, true).unwrap();
        s.close_folder(true).unwrap();
        s.logout().unwrap();

        let sent = Scripted::sent(&output);
        assert!(sent.contains("A3 UID STORE 7 -FLAGS.SILENT (\\Seen)\r\n"));
        assert!(sent.contains("A4 UID STORE 7 +FLAGS.SILENT (\\Deleted)\r\n"));
        assert!(sent.contains("A5 CLOSE\r\n"));
        assert!(sent.contains("A6 LOGOUT\r\n"));
    }

    #[test]
    fn close_without_expunge_sends_nothing() {
        let (mut s, output) = session(&format!("{GREETING}A1 OK\r\nA2 OK\r\n"));
        s.open_folder("INBOX").unwrap();
        s.close_folder(false).unwrap();
        // Server dropped the connection before answering LOGOUT.
        s.logout().unwrap();
        assert!(!Scripted::sent(&output).contains("CLOSE"));
    }

    // ── Parsing helpers ─────────────────────────────────────────────

    #[test]
    fn helper_parsing() {
        assert_eq!(literal_len("* 1 FETCH (BODY[] {120}"), Some(120));
        assert_eq!(literal_len("* 1 FETCH (BODY[] {7+}"), Some(7));
        assert_eq!(literal_len("* OK done"), None);
        assert_eq!(verb("UID FETCH 4 (BODY[])"), "UID FETCH");
        assert_eq!(verb("SELECT \"INBOX\""), "SELECT");
        assert_eq!(parse_list_separator("() \"\\\\\" \"INBOX\""), Some('\\'));
    }
}
