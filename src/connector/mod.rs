//! Mailbox sessions over IMAP and POP3.
//!
//! A [`Connector`] turns an account into an authenticated [`MailSession`].
//! Sessions are blocking and single-threaded; run them on a blocking thread.

pub mod imap;
pub mod memory;
pub mod pop3;
pub mod stream;

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use secrecy::ExposeSecret;
use tracing::{debug, warn};

use crate::account::{MailAccount, MailProtocol};
use crate::error::ConnectionError;

pub use imap::ImapSession;
pub use memory::MemoryMailbox;
pub use pop3::Pop3Session;

/// Folder hierarchy separators accepted in configured folder paths.
pub const FOLDER_SEPARATORS: [char; 2] = ['/', '.'];

/// Identity of a message within its folder.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MessageUid {
    /// Stable, strictly increasing IMAP UID.
    Imap(u32),
    /// Opaque POP3 `UIDL` value.
    Pop3(String),
}

impl MessageUid {
    /// Numeric UID usable as a resume cursor.
    pub fn cursor(&self) -> Option<u32> {
        match self {
            Self::Imap(uid) => Some(*uid),
            Self::Pop3(_) => None,
        }
    }
}

impl fmt::Display for MessageUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Imap(uid) => write!(f, "{uid}"),
            Self::Pop3(uid) => f.write_str(uid),
        }
    }
}

/// A fetched message with the metadata the store reported for it.
#[derive(Debug, Clone)]
pub struct RawMessage {
    pub uid: MessageUid,
    pub bytes: Vec<u8>,
    /// `\Seen` before the fetch.
    pub seen: bool,
    pub internal_date: Option<DateTime<Utc>>,
    pub size: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flag {
    Seen,
    Deleted,
}

impl Flag {
    pub const fn imap_name(&self) -> &'static str {
        match self {
            Self::Seen => "\\Seen",
            Self::Deleted => "\\Deleted",
        }
    }
}

/// An authenticated mailbox session.
pub trait MailSession: Send {
    /// Native hierarchy separator of the folder named `top`, `None` when the
    /// store has no folder hierarchy.
    fn separator(&mut self, top: &str) -> Result<Option<char>, ConnectionError>;

    /// Open `folder` read-write.
    fn open_folder(&mut self, folder: &str) -> Result<(), ConnectionError>;

    /// UIDs from `start` to the newest message. Servers may include the
    /// newest message even when its UID is below `start`.
    fn messages_from_uid(&mut self, start: u32) -> Result<Vec<MessageUid>, ConnectionError>;

    /// Messages without the seen flag.
    fn unseen_messages(&mut self) -> Result<Vec<MessageUid>, ConnectionError>;

    /// Fetch a full message without marking it seen.
    fn fetch(&mut self, uid: &MessageUid) -> Result<RawMessage, ConnectionError>;

    fn set_flag(&mut self, uid: &MessageUid, flag: Flag, value: bool)
    -> Result<(), ConnectionError>;

    /// Close the open folder, permanently removing deleted messages when `expunge`.
    fn close_folder(&mut self, expunge: bool) -> Result<(), ConnectionError>;

    fn logout(&mut self) -> Result<(), ConnectionError>;
}

/// Opens authenticated sessions for accounts.
pub trait Connector: Send + Sync {
    fn connect(&self, account: &MailAccount) -> Result<Box<dyn MailSession>, ConnectionError>;
}

/// Connects to real servers over TCP, with implicit TLS for IMAPS and POP3S.
#[derive(Debug, Clone)]
pub struct NetworkConnector {
    timeout: Duration,
}

impl NetworkConnector {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for NetworkConnector {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

impl Connector for NetworkConnector {
    fn connect(&self, account: &MailAccount) -> Result<Box<dyn MailSession>, ConnectionError> {
        let (host, port) = account.endpoint();
        debug!(
            account = account.id,
            protocol = %account.protocol,
            host = %host,
            port,
            "Connecting to mailbox"
        );
        let stream = stream::open_stream(&host, port, account.protocol.is_tls(), self.timeout)?;
        let password = account.password.expose_secret();
        match account.protocol {
            MailProtocol::Imap | MailProtocol::Imaps => Ok(Box::new(ImapSession::login(
                stream,
                &account.mail_user,
                password,
            )?)),
            MailProtocol::Pop3 | MailProtocol::Pop3s => Ok(Box::new(Pop3Session::login(
                stream,
                &account.mail_user,
                password,
            )?)),
        }
    }
}

/// Translate the configured folder path into the store's native separator.
///
/// `/` is taken as the configured separator when present, `.` otherwise.
/// Paths with a single segment are returned unchanged.
pub fn fix_folder_separator(
    session: &mut dyn MailSession,
    folder: &str,
) -> Result<String, ConnectionError> {
    let Some(sep) = FOLDER_SEPARATORS.into_iter().find(|c| folder.contains(*c)) else {
        return Ok(folder.to_string());
    };
    let segments: Vec<&str> = folder.split(sep).collect();
    if segments.len() < 2 {
        return Ok(folder.to_string());
    }
    match session.separator(segments[0])? {
        Some(native) => Ok(segments.join(&native.to_string())),
        None => Ok(folder.to_string()),
    }
}

/// Open the account's folder, run `body`, then close and log out.
///
/// Closing happens on every path. A close failure is returned when `body`
/// succeeded and only logged when it already failed.
pub fn with_folder<T, E>(
    mut session: Box<dyn MailSession>,
    folder: &str,
    expunge: bool,
    body: impl FnOnce(&mut dyn MailSession) -> Result<T, E>,
) -> Result<T, E>
where
    E: From<ConnectionError>,
{
    let opened = fix_folder_separator(session.as_mut(), folder)
        .and_then(|native| session.open_folder(&native));
    if let Err(e) = opened {
        if let Err(logout) = session.logout() {
            warn!(error = %logout, "Logout after failed open");
        }
        return Err(e.into());
    }

    let result = body(session.as_mut());
    let closed = session.close_folder(expunge);
    let closed = closed.and(session.logout());

    match (result, closed) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(e)) => Err(e.into()),
        (Err(e), Ok(())) => Err(e),
        (Err(e), Err(close)) => {
            warn!(error = %close, "Failed to close mailbox folder");
            Err(e)
        }
    }
}

/// Log in, open the account's folder read-write and close it again.
pub fn test_connection(
    connector: &dyn Connector,
    account: &MailAccount,
) -> Result<(), ConnectionError> {
    let connectivity = |e: ConnectionError| ConnectionError::Connectivity(e.to_string());
    let session = connector.connect(account).map_err(connectivity)?;
    with_folder(session, &account.folder, false, |_| Ok::<_, ConnectionError>(()))
        .map_err(connectivity)
}
