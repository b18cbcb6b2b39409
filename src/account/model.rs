//! Mail account model types.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use secrecy::SecretString;

/// Mailbox access protocol of an account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MailProtocol {
    Imap,
    Imaps,
    Pop3,
    Pop3s,
}

impl MailProtocol {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Imap => "imap",
            Self::Imaps => "imaps",
            Self::Pop3 => "pop3",
            Self::Pop3s => "pop3s",
        }
    }

    pub const fn default_port(&self) -> u16 {
        match self {
            Self::Imap => 143,
            Self::Imaps => 993,
            Self::Pop3 => 110,
            Self::Pop3s => 995,
        }
    }

    /// Implicit TLS from the first byte.
    pub const fn is_tls(&self) -> bool {
        matches!(self, Self::Imaps | Self::Pop3s)
    }

    /// Whether the protocol exposes stable numeric UIDs usable as a resume cursor.
    pub const fn supports_uid_cursor(&self) -> bool {
        matches!(self, Self::Imap | Self::Imaps)
    }
}

impl fmt::Display for MailProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MailProtocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "imap" => Ok(Self::Imap),
            "imaps" => Ok(Self::Imaps),
            "pop3" => Ok(Self::Pop3),
            "pop3s" => Ok(Self::Pop3s),
            other => Err(format!("unknown mail protocol: {other}")),
        }
    }
}

/// Which mail attribute a filter rule inspects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleField {
    From,
    To,
    Subject,
    Content,
}

impl RuleField {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::From => "FROM",
            Self::To => "TO",
            Self::Subject => "SUBJECT",
            Self::Content => "CONTENT",
        }
    }
}

impl FromStr for RuleField {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "FROM" => Ok(Self::From),
            "TO" => Ok(Self::To),
            "SUBJECT" => Ok(Self::Subject),
            "CONTENT" => Ok(Self::Content),
            other => Err(format!("unknown rule field: {other}")),
        }
    }
}

/// Comparison applied by a filter rule. Always case-insensitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleOperation {
    Contains,
    Equals,
}

impl RuleOperation {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Contains => "CONTAINS",
            Self::Equals => "EQUALS",
        }
    }
}

impl FromStr for RuleOperation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "CONTAINS" => Ok(Self::Contains),
            "EQUALS" => Ok(Self::Equals),
            other => Err(format!("unknown rule operation: {other}")),
        }
    }
}

/// A single routing condition.
///
/// Field and operation are kept as their persisted tags so that rows
/// written by newer versions still load; tags this build does not know
/// are ignored when the filter is evaluated.
#[derive(Debug, Clone, PartialEq)]
pub struct MailFilterRule {
    pub id: i64,
    pub field: String,
    pub operation: String,
    pub value: String,
    pub active: bool,
}

impl MailFilterRule {
    pub fn new(field: RuleField, operation: RuleOperation, value: impl Into<String>) -> Self {
        Self {
            id: 0,
            field: field.as_str().to_string(),
            operation: operation.as_str().to_string(),
            value: value.into(),
            active: true,
        }
    }
}

/// Routes matching mail into `path`.
#[derive(Debug, Clone, PartialEq)]
pub struct MailFilter {
    pub id: i64,
    /// Destination folder in the repository.
    pub path: String,
    /// Store under `path/yyyy/m/d` of the received date.
    pub grouping: bool,
    pub active: bool,
    pub rules: Vec<MailFilterRule>,
}

impl MailFilter {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            id: 0,
            path: path.into(),
            grouping: false,
            active: true,
            rules: Vec::new(),
        }
    }

    pub fn with_grouping(mut self, grouping: bool) -> Self {
        self.grouping = grouping;
        self
    }

    pub fn with_rule(mut self, rule: MailFilterRule) -> Self {
        self.rules.push(rule);
        self
    }
}

/// A message that failed to import.
#[derive(Debug, Clone, PartialEq)]
pub struct MailImportError {
    /// Source UID as reported by the mailbox (numeric for IMAP, opaque for POP3).
    pub uid: String,
    pub subject: String,
    /// Rendered error with its full cause chain.
    pub trace: String,
    pub date: DateTime<Utc>,
}

/// An external mailbox polled into the repository on behalf of `user`.
#[derive(Debug, Clone)]
pub struct MailAccount {
    pub id: i64,
    /// Repository user that owns imported mail.
    pub user: String,
    pub protocol: MailProtocol,
    /// Host name, optionally with `:port`.
    pub host: String,
    pub mail_user: String,
    pub password: SecretString,
    /// Source folder, `/` or `.` separated.
    pub folder: String,
    /// Highest UID already committed (cursor-capable protocols only).
    pub last_uid: u32,
    pub mark_seen: bool,
    pub mark_deleted: bool,
    pub active: bool,
    pub filters: Vec<MailFilter>,
    pub import_errors: Vec<MailImportError>,
}

impl MailAccount {
    pub fn new(
        user: impl Into<String>,
        protocol: MailProtocol,
        host: impl Into<String>,
        mail_user: impl Into<String>,
        password: SecretString,
    ) -> Self {
        Self {
            id: 0,
            user: user.into(),
            protocol,
            host: host.into(),
            mail_user: mail_user.into(),
            password,
            folder: "INBOX".to_string(),
            last_uid: 0,
            mark_seen: false,
            mark_deleted: false,
            active: true,
            filters: Vec::new(),
            import_errors: Vec::new(),
        }
    }

    /// Split `host[:port]`, falling back to the protocol's default port.
    pub fn endpoint(&self) -> (String, u16) {
        if let Some((host, port)) = self.host.rsplit_once(':')
            && let Ok(port) = port.parse::<u16>()
        {
            return (host.to_string(), port);
        }
        (self.host.clone(), self.protocol.default_port())
    }

    /// Move the cursor forward. Returns `false` (and leaves it untouched) for older UIDs.
    pub fn advance_cursor(&mut self, uid: u32) -> bool {
        if uid > self.last_uid {
            self.last_uid = uid;
            true
        } else {
            false
        }
    }

    pub fn has_import_error(&self, uid: &str) -> bool {
        self.import_errors.iter().any(|e| e.uid == uid)
    }

    /// Append to the ledger unless that UID is already recorded.
    pub fn record_import_error(&mut self, error: MailImportError) -> bool {
        if self.has_import_error(&error.uid) {
            return false;
        }
        self.import_errors.push(error);
        true
    }
}
