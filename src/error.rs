//! Error types for docmail.

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Mailbox connection and protocol errors.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("Failed to connect to {host}:{port}: {reason}")]
    Connect {
        host: String,
        port: u16,
        reason: String,
    },

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Authentication failed for {user}: {reason}")]
    AuthFailed { user: String, reason: String },

    #[error("Folder not found: {0}")]
    FolderNotFound(String),

    #[error("Protocol error: {command} failed: {reason}")]
    Protocol { command: String, reason: String },

    #[error("Message {0} not found in folder")]
    MessageNotFound(String),

    #[error("Connection closed by server")]
    Closed,

    #[error("Unable to reach mailbox: {0}")]
    Connectivity(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// MIME or compound-document parsing errors.
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("Message is not valid MIME: {0}")]
    Malformed(String),

    #[error("Empty message")]
    Empty,
}

/// Errors reported by the content repository.
#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("Path not found: {0}")]
    NotFound(String),

    #[error("Item already exists: {0}")]
    ItemExists(String),

    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("Quota exceeded for {user}")]
    QuotaExceeded { user: String },

    #[error("Virus detected in {name}: {signature}")]
    VirusDetected { name: String, signature: String },

    #[error("File {name} exceeds maximum size ({size} bytes)")]
    FileSizeExceeded { name: String, size: u64 },

    #[error("Unsupported MIME type {mime} for {name}")]
    UnsupportedMimeType { name: String, mime: String },

    #[error("Repository backend failure: {0}")]
    Backend(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl RepositoryError {
    /// Per-document rejections that must not fail the surrounding mail import.
    pub fn is_policy_rejection(&self) -> bool {
        matches!(
            self,
            Self::QuotaExceeded { .. }
                | Self::VirusDetected { .. }
                | Self::FileSizeExceeded { .. }
                | Self::UnsupportedMimeType { .. }
        )
    }
}

/// Failure importing a single message. Never aborts a run.
#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error("Failed to fetch message {uid}")]
    Fetch {
        uid: String,
        #[source]
        source: ConnectionError,
    },

    #[error("Failed to parse message {uid}")]
    Parse {
        uid: String,
        #[source]
        source: ParseError,
    },

    #[error("Failed to store message {uid} at {path}")]
    Repository {
        uid: String,
        path: String,
        #[source]
        source: RepositoryError,
    },

    #[error("Failed to update flags on message {uid}")]
    Flags {
        uid: String,
        #[source]
        source: ConnectionError,
    },
}

/// Run-level import failures. These abort the account run.
#[derive(Debug, thiserror::Error)]
pub enum ImportError {
    #[error("Mail account {0} not found")]
    AccountNotFound(i64),

    #[error("Mailbox unavailable: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Failed to persist account state: {0}")]
    Persistence(#[from] DatabaseError),
}

/// Outbound transport errors.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("SMTP relay error: {0}")]
    Relay(String),

    #[error("SMTP send failed: {0}")]
    SendFailed(String),
}

/// Errors composing or dispatching outbound mail.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("Invalid address {address}: {reason}")]
    InvalidAddress { address: String, reason: String },

    #[error("No recipients given")]
    NoRecipients,

    #[error("No sender address available")]
    NoSender,

    #[error("Failed to build message: {0}")]
    Build(String),

    #[error("Repository error: {0}")]
    Repository(#[from] RepositoryError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}
