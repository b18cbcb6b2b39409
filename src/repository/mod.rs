//! Content repository collaborators.
//!
//! The engine never manipulates repository storage directly; it goes through
//! [`Repository`] for nodes, [`MimeTypeTable`] for content types and
//! [`AuditSink`] for user activity records.

pub mod audit;
pub mod fs;
pub mod memory;

use std::io::Read;

use crate::error::RepositoryError;
use crate::mail::CanonicalMail;

pub use audit::{AuditRecord, AuditSink, MemoryAudit, TracingAudit};
pub use fs::FsRepository;
pub use memory::MemoryRepository;

/// A node known to the repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeRef {
    pub path: String,
    pub uuid: String,
}

/// Arguments of [`Repository::create_document`].
pub struct NewDocument<'a> {
    pub path: &'a str,
    pub content: &'a mut dyn Read,
    pub size: u64,
    pub mime_type: &'a str,
    pub owner: &'a str,
    /// Set when the attachment name suggested a group of related documents.
    pub group_hint: Option<&'a str>,
}

/// Blocking access to the document repository.
pub trait Repository: Send + Sync {
    fn has_node(&self, path: &str) -> Result<bool, RepositoryError>;

    /// Create a single folder. The parent must exist.
    fn create_folder(&self, path: &str) -> Result<NodeRef, RepositoryError>;

    /// Store `mail` at its assigned path.
    fn create_mail(&self, mail: &CanonicalMail, owner: &str) -> Result<NodeRef, RepositoryError>;

    fn create_document(&self, doc: NewDocument<'_>) -> Result<NodeRef, RepositoryError>;

    fn get_content(&self, path: &str) -> Result<Vec<u8>, RepositoryError>;

    fn path_from_uuid(&self, uuid: &str) -> Result<String, RepositoryError>;

    fn uuid_from_path(&self, path: &str) -> Result<String, RepositoryError>;

    /// Load a stored mail by path or UUID.
    fn get_mail(&self, id: &str) -> Result<CanonicalMail, RepositoryError>;

    /// Documents stored under a mail node, in name order.
    fn mail_attachments(&self, mail_path: &str) -> Result<Vec<NodeRef>, RepositoryError>;

    /// Create every missing folder along `path`.
    ///
    /// Levels are checked before being created, and losing a creation race
    /// to another writer counts as success.
    fn create_missing_folders(&self, path: &str) -> Result<(), RepositoryError> {
        let mut current = String::new();
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            current.push('/');
            current.push_str(segment);
            ensure_folder(self, &current)?;
        }
        Ok(())
    }
}

/// Check-then-create a single folder level.
pub fn ensure_folder<R: Repository + ?Sized>(repo: &R, path: &str) -> Result<(), RepositoryError> {
    if repo.has_node(path)? {
        return Ok(());
    }
    match repo.create_folder(path) {
        Ok(_) | Err(RepositoryError::ItemExists(_)) => Ok(()),
        Err(e) => Err(e),
    }
}

/// Maps file names to MIME types.
pub trait MimeTypeTable: Send + Sync {
    fn lookup(&self, file_name: &str) -> String;
}

/// Extension-based lookup backed by `mime_guess`.
#[derive(Debug, Clone, Copy, Default)]
pub struct GuessMimeTypes;

impl MimeTypeTable for GuessMimeTypes {
    fn lookup(&self, file_name: &str) -> String {
        mime_guess::from_path(file_name.to_lowercase())
            .first_or_octet_stream()
            .essence_str()
            .to_string()
    }
}

/// `true` for absolute repository paths (as opposed to UUIDs).
pub fn is_path(id: &str) -> bool {
    id.starts_with('/')
}

/// Parent of a repository path (`/` for top-level nodes).
pub fn parent_path(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(idx) => &path[..idx],
    }
}

/// Last segment of a repository path.
pub fn node_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_helpers() {
        assert_eq!(parent_path("/mail/bob/Inbox"), "/mail/bob");
        assert_eq!(parent_path("/mail"), "/");
        assert_eq!(node_name("/mail/bob/Inbox"), "Inbox");
        assert_eq!(node_name("report.pdf"), "report.pdf");
        assert!(is_path("/a/b"));
        assert!(!is_path("0b5e4c1e-6a1f-4c43-9a51-3e7f5d5a6d11"));
    }

    #[test]
    fn mime_guess_lookup() {
        let table = GuessMimeTypes;
        assert_eq!(table.lookup("Report.PDF"), "application/pdf");
        assert_eq!(table.lookup("notes.txt"), "text/plain");
        assert_eq!(table.lookup("blob"), "application/octet-stream");
    }

    #[test]
    fn missing_folders_are_created_once() {
        let repo = MemoryRepository::new();
        repo.create_missing_folders("/mail/bob/Inbox").unwrap();
        assert!(repo.has_node("/mail").unwrap());
        assert!(repo.has_node("/mail/bob/Inbox").unwrap());
        // Second pass is a no-op.
        repo.create_missing_folders("/mail/bob/Inbox").unwrap();
    }
}
