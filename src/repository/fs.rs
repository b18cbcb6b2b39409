//! Directory-backed repository.
//!
//! Layout on disk, relative to the root:
//! - folders and mails are directories, documents are files
//! - every node has a JSON sidecar at `<parent>/.docmail/<name>.json`
//!   holding its UUID and metadata (the full mail for mail nodes)
//! - `.docmail-index.json` maps UUIDs to repository paths

use std::collections::HashMap;
use std::fs;
use std::io::{self, ErrorKind};
use std::path::PathBuf;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use super::{NewDocument, NodeRef, Repository, is_path, node_name, parent_path};
use crate::error::RepositoryError;
use crate::mail::CanonicalMail;

const META_DIR: &str = ".docmail";
const INDEX_FILE: &str = ".docmail-index.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum NodeKind {
    Folder,
    Mail,
    Document,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct NodeMeta {
    uuid: String,
    kind: NodeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    owner: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    group_hint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    mail: Option<CanonicalMail>,
}

/// File-backed repository rooted at a directory.
pub struct FsRepository {
    root: PathBuf,
    /// Serializes index updates.
    index_lock: Mutex<()>,
}

impl FsRepository {
    /// Open a repository at `root`, creating the directory if needed.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, RepositoryError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        debug!(root = %root.display(), "Repository opened");
        Ok(Self {
            root,
            index_lock: Mutex::new(()),
        })
    }

    /// Resolve a repository path to a filesystem path.
    fn resolve(&self, path: &str) -> Result<PathBuf, RepositoryError> {
        let mut full = self.root.clone();
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            if segment == "." || segment == ".." || segment.starts_with(META_DIR) {
                return Err(RepositoryError::AccessDenied(path.to_string()));
            }
            full.push(segment);
        }
        Ok(full)
    }

    fn meta_path(&self, path: &str) -> Result<PathBuf, RepositoryError> {
        let parent = self.resolve(parent_path(path))?;
        Ok(parent
            .join(META_DIR)
            .join(format!("{}.json", node_name(path))))
    }

    fn read_meta(&self, path: &str) -> Result<NodeMeta, RepositoryError> {
        let raw = match fs::read(self.meta_path(path)?) {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(RepositoryError::NotFound(path.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        serde_json::from_slice(&raw)
            .map_err(|e| RepositoryError::Backend(format!("corrupt metadata for {path}: {e}")))
    }

    fn write_meta(&self, path: &str, meta: &NodeMeta) -> Result<(), RepositoryError> {
        let meta_path = self.meta_path(path)?;
        if let Some(dir) = meta_path.parent() {
            fs::create_dir_all(dir)?;
        }
        let json = serde_json::to_vec_pretty(meta)
            .map_err(|e| RepositoryError::Backend(format!("serialize metadata: {e}")))?;
        fs::write(meta_path, json)?;
        self.index_insert(&meta.uuid, path)
    }

    fn load_index(&self) -> Result<HashMap<String, String>, RepositoryError> {
        match fs::read(self.root.join(INDEX_FILE)) {
            Ok(raw) => serde_json::from_slice(&raw)
                .map_err(|e| RepositoryError::Backend(format!("corrupt uuid index: {e}"))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(HashMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn index_insert(&self, uuid: &str, path: &str) -> Result<(), RepositoryError> {
        let _guard = self.index_lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut index = self.load_index()?;
        index.insert(uuid.to_string(), path.to_string());
        let json = serde_json::to_vec(&index)
            .map_err(|e| RepositoryError::Backend(format!("serialize uuid index: {e}")))?;
        fs::write(self.root.join(INDEX_FILE), json)?;
        Ok(())
    }

    /// Parent must be an existing folder or mail directory.
    fn check_parent(&self, path: &str) -> Result<(), RepositoryError> {
        let parent = parent_path(path);
        if !self.resolve(parent)?.is_dir() {
            return Err(RepositoryError::NotFound(parent.to_string()));
        }
        Ok(())
    }

    fn create_dir_node(&self, path: &str, meta: NodeMeta) -> Result<NodeRef, RepositoryError> {
        self.check_parent(path)?;
        let dir = self.resolve(path)?;
        fs::create_dir(&dir).map_err(|e| exists_or_io(e, path))?;
        let uuid = meta.uuid.clone();
        self.write_meta(path, &meta)?;
        Ok(NodeRef {
            path: path.to_string(),
            uuid,
        })
    }
}

fn exists_or_io(e: io::Error, path: &str) -> RepositoryError {
    if e.kind() == ErrorKind::AlreadyExists {
        RepositoryError::ItemExists(path.to_string())
    } else {
        RepositoryError::Io(e)
    }
}

fn new_meta(kind: NodeKind) -> NodeMeta {
    NodeMeta {
        uuid: Uuid::new_v4().to_string(),
        kind,
        mime_type: None,
        owner: None,
        group_hint: None,
        mail: None,
    }
}

impl Repository for FsRepository {
    fn has_node(&self, path: &str) -> Result<bool, RepositoryError> {
        Ok(self.resolve(path)?.exists())
    }

    fn create_folder(&self, path: &str) -> Result<NodeRef, RepositoryError> {
        self.create_dir_node(path, new_meta(NodeKind::Folder))
    }

    fn create_mail(&self, mail: &CanonicalMail, owner: &str) -> Result<NodeRef, RepositoryError> {
        let path = mail
            .path
            .clone()
            .ok_or_else(|| RepositoryError::Backend("mail has no path".into()))?;
        let mut meta = new_meta(NodeKind::Mail);
        meta.owner = Some(owner.to_string());
        meta.mail = Some(CanonicalMail {
            uuid: Some(meta.uuid.clone()),
            ..mail.clone()
        });
        self.create_dir_node(&path, meta)
    }

    fn create_document(&self, doc: NewDocument<'_>) -> Result<NodeRef, RepositoryError> {
        self.check_parent(doc.path)?;
        let file_path = self.resolve(doc.path)?;
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&file_path)
            .map_err(|e| exists_or_io(e, doc.path))?;
        io::copy(doc.content, &mut file)?;

        let mut meta = new_meta(NodeKind::Document);
        meta.mime_type = Some(doc.mime_type.to_string());
        meta.owner = Some(doc.owner.to_string());
        meta.group_hint = doc.group_hint.map(str::to_string);
        let uuid = meta.uuid.clone();
        self.write_meta(doc.path, &meta)?;
        Ok(NodeRef {
            path: doc.path.to_string(),
            uuid,
        })
    }

    fn get_content(&self, path: &str) -> Result<Vec<u8>, RepositoryError> {
        let file_path = self.resolve(path)?;
        if !file_path.is_file() {
            return Err(RepositoryError::NotFound(path.to_string()));
        }
        Ok(fs::read(file_path)?)
    }

    fn path_from_uuid(&self, uuid: &str) -> Result<String, RepositoryError> {
        self.load_index()?
            .remove(uuid)
            .ok_or_else(|| RepositoryError::NotFound(uuid.to_string()))
    }

    fn uuid_from_path(&self, path: &str) -> Result<String, RepositoryError> {
        Ok(self.read_meta(path)?.uuid)
    }

    fn get_mail(&self, id: &str) -> Result<CanonicalMail, RepositoryError> {
        let path = if is_path(id) {
            id.to_string()
        } else {
            self.path_from_uuid(id)?
        };
        self.read_meta(&path)?
            .mail
            .ok_or(RepositoryError::NotFound(path))
    }

    fn mail_attachments(&self, mail_path: &str) -> Result<Vec<NodeRef>, RepositoryError> {
        let dir = self.resolve(mail_path)?;
        if self.read_meta(mail_path)?.kind != NodeKind::Mail {
            return Err(RepositoryError::NotFound(mail_path.to_string()));
        }

        let mut names = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            names.push(entry.file_name().to_string_lossy().to_string());
        }
        names.sort();

        names
            .into_iter()
            .map(|name| {
                let path = format!("{}/{}", mail_path.trim_end_matches('/'), name);
                let uuid = self.uuid_from_path(&path)?;
                Ok(NodeRef { path, uuid })
            })
            .collect()
    }
}

impl std::fmt::Debug for FsRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FsRepository")
            .field("root", &self.root)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    use tempfile::TempDir;

    fn to_fs_path(root: &Path, path: &str) -> PathBuf {
        path.split('/')
            .filter(|s| !s.is_empty())
            .fold(root.to_path_buf(), |acc, s| acc.join(s))
    }

    fn test_repo() -> (FsRepository, TempDir) {
        let dir = TempDir::new().unwrap();
        let repo = FsRepository::open(dir.path()).unwrap();
        (repo, dir)
    }

    #[test]
    fn folders_and_mail_roundtrip() {
        let (repo, dir) = test_repo();
        repo.create_missing_folders("/mail/bob/Inbox").unwrap();
        assert!(to_fs_path(dir.path(), "/mail/bob/Inbox").is_dir());

        let mut mail = CanonicalMail::new("Hello", "body");
        mail.from = "ann@example.com".into();
        let node = repo
            .create_mail(&mail.at_path("/mail/bob/Inbox/1-Hello"), "bob")
            .unwrap();

        let loaded = repo.get_mail(&node.uuid).unwrap();
        assert_eq!(loaded.subject, "Hello");
        assert_eq!(loaded.from, "ann@example.com");
        assert_eq!(loaded.uuid.as_deref(), Some(node.uuid.as_str()));
        assert_eq!(
            repo.path_from_uuid(&node.uuid).unwrap(),
            "/mail/bob/Inbox/1-Hello"
        );
    }

    #[test]
    fn documents_under_mail() {
        let (repo, _dir) = test_repo();
        repo.create_folder("/in").unwrap();
        repo.create_mail(&CanonicalMail::new("s", "c").at_path("/in/1-s"), "bob")
            .unwrap();

        for (name, body) in [("b.txt", &b"bee"[..]), ("a.txt", &b"ay"[..])] {
            let mut reader = body;
            repo.create_document(NewDocument {
                path: &format!("/in/1-s/{name}"),
                content: &mut reader,
                size: body.len() as u64,
                mime_type: "text/plain",
                owner: "bob",
                group_hint: None,
            })
            .unwrap();
        }

        let attachments = repo.mail_attachments("/in/1-s").unwrap();
        let paths: Vec<_> = attachments.iter().map(|n| n.path.as_str()).collect();
        assert_eq!(paths, vec!["/in/1-s/a.txt", "/in/1-s/b.txt"]);
        assert_eq!(repo.get_content("/in/1-s/b.txt").unwrap(), b"bee");
    }

    #[test]
    fn duplicate_folder_is_item_exists() {
        let (repo, _dir) = test_repo();
        repo.create_folder("/x").unwrap();
        assert!(matches!(
            repo.create_folder("/x"),
            Err(RepositoryError::ItemExists(_))
        ));
    }

    #[test]
    fn missing_parent_is_not_found() {
        let (repo, _dir) = test_repo();
        assert!(matches!(
            repo.create_folder("/no/such"),
            Err(RepositoryError::NotFound(_))
        ));
    }

    #[test]
    fn traversal_is_denied() {
        let (repo, _dir) = test_repo();
        assert!(matches!(
            repo.has_node("/../etc"),
            Err(RepositoryError::AccessDenied(_))
        ));
        assert!(matches!(
            repo.create_folder("/.docmail"),
            Err(RepositoryError::AccessDenied(_))
        ));
    }
}
