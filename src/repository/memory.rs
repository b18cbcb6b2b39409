//! In-memory repository, for tests and embedding.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use uuid::Uuid;

use super::{NewDocument, NodeRef, Repository, is_path, node_name, parent_path};
use crate::error::RepositoryError;
use crate::mail::CanonicalMail;

#[derive(Debug, Clone)]
pub enum MemoryNode {
    Folder,
    Mail(CanonicalMail),
    Document {
        content: Vec<u8>,
        mime_type: String,
        owner: String,
        group_hint: Option<String>,
    },
}

/// Policy rejection the repository raises when a named document is stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    Quota,
    Virus,
    Oversize,
    Backend,
}

#[derive(Default)]
struct State {
    nodes: BTreeMap<String, (String, MemoryNode)>,
    uuids: HashMap<String, String>,
    rejections: HashMap<String, Rejection>,
}

/// Thread-safe map of path to node.
#[derive(Default)]
pub struct MemoryRepository {
    state: Mutex<State>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every later `create_document` for a file called `name` fail.
    pub fn reject_document(&self, name: &str, rejection: Rejection) {
        self.lock().rejections.insert(name.to_string(), rejection);
    }

    pub fn node(&self, path: &str) -> Option<MemoryNode> {
        self.lock().nodes.get(path).map(|(_, node)| node.clone())
    }

    /// All node paths, sorted.
    pub fn paths(&self) -> Vec<String> {
        self.lock().nodes.keys().cloned().collect()
    }

    /// Paths of stored mails, sorted.
    pub fn mail_paths(&self) -> Vec<String> {
        self.lock()
            .nodes
            .iter()
            .filter(|(_, (_, node))| matches!(node, MemoryNode::Mail(_)))
            .map(|(path, _)| path.clone())
            .collect()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // A poisoned lock only means another test thread panicked mid-write.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn insert(&self, path: &str, node: MemoryNode) -> Result<NodeRef, RepositoryError> {
        let mut state = self.lock();
        if state.nodes.contains_key(path) {
            return Err(RepositoryError::ItemExists(path.to_string()));
        }
        let parent = parent_path(path);
        let parent_ok = parent == "/"
            || matches!(
                state.nodes.get(parent),
                Some((_, MemoryNode::Folder | MemoryNode::Mail(_)))
            );
        if !parent_ok {
            return Err(RepositoryError::NotFound(parent.to_string()));
        }

        let uuid = Uuid::new_v4().to_string();
        state.uuids.insert(uuid.clone(), path.to_string());
        state.nodes.insert(path.to_string(), (uuid.clone(), node));
        Ok(NodeRef {
            path: path.to_string(),
            uuid,
        })
    }
}

impl Repository for MemoryRepository {
    fn has_node(&self, path: &str) -> Result<bool, RepositoryError> {
        Ok(self.lock().nodes.contains_key(path))
    }

    fn create_folder(&self, path: &str) -> Result<NodeRef, RepositoryError> {
        self.insert(path, MemoryNode::Folder)
    }

    fn create_mail(&self, mail: &CanonicalMail, _owner: &str) -> Result<NodeRef, RepositoryError> {
        let path = mail
            .path
            .clone()
            .ok_or_else(|| RepositoryError::Backend("mail has no path".into()))?;
        let node = self.insert(&path, MemoryNode::Mail(mail.clone()))?;
        if let Some((_, MemoryNode::Mail(stored))) = self.lock().nodes.get_mut(&path) {
            stored.uuid = Some(node.uuid.clone());
        }
        Ok(node)
    }

    fn create_document(&self, doc: NewDocument<'_>) -> Result<NodeRef, RepositoryError> {
        let name = node_name(doc.path).to_string();
        if let Some(rejection) = self.lock().rejections.get(&name).copied() {
            return Err(match rejection {
                Rejection::Quota => RepositoryError::QuotaExceeded {
                    user: doc.owner.to_string(),
                },
                Rejection::Virus => RepositoryError::VirusDetected {
                    name,
                    signature: "EICAR-Test-File".into(),
                },
                Rejection::Oversize => RepositoryError::FileSizeExceeded {
                    name,
                    size: doc.size,
                },
                Rejection::Backend => RepositoryError::Backend("storage offline".into()),
            });
        }

        let mut content = Vec::with_capacity(doc.size as usize);
        doc.content.read_to_end(&mut content)?;
        self.insert(
            doc.path,
            MemoryNode::Document {
                content,
                mime_type: doc.mime_type.to_string(),
                owner: doc.owner.to_string(),
                group_hint: doc.group_hint.map(str::to_string),
            },
        )
    }

    fn get_content(&self, path: &str) -> Result<Vec<u8>, RepositoryError> {
        match self.lock().nodes.get(path) {
            Some((_, MemoryNode::Document { content, .. })) => Ok(content.clone()),
            _ => Err(RepositoryError::NotFound(path.to_string())),
        }
    }

    fn path_from_uuid(&self, uuid: &str) -> Result<String, RepositoryError> {
        self.lock()
            .uuids
            .get(uuid)
            .cloned()
            .ok_or_else(|| RepositoryError::NotFound(uuid.to_string()))
    }

    fn uuid_from_path(&self, path: &str) -> Result<String, RepositoryError> {
        self.lock()
            .nodes
            .get(path)
            .map(|(uuid, _)| uuid.clone())
            .ok_or_else(|| RepositoryError::NotFound(path.to_string()))
    }

    fn get_mail(&self, id: &str) -> Result<CanonicalMail, RepositoryError> {
        let path = if is_path(id) {
            id.to_string()
        } else {
            self.path_from_uuid(id)?
        };
        match self.lock().nodes.get(&path) {
            Some((_, MemoryNode::Mail(mail))) => Ok(mail.clone()),
            _ => Err(RepositoryError::NotFound(path)),
        }
    }

    fn mail_attachments(&self, mail_path: &str) -> Result<Vec<NodeRef>, RepositoryError> {
        let state = self.lock();
        if !matches!(state.nodes.get(mail_path), Some((_, MemoryNode::Mail(_)))) {
            return Err(RepositoryError::NotFound(mail_path.to_string()));
        }
        Ok(state
            .nodes
            .iter()
            .filter(|(path, (_, node))| {
                parent_path(path) == mail_path && matches!(node, MemoryNode::Document { .. })
            })
            .map(|(path, (uuid, _))| NodeRef {
                path: path.clone(),
                uuid: uuid.clone(),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_doc(repo: &MemoryRepository, path: &str, body: &[u8]) -> Result<NodeRef, RepositoryError> {
        let mut reader = body;
        repo.create_document(NewDocument {
            path,
            content: &mut reader,
            size: body.len() as u64,
            mime_type: "text/plain",
            owner: "bob",
            group_hint: None,
        })
    }

    #[test]
    fn folder_requires_parent() {
        let repo = MemoryRepository::new();
        assert!(matches!(
            repo.create_folder("/a/b"),
            Err(RepositoryError::NotFound(_))
        ));
        repo.create_folder("/a").unwrap();
        repo.create_folder("/a/b").unwrap();
        assert!(matches!(
            repo.create_folder("/a/b"),
            Err(RepositoryError::ItemExists(_))
        ));
    }

    #[test]
    fn mail_with_attachments() {
        let repo = MemoryRepository::new();
        repo.create_folder("/in").unwrap();
        let mail = CanonicalMail::new("s", "c").at_path("/in/1-s");
        let node = repo.create_mail(&mail, "bob").unwrap();
        store_doc(&repo, "/in/1-s/b.txt", b"B").unwrap();
        store_doc(&repo, "/in/1-s/a.txt", b"A").unwrap();

        let loaded = repo.get_mail(&node.uuid).unwrap();
        assert_eq!(loaded.uuid.as_deref(), Some(node.uuid.as_str()));
        let names: Vec<_> = repo
            .mail_attachments("/in/1-s")
            .unwrap()
            .into_iter()
            .map(|n| n.path)
            .collect();
        assert_eq!(names, vec!["/in/1-s/a.txt", "/in/1-s/b.txt"]);
        assert_eq!(repo.get_content("/in/1-s/a.txt").unwrap(), b"A");
    }

    #[test]
    fn uuid_path_resolution() {
        let repo = MemoryRepository::new();
        let node = repo.create_folder("/docs").unwrap();
        assert_eq!(repo.path_from_uuid(&node.uuid).unwrap(), "/docs");
        assert_eq!(repo.uuid_from_path("/docs").unwrap(), node.uuid);
        assert!(repo.path_from_uuid("missing").is_err());
    }

    #[test]
    fn configured_rejection() {
        let repo = MemoryRepository::new();
        repo.create_folder("/d").unwrap();
        repo.reject_document("eicar.com", Rejection::Virus);
        let err = store_doc(&repo, "/d/eicar.com", b"X").unwrap_err();
        assert!(err.is_policy_rejection());
        assert!(!repo.has_node("/d/eicar.com").unwrap());
    }
}
