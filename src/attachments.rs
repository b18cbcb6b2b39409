//! Storage of message attachments as documents under their mail node.

use tracing::{debug, warn};

use crate::error::RepositoryError;
use crate::mail::{MimeBody, MimePart, OutlookAttachment};
use crate::path::escape_name;
use crate::repository::{MimeTypeTable, NewDocument, NodeRef, Repository};

/// Outcome of importing the attachments of one message.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct AttachmentReport {
    pub stored: Vec<NodeRef>,
    /// Names refused by repository policy (quota, virus, size, type).
    pub rejected: Vec<String>,
}

/// Shared context of an attachment import.
pub struct AttachmentTarget<'a> {
    pub repository: &'a dyn Repository,
    pub mime_types: &'a dyn MimeTypeTable,
    /// Path of the mail node the documents are stored under.
    pub mail_path: &'a str,
    pub subject: &'a str,
    pub owner: &'a str,
}

/// Store every named part of a multipart message after its first part.
pub fn import_mime_attachments(
    target: &AttachmentTarget<'_>,
    root: &MimePart,
) -> Result<AttachmentReport, RepositoryError> {
    let mut report = AttachmentReport::default();
    let MimeBody::Multipart(children) = &root.body else {
        return Ok(report);
    };

    for part in children.iter().skip(1) {
        let Some(name) = part.file_name.as_deref() else {
            continue;
        };
        let mime_type = target.mime_types.lookup(&name.to_lowercase());
        store(target, name, &mime_type, &part.payload(), &mut report)?;
    }
    Ok(report)
}

/// Store the file attachments of an Outlook message. Embedded messages are skipped.
pub fn import_outlook_attachments(
    target: &AttachmentTarget<'_>,
    attachments: &[OutlookAttachment],
) -> Result<AttachmentReport, RepositoryError> {
    let mut report = AttachmentReport::default();
    for attachment in attachments {
        let OutlookAttachment::File {
            long_filename,
            filename,
            data,
        } = attachment
        else {
            continue;
        };
        let Some(name) = long_filename.as_deref().or(filename.as_deref()) else {
            continue;
        };
        debug!(name, "Importing attachment");
        let mime_type = target.mime_types.lookup(&document_name(name).to_lowercase());
        store(target, name, &mime_type, data, &mut report)?;
    }
    Ok(report)
}

fn store(
    target: &AttachmentTarget<'_>,
    raw_name: &str,
    mime_type: &str,
    data: &[u8],
    report: &mut AttachmentReport,
) -> Result<(), RepositoryError> {
    let name = free_name(target.repository, target.mail_path, &document_name(raw_name))?;
    let path = format!("{}/{}", target.mail_path, name);
    let group_hint = raw_name.contains('/').then_some(target.subject);

    let mut reader = data;
    let created = target.repository.create_document(NewDocument {
        path: &path,
        content: &mut reader,
        size: data.len() as u64,
        mime_type,
        owner: target.owner,
        group_hint,
    });

    match created {
        Ok(node) => {
            report.stored.push(node);
            Ok(())
        }
        Err(e) if e.is_policy_rejection() => {
            warn!(path = %path, error = %e, "Attachment rejected by repository policy");
            report.rejected.push(name);
            Ok(())
        }
        Err(e) => Err(e),
    }
}

/// Single path segment for a declared attachment name.
fn document_name(raw: &str) -> String {
    let last = raw.rsplit(['/', '\\']).next().unwrap_or(raw);
    let escaped = escape_name(last);
    if escaped.is_empty() || escaped == "." || escaped == ".." {
        "attachment".to_string()
    } else {
        escaped
    }
}

/// `name`, or `stem (j).ext` with the smallest free `j`.
fn free_name(repo: &dyn Repository, parent: &str, name: &str) -> Result<String, RepositoryError> {
    let (stem, ext) = match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => (stem, Some(ext)),
        _ => (name, None),
    };

    let mut candidate = name.to_string();
    let mut j = 1;
    while repo.has_node(&format!("{parent}/{candidate}"))? {
        candidate = match ext {
            Some(ext) => format!("{stem} ({j}).{ext}"),
            None => format!("{stem} ({j})"),
        };
        j += 1;
    }
    Ok(candidate)
}
