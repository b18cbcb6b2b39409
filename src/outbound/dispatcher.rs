//! Sends composed mail and records user activity.

use std::sync::Arc;

use tracing::{info, warn};

use super::composer::{ComposedMessage, Draft, MailBody, MessageComposer, html_wrapper};
use super::MailTransport;
use crate::config::EngineConfig;
use crate::error::DispatchError;
use crate::repository::{AuditRecord, AuditSink, MimeTypeTable, Repository};

/// A send on behalf of a repository user.
#[derive(Debug, Clone)]
pub struct SendRequest {
    /// Repository user the activity is recorded for.
    pub actor: String,
    pub draft: Draft,
}

pub struct Dispatcher {
    repository: Arc<dyn Repository>,
    mime_types: Arc<dyn MimeTypeTable>,
    transport: Arc<dyn MailTransport>,
    audit: Arc<dyn AuditSink>,
    config: EngineConfig,
}

impl Dispatcher {
    pub fn new(
        repository: Arc<dyn Repository>,
        mime_types: Arc<dyn MimeTypeTable>,
        transport: Arc<dyn MailTransport>,
        audit: Arc<dyn AuditSink>,
        config: EngineConfig,
    ) -> Self {
        Self {
            repository,
            mime_types,
            transport,
            audit,
            config,
        }
    }

    fn composer(&self) -> MessageComposer<'_> {
        MessageComposer {
            repository: self.repository.as_ref(),
            mime_types: self.mime_types.as_ref(),
            config: &self.config,
            default_from: self.transport.default_from(),
        }
    }

    /// Send a draft with its documents attached.
    ///
    /// The body always goes out as inline HTML; a text body is escaped first.
    /// After the transport accepts the message its body is reset to the
    /// wrapped original HTML and rendered again; a failure there is only
    /// logged. Returns the message in its final form.
    pub fn send_documents(&self, request: SendRequest) -> Result<ComposedMessage, DispatchError> {
        let SendRequest { actor, mut draft } = request;
        draft.body = draft.body.into_html();
        let mut composed = self.composer().compose(&draft)?;
        self.transport.send(&composed.render()?)?;
        info!(
            actor = %actor,
            to = ?draft.to,
            attachments = composed.attachments.len(),
            message_id = %composed.message_id,
            "Mail sent"
        );

        composed.body = MailBody::Html(html_wrapper(draft.body.content()));
        if let Err(e) = composed.render() {
            warn!(message_id = %composed.message_id, error = %e, "Failed to save sent message body");
        }

        let recipients = recipient_list(&draft.to);
        if composed.attachments.is_empty() {
            self.audit.record(AuditRecord {
                actor,
                action: "SEND_MAIL_LINK".into(),
                object_id: String::new(),
                object_path: String::new(),
                detail: recipients,
            });
        } else {
            for attachment in &composed.attachments {
                self.audit.record(AuditRecord {
                    actor: actor.clone(),
                    action: "SEND_MAIL_ATTACHMENT".into(),
                    object_id: attachment.node.uuid.clone(),
                    object_path: attachment.node.path.clone(),
                    detail: recipients.clone(),
                });
            }
        }
        Ok(composed)
    }

    /// Plain HTML notification without attachments.
    pub fn send_message(
        &self,
        actor: &str,
        from: Option<&str>,
        to: &[String],
        subject: &str,
        content: &str,
    ) -> Result<ComposedMessage, DispatchError> {
        let mut draft = Draft::new(to.to_vec(), subject, MailBody::Html(content.to_string()));
        draft.from = from.map(str::to_string);
        self.send_documents(SendRequest {
            actor: actor.to_string(),
            draft,
        })
    }

    /// Forward the stored mail `mail_id` (path or UUID) with `message` on top.
    pub fn forward_mail(
        &self,
        actor: &str,
        from: Option<&str>,
        to: &[String],
        message: &str,
        mail_id: &str,
    ) -> Result<ComposedMessage, DispatchError> {
        let mail = self.repository.get_mail(mail_id)?;
        let composer = self.composer();
        let draft = composer.forward_draft(&mail, from, to, message)?;
        let composed = composer.compose(&draft)?;
        self.transport.send(&composed.render()?)?;
        info!(actor, mail = mail_id, to = ?to, "Mail forwarded");

        self.audit.record(AuditRecord {
            actor: actor.to_string(),
            action: "FORWARD_MAIL".into(),
            object_id: mail.uuid.clone().unwrap_or_default(),
            object_path: mail.path.clone().unwrap_or_default(),
            detail: recipient_list(to),
        });
        Ok(composed)
    }
}

fn recipient_list(to: &[String]) -> String {
    format!("[{}]", to.join(", "))
}
