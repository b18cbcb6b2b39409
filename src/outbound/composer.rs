//! Builds outbound messages from a draft and repository documents.

use std::sync::LazyLock;
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use lettre::Message;
use lettre::message::header::{ContentDisposition, ContentType};
use lettre::message::{Attachment, Mailbox, MultiPart, SinglePart};
use regex::Regex;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{XMailer, XMessageId};
use crate::config::EngineConfig;
use crate::error::DispatchError;
use crate::mail::{CanonicalMail, MailMimeType};
use crate::repository::{MimeTypeTable, NodeRef, Repository, is_path, node_name};

static MAIL_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^([_A-Za-z0-9-]+)(\.[_A-Za-z0-9-]+)*@[A-Za-z0-9-]+(\.[A-Za-z0-9-]+)*(\.[A-Za-z]{2,})$",
    )
    .unwrap_or_else(|e| panic!("invalid mail pattern: {e}"))
});

static INTERNAL_LINK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r##"onclick="javascript:parent\.jsOpenPathByUuid\('(.*?)'\);" href="#""##)
        .unwrap_or_else(|e| panic!("invalid link pattern: {e}"))
});

/// Primary body of an outbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MailBody {
    Text(String),
    Html(String),
}

impl MailBody {
    pub fn content(&self) -> &str {
        match self {
            Self::Text(s) | Self::Html(s) => s,
        }
    }

    /// HTML rendition: text is escaped and its line breaks kept.
    pub fn into_html(self) -> Self {
        match self {
            Self::Text(text) => Self::Html(text_to_html(&text)),
            html @ Self::Html(_) => html,
        }
    }
}

/// What the caller wants to send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Draft {
    /// Caller's address, used only when sending as the user is enabled.
    pub from: Option<String>,
    pub reply_to: Vec<String>,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub bcc: Vec<String>,
    pub subject: String,
    pub body: MailBody,
    /// Document paths or UUIDs to attach.
    pub documents: Vec<String>,
}

impl Draft {
    pub fn new(to: Vec<String>, subject: impl Into<String>, body: MailBody) -> Self {
        Self {
            from: None,
            reply_to: Vec::new(),
            to,
            cc: Vec::new(),
            bcc: Vec::new(),
            subject: subject.into(),
            body,
            documents: Vec::new(),
        }
    }
}

/// A repository document resolved for attachment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundAttachment {
    pub node: NodeRef,
    pub name: String,
    pub mime_type: String,
    pub data: Vec<u8>,
}

/// A fully resolved message. Rendering is repeatable; the message id and
/// sent date stay fixed across renders.
#[derive(Debug, Clone)]
pub struct ComposedMessage {
    pub from: Mailbox,
    pub reply_to: Vec<Mailbox>,
    pub to: Vec<Mailbox>,
    pub cc: Vec<Mailbox>,
    pub bcc: Vec<Mailbox>,
    pub subject: String,
    pub body: MailBody,
    pub attachments: Vec<OutboundAttachment>,
    pub x_mailer: String,
    pub message_id: String,
    pub sent_date: DateTime<Utc>,
}

impl ComposedMessage {
    /// Render as a `multipart/mixed` message: the inline body first, then
    /// one part per attachment.
    pub fn render(&self) -> Result<Message, DispatchError> {
        let mut builder = Message::builder()
            .from(self.from.clone())
            .subject(self.subject.clone())
            .date(SystemTime::from(self.sent_date))
            .header(XMailer(self.x_mailer.clone()))
            .header(XMessageId(self.message_id.clone()));
        for mailbox in &self.reply_to {
            builder = builder.reply_to(mailbox.clone());
        }
        for mailbox in &self.to {
            builder = builder.to(mailbox.clone());
        }
        for mailbox in &self.cc {
            builder = builder.cc(mailbox.clone());
        }
        for mailbox in &self.bcc {
            builder = builder.bcc(mailbox.clone());
        }

        let (content_type, content) = match &self.body {
            MailBody::Html(html) => (ContentType::TEXT_HTML, html.clone()),
            MailBody::Text(text) => (ContentType::TEXT_PLAIN, text.clone()),
        };
        let mut parts = MultiPart::mixed().singlepart(
            SinglePart::builder()
                .header(content_type)
                .header(ContentDisposition::inline())
                .body(content),
        );
        for attachment in &self.attachments {
            let content_type = ContentType::parse(&attachment.mime_type)
                .or_else(|_| ContentType::parse("application/octet-stream"))
                .map_err(|e| DispatchError::Build(format!("{}: {e}", attachment.name)))?;
            parts = parts.singlepart(
                Attachment::new(attachment.name.clone()).body(attachment.data.clone(), content_type),
            );
        }

        builder
            .multipart(parts)
            .map_err(|e| DispatchError::Build(e.to_string()))
    }
}

/// Resolves drafts against the repository and engine policy.
pub struct MessageComposer<'a> {
    pub repository: &'a dyn Repository,
    pub mime_types: &'a dyn MimeTypeTable,
    pub config: &'a EngineConfig,
    /// Transport identity.
    pub default_from: Option<String>,
}

impl MessageComposer<'_> {
    /// Compose `draft`. HTML bodies get their internal links rewritten and
    /// are wrapped in a minimal document.
    pub fn compose(&self, draft: &Draft) -> Result<ComposedMessage, DispatchError> {
        if draft.to.is_empty() {
            return Err(DispatchError::NoRecipients);
        }

        let body = match &draft.body {
            MailBody::Html(text) => MailBody::Html(html_wrapper(&rewrite_links(
                text,
                &self.config.application_url,
            ))),
            MailBody::Text(text) => MailBody::Text(text.clone()),
        };

        let attachments = draft
            .documents
            .iter()
            .map(|id| self.attachment(id))
            .collect::<Result<Vec<_>, _>>()?;

        let composed = ComposedMessage {
            from: self.sender(draft.from.as_deref())?,
            reply_to: mailboxes(&draft.reply_to)?,
            to: mailboxes(&draft.to)?,
            cc: mailboxes(&draft.cc)?,
            bcc: mailboxes(&draft.bcc)?,
            subject: draft.subject.clone(),
            body,
            attachments,
            x_mailer: self.config.x_mailer.clone(),
            message_id: format!("{}-{}", self.config.message_id_prefix, Uuid::new_v4()),
            sent_date: Utc::now(),
        };
        // Surface build errors before anything is handed to a transport.
        composed.render()?;
        debug!(
            to = composed.to.len(),
            attachments = composed.attachments.len(),
            message_id = %composed.message_id,
            "Message composed"
        );
        Ok(composed)
    }

    /// Draft forwarding a stored mail with `message` prepended.
    pub fn forward_draft(
        &self,
        mail: &CanonicalMail,
        from: Option<&str>,
        to: &[String],
        message: &str,
    ) -> Result<Draft, DispatchError> {
        let body = match mail.mime_type {
            MailMimeType::Html => MailBody::Html(format!(
                "{message}<br/><br/>---------- Forwarded message ----------<br/><br/>{}",
                mail.content
            )),
            MailMimeType::Text => MailBody::Text(format!(
                "{message}\n\n---------- Forwarded message ----------\n\n{}",
                mail.content
            )),
            MailMimeType::Undefined => {
                warn!(subject = %mail.subject, "Stored mail has no content type");
                MailBody::Text(mail.content.clone())
            }
        };

        let documents = match &mail.path {
            Some(path) => self
                .repository
                .mail_attachments(path)?
                .into_iter()
                .map(|node| node.path)
                .collect(),
            None => Vec::new(),
        };

        Ok(Draft {
            from: from.map(str::to_string),
            reply_to: Vec::new(),
            to: to.to_vec(),
            cc: Vec::new(),
            bcc: Vec::new(),
            subject: format!("Fwd: {}", mail.subject),
            body,
            documents,
        })
    }

    fn sender(&self, from: Option<&str>) -> Result<Mailbox, DispatchError> {
        let address = match from {
            Some(from) if self.config.send_as_user => Some(from.to_string()),
            _ => self.default_from.clone(),
        };
        let address = address.ok_or(DispatchError::NoSender)?;
        parse_mailbox(&address)
    }

    fn attachment(&self, id: &str) -> Result<OutboundAttachment, DispatchError> {
        let (path, uuid) = if is_path(id) {
            (id.to_string(), self.repository.uuid_from_path(id)?)
        } else {
            (self.repository.path_from_uuid(id)?, id.to_string())
        };
        let name = node_name(&path).to_string();
        let mime_type = self.mime_types.lookup(&name.to_lowercase());
        let data = self.repository.get_content(&path)?;
        Ok(OutboundAttachment {
            node: NodeRef { path, uuid },
            name,
            mime_type,
            data,
        })
    }
}

fn parse_mailbox(address: &str) -> Result<Mailbox, DispatchError> {
    address
        .trim()
        .parse()
        .map_err(|e: lettre::address::AddressError| DispatchError::InvalidAddress {
            address: address.to_string(),
            reason: e.to_string(),
        })
}

fn mailboxes(addresses: &[String]) -> Result<Vec<Mailbox>, DispatchError> {
    addresses.iter().map(|a| parse_mailbox(a)).collect()
}

/// Wrap body text in the fixed HTML document used for outbound mail.
pub fn html_wrapper(text: &str) -> String {
    format!(
        "<!DOCTYPE html PUBLIC \"-//W3C//DTD HTML 4.01 Transitional//EN\">\n\
         <html>\n<head>\n\
         <meta content=\"text/html;charset=UTF-8\" http-equiv=\"Content-Type\"/>\n\
         </head>\n<body>\n{text}\n</body>\n</html>"
    )
}

/// Turn in-app document links into absolute `?uuid=` links.
pub fn rewrite_links(body: &str, application_url: &str) -> String {
    INTERNAL_LINK
        .replace_all(body, |caps: &regex::Captures<'_>| {
            format!("href=\"{application_url}?uuid={}\"", &caps[1])
        })
        .into_owned()
}

/// Split a comma-separated address list, keeping syntactically valid entries.
pub fn parse_mail_list(mails: &str) -> Vec<String> {
    mails
        .split(',')
        .map(str::trim)
        .filter(|m| MAIL_REGEX.is_match(m))
        .map(str::to_string)
        .collect()
}

/// Render a stored mail as a small HTML page.
pub fn mail_to_html(mail: &CanonicalMail) -> String {
    let content = match mail.mime_type {
        MailMimeType::Html => mail.content.clone(),
        _ => text_to_html(&mail.content),
    };
    format!(
        "<html>\n<head>\n\
         <meta content=\"text/html;charset=UTF-8\" http-equiv=\"Content-Type\"/>\n\
         <title>{subject}</title>\n</head>\n<body>\n\
         <table>\n\
         <tr><td><b>From:</b></td><td>{from}</td></tr>\n\
         <tr><td><b>To:</b></td><td>{to}</td></tr>\n\
         <tr><td><b>Subject:</b></td><td>{subject}</td></tr>\n\
         </table>\n<hr/>\n{content}\n</body>\n</html>",
        from = escape_html(&mail.from),
        to = escape_html(&mail.to.join(", ")),
        subject = escape_html(&mail.subject),
    )
}

fn text_to_html(text: &str) -> String {
    escape_html(text).replace('\n', "<br/>\n")
}

fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}
