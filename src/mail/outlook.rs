//! Outlook (`.msg` compound document) messages.
//!
//! Decoding the compound file itself is the caller's job; this module takes
//! the decoded properties and maps them onto [`CanonicalMail`].

use chrono::{DateTime, Utc};

use super::canonical::{
    CanonicalMail, MailMimeType, fix_address_name, format_address, sanitize, subject_or_default,
};
use crate::error::ParseError;

/// A recipient entry of the recipient table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutlookRecipient {
    pub name: String,
    pub email: String,
}

impl OutlookRecipient {
    pub fn new(name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            email: email.into(),
        }
    }

    fn formatted(&self) -> String {
        sanitize(&format_address(Some(&self.name), &self.email))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum OutlookAttachment {
    File {
        long_filename: Option<String>,
        filename: Option<String>,
        data: Vec<u8>,
    },
    /// Embedded message; never imported as a document.
    Message { subject: Option<String> },
}

/// Decoded properties of an Outlook message.
#[derive(Debug, Clone, Default)]
pub struct OutlookMessage {
    pub subject: Option<String>,
    pub body_rtf: Option<String>,
    pub body_html: Option<String>,
    pub body_text: Option<String>,
    /// `;`-separated display names, as shown by Outlook.
    pub display_to: String,
    pub display_cc: String,
    pub display_bcc: String,
    /// Full recipient table.
    pub recipients: Vec<OutlookRecipient>,
    pub to_recipient: Option<OutlookRecipient>,
    pub cc_recipients: Vec<OutlookRecipient>,
    pub bcc_recipients: Vec<OutlookRecipient>,
    pub from_name: Option<String>,
    pub from_email: String,
    /// Delivery time.
    pub date: Option<DateTime<Utc>>,
    pub creation_date: Option<DateTime<Utc>>,
    pub attachments: Vec<OutlookAttachment>,
}

/// Converts RTF bodies to HTML.
pub trait RtfConverter: Send + Sync {
    fn rtf_to_html(&self, rtf: &str) -> Result<String, ParseError>;
}

const FONT_DOWNSIZE: [(&str, &str); 3] = [
    (
        "<font size=\"3\" style=\"font-size: 12pt\">",
        "<font size=\"2\" style=\"font-size: 10pt\">",
    ),
    (
        "<FONT SIZE=\"3\" STYLE=\"font-size: 12pt\">",
        "<FONT SIZE=\"2\" STYLE=\"font-size: 10pt\">",
    ),
    (
        "<FONT SIZE=3 STYLE=\"font-size: 12pt\">",
        "<FONT SIZE=2 STYLE=\"font-size: 10pt\">",
    ),
];

/// Map an Outlook message onto the canonical form.
pub fn parse_outlook(msg: &OutlookMessage, rtf: Option<&dyn RtfConverter>) -> CanonicalMail {
    let (mime_type, content) = body(msg, rtf);
    let now = Utc::now();

    CanonicalMail {
        path: None,
        uuid: None,
        from: sanitize(&format!(
            "{} <{}>",
            fix_address_name(msg.from_name.as_deref().unwrap_or_default()),
            msg.from_email
        )),
        to: recipients_of(
            &msg.display_to,
            &msg.recipients,
            msg.to_recipient.as_slice(),
        ),
        cc: recipients_of(&msg.display_cc, &msg.recipients, &msg.cc_recipients),
        bcc: recipients_of(&msg.display_bcc, &msg.recipients, &msg.bcc_recipients),
        subject: subject_or_default(msg.subject.as_deref()),
        size: content.len() as u64,
        content,
        mime_type,
        received_date: msg.date.unwrap_or(now),
        sent_date: msg.creation_date.unwrap_or(now),
    }
}

fn body(msg: &OutlookMessage, rtf: Option<&dyn RtfConverter>) -> (MailMimeType, String) {
    if let (Some(source), Some(converter)) = (msg.body_rtf.as_deref(), rtf) {
        match converter.rtf_to_html(source) {
            Ok(html) => {
                let mut html = html.replace("<br>", "").replace("<BR>", "");
                for (from, to) in FONT_DOWNSIZE {
                    html = html.replace(from, to);
                }
                return (MailMimeType::Html, sanitize(&html));
            }
            Err(e) => {
                tracing::warn!(error = %e, "RTF body conversion failed, using alternate body");
            }
        }
    }

    if let Some(html) = &msg.body_html {
        (MailMimeType::Html, sanitize(html))
    } else if let Some(text) = &msg.body_text {
        (MailMimeType::Text, sanitize(text))
    } else {
        (MailMimeType::Undefined, String::new())
    }
}

fn recipients_of(
    display: &str,
    table: &[OutlookRecipient],
    explicit: &[OutlookRecipient],
) -> Vec<String> {
    if !display.is_empty() && !table.is_empty() {
        resolve_display(display, table)
    } else {
        explicit.iter().map(OutlookRecipient::formatted).collect()
    }
}

/// Resolve `;`-separated display names against the recipient table.
/// Names without a matching entry are dropped.
fn resolve_display(display: &str, table: &[OutlookRecipient]) -> Vec<String> {
    display
        .split(';')
        .map(|name| name.trim_start().trim_end_matches('\0'))
        .filter_map(|name| table.iter().find(|r| r.name == name))
        .map(OutlookRecipient::formatted)
        .collect()
}
