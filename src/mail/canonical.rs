//! The canonical representation of a mail message, independent of its
//! source format.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Subject stored for mail without one.
pub const NO_SUBJECT: &str = "(Message without subject)";

/// Body stored when no text could be extracted.
pub const NO_BODY: &str = "(Message without body)";

/// Body format of a canonical mail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MailMimeType {
    #[default]
    Text,
    Html,
    Undefined,
}

impl MailMimeType {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text/plain",
            Self::Html => "text/html",
            Self::Undefined => "",
        }
    }

    pub fn from_mime(mime: &str) -> Self {
        match mime {
            "text/plain" => Self::Text,
            "text/html" => Self::Html,
            _ => Self::Undefined,
        }
    }
}

/// A parsed message ready to be stored in the repository.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalMail {
    /// Repository path, assigned once the destination is resolved.
    pub path: Option<String>,
    pub uuid: Option<String>,
    pub from: String,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub bcc: Vec<String>,
    pub subject: String,
    pub content: String,
    pub mime_type: MailMimeType,
    pub size: u64,
    pub received_date: DateTime<Utc>,
    pub sent_date: DateTime<Utc>,
}

impl CanonicalMail {
    pub fn new(subject: impl Into<String>, content: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            path: None,
            uuid: None,
            from: String::new(),
            to: Vec::new(),
            cc: Vec::new(),
            bcc: Vec::new(),
            subject: subject.into(),
            content: content.into(),
            mime_type: MailMimeType::Text,
            size: 0,
            received_date: now,
            sent_date: now,
        }
    }

    /// Same mail placed at `path`.
    pub fn at_path(&self, path: impl Into<String>) -> Self {
        Self {
            path: Some(path.into()),
            ..self.clone()
        }
    }
}

/// Strip characters that text columns of the repository reject.
///
/// NUL is removed outright. Lone surrogates cannot survive into a Rust
/// `String`; UTF-16 sources are decoded through [`decode_utf16_dropping_lone`]
/// so they disappear at decode time instead.
pub fn sanitize(text: &str) -> String {
    text.chars().filter(|c| *c != '\0').collect()
}

/// Decode UTF-16 code units, dropping unpaired surrogates.
pub fn decode_utf16_dropping_lone(units: impl IntoIterator<Item = u16>) -> String {
    char::decode_utf16(units).filter_map(Result::ok).collect()
}

/// Sanitized subject, or [`NO_SUBJECT`] when nothing remains.
pub fn subject_or_default(subject: Option<&str>) -> String {
    let cleaned = subject.map(sanitize).unwrap_or_default();
    if cleaned.trim().is_empty() {
        NO_SUBJECT.to_string()
    } else {
        cleaned
    }
}

/// Render a mailbox as `"Name" <email>`, or the bare address when the
/// display name is missing or identical to the address.
pub fn format_address(name: Option<&str>, email: &str) -> String {
    match name {
        Some(name) if !name.is_empty() && name != email => {
            format!("{} <{}>", fix_address_name(name), email)
        }
        _ => email.to_string(),
    }
}

/// Normalize a display name to double-quoted form.
pub fn fix_address_name(name: &str) -> String {
    let name = name.trim();
    if name.is_empty() {
        String::new()
    } else if name.len() >= 2 && name.starts_with('\'') && name.ends_with('\'') {
        format!("\"{}\"", &name[1..name.len() - 1])
    } else if name.len() >= 2 && name.starts_with('"') && name.ends_with('"') {
        name.to_string()
    } else {
        format!("\"{name}\"")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_strips_nul() {
        assert_eq!(sanitize("a\0b\0"), "ab");
        assert_eq!(sanitize("plain"), "plain");
    }

    #[test]
    fn utf16_lone_surrogates_are_dropped() {
        // "a", lone high surrogate, "b", valid pair for U+1F600
        let units = [0x61, 0xD800, 0x62, 0xD83D, 0xDE00];
        assert_eq!(decode_utf16_dropping_lone(units), "ab\u{1F600}");
    }

    #[test]
    fn empty_subject_gets_placeholder() {
        assert_eq!(subject_or_default(None), NO_SUBJECT);
        assert_eq!(subject_or_default(Some("")), NO_SUBJECT);
        assert_eq!(subject_or_default(Some("\0")), NO_SUBJECT);
        assert_eq!(subject_or_default(Some("Hi\0")), "Hi");
    }

    #[test]
    fn address_formatting() {
        assert_eq!(
            format_address(Some("Ann Lee"), "ann@x.org"),
            "\"Ann Lee\" <ann@x.org>"
        );
        assert_eq!(format_address(Some("ann@x.org"), "ann@x.org"), "ann@x.org");
        assert_eq!(format_address(None, "ann@x.org"), "ann@x.org");
        assert_eq!(format_address(Some(""), "ann@x.org"), "ann@x.org");
    }

    #[test]
    fn display_name_quoting() {
        assert_eq!(fix_address_name("  'Bob' "), "\"Bob\"");
        assert_eq!(fix_address_name("\"Bob\""), "\"Bob\"");
        assert_eq!(fix_address_name("Bob"), "\"Bob\"");
        assert_eq!(fix_address_name("   "), "");
        assert_eq!(fix_address_name("'"), "\"'\"");
    }

    #[test]
    fn mime_type_tags() {
        assert_eq!(MailMimeType::from_mime("text/html"), MailMimeType::Html);
        assert_eq!(MailMimeType::from_mime("text/plain"), MailMimeType::Text);
        assert_eq!(MailMimeType::from_mime("x"), MailMimeType::Undefined);
    }
}
