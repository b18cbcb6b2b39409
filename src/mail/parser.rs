//! MIME message parsing into [`CanonicalMail`].
//!
//! The raw message is parsed with `mail-parser`, lifted into a small owned
//! tree ([`MimePart`]) and the body is picked by a reduction over that tree:
//!
//! - `multipart/alternative`: the first `text/html` child wins, otherwise the
//!   last child that produced text.
//! - any other `multipart/*`: the first child that produces text.
//! - `message/rfc822`: the nested message's root.
//! - leaves: decoded text, classified by declared content type. Text the
//!   parser could only decode lossily is re-decoded with charset detection.

use chrono::{DateTime, Utc};
use mail_parser::decoders::base64::base64_decode;
use mail_parser::decoders::charsets::map::charset_decoder;
use mail_parser::decoders::quoted_printable::quoted_printable_decode;
use mail_parser::{Address, Encoding, MessageParser, MessagePart, MimeHeaders, PartType};

use super::canonical::{
    CanonicalMail, MailMimeType, NO_BODY, format_address, sanitize, subject_or_default,
};
use super::charset;
use crate::error::ParseError;

/// Owned MIME tree node.
#[derive(Debug, Clone, PartialEq)]
pub struct MimePart {
    /// Lowercase `type/subtype`, `None` when the part declares nothing.
    pub content_type: Option<String>,
    pub charset: Option<String>,
    /// Decoded attachment file name, if declared.
    pub file_name: Option<String>,
    pub body: MimeBody,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MimeBody {
    /// Decoded text of a text leaf.
    Text(String),
    /// Transfer-decoded bytes of a non-text leaf.
    Bytes(Vec<u8>),
    Multipart(Vec<MimePart>),
    /// An embedded `message/rfc822`.
    Message { raw: Vec<u8>, root: Box<MimePart> },
}

impl MimePart {
    pub fn is_mime_type(&self, mime: &str) -> bool {
        self.content_type.as_deref() == Some(mime)
    }

    pub fn is_multipart(&self) -> bool {
        matches!(self.body, MimeBody::Multipart(_))
    }

    /// Payload bytes as they would be stored for an attachment.
    pub fn payload(&self) -> Vec<u8> {
        match &self.body {
            MimeBody::Text(text) => text.as_bytes().to_vec(),
            MimeBody::Bytes(bytes) => bytes.clone(),
            MimeBody::Message { raw, .. } => raw.clone(),
            MimeBody::Multipart(_) => Vec::new(),
        }
    }
}

/// A parsed message: the canonical mail plus its MIME tree for attachment import.
#[derive(Debug, Clone)]
pub struct ParsedMessage {
    pub mail: CanonicalMail,
    pub root: MimePart,
}

/// Parse an RFC 5322 message.
///
/// `received` is the store's internal date and `size` the store-reported
/// size, both used when known.
pub fn parse_mime(
    raw: &[u8],
    received: Option<DateTime<Utc>>,
    size: Option<u64>,
) -> Result<ParsedMessage, ParseError> {
    if raw.iter().all(u8::is_ascii_whitespace) {
        return Err(ParseError::Empty);
    }

    let message = MessageParser::default()
        .parse(raw)
        .ok_or_else(|| ParseError::Malformed("not an RFC 5322 message".into()))?;
    if message.headers().is_empty() {
        return Err(ParseError::Malformed("missing header block".into()));
    }

    let root = lift(&message, 0, 0)?;
    let (mime_type, content) = extract_text(&root)
        .unwrap_or_else(|| (MailMimeType::Text, NO_BODY.to_string()));

    let now = Utc::now();
    let sent_date = message
        .date()
        .and_then(|d| DateTime::from_timestamp(d.to_timestamp(), 0))
        .unwrap_or(now);

    let mail = CanonicalMail {
        path: None,
        uuid: None,
        from: addresses(message.from()).into_iter().next().unwrap_or_default(),
        to: addresses(message.to()),
        cc: addresses(message.cc()),
        bcc: addresses(message.bcc()),
        subject: subject_or_default(message.subject()),
        content: sanitize(&content),
        mime_type,
        size: size.unwrap_or(raw.len() as u64),
        received_date: received.unwrap_or(now),
        sent_date,
    };

    Ok(ParsedMessage { mail, root })
}

const MAX_DEPTH: usize = 32;

fn lift(
    message: &mail_parser::Message<'_>,
    id: usize,
    depth: usize,
) -> Result<MimePart, ParseError> {
    if depth > MAX_DEPTH {
        return Err(ParseError::Malformed("MIME nesting too deep".into()));
    }
    let part = message
        .parts
        .get(id)
        .ok_or_else(|| ParseError::Malformed(format!("dangling MIME part {id}")))?;

    let content_type = MimeHeaders::content_type(part).map(|ct| match ct.subtype() {
        Some(sub) => format!("{}/{}", ct.ctype(), sub).to_ascii_lowercase(),
        None => ct.ctype().to_ascii_lowercase(),
    });
    let charset = MimeHeaders::content_type(part)
        .and_then(|ct| ct.attribute("charset"))
        .map(str::to_string);
    let file_name = MimeHeaders::attachment_name(part).map(str::to_string);

    let body = match &part.body {
        PartType::Text(text) | PartType::Html(text) => {
            match undecoded_text(message, part, charset.as_deref()) {
                Some(bytes) => MimeBody::Text(charset::decode_text(&bytes, charset.as_deref())),
                None => MimeBody::Text(text.to_string()),
            }
        }
        PartType::Binary(bytes) | PartType::InlineBinary(bytes) => MimeBody::Bytes(bytes.to_vec()),
        PartType::Message(nested) => MimeBody::Message {
            raw: nested.raw_message.to_vec(),
            root: Box::new(lift(nested, 0, depth + 1)?),
        },
        PartType::Multipart(children) => MimeBody::Multipart(
            children
                .iter()
                .map(|child| lift(message, *child as usize, depth + 1))
                .collect::<Result<_, _>>()?,
        ),
    };

    Ok(MimePart {
        content_type,
        charset,
        file_name,
        body,
    })
}

/// Transfer-decoded bytes of a text leaf the MIME parser could only decode
/// lossily: the declared charset is unknown (or missing) and the content is
/// not UTF-8. `None` when the parser's own text is trustworthy.
fn undecoded_text(
    message: &mail_parser::Message<'_>,
    part: &MessagePart<'_>,
    declared: Option<&str>,
) -> Option<Vec<u8>> {
    if declared.is_some_and(|label| charset_decoder(label.trim().as_bytes()).is_some()) {
        return None;
    }
    let raw = message
        .raw_message
        .get(part.offset_body as usize..part.offset_end as usize)?;
    let bytes = match part.encoding {
        Encoding::Base64 => base64_decode(raw).unwrap_or_else(|| raw.to_vec()),
        Encoding::QuotedPrintable => quoted_printable_decode(raw).unwrap_or_else(|| raw.to_vec()),
        Encoding::None => raw.to_vec(),
    };
    if std::str::from_utf8(&bytes).is_ok() {
        return None;
    }
    Some(bytes)
}

/// Body text of a MIME tree, or `None` when nothing readable is present.
pub fn extract_text(part: &MimePart) -> Option<(MailMimeType, String)> {
    match &part.body {
        MimeBody::Multipart(children) if part.is_mime_type("multipart/alternative") => {
            let mut text = None;
            for child in children {
                if child.is_mime_type("text/html") {
                    text = extract_text(child).or(text);
                    break;
                }
                if let Some(found) = extract_text(child) {
                    text = Some(found);
                }
            }
            text
        }
        MimeBody::Multipart(children) => children.iter().find_map(extract_text),
        MimeBody::Message { root, .. } => extract_text(root),
        MimeBody::Text(_) | MimeBody::Bytes(_) => leaf_text(part),
    }
}

fn leaf_text(part: &MimePart) -> Option<(MailMimeType, String)> {
    let text = match &part.body {
        MimeBody::Text(text) => text.clone(),
        MimeBody::Bytes(bytes) => charset::decode_text(bytes, part.charset.as_deref()),
        _ => return None,
    };
    if text.trim().is_empty() {
        return None;
    }
    Some((classify(part.content_type.as_deref(), &text), text))
}

fn classify(content_type: Option<&str>, text: &str) -> MailMimeType {
    match content_type {
        Some("text/html") => MailMimeType::Html,
        Some("text/plain") | None => MailMimeType::Text,
        Some(_) if text.to_ascii_lowercase().contains("<html>") => MailMimeType::Html,
        Some(_) => MailMimeType::Text,
    }
}

/// Formatted mailboxes of an address header; groups are flattened.
fn addresses(addr: Option<&Address<'_>>) -> Vec<String> {
    let Some(addr) = addr else {
        return Vec::new();
    };
    let mailboxes: Vec<&mail_parser::Addr<'_>> = match addr {
        Address::List(list) => list.iter().collect(),
        Address::Group(groups) => groups.iter().flat_map(|g| g.addresses.iter()).collect(),
    };
    mailboxes
        .into_iter()
        .filter_map(|a| {
            let email = a.address.as_deref()?;
            Some(sanitize(&format_address(a.name.as_deref(), email)))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(raw: &str) -> ParsedMessage {
        parse_mime(raw.as_bytes(), None, None).unwrap()
    }

    // ── Body selection ──────────────────────────────────────────────

    #[test]
    fn plain_message() {
        let parsed = parse(
            "From: Ann <ann@example.com>\r\n\
             To: bob@example.com\r\n\
             Subject: Hello\r\n\
             Date: Tue, 5 Mar 2024 10:00:00 +0000\r\n\
             \r\n\
             Just text.\r\n",
        );
        assert_eq!(parsed.mail.subject, "Hello");
        assert_eq!(parsed.mail.from, "\"Ann\" <ann@example.com>");
        assert_eq!(parsed.mail.to, vec!["bob@example.com"]);
        assert_eq!(parsed.mail.mime_type, MailMimeType::Text);
        assert!(parsed.mail.content.contains("Just text."));
        assert_eq!(
            parsed.mail.sent_date.to_rfc3339(),
            "2024-03-05T10:00:00+00:00"
        );
    }

    #[test]
    fn alternative_prefers_html() {
        let parsed = parse(
            "From: a@example.com\r\n\
             Subject: Alt\r\n\
             Content-Type: multipart/alternative; boundary=\"b1\"\r\n\
             \r\n\
             --b1\r\n\
             Content-Type: text/plain\r\n\
             \r\n\
             plain version\r\n\
             --b1\r\n\
             Content-Type: text/html\r\n\
             \r\n\
             <p>html version</p>\r\n\
             --b1--\r\n",
        );
        assert_eq!(parsed.mail.mime_type, MailMimeType::Html);
        assert!(parsed.mail.content.contains("html version"));
    }

    #[test]
    fn alternative_without_html_takes_last() {
        let parsed = parse(
            "From: a@example.com\r\n\
             Subject: Alt\r\n\
             Content-Type: multipart/alternative; boundary=\"b1\"\r\n\
             \r\n\
             --b1\r\n\
             Content-Type: text/plain\r\n\
             \r\n\
             first\r\n\
             --b1\r\n\
             Content-Type: text/plain\r\n\
             \r\n\
             second\r\n\
             --b1--\r\n",
        );
        assert!(parsed.mail.content.contains("second"));
    }

    #[test]
    fn mixed_takes_first_text_part() {
        let parsed = parse(
            "From: a@example.com\r\n\
             Subject: Mixed\r\n\
             Content-Type: multipart/mixed; boundary=\"m\"\r\n\
             \r\n\
             --m\r\n\
             Content-Type: text/plain\r\n\
             \r\n\
             body here\r\n\
             --m\r\n\
             Content-Type: text/plain\r\n\
             Content-Disposition: attachment; filename=\"notes.txt\"\r\n\
             \r\n\
             attached notes\r\n\
             --m--\r\n",
        );
        assert!(parsed.mail.content.contains("body here"));
        assert!(!parsed.mail.content.contains("attached notes"));
    }

    #[test]
    fn missing_body_and_subject_get_placeholders() {
        let parsed = parse("From: a@example.com\r\n\r\n");
        assert_eq!(parsed.mail.subject, super::super::canonical::NO_SUBJECT);
        assert_eq!(parsed.mail.content, NO_BODY);
        assert_eq!(parsed.mail.mime_type, MailMimeType::Text);
    }

    #[test]
    fn nul_is_stripped_from_body() {
        let parsed = parse("From: a@example.com\r\nSubject: s\r\n\r\nab\0cd\r\n");
        assert!(parsed.mail.content.contains("abcd"));
    }

    #[test]
    fn store_metadata_wins() {
        let received = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        let parsed =
            parse_mime(b"From: a@example.com\r\n\r\nx\r\n", Some(received), Some(999)).unwrap();
        assert_eq!(parsed.mail.received_date, received);
        assert_eq!(parsed.mail.size, 999);
    }

    #[test]
    fn size_defaults_to_raw_length() {
        let raw = b"From: a@example.com\r\n\r\nx\r\n";
        let parsed = parse_mime(raw, None, None).unwrap();
        assert_eq!(parsed.mail.size, raw.len() as u64);
    }

    #[test]
    fn empty_input_is_rejected() {
        assert!(matches!(
            parse_mime(b"", None, None),
            Err(ParseError::Empty)
        ));
        assert!(parse_mime(b"\r\n\r\n", None, None).is_err());
    }

    // ── Classification ──────────────────────────────────────────────

    #[test]
    fn unknown_leaf_type_sniffs_for_html() {
        assert_eq!(
            classify(Some("application/x-foo"), "<HTML><body>x</body></HTML>"),
            MailMimeType::Html
        );
        assert_eq!(
            classify(Some("application/x-foo"), "no markup"),
            MailMimeType::Text
        );
        assert_eq!(classify(None, "<html>"), MailMimeType::Text);
    }

    #[test]
    fn reduction_over_hand_built_tree() {
        let leaf = |ct: &str, text: &str| MimePart {
            content_type: Some(ct.to_string()),
            charset: None,
            file_name: None,
            body: MimeBody::Text(text.to_string()),
        };
        let nested = MimePart {
            content_type: Some("message/rfc822".into()),
            charset: None,
            file_name: None,
            body: MimeBody::Message {
                raw: Vec::new(),
                root: Box::new(leaf("text/html", "<b>inner</b>")),
            },
        };
        let tree = MimePart {
            content_type: Some("multipart/mixed".into()),
            charset: None,
            file_name: None,
            body: MimeBody::Multipart(vec![leaf("text/plain", "   "), nested]),
        };
        assert_eq!(
            extract_text(&tree),
            Some((MailMimeType::Html, "<b>inner</b>".to_string()))
        );

        let empty_alt = MimePart {
            content_type: Some("multipart/alternative".into()),
            charset: None,
            file_name: None,
            body: MimeBody::Multipart(Vec::new()),
        };
        assert_eq!(extract_text(&empty_alt), None);
    }

    #[test]
    fn byte_leaf_is_charset_decoded() {
        let part = MimePart {
            content_type: Some("application/octet-stream".into()),
            charset: Some("iso-8859-1".into()),
            file_name: None,
            body: MimeBody::Bytes(vec![0x63, 0x61, 0x66, 0xE9]),
        };
        assert_eq!(
            extract_text(&part),
            Some((MailMimeType::Text, "café".to_string()))
        );
    }

    #[test]
    fn named_leaf_is_a_body_candidate() {
        let parsed = parse(
            "From: a@example.com\r\n\
             Subject: Only attachment\r\n\
             Content-Type: multipart/mixed; boundary=\"m\"\r\n\
             \r\n\
             --m\r\n\
             Content-Type: text/plain\r\n\
             \r\n\
             \r\n\
             --m\r\n\
             Content-Type: text/plain\r\n\
             Content-Disposition: attachment; filename=\"notes.txt\"\r\n\
             \r\n\
             attached notes\r\n\
             --m--\r\n",
        );
        assert!(parsed.mail.content.contains("attached notes"));
    }

    // ── Charset detection ───────────────────────────────────────────

    const LATIN1_SENTENCE: &[u8] = b"caf\xE9 cr\xE8me br\xFBl\xE9e, d\xE9j\xE0 vu";

    fn latin1_message(content_type: &str) -> Vec<u8> {
        let mut raw = format!(
            "From: a@example.com\r\nSubject: Accents\r\nContent-Type: {content_type}\r\n\r\n"
        )
        .into_bytes();
        raw.extend_from_slice(LATIN1_SENTENCE);
        raw.extend_from_slice(b"\r\n");
        raw
    }

    #[test]
    fn unknown_charset_label_is_detected() {
        let raw = latin1_message("text/plain; charset=x-made-up");
        let parsed = parse_mime(&raw, None, None).unwrap();
        assert_eq!(parsed.mail.content.trim_end(), "café crème brûlée, déjà vu");
    }

    #[test]
    fn missing_charset_is_detected() {
        let raw = latin1_message("text/plain");
        let parsed = parse_mime(&raw, None, None).unwrap();
        assert_eq!(parsed.mail.content.trim_end(), "café crème brûlée, déjà vu");
    }

    #[test]
    fn quoted_printable_with_unknown_charset_is_detected() {
        let raw = "From: a@example.com\r\n\
                   Subject: QP\r\n\
                   Content-Type: text/plain; charset=x-made-up\r\n\
                   Content-Transfer-Encoding: quoted-printable\r\n\
                   \r\n\
                   caf=E9 cr=E8me br=FBl=E9e, d=E9j=E0 vu\r\n";
        let parsed = parse(raw);
        assert_eq!(parsed.mail.content.trim_end(), "café crème brûlée, déjà vu");
    }

    #[test]
    fn known_charset_is_left_to_the_parser() {
        let raw = latin1_message("text/plain; charset=iso-8859-1");
        let parsed = parse_mime(&raw, None, None).unwrap();
        assert_eq!(parsed.mail.content.trim_end(), "café crème brûlée, déjà vu");
    }
}
