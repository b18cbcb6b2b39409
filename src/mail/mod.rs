//! Mail parsing: MIME and Outlook sources reduced to [`CanonicalMail`].

pub mod canonical;
pub mod charset;
pub mod outlook;
pub mod parser;

pub use canonical::{CanonicalMail, MailMimeType, NO_BODY, NO_SUBJECT};
pub use outlook::{OutlookAttachment, OutlookMessage, OutlookRecipient, RtfConverter, parse_outlook};
pub use parser::{MimeBody, MimePart, ParsedMessage, parse_mime};
