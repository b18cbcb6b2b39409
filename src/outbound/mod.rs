//! Outbound mail: composition, dispatch and the SMTP transport.

pub mod composer;
pub mod dispatcher;
pub mod smtp;

use std::error::Error as StdError;
use std::sync::{Arc, Mutex};

use lettre::Message;
use lettre::message::header::{Header, HeaderName, HeaderValue};

use crate::error::TransportError;

pub use composer::{
    ComposedMessage, Draft, MailBody, MessageComposer, OutboundAttachment, html_wrapper,
    mail_to_html, parse_mail_list, rewrite_links,
};
pub use dispatcher::{Dispatcher, SendRequest};
pub use smtp::SmtpMailTransport;

/// Hands finished messages to a mail server.
pub trait MailTransport: Send + Sync {
    fn send(&self, message: &Message) -> Result<(), TransportError>;

    /// Identity used as `From` when mail is not sent as the user.
    fn default_from(&self) -> Option<String>;
}

/// `X-Mailer` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XMailer(pub String);

impl Header for XMailer {
    fn name() -> HeaderName {
        HeaderName::new_from_ascii_str("X-Mailer")
    }

    fn parse(s: &str) -> Result<Self, Box<dyn StdError + Send + Sync>> {
        Ok(Self(s.to_string()))
    }

    fn display(&self) -> HeaderValue {
        HeaderValue::new(Self::name(), self.0.clone())
    }
}

/// `X-Message-Id` header: `<prefix>-<uuid>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XMessageId(pub String);

impl Header for XMessageId {
    fn name() -> HeaderName {
        HeaderName::new_from_ascii_str("X-Message-Id")
    }

    fn parse(s: &str) -> Result<Self, Box<dyn StdError + Send + Sync>> {
        Ok(Self(s.to_string()))
    }

    fn display(&self) -> HeaderValue {
        HeaderValue::new(Self::name(), self.0.clone())
    }
}

/// Keeps sent messages in memory.
#[derive(Debug, Clone)]
pub struct MemoryTransport {
    from: Option<String>,
    state: Arc<Mutex<TransportState>>,
}

#[derive(Debug, Default)]
struct TransportState {
    sent: Vec<Message>,
    failing: bool,
}

impl MemoryTransport {
    pub fn new(from: Option<&str>) -> Self {
        Self {
            from: from.map(str::to_string),
            state: Arc::new(Mutex::new(TransportState::default())),
        }
    }

    /// Reject every following send.
    pub fn set_failing(&self, failing: bool) {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).failing = failing;
    }

    pub fn sent(&self) -> Vec<Message> {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .sent
            .clone()
    }
}

impl MailTransport for MemoryTransport {
    fn send(&self, message: &Message) -> Result<(), TransportError> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.failing {
            return Err(TransportError::SendFailed("relay refused message".into()));
        }
        state.sent.push(message.clone());
        Ok(())
    }

    fn default_from(&self) -> Option<String> {
        self.from.clone()
    }
}
