//! Filter rule evaluation.
//!
//! Stored rules are compiled into a closed [`Predicate`] set and evaluated
//! against a [`CanonicalMail`]. Evaluation AND-accumulates every active rule
//! without short-circuiting, so every rule is always visited (and logged).

use tracing::debug;

use crate::account::{MailFilterRule, RuleField, RuleOperation};
use crate::mail::CanonicalMail;

/// A compiled rule. Values are lowercased once at compile time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Predicate {
    FromContains(String),
    FromEquals(String),
    /// Holds for every recipient; vacuously true without recipients.
    ToContains(String),
    ToEquals(String),
    SubjectContains(String),
    SubjectEquals(String),
    ContentContains(String),
    ContentEquals(String),
}

impl Predicate {
    /// Compile a stored rule. Unknown field or operation tags yield `None`.
    pub fn compile(rule: &MailFilterRule) -> Option<Self> {
        let field: RuleField = rule.field.parse().ok()?;
        let operation: RuleOperation = rule.operation.parse().ok()?;
        let value = rule.value.to_lowercase();

        Some(match (field, operation) {
            (RuleField::From, RuleOperation::Contains) => Self::FromContains(value),
            (RuleField::From, RuleOperation::Equals) => Self::FromEquals(value),
            (RuleField::To, RuleOperation::Contains) => Self::ToContains(value),
            (RuleField::To, RuleOperation::Equals) => Self::ToEquals(value),
            (RuleField::Subject, RuleOperation::Contains) => Self::SubjectContains(value),
            (RuleField::Subject, RuleOperation::Equals) => Self::SubjectEquals(value),
            (RuleField::Content, RuleOperation::Contains) => Self::ContentContains(value),
            (RuleField::Content, RuleOperation::Equals) => Self::ContentEquals(value),
        })
    }

    pub fn eval(&self, mail: &CanonicalMail) -> bool {
        match self {
            Self::FromContains(v) => contains(&mail.from, v),
            Self::FromEquals(v) => equals(&mail.from, v),
            Self::ToContains(v) => mail.to.iter().all(|to| contains(to, v)),
            Self::ToEquals(v) => mail.to.iter().all(|to| equals(to, v)),
            Self::SubjectContains(v) => contains(&mail.subject, v),
            Self::SubjectEquals(v) => equals(&mail.subject, v),
            Self::ContentContains(v) => contains(&mail.content, v),
            Self::ContentEquals(v) => equals(&mail.content, v),
        }
    }
}

fn contains(haystack: &str, lowered_needle: &str) -> bool {
    haystack.to_lowercase().contains(lowered_needle)
}

fn equals(value: &str, lowered: &str) -> bool {
    value.to_lowercase() == lowered
}

/// Whether `mail` satisfies every active rule. An empty rule set matches.
pub fn matches(mail: &CanonicalMail, rules: &[MailFilterRule]) -> bool {
    let mut ret = true;
    for rule in rules.iter().filter(|r| r.active) {
        match Predicate::compile(rule) {
            Some(predicate) => {
                let hit = predicate.eval(mail);
                debug!(field = %rule.field, operation = %rule.operation, hit, "Filter rule");
                ret &= hit;
            }
            None => {
                debug!(field = %rule.field, operation = %rule.operation, "Ignoring unknown filter rule");
            }
        }
    }
    ret
}
