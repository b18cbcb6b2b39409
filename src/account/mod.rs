//! Mail accounts, their routing filters and import error ledger.

pub mod model;

pub use model::{
    MailAccount, MailFilter, MailFilterRule, MailImportError, MailProtocol, RuleField,
    RuleOperation,
};
