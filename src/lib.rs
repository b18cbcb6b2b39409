//! docmail: mailbox import into a document repository, and outbound mail
//! carrying repository documents.

pub mod account;
pub mod attachments;
pub mod config;
pub mod connector;
pub mod error;
pub mod fetcher;
pub mod filter;
pub mod import;
pub mod mail;
pub mod outbound;
pub mod path;
pub mod poller;
pub mod repository;
pub mod store;
