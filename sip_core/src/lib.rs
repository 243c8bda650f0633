//! Sans-IO SIP user agent core.
//!
//! Nothing in this crate touches a socket or a clock source on its own: the
//! caller feeds parsed messages and the current `Instant` in, and gets
//! [`CoreEvent`]s back describing what to send and what changed.

use thiserror::Error;

pub mod auth;
pub mod dialog;
pub mod message;
pub mod registration;
pub mod stack;
pub mod transaction;
pub mod uri;

pub use auth::{authorization_header, parse_challenge, DigestChallenge, DigestCredentials};
pub use dialog::{Dialog, DialogState};
pub use message::{header_value, parse_message, Header, Message, Method, Request, Response};
pub use registration::{RegistrationResult, RegistrationState, RegistrationTransaction};
pub use stack::{
    AccountKey, AccountParams, CallKey, CoreEvent, LocalContact, NextHop, Outgoing, SipStack,
};
pub use transaction::{ClientTransactions, TransactionTimeout};
pub use uri::SipUri;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SipError {
    #[error("invalid message: {0}")]
    Invalid(&'static str),
    #[error("invalid state: {0}")]
    InvalidState(&'static str),
    #[error("invalid uri: {0}")]
    InvalidUri(String),
    #[error("authentication failed: {0}")]
    Auth(&'static str),
}

pub type Result<T> = std::result::Result<T, SipError>;
