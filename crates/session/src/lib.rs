//! Sessions and their transaction records
//!
//! This crate provides:
//! - [`SessionCatalog`]: exclusive, killable checkout of client sessions
//! - [`TransactionRecord`]: the in-memory state of one transaction attempt
//! - [`ParticipantRegistry`]: the participants a transaction has touched

pub mod catalog;
pub mod config;
pub mod error;
pub mod record;
pub mod registry;

pub use catalog::{KillOutcome, SessionCatalog, SessionCheckout, SessionSnapshot};
pub use config::CatalogConfig;
pub use error::{Result, SessionError};
pub use record::TransactionRecord;
pub use registry::{Participant, ParticipantList, ParticipantRegistry};
