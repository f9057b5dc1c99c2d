//! Wire protocol for Stevedore client-node communication.
//!
//! Defines the JSON message envelope exchanged over persistent connections,
//! the typed payloads for admission, upload control, and connection
//! migration, and the shared domain types (principals, tiers, upload state)
//! that every other crate consumes.

pub mod constants;
pub mod envelope;
pub mod messages;
pub mod notify;
pub mod types;
