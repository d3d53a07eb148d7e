//! Shared domain types for the Voxflow outbound calling platform.
//!
//! Everything that crosses a crate boundary lives here: the persisted
//! entities (campaigns, contacts, calls), the domain-event vocabulary
//! published on the in-process bus, the shared error type, and the
//! environment-driven configuration.

pub mod config;
pub mod error;
pub mod events;
pub mod model;
pub mod retry;

pub use error::{Error, Result};
