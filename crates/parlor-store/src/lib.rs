//! # parlor-store
//!
//! Durable state for the Parlor chat service, backed by SQLite.
//!
//! The crate exposes a synchronous [`Database`] handle that wraps a
//! `rusqlite::Connection` and provides typed operations for users, the
//! friend graph, conversations, and messages. Every business rule that
//! touches persisted data (participant and admin sets, the one private chat
//! per pair rule, message ordering, read markers) is enforced here so that
//! the realtime hub and the REST handlers share one implementation.

pub mod conversations;
pub mod database;
pub mod friends;
pub mod messages;
pub mod migrations;
pub mod models;
pub mod users;

mod error;
mod sql;

pub use database::Database;
pub use error::{Result, StoreError};
pub use models::*;
