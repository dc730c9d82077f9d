//! # parlor-shared
//!
//! Types shared between the Parlor store and server crates: strongly typed
//! identifiers, broadcast room names, signed session tokens, and protocol
//! constants.

pub mod constants;
pub mod error;
pub mod session;
pub mod types;

pub use error::TokenError;
pub use types::{ConnectionId, ConversationId, MessageId, Room, UserId};
