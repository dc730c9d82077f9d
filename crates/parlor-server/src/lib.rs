//! # parlor-server
//!
//! Realtime chat server for Parlor.
//!
//! This crate provides:
//! - **Realtime hub** that authenticates WebSocket connections, tracks
//!   presence, and fans conversation events out to rooms
//! - **Connection registry** mapping users to live connections and rooms
//! - **Presence tracker** with write-through to the user table
//! - **REST API** (axum) for chats, history, friends, and an admin surface
//! - **Per-IP rate limiting** to protect against abuse

pub mod api;
pub mod config;
pub mod error;
pub mod hub;
pub mod locks;
pub mod presence;
pub mod protocol;
pub mod rate_limit;
pub mod registry;
pub mod socket;
pub mod store;

pub use error::{HubError, ServerError};
pub use hub::{Connection, Flow, Hub, HubConfig, Session};
