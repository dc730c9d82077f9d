/// Application name
pub const APP_NAME: &str = "Parlor";

/// Wire protocol version reported by `/info`
pub const PROTOCOL_VERSION: &str = "parlor/1";

/// Default HTTP API port
pub const DEFAULT_HTTP_PORT: u16 = 8080;

/// Session lifetime when `SESSION_TTL_HOURS` is unset (7 days)
pub const DEFAULT_SESSION_TTL_HOURS: i64 = 24 * 7;

/// Ed25519 signature length appended to every session token
pub const SIGNATURE_SIZE: usize = 64;

/// Maximum message text length in characters
pub const MAX_MESSAGE_CHARS: usize = 4_000;

/// Maximum attachments on a single message
pub const MAX_ATTACHMENTS: usize = 10;

/// Maximum group name length in characters
pub const MAX_GROUP_NAME_CHARS: usize = 100;

/// Receivers drop a typing indicator after this much silence. The hub never
/// synthesizes stop events; the constant is published for clients.
pub const TYPING_EXPIRY_SECS: u64 = 3;
