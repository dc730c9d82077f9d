//! WebSocket wire protocol.
//!
//! Every frame is a JSON text frame shaped `{"event": "<name>", "data": {...}}`
//! with camelCase event names and payload fields.

use serde::{Deserialize, Serialize};

use parlor_shared::{ConversationId, MessageId, UserId};
use parlor_store::{Attachment, Conversation, Message};

use crate::error::HubError;

/// Events a client may send once its connection is active.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum ClientEvent {
    JoinConversationRoom {
        conversation_id: ConversationId,
    },
    LeaveConversationRoom {
        conversation_id: ConversationId,
    },
    SendMessage {
        conversation_id: ConversationId,
        #[serde(default)]
        text: Option<String>,
        #[serde(default)]
        attachments: Vec<Attachment>,
    },
    TypingStart {
        conversation_id: ConversationId,
        display_name: String,
    },
    TypingStop {
        conversation_id: ConversationId,
    },
    MarkRead {
        message_id: MessageId,
    },
    /// Close this connection through the normal teardown path.
    Logout,
}

impl ClientEvent {
    /// Parse one inbound text frame.
    pub fn parse(frame: &str) -> Result<Self, HubError> {
        serde_json::from_str(frame).map_err(|e| HubError::Validation(format!("malformed event: {e}")))
    }
}

/// Events pushed from the server to clients.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum ServerEvent {
    NewMessage {
        message: Message,
    },
    MessageRead {
        message_id: MessageId,
        user_id: UserId,
    },
    UserTyping {
        user_id: UserId,
        conversation_id: ConversationId,
        display_name: String,
    },
    UserStopTyping {
        user_id: UserId,
        conversation_id: ConversationId,
    },
    UserOnline {
        user_id: UserId,
    },
    UserOffline {
        user_id: UserId,
    },
    NewChat {
        conversation: Conversation,
    },
    ChatUpdated {
        conversation: Conversation,
    },
    UserRemoved {
        conversation_id: ConversationId,
        user_id: UserId,
    },
    /// Sent only to the connection whose request failed.
    Error(ErrorEvent),
}

impl ServerEvent {
    /// Event name as it appears on the wire, for logging.
    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::NewMessage { .. } => "newMessage",
            ServerEvent::MessageRead { .. } => "messageRead",
            ServerEvent::UserTyping { .. } => "userTyping",
            ServerEvent::UserStopTyping { .. } => "userStopTyping",
            ServerEvent::UserOnline { .. } => "userOnline",
            ServerEvent::UserOffline { .. } => "userOffline",
            ServerEvent::NewChat { .. } => "newChat",
            ServerEvent::ChatUpdated { .. } => "chatUpdated",
            ServerEvent::UserRemoved { .. } => "userRemoved",
            ServerEvent::Error(_) => "error",
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ErrorKind {
    /// The request itself was invalid or not allowed.
    Rejected,
    /// The request was fine but storage failed.
    Undeliverable,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorEvent {
    pub kind: ErrorKind,
    pub code: String,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use parlor_store::AttachmentKind;
    use serde_json::json;

    #[test]
    fn test_parse_send_message() {
        let id = ConversationId::new();
        let frame = json!({
            "event": "sendMessage",
            "data": {
                "conversationId": id,
                "text": "hello",
                "attachments": [{ "url": "https://x/y.png", "kind": "image" }]
            }
        })
        .to_string();

        let event = ClientEvent::parse(&frame).unwrap();
        assert_eq!(
            event,
            ClientEvent::SendMessage {
                conversation_id: id,
                text: Some("hello".into()),
                attachments: vec![Attachment {
                    url: "https://x/y.png".into(),
                    kind: AttachmentKind::Image,
                }],
            }
        );
    }

    #[test]
    fn test_optional_fields_default() {
        let id = ConversationId::new();
        let frame = json!({ "event": "sendMessage", "data": { "conversationId": id } }).to_string();
        match ClientEvent::parse(&frame).unwrap() {
            ClientEvent::SendMessage { text, attachments, .. } => {
                assert!(text.is_none());
                assert!(attachments.is_empty());
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_parse_logout_without_data() {
        assert_eq!(ClientEvent::parse(r#"{"event":"logout"}"#).unwrap(), ClientEvent::Logout);
    }

    #[test]
    fn test_malformed_frames_are_validation_errors() {
        for frame in [
            "not json",
            r#"{"event":"shout","data":{}}"#,
            r#"{"event":"markRead","data":{"messageId":"nope"}}"#,
            r#"{"event":"typingStart","data":{"conversationId":"00000000-0000-0000-0000-000000000000"}}"#,
        ] {
            assert!(matches!(ClientEvent::parse(frame), Err(HubError::Validation(_))), "{frame}");
        }
    }

    #[test]
    fn test_server_event_wire_shape() {
        let user = UserId::new();
        let value: serde_json::Value =
            serde_json::from_str(&ServerEvent::UserOnline { user_id: user }.to_json().unwrap()).unwrap();
        assert_eq!(value, json!({ "event": "userOnline", "data": { "userId": user } }));

        let error = ServerEvent::Error(ErrorEvent {
            kind: ErrorKind::Rejected,
            code: "validation".into(),
            message: "bad".into(),
        });
        let value: serde_json::Value = serde_json::from_str(&error.to_json().unwrap()).unwrap();
        assert_eq!(value["event"], "error");
        assert_eq!(value["data"]["kind"], "rejected");
        assert_eq!(error.name(), "error");
    }
}
