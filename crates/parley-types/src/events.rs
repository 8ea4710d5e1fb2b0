use serde::{Deserialize, Serialize};

use crate::models::{ActivityStatus, MessageView, NotificationView, UserId, flag};

/// Action discriminator of an inbound frame. Anything we don't recognise
/// lands in `Unknown` and is dropped without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    ChatMessage,
    EditMessage,
    DeleteMessage,
    UserStatus,
    MarkRead,
    #[serde(other)]
    Unknown,
}

#[derive(Deserialize)]
struct Envelope {
    action_type: ActionKind,
}

/// Frames sent FROM client TO server.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "action_type", rename_all = "snake_case")]
pub enum ClientAction {
    /// Post a new message into the session's conversation
    ChatMessage { message: NewMessage },

    /// Replace the content of one of the caller's messages
    EditMessage { message_id: i64, new_content: String },

    /// Remove one of the caller's messages
    DeleteMessage { message_id: i64 },

    /// Typing / in-the-chat hint
    UserStatus { user_status: StatusHint },

    /// Flip a notification to read (notification stream only)
    MarkRead { notification_id: i64 },
}

impl ClientAction {
    /// Decode one text frame. `Ok(None)` means a well-formed frame with an
    /// action type this server does not know.
    pub fn decode(text: &str) -> Result<Option<Self>, serde_json::Error> {
        let value: serde_json::Value = serde_json::from_str(text)?;
        let envelope = Envelope::deserialize(&value)?;
        if envelope.action_type == ActionKind::Unknown {
            return Ok(None);
        }
        Self::deserialize(value).map(Some)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct NewMessage {
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub sender: Option<SenderRef>,
    #[serde(default)]
    pub file: Option<FileRef>,
}

impl NewMessage {
    /// A message needs text or an attachment.
    pub fn is_empty(&self) -> bool {
        self.content.trim().is_empty() && self.file.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct SenderRef {
    pub id: UserId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct FileRef {
    pub id: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct StatusHint {
    #[serde(default, with = "flag")]
    pub in_the_chat_status: bool,
    #[serde(default, with = "flag")]
    pub typing: bool,
}

/// Events published to chat groups.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action_type", rename_all = "snake_case")]
pub enum ChatEvent {
    ChatMessage { message: MessageView },
    MessageEdited { message_id: i64, new_content: String },
    MessageDeleted { message_id: i64 },
    UserStatus { user_status: Vec<ActivityStatus> },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PresenceEvent {
    OnlineUsers { online_users: Vec<UserId> },
}

/// Everything the server writes to a socket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServerFrame {
    Chat(ChatEvent),
    Presence(PresenceEvent),
    Notifications { notifications: Vec<NotificationView> },
    Notification { notification: NotificationView },
    Error { error: bool, message: String },
}

impl ServerFrame {
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            error: true,
            message: message.into(),
        }
    }
}

impl From<ChatEvent> for ServerFrame {
    fn from(event: ChatEvent) -> Self {
        Self::Chat(event)
    }
}

impl From<PresenceEvent> for ServerFrame {
    fn from(event: PresenceEvent) -> Self {
        Self::Presence(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_chat_message() {
        let action = ClientAction::decode(
            r#"{"action_type":"chat_message","message":{"content":"hi","sender":{"id":3}}}"#,
        )
        .unwrap()
        .unwrap();
        match action {
            ClientAction::ChatMessage { message } => {
                assert_eq!(message.content, "hi");
                assert_eq!(message.sender, Some(SenderRef { id: UserId(3) }));
                assert!(message.file.is_none());
            }
            other => panic!("unexpected action {:?}", other),
        }
    }

    #[test]
    fn test_unknown_action_is_not_an_error() {
        let action = ClientAction::decode(r#"{"action_type":"wave","at":"everyone"}"#).unwrap();
        assert!(action.is_none());
    }

    #[test]
    fn test_malformed_frames() {
        assert!(ClientAction::decode("not json").is_err());
        assert!(ClientAction::decode(r#"{"message":"no action"}"#).is_err());
        assert!(ClientAction::decode(r#"{"action_type":"edit_message","message_id":"x"}"#).is_err());
        assert!(ClientAction::decode(r#"[1,2,3]"#).is_err());
    }

    #[test]
    fn test_status_hint_from_client_strings() {
        let action = ClientAction::decode(
            r#"{"action_type":"user_status","user_status":{"user_id":"3","in_the_chat_status":"True","typing":"False"}}"#,
        )
        .unwrap()
        .unwrap();
        assert_eq!(
            action,
            ClientAction::UserStatus {
                user_status: StatusHint {
                    in_the_chat_status: true,
                    typing: false
                }
            }
        );
    }

    #[test]
    fn test_outbound_shapes() {
        let edited = serde_json::to_value(ServerFrame::from(ChatEvent::MessageEdited {
            message_id: 4,
            new_content: "fixed".into(),
        }))
        .unwrap();
        assert_eq!(
            edited,
            serde_json::json!({"action_type": "message_edited", "message_id": 4, "new_content": "fixed"})
        );

        let online = serde_json::to_value(ServerFrame::from(PresenceEvent::OnlineUsers {
            online_users: vec![UserId(1), UserId(2)],
        }))
        .unwrap();
        assert_eq!(
            online,
            serde_json::json!({"type": "online_users", "online_users": [1, 2]})
        );

        let error = serde_json::to_value(ServerFrame::error("Invalid json format")).unwrap();
        assert_eq!(
            error,
            serde_json::json!({"error": true, "message": "Invalid json format"})
        );
    }

    #[test]
    fn test_empty_message() {
        let empty = NewMessage {
            content: "   ".into(),
            sender: None,
            file: None,
        };
        assert!(empty.is_empty());
        let attachment_only = NewMessage {
            file: Some(FileRef { id: 1 }),
            ..empty
        };
        assert!(!attachment_only.is_empty());
    }
}
