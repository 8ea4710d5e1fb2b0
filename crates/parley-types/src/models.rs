use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Numeric user id as issued by the account store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub i64);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for UserId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse().map(UserId)
    }
}

/// Name of a broadcast scope. Constructors are the only way to build one,
/// so every participant derives the same key for the same context.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupName(String);

impl GroupName {
    pub fn chatroom(chatroom_id: i64) -> Self {
        Self(format!("chatroom_{}", chatroom_id))
    }

    /// DM group key, sorted on the participant ids.
    pub fn direct(a: UserId, b: UserId) -> Self {
        let (low, high) = if a <= b { (a, b) } else { (b, a) };
        Self(format!("dm_{}_{}", low, high))
    }

    pub fn notifications(user_id: UserId) -> Self {
        Self(format!("notifications_{}", user_id))
    }

    /// Group shared by every activity (presence-tracked) connection.
    pub fn activity() -> Self {
        Self("user_status".to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for GroupName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Connection target, resolved from the upgrade path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    DirectMessage { dm_id: i64 },
    Chatroom { chatroom_id: i64, channel_id: i64 },
    Notifications,
    Activity,
}

/// Selects the message table a chat session reads and writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Direct,
    Chatroom,
}

/// Where a message lives. Flattened into [`MessageView`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageScope {
    Direct { direct_message: i64 },
    Chatroom { channel: i64 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRef {
    pub id: UserId,
    pub username: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileView {
    pub id: i64,
    pub original_name: String,
    pub file_path: String,
    pub file_size: i64,
    pub mime_type: String,
}

/// Serialized chat message as delivered to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageView {
    pub id: i64,
    pub sender: UserRef,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub is_read: bool,
    pub file: Option<FileView>,
    #[serde(flatten)]
    pub scope: MessageScope,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    Message,
    FriendRequest,
    ChatroomInvitation,
    ChatroomJoinRequest,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Message => "message",
            Self::FriendRequest => "friend_request",
            Self::ChatroomInvitation => "chatroom_invitation",
            Self::ChatroomJoinRequest => "chatroom_join_request",
        }
    }

    /// Direct messages follow the message preference, everything else the
    /// request preference.
    pub fn is_request(&self) -> bool {
        !matches!(self, Self::Message)
    }
}

impl FromStr for NotificationKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "message" => Ok(Self::Message),
            "friend_request" => Ok(Self::FriendRequest),
            "chatroom_invitation" => Ok(Self::ChatroomInvitation),
            "chatroom_join_request" => Ok(Self::ChatroomJoinRequest),
            other => Err(format!("unknown notification kind: {}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationView {
    pub id: i64,
    pub user_id: UserId,
    pub notification_type: NotificationKind,
    pub object_id: i64,
    pub notification_message: String,
    pub is_read: bool,
    pub created_at: DateTime<Utc>,
}

/// Live activity flags for one user, as published on DM streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityStatus {
    pub user_id: UserId,
    #[serde(rename = "in_the_chat_status", with = "flag")]
    pub in_the_chat: bool,
    #[serde(with = "flag")]
    pub typing: bool,
}

impl ActivityStatus {
    pub fn away(user_id: UserId) -> Self {
        Self {
            user_id,
            in_the_chat: false,
            typing: false,
        }
    }
}

/// Boolean flags travel as `"True"` / `"False"` strings; plain JSON booleans
/// are accepted on input too.
pub mod flag {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &bool, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(if *value { "True" } else { "False" })
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Bool(bool),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Bool(b) => Ok(b),
            Raw::Text(s) => Ok(s.eq_ignore_ascii_case("true")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direct_group_is_symmetric() {
        for (a, b) in [(3, 7), (7, 3), (1, 1), (42, 9)] {
            assert_eq!(
                GroupName::direct(UserId(a), UserId(b)),
                GroupName::direct(UserId(b), UserId(a))
            );
        }
        assert_eq!(GroupName::direct(UserId(7), UserId(3)).as_str(), "dm_3_7");
    }

    #[test]
    fn test_group_names() {
        assert_eq!(GroupName::chatroom(12).as_str(), "chatroom_12");
        assert_eq!(GroupName::notifications(UserId(9)).as_str(), "notifications_9");
        assert_eq!(GroupName::activity().as_str(), "user_status");
    }

    #[test]
    fn test_activity_flags_accept_strings_and_bools() {
        let status: ActivityStatus = serde_json::from_str(
            r#"{"user_id": 4, "in_the_chat_status": "True", "typing": false}"#,
        )
        .unwrap();
        assert!(status.in_the_chat);
        assert!(!status.typing);

        let json = serde_json::to_value(status).unwrap();
        assert_eq!(json["in_the_chat_status"], "True");
        assert_eq!(json["typing"], "False");
    }

    #[test]
    fn test_message_view_flattens_scope() {
        let view = MessageView {
            id: 1,
            sender: UserRef {
                id: UserId(3),
                username: "ada".into(),
            },
            content: "hi".into(),
            timestamp: Utc::now(),
            is_read: false,
            file: None,
            scope: MessageScope::Direct { direct_message: 5 },
        };
        let json = serde_json::to_value(&view).unwrap();
        assert_eq!(json["direct_message"], 5);
        assert_eq!(json["sender"]["id"], 3);
        assert!(json.get("channel").is_none());
    }

    #[test]
    fn test_notification_kind_round_trips_through_str() {
        for kind in [
            NotificationKind::Message,
            NotificationKind::FriendRequest,
            NotificationKind::ChatroomInvitation,
            NotificationKind::ChatroomJoinRequest,
        ] {
            assert_eq!(kind.as_str().parse::<NotificationKind>().unwrap(), kind);
        }
        assert!("poke".parse::<NotificationKind>().is_err());
    }
}
