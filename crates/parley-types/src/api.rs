use serde::{Deserialize, Serialize};

use crate::models::UserId;

// -- JWT Claims --

/// Bearer token claims. Tokens are issued by the account service; the
/// gateway only verifies them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: UserId,
    pub username: String,
    pub exp: usize,
}

// -- Domain events --

/// Events raised by the rest of the system that may produce a notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DomainEvent {
    FriendRequestCreated {
        request_id: i64,
        initiator_id: UserId,
        recipient_id: UserId,
    },
    InvitationCreated {
        invitation_id: i64,
        initiator_id: UserId,
        recipient_id: UserId,
        chatroom_id: i64,
    },
    JoinRequestCreated {
        request_id: i64,
        initiator_id: UserId,
        recipient_id: UserId,
        chatroom_id: i64,
    },
    DirectMessageCreated {
        message_id: i64,
        dm_id: i64,
        sender_id: UserId,
    },
}

#[derive(Debug, Serialize, Deserialize)]
pub struct EventAccepted {
    pub notification_id: i64,
    pub is_read: bool,
}
