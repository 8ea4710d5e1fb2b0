use std::sync::Arc;

use tracing::{info, warn};

use parley_db::Database;
use parley_db::models::NotificationRow;
use parley_types::api::DomainEvent;
use parley_types::events::ServerFrame;
use parley_types::models::{GroupName, NotificationKind, NotificationView, UserId};

use crate::error::{GatewayError, run_blocking};
use crate::groups::GroupDirectory;
use crate::presence::PresenceRegistry;

/// What a notification points at, with the names needed to render it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotificationSource {
    DirectMessage { message_id: i64, sender: String },
    FriendRequest { request_id: i64, initiator: String },
    Invitation { invitation_id: i64, initiator: String, chatroom: String },
    JoinRequest { request_id: i64, initiator: String, chatroom: String },
}

impl NotificationSource {
    pub fn kind(&self) -> NotificationKind {
        match self {
            Self::DirectMessage { .. } => NotificationKind::Message,
            Self::FriendRequest { .. } => NotificationKind::FriendRequest,
            Self::Invitation { .. } => NotificationKind::ChatroomInvitation,
            Self::JoinRequest { .. } => NotificationKind::ChatroomJoinRequest,
        }
    }

    pub fn object_id(&self) -> i64 {
        match self {
            Self::DirectMessage { message_id, .. } => *message_id,
            Self::FriendRequest { request_id, .. } => *request_id,
            Self::Invitation { invitation_id, .. } => *invitation_id,
            Self::JoinRequest { request_id, .. } => *request_id,
        }
    }

    pub fn render(&self) -> String {
        match self {
            Self::DirectMessage { sender, .. } => format!("{} sent you a message", sender),
            Self::FriendRequest { initiator, .. } => format!("{} sent you a friend request", initiator),
            Self::Invitation {
                initiator, chatroom, ..
            } => format!("{} invited you to join {}", initiator, chatroom),
            Self::JoinRequest {
                initiator, chatroom, ..
            } => format!("{} wants to join {}", initiator, chatroom),
        }
    }
}

pub(crate) fn notification_view(row: NotificationRow) -> Result<NotificationView, GatewayError> {
    let notification_type = row
        .kind
        .parse::<NotificationKind>()
        .map_err(anyhow::Error::msg)?;
    Ok(NotificationView {
        id: row.id,
        user_id: UserId(row.user_id),
        notification_type,
        object_id: row.object_id,
        notification_message: row.message,
        is_read: row.is_read,
        created_at: parley_db::parse_timestamp(&row.created_at)?,
    })
}

/// Turns domain events into notification records and pushes the unread
/// ones to the recipient's notification stream.
///
/// Every call creates exactly one record. Deduplicating repeated events
/// is the caller's job.
#[derive(Clone)]
pub struct Notifier {
    db: Arc<Database>,
    groups: GroupDirectory,
    presence: PresenceRegistry,
}

impl Notifier {
    pub fn new(db: Arc<Database>, groups: GroupDirectory, presence: PresenceRegistry) -> Self {
        Self { db, groups, presence }
    }

    pub async fn notify(
        &self,
        recipient: UserId,
        source: NotificationSource,
    ) -> Result<NotificationView, GatewayError> {
        // An unreachable presence store counts as "not watching"
        let live = match self.presence.is_user_in_live_context(recipient).await {
            Ok(live) => live,
            Err(e) => {
                warn!("Presence lookup for {} failed, assuming not live: {}", recipient, e);
                false
            }
        };

        let db = self.db.clone();
        let kind = source.kind();
        let object_id = source.object_id();
        let message = source.render();
        let row = run_blocking(move || -> anyhow::Result<NotificationRow> {
            let settings = db.notification_settings(recipient.0)?;
            let enabled = if kind.is_request() {
                settings.request_notifications
            } else {
                settings.message_notifications
            };
            db.insert_notification(recipient.0, kind.as_str(), object_id, &message, live || !enabled)
        })
        .await?;

        let view = notification_view(row)?;
        if view.is_read {
            info!("Recorded {} notification {} for {} (no push)", kind.as_str(), view.id, recipient);
        } else {
            let frame = ServerFrame::Notification {
                notification: view.clone(),
            };
            let delivered = self
                .groups
                .publish(&GroupName::notifications(recipient), &frame)
                .await;
            info!(
                "Pushed {} notification {} to {} ({} streams)",
                kind.as_str(),
                view.id,
                recipient,
                delivered
            );
        }
        Ok(view)
    }

    /// Resolve the names an event refers to, then notify its recipient.
    pub async fn handle_event(&self, event: DomainEvent) -> Result<NotificationView, GatewayError> {
        let db = self.db.clone();
        let (recipient, source) = run_blocking(move || resolve_event(&db, event)).await?;
        self.notify(recipient, source).await
    }
}

fn resolve_event(db: &Database, event: DomainEvent) -> Result<(UserId, NotificationSource), GatewayError> {
    let username = |id: UserId| -> Result<String, GatewayError> {
        Ok(db.get_user(id.0)?.ok_or(GatewayError::ContextNotFound)?.username)
    };
    let chatroom_name = |id: i64| -> Result<String, GatewayError> {
        Ok(db.get_chatroom(id)?.ok_or(GatewayError::ContextNotFound)?.name)
    };

    match event {
        DomainEvent::FriendRequestCreated {
            request_id,
            initiator_id,
            recipient_id,
        } => Ok((
            recipient_id,
            NotificationSource::FriendRequest {
                request_id,
                initiator: username(initiator_id)?,
            },
        )),
        DomainEvent::InvitationCreated {
            invitation_id,
            initiator_id,
            recipient_id,
            chatroom_id,
        } => Ok((
            recipient_id,
            NotificationSource::Invitation {
                invitation_id,
                initiator: username(initiator_id)?,
                chatroom: chatroom_name(chatroom_id)?,
            },
        )),
        DomainEvent::JoinRequestCreated {
            request_id,
            initiator_id,
            recipient_id,
            chatroom_id,
        } => Ok((
            recipient_id,
            NotificationSource::JoinRequest {
                request_id,
                initiator: username(initiator_id)?,
                chatroom: chatroom_name(chatroom_id)?,
            },
        )),
        DomainEvent::DirectMessageCreated {
            message_id,
            dm_id,
            sender_id,
        } => {
            let dm = db
                .get_direct_message(dm_id)?
                .ok_or(GatewayError::ContextNotFound)?;
            let recipient = if dm.user1_id == sender_id.0 {
                dm.user2_id
            } else if dm.user2_id == sender_id.0 {
                dm.user1_id
            } else {
                return Err(GatewayError::Forbidden);
            };
            Ok((
                UserId(recipient),
                NotificationSource::DirectMessage {
                    message_id,
                    sender: username(sender_id)?,
                },
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::presence::MemoryPresenceStore;
    use parley_types::models::ActivityStatus;

    struct Fixture {
        db: Arc<Database>,
        groups: GroupDirectory,
        presence: PresenceRegistry,
        notifier: Notifier,
        ada: UserId,
        bob: UserId,
    }

    fn fixture() -> Fixture {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let ada = UserId(db.create_user("ada").unwrap());
        let bob = UserId(db.create_user("bob").unwrap());
        let groups = GroupDirectory::new();
        let presence = PresenceRegistry::new(Arc::new(MemoryPresenceStore::new()), groups.clone());
        let notifier = Notifier::new(db.clone(), groups.clone(), presence.clone());
        Fixture {
            db,
            groups,
            presence,
            notifier,
            ada,
            bob,
        }
    }

    #[test]
    fn test_rendered_messages() {
        let cases = [
            (
                NotificationSource::DirectMessage {
                    message_id: 1,
                    sender: "ada".into(),
                },
                "ada sent you a message",
            ),
            (
                NotificationSource::FriendRequest {
                    request_id: 1,
                    initiator: "ada".into(),
                },
                "ada sent you a friend request",
            ),
            (
                NotificationSource::Invitation {
                    invitation_id: 1,
                    initiator: "ada".into(),
                    chatroom: "lobby".into(),
                },
                "ada invited you to join lobby",
            ),
            (
                NotificationSource::JoinRequest {
                    request_id: 1,
                    initiator: "ada".into(),
                    chatroom: "lobby".into(),
                },
                "ada wants to join lobby",
            ),
        ];
        for (source, expected) in cases {
            assert_eq!(source.render(), expected);
        }
    }

    #[tokio::test]
    async fn test_offline_recipient_gets_one_push() {
        let f = fixture();
        let (stream, mut rx) = f.groups.register();
        f.groups.subscribe(&GroupName::notifications(f.bob), &stream).await;

        let view = f
            .notifier
            .notify(
                f.bob,
                NotificationSource::FriendRequest {
                    request_id: 11,
                    initiator: "ada".into(),
                },
            )
            .await
            .unwrap();
        assert!(!view.is_read);
        assert_eq!(view.object_id, 11);

        let pushed: serde_json::Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(pushed["notification"]["id"], view.id);
        assert_eq!(pushed["notification"]["notification_type"], "friend_request");
        assert!(rx.try_recv().is_err());
        assert_eq!(f.db.unread_notifications(f.bob.0).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_live_recipient_is_recorded_read_without_push() {
        let f = fixture();
        let (stream, mut rx) = f.groups.register();
        f.groups.subscribe(&GroupName::notifications(f.bob), &stream).await;
        f.presence
            .set_activity(ActivityStatus {
                user_id: f.bob,
                in_the_chat: true,
                typing: false,
            })
            .await
            .unwrap();

        let view = f
            .notifier
            .notify(
                f.bob,
                NotificationSource::DirectMessage {
                    message_id: 3,
                    sender: "ada".into(),
                },
            )
            .await
            .unwrap();
        assert!(view.is_read);
        assert!(rx.try_recv().is_err());
        assert!(f.db.unread_notifications(f.bob.0).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_disabled_preference_suppresses_push() {
        let f = fixture();
        let (stream, mut rx) = f.groups.register();
        f.groups.subscribe(&GroupName::notifications(f.bob), &stream).await;
        f.db.set_notification_settings(f.bob.0, true, false).unwrap();

        let request = f
            .notifier
            .notify(
                f.bob,
                NotificationSource::FriendRequest {
                    request_id: 1,
                    initiator: "ada".into(),
                },
            )
            .await
            .unwrap();
        assert!(request.is_read);
        assert!(rx.try_recv().is_err());

        // message preference is still on
        let message = f
            .notifier
            .notify(
                f.bob,
                NotificationSource::DirectMessage {
                    message_id: 2,
                    sender: "ada".into(),
                },
            )
            .await
            .unwrap();
        assert!(!message.is_read);
        assert!(rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_handle_event_resolves_names() {
        let f = fixture();
        let (room, _main) = f.db.create_chatroom("lobby", f.ada.0).unwrap();

        let view = f
            .notifier
            .handle_event(DomainEvent::InvitationCreated {
                invitation_id: 4,
                initiator_id: f.ada,
                recipient_id: f.bob,
                chatroom_id: room,
            })
            .await
            .unwrap();
        assert_eq!(view.user_id, f.bob);
        assert_eq!(view.notification_message, "ada invited you to join lobby");
        assert_eq!(view.notification_type, NotificationKind::ChatroomInvitation);
    }

    #[tokio::test]
    async fn test_direct_message_event_targets_other_participant() {
        let f = fixture();
        let dm = f.db.create_direct_message(f.ada.0, f.bob.0).unwrap();

        let view = f
            .notifier
            .handle_event(DomainEvent::DirectMessageCreated {
                message_id: 9,
                dm_id: dm,
                sender_id: f.bob,
            })
            .await
            .unwrap();
        assert_eq!(view.user_id, f.ada);
        assert_eq!(view.notification_message, "bob sent you a message");

        let outsider = UserId(f.db.create_user("eve").unwrap());
        let err = f
            .notifier
            .handle_event(DomainEvent::DirectMessageCreated {
                message_id: 9,
                dm_id: dm,
                sender_id: outsider,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Forbidden));
    }

    #[tokio::test]
    async fn test_unknown_actor_is_rejected() {
        let f = fixture();
        let err = f
            .notifier
            .handle_event(DomainEvent::FriendRequestCreated {
                request_id: 1,
                initiator_id: UserId(404),
                recipient_id: f.bob,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::ContextNotFound));
    }
}
