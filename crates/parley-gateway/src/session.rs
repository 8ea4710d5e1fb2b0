use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{error, info, warn};

use parley_db::Database;
use parley_types::events::ServerFrame;
use parley_types::models::{GroupName, MessageKind, Route, UserId, UserRef};

use crate::chat::{self, ActionOutcome};
use crate::error::{GatewayError, run_blocking};
use crate::groups::{ConnectionHandle, GroupDirectory, Payload};
use crate::notify::{Notifier, notification_view};
use crate::presence::{PresenceRegistry, PresenceStore};

/// Who is connecting, as resolved from the bearer token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Identity {
    User(UserRef),
    Anonymous,
}

/// The context a session was authorized into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Context {
    Direct { dm_id: i64, peer: UserId },
    Chatroom { chatroom_id: i64, channel_id: i64 },
    Notifications,
    Activity,
}

impl Context {
    pub fn group(&self, user_id: UserId) -> GroupName {
        match *self {
            Self::Direct { peer, .. } => GroupName::direct(user_id, peer),
            Self::Chatroom { chatroom_id, .. } => GroupName::chatroom(chatroom_id),
            Self::Notifications => GroupName::notifications(user_id),
            Self::Activity => GroupName::activity(),
        }
    }

    /// Message table and container id for chat contexts.
    pub fn container(&self) -> Option<(MessageKind, i64)> {
        match *self {
            Self::Direct { dm_id, .. } => Some((MessageKind::Direct, dm_id)),
            Self::Chatroom { channel_id, .. } => Some((MessageKind::Chatroom, channel_id)),
            Self::Notifications | Self::Activity => None,
        }
    }
}

/// Proof that a connection passed authorization. Holding one is the only
/// way to open a session.
#[derive(Debug, Clone)]
pub struct Grant {
    user: UserRef,
    context: Context,
}

impl Grant {
    pub fn user(&self) -> &UserRef {
        &self.user
    }

    pub fn context(&self) -> Context {
        self.context
    }
}

/// Shared services behind every connection. Cheap to clone.
#[derive(Clone)]
pub struct Gateway {
    inner: Arc<GatewayInner>,
}

struct GatewayInner {
    db: Arc<Database>,
    groups: GroupDirectory,
    presence: PresenceRegistry,
    notifier: Notifier,
}

impl Gateway {
    pub fn new(db: Arc<Database>, store: Arc<dyn PresenceStore>) -> Self {
        let groups = GroupDirectory::new();
        let presence = PresenceRegistry::new(store, groups.clone());
        let notifier = Notifier::new(db.clone(), groups.clone(), presence.clone());
        Self {
            inner: Arc::new(GatewayInner {
                db,
                groups,
                presence,
                notifier,
            }),
        }
    }

    pub fn db(&self) -> &Arc<Database> {
        &self.inner.db
    }

    pub fn groups(&self) -> &GroupDirectory {
        &self.inner.groups
    }

    pub fn presence(&self) -> &PresenceRegistry {
        &self.inner.presence
    }

    pub fn notifier(&self) -> &Notifier {
        &self.inner.notifier
    }

    /// Decide whether `identity` may open `route`. Reads the store but
    /// changes nothing.
    pub async fn authorize(&self, identity: &Identity, route: Route) -> Result<Grant, GatewayError> {
        let Identity::User(user) = identity else {
            return Err(GatewayError::Unauthenticated);
        };
        let user_id = user.id;

        let context = match route {
            Route::DirectMessage { dm_id } => {
                let db = self.inner.db.clone();
                let dm = run_blocking(move || db.get_direct_message(dm_id))
                    .await?
                    .ok_or(GatewayError::ContextNotFound)?;
                let peer = if dm.user1_id == user_id.0 {
                    dm.user2_id
                } else if dm.user2_id == user_id.0 {
                    dm.user1_id
                } else {
                    return Err(GatewayError::Forbidden);
                };
                Context::Direct {
                    dm_id,
                    peer: UserId(peer),
                }
            }
            Route::Chatroom {
                chatroom_id,
                channel_id,
            } => {
                let db = self.inner.db.clone();
                let allowed = run_blocking(move || -> anyhow::Result<Option<bool>> {
                    let Some(room) = db.get_chatroom(chatroom_id)? else {
                        return Ok(None);
                    };
                    // channel must belong to the room it is addressed through
                    match db.get_channel(channel_id)? {
                        Some(channel) if channel.chatroom_id == room.id => {}
                        _ => return Ok(None),
                    }
                    Ok(Some(
                        room.admin_id == user_id.0 || db.is_chatroom_member(chatroom_id, user_id.0)?,
                    ))
                })
                .await?;
                match allowed {
                    None => return Err(GatewayError::ContextNotFound),
                    Some(false) => return Err(GatewayError::Forbidden),
                    Some(true) => Context::Chatroom {
                        chatroom_id,
                        channel_id,
                    },
                }
            }
            Route::Notifications => Context::Notifications,
            Route::Activity => Context::Activity,
        };

        Ok(Grant {
            user: user.clone(),
            context,
        })
    }

    /// Register the connection and apply the grant: one group subscription,
    /// plus a presence entry for activity streams or a chat-session entry
    /// for conversations. Returns the session and
    /// the receiver the socket task drains.
    pub async fn open_session(&self, grant: Grant) -> (Session, mpsc::UnboundedReceiver<Payload>) {
        let (handle, rx) = self.inner.groups.register();
        let group = grant.context.group(grant.user.id);
        self.inner.groups.subscribe(&group, &handle).await;

        let session = Session {
            gateway: self.clone(),
            user: grant.user,
            context: grant.context,
            group,
            handle,
        };

        match session.context {
            Context::Activity => {
                if let Err(e) = self
                    .inner
                    .presence
                    .mark_online(session.user.id, session.handle.id())
                    .await
                {
                    warn!("Could not mark {} online: {}", session.user.id, e);
                }
            }
            Context::Notifications => session.send_unread().await,
            Context::Direct { .. } | Context::Chatroom { .. } => {
                if let Err(e) = self
                    .inner
                    .presence
                    .enter_chat(session.user.id, session.handle.id())
                    .await
                {
                    warn!("Could not record chat session for {}: {}", session.user.id, e);
                }
            }
        }

        info!(
            "{} ({}) joined {} on {}",
            session.user.username,
            session.user.id,
            session.group,
            session.handle.id()
        );
        (session, rx)
    }
}

/// One authorized connection. Frames are handled one at a time through
/// [`Session::handle_text`]; [`Session::close`] undoes everything the
/// session registered.
pub struct Session {
    gateway: Gateway,
    user: UserRef,
    context: Context,
    group: GroupName,
    handle: ConnectionHandle,
}

impl Session {
    pub fn user(&self) -> &UserRef {
        &self.user
    }

    pub fn context(&self) -> Context {
        self.context
    }

    pub fn group(&self) -> &GroupName {
        &self.group
    }

    pub fn handle(&self) -> &ConnectionHandle {
        &self.handle
    }

    pub fn gateway(&self) -> &Gateway {
        &self.gateway
    }

    pub async fn handle_text(&self, text: &str) -> ActionOutcome {
        chat::handle_frame(self, text).await
    }

    /// Send a frame to this connection only.
    pub fn reply(&self, frame: &ServerFrame) -> bool {
        self.handle.send_frame(frame)
    }

    pub(crate) async fn publish(&self, frame: &ServerFrame) -> usize {
        self.gateway.groups().publish(&self.group, frame).await
    }

    async fn send_unread(&self) {
        let db = self.gateway.db().clone();
        let user_id = self.user.id;
        let rows = match run_blocking(move || db.unread_notifications(user_id.0)).await {
            Ok(rows) => rows,
            Err(e) => {
                error!("Loading unread notifications for {} failed: {}", user_id, e);
                self.reply(&ServerFrame::error(chat::INTERNAL_ERROR));
                return;
            }
        };

        let mut notifications = Vec::with_capacity(rows.len());
        for row in rows {
            match notification_view(row) {
                Ok(view) => notifications.push(view),
                Err(e) => warn!("Skipping unreadable notification for {}: {}", user_id, e),
            }
        }
        self.reply(&ServerFrame::Notifications { notifications });
    }

    /// Remove every trace of this connection from the group directory and
    /// the presence store. Runs to completion before the socket task ends.
    pub async fn close(&self) {
        self.gateway
            .groups()
            .unsubscribe(&self.group, self.handle.id())
            .await;

        let presence = self.gateway.presence();
        match self.context {
            Context::Activity => {
                if let Err(e) = presence.mark_offline(self.user.id, self.handle.id()).await {
                    warn!("Could not mark {} offline: {}", self.user.id, e);
                }
            }
            // the live flag stays up while another chat session is open
            Context::Direct { .. } | Context::Chatroom { .. } => {
                if let Err(e) = presence.leave_chat(self.user.id, self.handle.id()).await {
                    warn!("Could not clear activity for {}: {}", self.user.id, e);
                }
            }
            Context::Notifications => {}
        }

        info!(
            "{} ({}) left {}",
            self.user.username, self.user.id, self.group
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::presence::MemoryPresenceStore;
    use crate::presence::tests::UnavailableStore;
    use parley_types::models::ActivityStatus;

    struct Fixture {
        gateway: Gateway,
        ada: UserRef,
        bob: UserRef,
        eve: UserRef,
    }

    fn user(db: &Database, name: &str) -> UserRef {
        UserRef {
            id: UserId(db.create_user(name).unwrap()),
            username: name.to_string(),
        }
    }

    fn fixture_with(store: Arc<dyn PresenceStore>) -> Fixture {
        let db = Database::open_in_memory().unwrap();
        let ada = user(&db, "ada");
        let bob = user(&db, "bob");
        let eve = user(&db, "eve");
        Fixture {
            gateway: Gateway::new(Arc::new(db), store),
            ada,
            bob,
            eve,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(Arc::new(MemoryPresenceStore::new()))
    }

    #[tokio::test]
    async fn test_anonymous_is_rejected() {
        let f = fixture();
        let err = f
            .gateway
            .authorize(&Identity::Anonymous, Route::Notifications)
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Unauthenticated));
    }

    #[tokio::test]
    async fn test_direct_message_requires_participant() {
        let f = fixture();
        let dm = f.gateway.db().create_direct_message(f.ada.id.0, f.bob.id.0).unwrap();
        let route = Route::DirectMessage { dm_id: dm };

        let grant = f
            .gateway
            .authorize(&Identity::User(f.bob.clone()), route)
            .await
            .unwrap();
        assert_eq!(
            grant.context(),
            Context::Direct {
                dm_id: dm,
                peer: f.ada.id
            }
        );

        let err = f
            .gateway
            .authorize(&Identity::User(f.eve.clone()), route)
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Forbidden));

        let err = f
            .gateway
            .authorize(&Identity::User(f.ada.clone()), Route::DirectMessage { dm_id: 999 })
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::ContextNotFound));
    }

    #[tokio::test]
    async fn test_chatroom_requires_member_or_admin() {
        let f = fixture();
        let db = f.gateway.db();
        let (room, main) = db.create_chatroom("lobby", f.ada.id.0).unwrap();
        db.add_chatroom_member(room, f.bob.id.0).unwrap();
        let route = Route::Chatroom {
            chatroom_id: room,
            channel_id: main,
        };

        for member in [&f.ada, &f.bob] {
            assert!(
                f.gateway
                    .authorize(&Identity::User(member.clone()), route)
                    .await
                    .is_ok()
            );
        }
        let err = f
            .gateway
            .authorize(&Identity::User(f.eve.clone()), route)
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Forbidden));
    }

    #[tokio::test]
    async fn test_channel_from_another_room_is_not_found() {
        let f = fixture();
        let db = f.gateway.db();
        let (room, _) = db.create_chatroom("lobby", f.ada.id.0).unwrap();
        let (_, other_main) = db.create_chatroom("attic", f.ada.id.0).unwrap();

        let err = f
            .gateway
            .authorize(
                &Identity::User(f.ada.clone()),
                Route::Chatroom {
                    chatroom_id: room,
                    channel_id: other_main,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::ContextNotFound));
        assert!(err.is_authorization_failure());
    }

    #[tokio::test]
    async fn test_failed_authorization_leaves_no_state() {
        let f = fixture();
        let dm = f.gateway.db().create_direct_message(f.ada.id.0, f.bob.id.0).unwrap();
        let _ = f
            .gateway
            .authorize(&Identity::User(f.eve.clone()), Route::DirectMessage { dm_id: dm })
            .await;
        assert_eq!(
            f.gateway
                .groups()
                .member_count(&GroupName::direct(f.ada.id, f.eve.id))
                .await,
            0
        );
        assert!(f.gateway.presence().list_online().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_notification_stream_starts_with_unread_newest_first() {
        let f = fixture();
        let db = f.gateway.db();
        let older = db.insert_notification(f.bob.id.0, "message", 1, "a", false).unwrap();
        db.insert_notification(f.bob.id.0, "message", 2, "b", true).unwrap();
        let newer = db
            .insert_notification(f.bob.id.0, "friend_request", 3, "c", false)
            .unwrap();

        let grant = f
            .gateway
            .authorize(&Identity::User(f.bob.clone()), Route::Notifications)
            .await
            .unwrap();
        let (session, mut rx) = f.gateway.open_session(grant).await;
        assert_eq!(session.group().as_str(), format!("notifications_{}", f.bob.id));

        let first: serde_json::Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        let ids: Vec<i64> = first["notifications"]
            .as_array()
            .unwrap()
            .iter()
            .map(|n| n["id"].as_i64().unwrap())
            .collect();
        assert_eq!(ids, vec![newer.id, older.id]);
    }

    #[tokio::test]
    async fn test_activity_session_tracks_presence() {
        let f = fixture();
        let grant = f
            .gateway
            .authorize(&Identity::User(f.ada.clone()), Route::Activity)
            .await
            .unwrap();
        let (session, _rx) = f.gateway.open_session(grant).await;
        assert_eq!(f.gateway.presence().list_online().await.unwrap(), vec![f.ada.id]);

        session.close().await;
        assert!(f.gateway.presence().list_online().await.unwrap().is_empty());
        assert_eq!(f.gateway.groups().member_count(&GroupName::activity()).await, 0);
    }

    #[tokio::test]
    async fn test_presence_outage_does_not_block_connect() {
        let f = fixture_with(Arc::new(UnavailableStore));
        let grant = f
            .gateway
            .authorize(&Identity::User(f.ada.clone()), Route::Activity)
            .await
            .unwrap();
        let (session, _rx) = f.gateway.open_session(grant).await;
        assert_eq!(f.gateway.groups().member_count(&GroupName::activity()).await, 1);
        session.close().await;
        assert_eq!(f.gateway.groups().member_count(&GroupName::activity()).await, 0);
    }

    #[tokio::test]
    async fn test_closing_chat_session_clears_live_flag() {
        let f = fixture();
        let dm = f.gateway.db().create_direct_message(f.ada.id.0, f.bob.id.0).unwrap();
        let grant = f
            .gateway
            .authorize(&Identity::User(f.ada.clone()), Route::DirectMessage { dm_id: dm })
            .await
            .unwrap();
        let (session, _rx) = f.gateway.open_session(grant).await;
        f.gateway
            .presence()
            .set_activity(ActivityStatus {
                user_id: f.ada.id,
                in_the_chat: true,
                typing: true,
            })
            .await
            .unwrap();

        session.close().await;
        assert!(!f.gateway.presence().is_user_in_live_context(f.ada.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_live_flag_outlasts_closing_another_chat_session() {
        let f = fixture();
        let db = f.gateway.db();
        let dm = db.create_direct_message(f.ada.id.0, f.bob.id.0).unwrap();
        let (room, main) = db.create_chatroom("lobby", f.ada.id.0).unwrap();
        let ada = Identity::User(f.ada.clone());

        let grant = f.gateway.authorize(&ada, Route::DirectMessage { dm_id: dm }).await.unwrap();
        let (dm_session, _dm_rx) = f.gateway.open_session(grant).await;
        let grant = f
            .gateway
            .authorize(
                &ada,
                Route::Chatroom {
                    chatroom_id: room,
                    channel_id: main,
                },
            )
            .await
            .unwrap();
        let (room_session, _room_rx) = f.gateway.open_session(grant).await;

        room_session
            .handle_text(r#"{"action_type":"user_status","user_status":{"in_the_chat_status":"True","typing":"False"}}"#)
            .await;
        assert!(f.gateway.presence().is_user_in_live_context(f.ada.id).await.unwrap());

        dm_session.close().await;
        assert!(f.gateway.presence().is_user_in_live_context(f.ada.id).await.unwrap());

        room_session.close().await;
        assert!(!f.gateway.presence().is_user_in_live_context(f.ada.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_every_channel_of_a_room_shares_one_group() {
        let f = fixture();
        let db = f.gateway.db();
        let (room, main) = db.create_chatroom("lobby", f.ada.id.0).unwrap();
        let random = db.create_channel(room, "random").unwrap();
        let ada = Identity::User(f.ada.clone());

        let mut groups = Vec::new();
        for channel_id in [main, random] {
            let grant = f
                .gateway
                .authorize(
                    &ada,
                    Route::Chatroom {
                        chatroom_id: room,
                        channel_id,
                    },
                )
                .await
                .unwrap();
            assert_eq!(grant.context().container(), Some((MessageKind::Chatroom, channel_id)));
            groups.push(grant.context().group(f.ada.id));
        }
        assert_eq!(groups[0], GroupName::chatroom(room));
        assert_eq!(groups[0], groups[1]);
    }
}
