use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use parley_types::events::{PresenceEvent, ServerFrame};
use parley_types::models::{ActivityStatus, GroupName, UserId};

use crate::error::{GatewayError, run_blocking};
use crate::groups::{ConnectionId, GroupDirectory};

#[derive(Debug, Error)]
pub enum PresenceError {
    #[error("redis: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("presence lock poisoned")]
    Poisoned,
}

/// Shared presence state. Implementations block; the registry calls them
/// from the blocking pool.
///
/// Presence is reference counted: a user is online while at least one of
/// their activity connections is registered. Chat sessions are counted the
/// same way for the live-context flag.
pub trait PresenceStore: Send + Sync + 'static {
    /// Returns true if this is the user's first live connection.
    fn add_connection(&self, user_id: UserId, conn: ConnectionId) -> Result<bool, PresenceError>;

    /// Returns true if the user has no live connection left.
    fn remove_connection(&self, user_id: UserId, conn: ConnectionId) -> Result<bool, PresenceError>;

    /// Online users, ascending.
    fn online_users(&self) -> Result<Vec<UserId>, PresenceError>;

    /// Record an open chat session for the user.
    fn enter_chat(&self, user_id: UserId, conn: ConnectionId) -> Result<(), PresenceError>;

    /// Forget a chat session. If it was the user's last one their activity
    /// is reset to away in the same step and this returns true.
    fn leave_chat(&self, user_id: UserId, conn: ConnectionId) -> Result<bool, PresenceError>;

    fn set_activity(&self, status: ActivityStatus) -> Result<(), PresenceError>;

    fn activity(&self, user_id: UserId) -> Result<Option<ActivityStatus>, PresenceError>;
}

/// In-process presence store for single-node deployments and tests.
#[derive(Default)]
pub struct MemoryPresenceStore {
    state: Mutex<MemoryState>,
}

#[derive(Default)]
struct MemoryState {
    by_user: HashMap<UserId, HashSet<ConnectionId>>,
    chats: HashMap<UserId, HashSet<ConnectionId>>,
    activity: HashMap<UserId, ActivityStatus>,
}

impl MemoryPresenceStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut MemoryState) -> T) -> Result<T, PresenceError> {
        let mut state = self.state.lock().map_err(|_| PresenceError::Poisoned)?;
        Ok(f(&mut state))
    }
}

impl PresenceStore for MemoryPresenceStore {
    fn add_connection(&self, user_id: UserId, conn: ConnectionId) -> Result<bool, PresenceError> {
        self.with_state(|state| {
            let conns = state.by_user.entry(user_id).or_default();
            conns.insert(conn);
            conns.len() == 1
        })
    }

    fn remove_connection(&self, user_id: UserId, conn: ConnectionId) -> Result<bool, PresenceError> {
        self.with_state(|state| {
            let Some(conns) = state.by_user.get_mut(&user_id) else {
                return true;
            };
            conns.remove(&conn);
            if conns.is_empty() {
                state.by_user.remove(&user_id);
                true
            } else {
                false
            }
        })
    }

    fn online_users(&self) -> Result<Vec<UserId>, PresenceError> {
        self.with_state(|state| {
            let mut users: Vec<UserId> = state.by_user.keys().copied().collect();
            users.sort();
            users
        })
    }

    fn enter_chat(&self, user_id: UserId, conn: ConnectionId) -> Result<(), PresenceError> {
        self.with_state(|state| {
            state.chats.entry(user_id).or_default().insert(conn);
        })
    }

    fn leave_chat(&self, user_id: UserId, conn: ConnectionId) -> Result<bool, PresenceError> {
        self.with_state(|state| {
            if let Some(conns) = state.chats.get_mut(&user_id) {
                conns.remove(&conn);
                if !conns.is_empty() {
                    return false;
                }
                state.chats.remove(&user_id);
            }
            state.activity.insert(user_id, ActivityStatus::away(user_id));
            true
        })
    }

    fn set_activity(&self, status: ActivityStatus) -> Result<(), PresenceError> {
        self.with_state(|state| {
            state.activity.insert(status.user_id, status);
        })
    }

    fn activity(&self, user_id: UserId) -> Result<Option<ActivityStatus>, PresenceError> {
        self.with_state(|state| state.activity.get(&user_id).copied())
    }
}

/// Tracks who is online and pushes the full online-user list to the
/// activity group whenever it changes.
#[derive(Clone)]
pub struct PresenceRegistry {
    store: Arc<dyn PresenceStore>,
    groups: GroupDirectory,
}

impl PresenceRegistry {
    pub fn new(store: Arc<dyn PresenceStore>, groups: GroupDirectory) -> Self {
        Self { store, groups }
    }

    /// Register a live activity connection and start a snapshot broadcast
    /// in the background. The returned handle resolves to the number of
    /// connections the snapshot reached.
    pub async fn mark_online(
        &self,
        user_id: UserId,
        conn: ConnectionId,
    ) -> Result<JoinHandle<usize>, GatewayError> {
        let store = self.store.clone();
        let first = run_blocking(move || store.add_connection(user_id, conn)).await?;
        if first {
            debug!("User {} is now online", user_id);
        }
        Ok(self.spawn_broadcast())
    }

    pub async fn mark_offline(
        &self,
        user_id: UserId,
        conn: ConnectionId,
    ) -> Result<JoinHandle<usize>, GatewayError> {
        let store = self.store.clone();
        let gone = run_blocking(move || store.remove_connection(user_id, conn)).await?;
        if gone {
            debug!("User {} is now offline", user_id);
        }
        Ok(self.spawn_broadcast())
    }

    pub async fn list_online(&self) -> Result<Vec<UserId>, GatewayError> {
        let store = self.store.clone();
        run_blocking(move || store.online_users()).await
    }

    /// Whether the user is actively looking at a chat. Drives notification
    /// suppression.
    pub async fn is_user_in_live_context(&self, user_id: UserId) -> Result<bool, GatewayError> {
        let store = self.store.clone();
        let status = run_blocking(move || store.activity(user_id)).await?;
        Ok(status.is_some_and(|s| s.in_the_chat))
    }

    pub async fn enter_chat(&self, user_id: UserId, conn: ConnectionId) -> Result<(), GatewayError> {
        let store = self.store.clone();
        run_blocking(move || store.enter_chat(user_id, conn)).await
    }

    /// Returns true if the user's last chat session just closed and their
    /// live-context flag was cleared.
    pub async fn leave_chat(&self, user_id: UserId, conn: ConnectionId) -> Result<bool, GatewayError> {
        let store = self.store.clone();
        run_blocking(move || store.leave_chat(user_id, conn)).await
    }

    pub async fn set_activity(&self, status: ActivityStatus) -> Result<(), GatewayError> {
        let store = self.store.clone();
        run_blocking(move || store.set_activity(status)).await
    }

    /// Activity for each user, in the order given. Users with no record
    /// are reported as away.
    pub async fn activity_of(&self, users: Vec<UserId>) -> Result<Vec<ActivityStatus>, GatewayError> {
        let store = self.store.clone();
        run_blocking(move || {
            users
                .into_iter()
                .map(|u| Ok(store.activity(u)?.unwrap_or_else(|| ActivityStatus::away(u))))
                .collect::<Result<Vec<_>, PresenceError>>()
        })
        .await
    }

    fn spawn_broadcast(&self) -> JoinHandle<usize> {
        let registry = self.clone();
        tokio::spawn(async move { registry.broadcast_snapshot().await })
    }

    /// Publish the complete online-user list to every activity connection
    /// on this node. A store failure skips this round.
    pub async fn broadcast_snapshot(&self) -> usize {
        let online_users = match self.list_online().await {
            Ok(users) => users,
            Err(e) => {
                warn!("Skipping presence broadcast: {}", e);
                return 0;
            }
        };

        let frame = ServerFrame::from(PresenceEvent::OnlineUsers { online_users });
        self.groups.publish(&GroupName::activity(), &frame).await
    }
}
