use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{RwLock, mpsc};
use tracing::{trace, warn};
use uuid::Uuid;

use parley_types::events::ServerFrame;
use parley_types::models::GroupName;

/// A serialized frame. One allocation is shared by every recipient of a
/// publish.
pub type Payload = Arc<str>;

/// Opaque id of one live transport stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Sending half of a live connection. The socket task owns the receiver.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    tx: mpsc::UnboundedSender<Payload>,
}

impl ConnectionHandle {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Queue a payload. Returns false if the connection is already gone;
    /// that is not an error for the caller.
    pub fn send(&self, payload: Payload) -> bool {
        self.tx.send(payload).is_ok()
    }

    pub fn send_frame(&self, frame: &ServerFrame) -> bool {
        match encode(frame) {
            Some(payload) => self.send(payload),
            None => false,
        }
    }
}

pub fn encode(frame: &ServerFrame) -> Option<Payload> {
    match serde_json::to_string(frame) {
        Ok(json) => Some(json.into()),
        Err(e) => {
            warn!("Failed to encode server frame: {}", e);
            None
        }
    }
}

type Members = HashMap<ConnectionId, ConnectionHandle>;

/// Maps group names to the connections subscribed to them and fans
/// payloads out to every member.
#[derive(Clone, Default)]
pub struct GroupDirectory {
    inner: Arc<DirectoryInner>,
}

#[derive(Default)]
struct DirectoryInner {
    /// group -> members. The member mutex is held for the whole fan-out of
    /// one publish, so publishes to the same group reach every member in
    /// the same order.
    groups: RwLock<HashMap<GroupName, Arc<Mutex<Members>>>>,
}

impl GroupDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a handle for a new connection. Returns it with the receiver
    /// the socket task drains; the connection joins no group until
    /// subscribed.
    pub fn register(&self) -> (ConnectionHandle, mpsc::UnboundedReceiver<Payload>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = ConnectionHandle {
            id: ConnectionId::new(),
            tx,
        };
        (handle, rx)
    }

    /// Idempotent.
    pub async fn subscribe(&self, group: &GroupName, handle: &ConnectionHandle) {
        let mut groups = self.inner.groups.write().await;
        let members = groups.entry(group.clone()).or_default();
        members
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(handle.id, handle.clone());
        trace!("{} subscribed to {}", handle.id, group);
    }

    /// Idempotent. Empty groups are dropped from the map.
    pub async fn unsubscribe(&self, group: &GroupName, id: ConnectionId) {
        let mut groups = self.inner.groups.write().await;
        let now_empty = match groups.get(group) {
            Some(members) => {
                let mut members = members.lock().unwrap_or_else(PoisonError::into_inner);
                members.remove(&id);
                members.is_empty()
            }
            None => return,
        };
        if now_empty {
            groups.remove(group);
        }
        trace!("{} unsubscribed from {}", id, group);
    }

    /// Deliver a frame to every current member of `group`. Returns the
    /// number of live members it was queued for.
    pub async fn publish(&self, group: &GroupName, frame: &ServerFrame) -> usize {
        match encode(frame) {
            Some(payload) => self.publish_payload(group, payload).await,
            None => 0,
        }
    }

    pub async fn publish_payload(&self, group: &GroupName, payload: Payload) -> usize {
        let members = match self.inner.groups.read().await.get(group) {
            Some(members) => members.clone(),
            None => return 0,
        };

        let members = members.lock().unwrap_or_else(PoisonError::into_inner);
        let delivered = members
            .values()
            .filter(|handle| handle.send(payload.clone()))
            .count();
        trace!("Published to {} ({} of {} members)", group, delivered, members.len());
        delivered
    }

    pub async fn member_count(&self, group: &GroupName) -> usize {
        match self.inner.groups.read().await.get(group) {
            Some(members) => members.lock().unwrap_or_else(PoisonError::into_inner).len(),
            None => 0,
        }
    }
}
