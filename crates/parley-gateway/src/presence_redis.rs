use std::collections::HashMap;
use std::sync::Mutex;

use redis::{Client, Connection, RedisResult, Script};
use tracing::{info, warn};

use parley_types::models::{ActivityStatus, UserId};

use crate::groups::ConnectionId;
use crate::presence::{PresenceError, PresenceStore};

const ONLINE_USERS_KEY: &str = "parley:online_users";

// KEYS: user connection set, online users
// ARGV: connection id, user id
const REMOVE_CONNECTION: &str = r#"
redis.call('SREM', KEYS[1], ARGV[1])
if redis.call('SCARD', KEYS[1]) == 0 then
    redis.call('SREM', KEYS[2], ARGV[2])
    return 1
end
return 0
"#;

// KEYS: user chat session set, activity hash
// ARGV: connection id, user id
const LEAVE_CHAT: &str = r#"
redis.call('SREM', KEYS[1], ARGV[1])
if redis.call('SCARD', KEYS[1]) == 0 then
    redis.call('HSET', KEYS[2], 'user_id', ARGV[2], 'in_the_chat_status', 'False', 'typing', 'False')
    return 1
end
return 0
"#;

fn user_connections_key(user_id: UserId) -> String {
    format!("parley:presence:{}", user_id)
}

fn chat_sessions_key(user_id: UserId) -> String {
    format!("parley:chat_sessions:{}", user_id)
}

fn activity_key(user_id: UserId) -> String {
    format!("parley:activity:{}", user_id)
}

fn flag(value: bool) -> &'static str {
    if value { "True" } else { "False" }
}

/// Presence shared through Redis, so several gateway processes see one
/// online set. The connection is opened lazily and dropped after any
/// error so the next call reconnects.
pub struct RedisPresenceStore {
    client: Client,
    conn: Mutex<Option<Connection>>,
    remove_script: Script,
    leave_chat_script: Script,
}

impl RedisPresenceStore {
    /// Opens the first connection eagerly so a bad URL fails at startup.
    pub fn connect(url: &str) -> Result<Self, PresenceError> {
        let client = Client::open(url)?;
        let conn = client.get_connection()?;
        info!("Presence store connected to {}", url);
        Ok(Self {
            client,
            conn: Mutex::new(Some(conn)),
            remove_script: Script::new(REMOVE_CONNECTION),
            leave_chat_script: Script::new(LEAVE_CHAT),
        })
    }

    fn with_conn<T>(&self, f: impl FnOnce(&mut Connection) -> RedisResult<T>) -> Result<T, PresenceError> {
        let mut slot = self.conn.lock().map_err(|_| PresenceError::Poisoned)?;
        let conn = match slot.take() {
            Some(conn) => conn,
            None => self.client.get_connection()?,
        };
        let conn = slot.insert(conn);
        match f(conn) {
            Ok(value) => Ok(value),
            Err(e) => {
                if e.is_connection_dropped() || e.is_io_error() {
                    warn!("Presence store connection lost: {}", e);
                    *slot = None;
                }
                Err(e.into())
            }
        }
    }
}

impl PresenceStore for RedisPresenceStore {
    fn add_connection(&self, user_id: UserId, conn: ConnectionId) -> Result<bool, PresenceError> {
        let user_key = user_connections_key(user_id);
        let conn_id = conn.to_string();
        self.with_conn(|c| {
            let (_, _, count): (i64, i64, i64) = redis::pipe()
                .atomic()
                .cmd("SADD")
                .arg(&user_key)
                .arg(&conn_id)
                .cmd("SADD")
                .arg(ONLINE_USERS_KEY)
                .arg(user_id.0)
                .cmd("SCARD")
                .arg(&user_key)
                .query(c)?;
            Ok(count == 1)
        })
    }

    fn remove_connection(&self, user_id: UserId, conn: ConnectionId) -> Result<bool, PresenceError> {
        let gone: i64 = self.with_conn(|c| {
            self.remove_script
                .key(user_connections_key(user_id))
                .key(ONLINE_USERS_KEY)
                .arg(conn.to_string())
                .arg(user_id.0)
                .invoke(c)
        })?;
        Ok(gone == 1)
    }

    fn online_users(&self) -> Result<Vec<UserId>, PresenceError> {
        let mut users: Vec<UserId> = self
            .with_conn(|c| redis::cmd("SMEMBERS").arg(ONLINE_USERS_KEY).query::<Vec<i64>>(c))?
            .into_iter()
            .map(UserId)
            .collect();
        users.sort();
        Ok(users)
    }

    fn enter_chat(&self, user_id: UserId, conn: ConnectionId) -> Result<(), PresenceError> {
        self.with_conn(|c| {
            redis::cmd("SADD")
                .arg(chat_sessions_key(user_id))
                .arg(conn.to_string())
                .query::<()>(c)
        })
    }

    fn leave_chat(&self, user_id: UserId, conn: ConnectionId) -> Result<bool, PresenceError> {
        let last: i64 = self.with_conn(|c| {
            self.leave_chat_script
                .key(chat_sessions_key(user_id))
                .key(activity_key(user_id))
                .arg(conn.to_string())
                .arg(user_id.0)
                .invoke(c)
        })?;
        Ok(last == 1)
    }

    fn set_activity(&self, status: ActivityStatus) -> Result<(), PresenceError> {
        self.with_conn(|c| {
            redis::cmd("HSET")
                .arg(activity_key(status.user_id))
                .arg("user_id")
                .arg(status.user_id.0)
                .arg("in_the_chat_status")
                .arg(flag(status.in_the_chat))
                .arg("typing")
                .arg(flag(status.typing))
                .query::<()>(c)
        })
    }

    fn activity(&self, user_id: UserId) -> Result<Option<ActivityStatus>, PresenceError> {
        let fields: HashMap<String, String> =
            self.with_conn(|c| redis::cmd("HGETALL").arg(activity_key(user_id)).query(c))?;
        Ok(activity_from_hash(user_id, &fields))
    }
}

fn activity_from_hash(user_id: UserId, fields: &HashMap<String, String>) -> Option<ActivityStatus> {
    if fields.is_empty() {
        return None;
    }
    let is_set = |name: &str| fields.get(name).is_some_and(|v| v.eq_ignore_ascii_case("true"));
    Some(ActivityStatus {
        user_id,
        in_the_chat: is_set("in_the_chat_status"),
        typing: is_set("typing"),
    })
}
