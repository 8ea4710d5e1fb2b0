use crate::models::{
    ChannelRow, ChatroomRow, DirectMessageRow, FileRow, MessageRow, NotificationRow,
    NotificationSettingsRow, UserRow,
};
use crate::{Database, now_timestamp};
use anyhow::Result;
use parley_types::models::MessageKind;
use rusqlite::{Connection, Row, params};

/// Table, container column and attachment tag for each message flavour.
fn message_table(kind: MessageKind) -> (&'static str, &'static str, &'static str) {
    match kind {
        MessageKind::Direct => ("dm_messages", "dm_id", "direct"),
        MessageKind::Chatroom => ("chatroom_messages", "channel_id", "chatroom"),
    }
}

impl Database {
    // -- Users --

    pub fn create_user(&self, username: &str) -> Result<i64> {
        self.with_conn(|conn| {
            conn.execute("INSERT INTO users (username) VALUES (?1)", [username])?;
            Ok(conn.last_insert_rowid())
        })
    }

    pub fn get_user(&self, id: i64) -> Result<Option<UserRow>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT id, username, created_at FROM users WHERE id = ?1",
                [id],
                |row| {
                    Ok(UserRow {
                        id: row.get(0)?,
                        username: row.get(1)?,
                        created_at: row.get(2)?,
                    })
                },
            )
            .optional()
        })
    }

    pub fn notification_settings(&self, user_id: i64) -> Result<NotificationSettingsRow> {
        self.with_conn(|conn| {
            let row = conn
                .query_row(
                    "SELECT message_notifications, request_notifications FROM user_settings WHERE user_id = ?1",
                    [user_id],
                    |row| {
                        Ok(NotificationSettingsRow {
                            message_notifications: row.get(0)?,
                            request_notifications: row.get(1)?,
                        })
                    },
                )
                .optional()?;
            Ok(row.unwrap_or_default())
        })
    }

    pub fn set_notification_settings(
        &self,
        user_id: i64,
        message_notifications: bool,
        request_notifications: bool,
    ) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO user_settings (user_id, message_notifications, request_notifications)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(user_id) DO UPDATE SET
                    message_notifications = excluded.message_notifications,
                    request_notifications = excluded.request_notifications",
                params![user_id, message_notifications, request_notifications],
            )?;
            Ok(())
        })
    }

    // -- Conversations --

    /// Creates the DM between two users. The group name is derived from the
    /// sorted pair so either side computes the same key.
    pub fn create_direct_message(&self, user1_id: i64, user2_id: i64) -> Result<i64> {
        let (low, high) = if user1_id <= user2_id {
            (user1_id, user2_id)
        } else {
            (user2_id, user1_id)
        };
        let group_name = format!("dm_{}_{}", low, high);
        let now = now_timestamp();
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO direct_messages (user1_id, user2_id, group_name, created_at, last_interaction)
                 VALUES (?1, ?2, ?3, ?4, ?4)",
                params![user1_id, user2_id, group_name, now],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    pub fn get_direct_message(&self, id: i64) -> Result<Option<DirectMessageRow>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT id, user1_id, user2_id, group_name, last_interaction FROM direct_messages WHERE id = ?1",
                [id],
                |row| {
                    Ok(DirectMessageRow {
                        id: row.get(0)?,
                        user1_id: row.get(1)?,
                        user2_id: row.get(2)?,
                        group_name: row.get(3)?,
                        last_interaction: row.get(4)?,
                    })
                },
            )
            .optional()
        })
    }

    pub fn delete_direct_message(&self, id: i64) -> Result<bool> {
        self.with_conn(|conn| {
            let n = conn.execute("DELETE FROM direct_messages WHERE id = ?1", [id])?;
            Ok(n > 0)
        })
    }

    /// Creates a chatroom together with its "Main" channel. Returns
    /// `(chatroom_id, main_channel_id)`.
    pub fn create_chatroom(&self, name: &str, admin_id: i64) -> Result<(i64, i64)> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO chatrooms (name, admin_id) VALUES (?1, ?2)",
                params![name, admin_id],
            )?;
            let chatroom_id = tx.last_insert_rowid();
            tx.execute(
                "INSERT INTO channels (chatroom_id, name) VALUES (?1, 'Main')",
                [chatroom_id],
            )?;
            let channel_id = tx.last_insert_rowid();
            tx.commit()?;
            Ok((chatroom_id, channel_id))
        })
    }

    pub fn create_channel(&self, chatroom_id: i64, name: &str) -> Result<i64> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO channels (chatroom_id, name) VALUES (?1, ?2)",
                params![chatroom_id, name],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    pub fn add_chatroom_member(&self, chatroom_id: i64, user_id: i64) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO chatroom_members (user_id, chatroom_id) VALUES (?1, ?2)",
                params![user_id, chatroom_id],
            )?;
            Ok(())
        })
    }

    pub fn get_chatroom(&self, id: i64) -> Result<Option<ChatroomRow>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT id, name, admin_id FROM chatrooms WHERE id = ?1",
                [id],
                |row| {
                    Ok(ChatroomRow {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        admin_id: row.get(2)?,
                    })
                },
            )
            .optional()
        })
    }

    pub fn get_channel(&self, id: i64) -> Result<Option<ChannelRow>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT id, chatroom_id, name FROM channels WHERE id = ?1",
                [id],
                |row| {
                    Ok(ChannelRow {
                        id: row.get(0)?,
                        chatroom_id: row.get(1)?,
                        name: row.get(2)?,
                    })
                },
            )
            .optional()
        })
    }

    pub fn is_chatroom_member(&self, chatroom_id: i64, user_id: i64) -> Result<bool> {
        self.with_conn(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM chatroom_members WHERE chatroom_id = ?1 AND user_id = ?2",
                params![chatroom_id, user_id],
                |row| row.get(0),
            )?;
            Ok(count > 0)
        })
    }

    // -- Files --

    pub fn create_chat_file(
        &self,
        user_id: i64,
        original_name: &str,
        file_path: &str,
        file_size: i64,
        mime_type: &str,
    ) -> Result<i64> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO chat_files (user_id, original_name, file_path, file_size, mime_type)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![user_id, original_name, file_path, file_size, mime_type],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    // -- Messages --

    /// Inserts a message and, in the same transaction, re-points the
    /// attached file (if any, and if uploaded by the sender) at it. DM
    /// inserts also bump the conversation's `last_interaction`.
    pub fn insert_message(
        &self,
        kind: MessageKind,
        container_id: i64,
        sender_id: i64,
        content: &str,
        file_id: Option<i64>,
    ) -> Result<i64> {
        let (table, column, tag) = message_table(kind);
        let now = now_timestamp();
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            tx.execute(
                &format!(
                    "INSERT INTO {} ({}, sender_id, content, created_at) VALUES (?1, ?2, ?3, ?4)",
                    table, column
                ),
                params![container_id, sender_id, content, now],
            )?;
            let message_id = tx.last_insert_rowid();

            if let Some(file_id) = file_id {
                tx.execute(
                    "UPDATE chat_files SET message_kind = ?1, message_id = ?2 WHERE id = ?3 AND user_id = ?4",
                    params![tag, message_id, file_id, sender_id],
                )?;
            }

            if kind == MessageKind::Direct {
                tx.execute(
                    "UPDATE direct_messages SET last_interaction = ?1 WHERE id = ?2",
                    params![now, container_id],
                )?;
            }

            tx.commit()?;
            Ok(message_id)
        })
    }

    pub fn get_message(&self, kind: MessageKind, id: i64) -> Result<Option<MessageRow>> {
        self.with_conn(|conn| query_message(conn, kind, id))
    }

    pub fn update_message_content(&self, kind: MessageKind, id: i64, content: &str) -> Result<bool> {
        let (table, _, _) = message_table(kind);
        self.with_conn(|conn| {
            let n = conn.execute(
                &format!("UPDATE {} SET content = ?1 WHERE id = ?2", table),
                params![content, id],
            )?;
            Ok(n > 0)
        })
    }

    /// Deletes a message together with its attachments.
    pub fn delete_message(&self, kind: MessageKind, id: i64) -> Result<bool> {
        let (table, _, tag) = message_table(kind);
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "DELETE FROM chat_files WHERE message_kind = ?1 AND message_id = ?2",
                params![tag, id],
            )?;
            let n = tx.execute(&format!("DELETE FROM {} WHERE id = ?1", table), [id])?;
            tx.commit()?;
            Ok(n > 0)
        })
    }

    // -- Notifications --

    pub fn insert_notification(
        &self,
        user_id: i64,
        kind: &str,
        object_id: i64,
        message: &str,
        is_read: bool,
    ) -> Result<NotificationRow> {
        let now = now_timestamp();
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO notifications (user_id, kind, object_id, message, is_read, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![user_id, kind, object_id, message, is_read, now],
            )?;
            Ok(NotificationRow {
                id: conn.last_insert_rowid(),
                user_id,
                kind: kind.to_string(),
                object_id,
                message: message.to_string(),
                is_read,
                created_at: now,
            })
        })
    }

    /// Unread notifications for a user, newest first.
    pub fn unread_notifications(&self, user_id: i64) -> Result<Vec<NotificationRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, user_id, kind, object_id, message, is_read, created_at
                 FROM notifications
                 WHERE user_id = ?1 AND is_read = 0
                 ORDER BY created_at DESC, id DESC",
            )?;
            let rows = stmt
                .query_map([user_id], notification_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Marks a notification read. Returns false if it does not exist or
    /// belongs to someone else.
    pub fn mark_notification_read(&self, id: i64, user_id: i64) -> Result<bool> {
        self.with_conn(|conn| {
            let n = conn.execute(
                "UPDATE notifications SET is_read = 1 WHERE id = ?1 AND user_id = ?2",
                params![id, user_id],
            )?;
            Ok(n > 0)
        })
    }
}

fn query_message(conn: &Connection, kind: MessageKind, id: i64) -> Result<Option<MessageRow>> {
    let (table, column, tag) = message_table(kind);
    // JOIN users for the sender name and the first attachment in one query
    let sql = format!(
        "SELECT m.id, m.{column}, m.sender_id, u.username, m.content, m.is_read, m.created_at,
                f.id, f.original_name, f.file_path, f.file_size, f.mime_type
         FROM {table} m
         JOIN users u ON u.id = m.sender_id
         LEFT JOIN chat_files f ON f.message_kind = ?2 AND f.message_id = m.id
         WHERE m.id = ?1
         ORDER BY f.id
         LIMIT 1"
    );

    conn.query_row(&sql, params![id, tag], |row| {
        let file = match row.get::<_, Option<i64>>(7)? {
            Some(file_id) => Some(FileRow {
                id: file_id,
                original_name: row.get(8)?,
                file_path: row.get(9)?,
                file_size: row.get(10)?,
                mime_type: row.get(11)?,
            }),
            None => None,
        };
        Ok(MessageRow {
            id: row.get(0)?,
            container_id: row.get(1)?,
            sender_id: row.get(2)?,
            sender_username: row.get(3)?,
            content: row.get(4)?,
            is_read: row.get(5)?,
            created_at: row.get(6)?,
            file,
        })
    })
    .optional()
}

fn notification_from_row(row: &Row<'_>) -> rusqlite::Result<NotificationRow> {
    Ok(NotificationRow {
        id: row.get(0)?,
        user_id: row.get(1)?,
        kind: row.get(2)?,
        object_id: row.get(3)?,
        message: row.get(4)?,
        is_read: row.get(5)?,
        created_at: row.get(6)?,
    })
}

/// Extension trait for optional query results
trait OptionalExt<T> {
    fn optional(self) -> Result<Option<T>>;
}

impl<T> OptionalExt<T> for std::result::Result<T, rusqlite::Error> {
    fn optional(self) -> Result<Option<T>> {
        match self {
            Ok(val) => Ok(Some(val)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
