/// Database row types. These map directly to SQLite rows and are kept
/// separate from the wire types in parley-types.

pub struct UserRow {
    pub id: i64,
    pub username: String,
    pub created_at: String,
}

pub struct DirectMessageRow {
    pub id: i64,
    pub user1_id: i64,
    pub user2_id: i64,
    pub group_name: String,
    pub last_interaction: String,
}

pub struct ChatroomRow {
    pub id: i64,
    pub name: String,
    pub admin_id: i64,
}

pub struct ChannelRow {
    pub id: i64,
    pub chatroom_id: i64,
    pub name: String,
}

/// One message from either message table, joined with its sender and its
/// first attachment.
pub struct MessageRow {
    pub id: i64,
    /// dm id or channel id, depending on the table the row came from
    pub container_id: i64,
    pub sender_id: i64,
    pub sender_username: String,
    pub content: String,
    pub is_read: bool,
    pub created_at: String,
    pub file: Option<FileRow>,
}

pub struct FileRow {
    pub id: i64,
    pub original_name: String,
    pub file_path: String,
    pub file_size: i64,
    pub mime_type: String,
}

pub struct NotificationRow {
    pub id: i64,
    pub user_id: i64,
    pub kind: String,
    pub object_id: i64,
    pub message: String,
    pub is_read: bool,
    pub created_at: String,
}

pub struct NotificationSettingsRow {
    pub message_notifications: bool,
    pub request_notifications: bool,
}

impl Default for NotificationSettingsRow {
    fn default() -> Self {
        Self {
            message_notifications: true,
            request_notifications: true,
        }
    }
}
