use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch("CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL);")?;

    let version: i64 =
        conn.query_row("SELECT COALESCE(MAX(version), 0) FROM schema_version", [], |r| r.get(0))?;

    if version < 1 {
        info!("Database: running migration v1 (initial schema)");
        conn.execute_batch(
            "
            CREATE TABLE users (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                username    TEXT NOT NULL UNIQUE,
                created_at  TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
            );

            CREATE TABLE user_settings (
                user_id                 INTEGER PRIMARY KEY REFERENCES users(id) ON DELETE CASCADE,
                message_notifications   INTEGER NOT NULL DEFAULT 1,
                request_notifications   INTEGER NOT NULL DEFAULT 1
            );

            CREATE TABLE direct_messages (
                id                  INTEGER PRIMARY KEY AUTOINCREMENT,
                user1_id            INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                user2_id            INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                group_name          TEXT NOT NULL UNIQUE,
                created_at          TEXT NOT NULL,
                last_interaction    TEXT NOT NULL,
                UNIQUE(user1_id, user2_id)
            );

            CREATE TABLE chatrooms (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                name        TEXT NOT NULL UNIQUE,
                admin_id    INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                created_at  TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
            );

            CREATE TABLE chatroom_members (
                user_id     INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                chatroom_id INTEGER NOT NULL REFERENCES chatrooms(id) ON DELETE CASCADE,
                joined_at   TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
                PRIMARY KEY (user_id, chatroom_id)
            );

            CREATE TABLE channels (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                chatroom_id INTEGER NOT NULL REFERENCES chatrooms(id) ON DELETE CASCADE,
                name        TEXT NOT NULL,
                UNIQUE(chatroom_id, name)
            );

            CREATE TABLE dm_messages (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                dm_id       INTEGER NOT NULL REFERENCES direct_messages(id) ON DELETE CASCADE,
                sender_id   INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                content     TEXT NOT NULL,
                is_read     INTEGER NOT NULL DEFAULT 0,
                created_at  TEXT NOT NULL
            );

            CREATE INDEX idx_dm_messages_dm ON dm_messages(dm_id, created_at);

            CREATE TABLE chatroom_messages (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                channel_id  INTEGER NOT NULL REFERENCES channels(id) ON DELETE CASCADE,
                sender_id   INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                content     TEXT NOT NULL,
                is_read     INTEGER NOT NULL DEFAULT 0,
                created_at  TEXT NOT NULL
            );

            CREATE INDEX idx_chatroom_messages_channel ON chatroom_messages(channel_id, created_at);

            -- message_kind/message_id point at dm_messages or chatroom_messages
            CREATE TABLE chat_files (
                id              INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id         INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                original_name   TEXT NOT NULL,
                file_path       TEXT NOT NULL,
                file_size       INTEGER NOT NULL,
                mime_type       TEXT NOT NULL,
                message_kind    TEXT,
                message_id      INTEGER,
                created_at      TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
            );

            CREATE INDEX idx_chat_files_message ON chat_files(message_kind, message_id);

            CREATE TABLE notifications (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id     INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                kind        TEXT NOT NULL,
                object_id   INTEGER NOT NULL,
                message     TEXT NOT NULL,
                is_read     INTEGER NOT NULL DEFAULT 0,
                created_at  TEXT NOT NULL
            );

            CREATE INDEX idx_notifications_unread ON notifications(user_id, is_read, created_at);

            INSERT INTO schema_version (version) VALUES (1);
            ",
        )?;
    }

    info!("Database migrations complete");
    Ok(())
}
