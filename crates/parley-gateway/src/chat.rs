use anyhow::anyhow;
use tracing::{debug, error, trace, warn};

use parley_db::models::MessageRow;
use parley_types::events::{ChatEvent, ClientAction, NewMessage, ServerFrame, StatusHint};
use parley_types::models::{
    ActivityStatus, FileView, MessageKind, MessageScope, MessageView, UserId, UserRef,
};

use crate::error::{GatewayError, run_blocking};
use crate::notify::NotificationSource;
use crate::session::{Context, Session};

pub(crate) const INTERNAL_ERROR: &str = "Internal server error";
const INVALID_FRAME: &str = "Invalid json format";

/// Result of handling one inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionOutcome {
    MessageSent { message_id: i64 },
    MessageEdited { message_id: i64 },
    MessageDeleted { message_id: i64 },
    StatusRecorded,
    NotificationRead { notification_id: i64 },
    /// Nothing changed and nothing was sent: unknown action, an action
    /// that does not apply to this stream, or a message the caller does
    /// not own.
    Ignored,
    /// An error frame carrying this text went back to the sender.
    Rejected(String),
}

/// Decode one text frame and run it against the session's context.
pub(crate) async fn handle_frame(session: &Session, text: &str) -> ActionOutcome {
    let action = match ClientAction::decode(text) {
        Ok(Some(action)) => action,
        Ok(None) => {
            trace!("Ignoring unknown action from {}", session.user().id);
            return ActionOutcome::Ignored;
        }
        Err(e) => {
            warn!(
                "{} ({}) sent a malformed frame: {} -- raw: {}",
                session.user().username,
                session.user().id,
                e,
                preview(text)
            );
            return reject(session, INVALID_FRAME);
        }
    };

    let container = session.context().container();
    let result = match (action, container) {
        (ClientAction::ChatMessage { message }, Some((kind, container_id))) => {
            send_message(session, kind, container_id, message).await
        }
        (
            ClientAction::EditMessage {
                message_id,
                new_content,
            },
            Some((kind, container_id)),
        ) => edit_message(session, kind, container_id, message_id, new_content).await,
        (ClientAction::DeleteMessage { message_id }, Some((kind, container_id))) => {
            delete_message(session, kind, container_id, message_id).await
        }
        (ClientAction::UserStatus { user_status }, _)
            if session.context() != Context::Notifications =>
        {
            record_status(session, user_status).await
        }
        (ClientAction::MarkRead { notification_id }, None)
            if session.context() == Context::Notifications =>
        {
            mark_read(session, notification_id).await
        }
        _ => Ok(ActionOutcome::Ignored),
    };

    match result {
        Ok(outcome) => outcome,
        Err(GatewayError::MalformedFrame(reason)) => {
            debug!("Rejected frame from {}: {}", session.user().id, reason);
            reject(session, &reason)
        }
        Err(GatewayError::StoreUnavailable(e)) => {
            warn!("Presence store unavailable, dropping status from {}: {}", session.user().id, e);
            ActionOutcome::Ignored
        }
        Err(e) => {
            error!(
                "Frame from {} ({}) failed: {}",
                session.user().username,
                session.user().id,
                e
            );
            reject(session, INTERNAL_ERROR)
        }
    }
}

fn preview(text: &str) -> &str {
    match text.char_indices().nth(200) {
        Some((end, _)) => &text[..end],
        None => text,
    }
}

fn reject(session: &Session, message: &str) -> ActionOutcome {
    session.reply(&ServerFrame::error(message));
    ActionOutcome::Rejected(message.to_string())
}

async fn send_message(
    session: &Session,
    kind: MessageKind,
    container_id: i64,
    message: NewMessage,
) -> Result<ActionOutcome, GatewayError> {
    let sender = session.user().clone();
    if message.is_empty() {
        return Err(GatewayError::MalformedFrame(
            "Message needs content or a file".into(),
        ));
    }
    if message.sender.is_some_and(|s| s.id != sender.id) {
        return Err(GatewayError::MalformedFrame(
            "Sender does not match the connected user".into(),
        ));
    }

    let db = session.gateway().db().clone();
    let sender_id = sender.id.0;
    let file_id = message.file.map(|f| f.id);
    let content = message.content;
    let row = run_blocking(move || -> anyhow::Result<MessageRow> {
        let id = db.insert_message(kind, container_id, sender_id, &content, file_id)?;
        db.get_message(kind, id)?
            .ok_or_else(|| anyhow!("message {} missing right after insert", id))
    })
    .await?;

    let message_id = row.id;
    let view = message_view(kind, row)?;
    let delivered = session.publish(&ChatEvent::ChatMessage { message: view }.into()).await;
    debug!("Message {} delivered to {} connections in {}", message_id, delivered, session.group());

    if let Context::Direct { peer, .. } = session.context() {
        notify_peer(session, peer, message_id, sender).await;
    }
    Ok(ActionOutcome::MessageSent { message_id })
}

/// The recipient's notification is best effort: the message itself is
/// already stored and published.
async fn notify_peer(session: &Session, peer: UserId, message_id: i64, sender: UserRef) {
    let source = NotificationSource::DirectMessage {
        message_id,
        sender: sender.username,
    };
    if let Err(e) = session.gateway().notifier().notify(peer, source).await {
        error!("Notification for message {} to {} failed: {}", message_id, peer, e);
    }
}

/// Load a message in this session's container that the caller wrote.
/// Anything else comes back as `None`.
async fn owned_message(
    session: &Session,
    kind: MessageKind,
    container_id: i64,
    message_id: i64,
) -> Result<Option<MessageRow>, GatewayError> {
    let db = session.gateway().db().clone();
    let Some(row) = run_blocking(move || db.get_message(kind, message_id)).await? else {
        debug!("Message {} not found", message_id);
        return Ok(None);
    };
    if row.container_id != container_id {
        debug!("Message {} is not in {}", message_id, session.group());
        return Ok(None);
    }
    if row.sender_id != session.user().id.0 {
        warn!(
            "{} tried to change message {} owned by {}",
            session.user().id,
            message_id,
            row.sender_id
        );
        return Ok(None);
    }
    Ok(Some(row))
}

async fn edit_message(
    session: &Session,
    kind: MessageKind,
    container_id: i64,
    message_id: i64,
    new_content: String,
) -> Result<ActionOutcome, GatewayError> {
    if owned_message(session, kind, container_id, message_id).await?.is_none() {
        return Ok(ActionOutcome::Ignored);
    }

    let db = session.gateway().db().clone();
    let content = new_content.clone();
    let updated = run_blocking(move || db.update_message_content(kind, message_id, &content)).await?;
    if !updated {
        return Ok(ActionOutcome::Ignored);
    }

    session
        .publish(
            &ChatEvent::MessageEdited {
                message_id,
                new_content,
            }
            .into(),
        )
        .await;
    Ok(ActionOutcome::MessageEdited { message_id })
}

async fn delete_message(
    session: &Session,
    kind: MessageKind,
    container_id: i64,
    message_id: i64,
) -> Result<ActionOutcome, GatewayError> {
    if owned_message(session, kind, container_id, message_id).await?.is_none() {
        return Ok(ActionOutcome::Ignored);
    }

    let db = session.gateway().db().clone();
    let deleted = run_blocking(move || db.delete_message(kind, message_id)).await?;
    if !deleted {
        return Ok(ActionOutcome::Ignored);
    }

    session
        .publish(&ChatEvent::MessageDeleted { message_id }.into())
        .await;
    Ok(ActionOutcome::MessageDeleted { message_id })
}

/// Record the sender's activity flags. On a DM stream both participants'
/// flags are then published to the conversation.
async fn record_status(session: &Session, hint: StatusHint) -> Result<ActionOutcome, GatewayError> {
    let user_id = session.user().id;
    let presence = session.gateway().presence();
    presence
        .set_activity(ActivityStatus {
            user_id,
            in_the_chat: hint.in_the_chat_status,
            typing: hint.typing,
        })
        .await?;

    if let Context::Direct { peer, .. } = session.context() {
        let user_status = presence.activity_of(vec![user_id, peer]).await?;
        session
            .publish(&ChatEvent::UserStatus { user_status }.into())
            .await;
    }
    Ok(ActionOutcome::StatusRecorded)
}

async fn mark_read(session: &Session, notification_id: i64) -> Result<ActionOutcome, GatewayError> {
    let db = session.gateway().db().clone();
    let user_id = session.user().id.0;
    let updated =
        run_blocking(move || db.mark_notification_read(notification_id, user_id)).await?;
    Ok(if updated {
        ActionOutcome::NotificationRead { notification_id }
    } else {
        ActionOutcome::Ignored
    })
}

fn message_view(kind: MessageKind, row: MessageRow) -> Result<MessageView, GatewayError> {
    let scope = match kind {
        MessageKind::Direct => MessageScope::Direct {
            direct_message: row.container_id,
        },
        MessageKind::Chatroom => MessageScope::Chatroom {
            channel: row.container_id,
        },
    };
    Ok(MessageView {
        id: row.id,
        sender: UserRef {
            id: UserId(row.sender_id),
            username: row.sender_username,
        },
        content: row.content,
        timestamp: parley_db::parse_timestamp(&row.created_at)?,
        is_read: row.is_read,
        file: row.file.map(|f| FileView {
            id: f.id,
            original_name: f.original_name,
            file_path: f.file_path,
            file_size: f.file_size,
            mime_type: f.mime_type,
        }),
        scope,
    })
}
