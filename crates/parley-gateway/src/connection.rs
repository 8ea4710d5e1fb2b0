use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, Stream, StreamExt};
use tokio::sync::{Notify, mpsc};
use tracing::{debug, trace, warn};

use crate::groups::Payload;
use crate::session::Session;

/// Default ping interval. Two unanswered pings drop the connection.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Drive one upgraded socket until either side goes away, then tear the
/// session down.
///
/// Outbound payloads and heartbeats run in one task, inbound frames in
/// another. Inbound frames are handled one at a time, in arrival order.
pub async fn serve(
    socket: WebSocket,
    session: Session,
    mut outbound: mpsc::UnboundedReceiver<Payload>,
    heartbeat: Duration,
) {
    let (mut sender, receiver) = socket.split();
    let session = Arc::new(session);

    let pong_received = Arc::new(AtomicBool::new(true));
    let pong_flag_send = pong_received.clone();
    let pong_flag_recv = pong_received;
    let stop = Arc::new(Notify::new());

    let conn_id = session.handle().id();
    let mut send_task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(heartbeat);
        ticker.tick().await;
        let mut missed_heartbeats: u8 = 0;

        loop {
            tokio::select! {
                payload = outbound.recv() => {
                    let Some(payload) = payload else {
                        break;
                    };
                    if sender.send(Message::Text(payload.to_string().into())).await.is_err() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    if pong_flag_send.swap(false, Ordering::AcqRel) {
                        missed_heartbeats = 0;
                    } else {
                        missed_heartbeats += 1;
                        if missed_heartbeats >= 2 {
                            warn!("{} missed {} pongs, dropping connection", conn_id, missed_heartbeats);
                            break;
                        }
                    }
                    if sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                }
            }
        }
        let _ = sender.close().await;
    });

    let recv_session = session.clone();
    let recv_stop = stop.clone();
    let mut recv_task = tokio::spawn(async move {
        receive_frames(receiver, &recv_session, &pong_flag_recv, &recv_stop).await;
    });

    tokio::select! {
        // let a frame that is mid-flight finish persisting and publishing
        _ = &mut send_task => {
            stop.notify_one();
            let _ = recv_task.await;
        }
        _ = &mut recv_task => send_task.abort(),
    }

    session.close().await;
}

/// Handle inbound frames until the stream ends or `stop` fires. `stop` is
/// only observed between frames.
async fn receive_frames<S>(mut receiver: S, session: &Session, pong: &AtomicBool, stop: &Notify)
where
    S: Stream<Item = Result<Message, axum::Error>> + Unpin,
{
    loop {
        let msg = tokio::select! {
            biased;
            _ = stop.notified() => break,
            msg = receiver.next() => msg,
        };
        let Some(Ok(msg)) = msg else {
            break;
        };

        match msg {
            Message::Text(text) => {
                let outcome = session.handle_text(text.as_str()).await;
                trace!("{} frame outcome: {:?}", session.handle().id(), outcome);
            }
            Message::Binary(data) => {
                debug!("Ignoring {} byte binary frame from {}", data.len(), session.user().id);
            }
            Message::Pong(_) => {
                pong.store(true, Ordering::Release);
            }
            Message::Close(_) => break,
            Message::Ping(_) => {}
        }
    }
}
