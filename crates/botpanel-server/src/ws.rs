use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use botpanel_protocol::{ActionCmd, BotId, ClientEvent, OutputPayload, ServerEvent};
use libbotpanel::{Delivery, LaunchSpec, Subscriber};

use crate::server::AppState;

/// WebSocket upgrade handler for the control channel.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Handle a single viewer connection.
///
/// - The connection is one `Subscriber`; it may join any number of bots.
/// - A write task owns the socket's sink and merges hub deliveries with
///   replies meant for this connection only.
/// - The read loop turns client events into supervisor and hub calls.
async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (subscriber, mut deliveries) = state.supervisor.hub().subscriber();
    let (reply_tx, mut reply_rx) = mpsc::channel::<ServerEvent>(64);
    let connection = subscriber.id();
    let lag_marks = subscriber.lag_marks();
    debug!(connection = %connection, "ws connection opened");

    let write_task = tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                Some(delivery) = deliveries.recv() => output_event(delivery),
                Some(reply) = reply_rx.recv() => reply,
                else => break,
            };
            let mut events = vec![event];
            events.extend(lag_marks.take().iter().map(lagged_event));
            for event in events {
                let json = match serde_json::to_string(&event) {
                    Ok(json) => json,
                    Err(e) => {
                        warn!(error = %e, "failed to encode server event");
                        continue;
                    }
                };
                if ws_tx.send(Message::text(json)).await.is_err() {
                    return;
                }
            }
        }
    });

    while let Some(msg) = ws_rx.next().await {
        let msg = match msg {
            Ok(m) => m,
            Err(e) => {
                debug!(connection = %connection, "ws read error: {e}");
                break;
            }
        };

        let reply = match msg {
            Message::Text(text) => handle_text(&state, &subscriber, &text).await.err(),
            Message::Binary(_) => Some(ServerEvent::error(
                "binary frames are not supported",
                None,
            )),
            Message::Close(_) => break,
            _ => None,
        };

        if let Some(reply) = reply
            && reply_tx.send(reply).await.is_err()
        {
            break;
        }
    }

    // Leaving drops the hub's senders; with ours gone the write task drains and exits.
    state.supervisor.hub().leave(connection).await;
    drop(subscriber);
    drop(reply_tx);
    let _ = write_task.await;
    debug!(connection = %connection, "ws connection closed");
}

/// Told to a viewer that was dropped from a bot's group for falling behind.
fn lagged_event(bot_id: &BotId) -> ServerEvent {
    ServerEvent::error(
        "viewer fell behind and was unsubscribed; join again to resync",
        Some(bot_id.as_str()),
    )
}

fn output_event(delivery: Delivery) -> ServerEvent {
    ServerEvent::Output(OutputPayload {
        bot_id: delivery.bot_id,
        seq: delivery.line.seq,
        text: delivery.line.text,
    })
}

/// Parse one text frame and act on it. An `Err` is sent back to this
/// connection only.
pub async fn handle_text(
    state: &AppState,
    subscriber: &Subscriber,
    text: &str,
) -> Result<(), ServerEvent> {
    if text.len() > state.limits.max_control_bytes {
        return Err(ServerEvent::error(
            format!(
                "control frame too large: {} > {}",
                text.len(),
                state.limits.max_control_bytes
            ),
            None,
        ));
    }

    let event: ClientEvent = serde_json::from_str(text).map_err(|e| {
        debug!(connection = %subscriber.id(), error = %e, "malformed client event");
        ServerEvent::error(format!("invalid message: {e}"), None)
    })?;
    dispatch(state, subscriber, event).await
}

pub async fn dispatch(
    state: &AppState,
    subscriber: &Subscriber,
    event: ClientEvent,
) -> Result<(), ServerEvent> {
    let hub = state.supervisor.hub();
    match event {
        ClientEvent::Join(raw) => {
            let bot_id = validate(&raw)?;
            if hub.join(&bot_id, subscriber).await.is_none() {
                return Err(lagged_event(&bot_id));
            }
        }

        ClientEvent::Leave(raw) => {
            let bot_id = validate(&raw)?;
            hub.leave_bot(&bot_id, subscriber.id()).await;
        }

        ClientEvent::Action(req) => {
            let bot_id = validate(&req.bot_id)?;
            let outcome = match req.cmd {
                ActionCmd::Run => {
                    let spec = LaunchSpec {
                        file: req.file,
                        port: req.port,
                    };
                    state.supervisor.start(&bot_id, &spec).await
                }
                ActionCmd::Stop => state.supervisor.stop(&bot_id).await,
                ActionCmd::Install => {
                    let Some(version) = req.runtime_version.as_deref() else {
                        return Err(ServerEvent::error(
                            "install requires runtimeVersion",
                            Some(bot_id.as_str()),
                        ));
                    };
                    state.supervisor.install_runtime(&bot_id, version).await
                }
            };
            debug!(connection = %subscriber.id(), bot_id = %bot_id, outcome = ?outcome, "action handled");
        }

        ClientEvent::Command(req) => {
            let bot_id = validate(&req.bot_id)?;
            if req.command.len() > state.limits.max_input_bytes {
                return Err(ServerEvent::error(
                    format!(
                        "command too large: {} > {}",
                        req.command.len(),
                        state.limits.max_input_bytes
                    ),
                    Some(bot_id.as_str()),
                ));
            }
            state.supervisor.send_input(&bot_id, &req.command).await;
        }
    }
    Ok(())
}

fn validate(raw: &str) -> Result<BotId, ServerEvent> {
    BotId::parse(raw).map_err(|e| ServerEvent::error(format!("invalid bot id: {e}"), Some(raw)))
}
