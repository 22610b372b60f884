//! Realtime event delivery.
//!
//! ## WebSocket `GET /api/events`
//!
//! | Direction | Content |
//! |---|---|
//! | Server → Client | `{"event":"install-progress","payload":{...}}` for every instance |
//! | Server → Client | `{"event":"console-output","payload":{...}}` for subscribed ids only |
//! | Client → Server | `{"type":"subscribe-console","serverId":"alpha"}` |
//! | Client → Server | `{"type":"unsubscribe-console","serverId":"alpha"}` |
//!
//! Console subscriptions are dropped when the socket closes.
//!
//! ## SSE `GET /api/instances/:id/events`
//!
//! Install progress and console output of one instance.

use std::collections::HashMap;
use std::convert::Infallible;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use serde::Deserialize;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;

use super::super::IPCServer;
use crate::events::ServerEvent;
use crate::supervisor::error::SupervisorError;

const KEEP_ALIVE: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    SubscribeConsole {
        #[serde(rename = "serverId")]
        server_id: String,
    },
    UnsubscribeConsole {
        #[serde(rename = "serverId")]
        server_id: String,
    },
}

/// GET /api/events: WebSocket upgrade.
pub async fn events_ws(ws: WebSocketUpgrade, State(state): State<IPCServer>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_events_ws(socket, state))
}

async fn handle_events_ws(mut socket: WebSocket, state: IPCServer) {
    let events = state.supervisor.events().clone();
    let mut install_rx = events.install.firehose();
    let (console_tx, mut console_rx) = mpsc::channel::<ServerEvent>(256);
    let mut console_subs: HashMap<String, JoinHandle<()>> = HashMap::new();

    tracing::debug!("Event socket opened");

    loop {
        let outgoing = tokio::select! {
            msg = socket.recv() => match msg {
                Some(Ok(Message::Text(text))) => {
                    match serde_json::from_str::<ClientMessage>(&text) {
                        Ok(ClientMessage::SubscribeConsole { server_id }) => {
                            if !console_subs.contains_key(&server_id) {
                                let mut sub = events.console.subscribe(&server_id);
                                let tx = console_tx.clone();
                                let task = tokio::spawn(async move {
                                    while let Some(line) = sub.recv().await {
                                        if tx.send(ServerEvent::ConsoleOutput(line)).await.is_err() {
                                            break;
                                        }
                                    }
                                });
                                tracing::debug!("Socket subscribed to console of '{}'", server_id);
                                console_subs.insert(server_id, task);
                            }
                        }
                        Ok(ClientMessage::UnsubscribeConsole { server_id }) => {
                            if let Some(task) = console_subs.remove(&server_id) {
                                task.abort();
                            }
                        }
                        Err(e) => tracing::debug!("Ignoring client message {:?}: {}", text, e),
                    }
                    None
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => None,
            },
            ev = install_rx.recv() => match ev {
                Ok(progress) => Some(ServerEvent::InstallProgress(progress)),
                Err(RecvError::Lagged(n)) => {
                    tracing::debug!("Event socket lagged, skipped {} install events", n);
                    None
                }
                Err(RecvError::Closed) => break,
            },
            Some(ev) = console_rx.recv() => Some(ev),
        };

        if let Some(event) = outgoing {
            let text = match serde_json::to_string(&event) {
                Ok(text) => text,
                Err(e) => {
                    tracing::warn!("Failed to serialize event: {}", e);
                    continue;
                }
            };
            if socket.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    }

    for (_, task) in console_subs {
        task.abort();
    }
    tracing::debug!("Event socket closed");
}

fn to_sse(event: ServerEvent) -> Option<Result<Event, Infallible>> {
    let name = match &event {
        ServerEvent::InstallProgress(_) => "install-progress",
        ServerEvent::ConsoleOutput(_) => "console-output",
    };
    match serde_json::to_string(&event) {
        Ok(json) => Some(Ok(Event::default().event(name).data(json))),
        Err(e) => {
            tracing::warn!("Failed to serialize event: {}", e);
            None
        }
    }
}

/// GET /api/instances/:id/events: SSE stream for one instance.
pub async fn instance_sse(
    Path(id): Path<String>,
    State(state): State<IPCServer>,
) -> Result<impl IntoResponse, SupervisorError> {
    state.supervisor.get(&id).await?;

    let events = state.supervisor.events();
    let install = events
        .install
        .subscribe(&id)
        .into_stream()
        .map(ServerEvent::InstallProgress);
    let console = events
        .console
        .subscribe(&id)
        .into_stream()
        .map(ServerEvent::ConsoleOutput);
    let stream = install.merge(console).filter_map(to_sse);

    Ok(Sse::new(stream).keep_alive(KeepAlive::new().interval(KEEP_ALIVE).text("ping")))
}
