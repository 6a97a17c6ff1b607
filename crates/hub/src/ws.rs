//! Live subscription socket. A client joins unit topics and receives every
//! event published on them while it stays connected.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;

use crate::model::{unit_topic, UnitId, UNITS_TOPIC};
use crate::web::AppState;

/// Commands a client may send.
#[derive(Debug, Deserialize, PartialEq)]
#[serde(tag = "action", rename_all = "kebab-case")]
pub(crate) enum ClientCommand {
    #[serde(alias = "join-unit", rename_all = "camelCase")]
    Join { unit_id: UnitId },
    #[serde(alias = "leave-unit", rename_all = "camelCase")]
    Leave { unit_id: UnitId },
    /// Provisioning events (unit created or deleted).
    WatchUnits,
    UnwatchUnits,
}

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (client, mut frames) = state.broadcaster.connect().await;
    tracing::info!(%client, "live client connected");

    let (mut sink, mut stream) = socket.split();

    // Replies to this client's own commands. They bypass the broadcaster so
    // a full event queue cannot swallow them.
    let (reply_tx, mut reply_rx) = mpsc::channel::<String>(8);

    let send_task = tokio::spawn(async move {
        loop {
            let text = tokio::select! {
                frame = frames.recv() => match frame {
                    Some(frame) => frame.to_string(),
                    None => break,
                },
                reply = reply_rx.recv() => match reply {
                    Some(reply) => reply,
                    None => break,
                },
            };
            if sink.send(Message::Text(text.into())).await.is_err() {
                tracing::debug!(%client, "live client sink closed");
                return;
            }
        }
        let _ = sink.send(Message::Close(None)).await;
    });

    loop {
        let next = tokio::select! {
            _ = state.shutdown.cancelled() => break,
            next = stream.next() => next,
        };
        match next {
            Some(Ok(Message::Text(text))) => {
                let reply = handle_command(&state, client, text.as_str()).await;
                if reply_tx.try_send(reply.to_string()).is_err() {
                    tracing::debug!(%client, "live client reply dropped");
                }
            }
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                tracing::debug!(%client, error = %e, "live client receive error");
                break;
            }
        }
    }

    state.broadcaster.disconnect(client).await;
    drop(reply_tx);
    // The sender ends once both of its channels are closed.
    let _ = tokio::time::timeout(std::time::Duration::from_secs(1), send_task).await;
    tracing::info!(%client, "live client disconnected");
}

async fn handle_command(
    state: &AppState,
    client: crate::broadcast::ClientId,
    text: &str,
) -> serde_json::Value {
    let cmd: ClientCommand = match serde_json::from_str(text) {
        Ok(cmd) => cmd,
        Err(e) => {
            return json!({ "type": "error", "error": format!("unrecognised command: {e}") });
        }
    };

    match cmd {
        ClientCommand::Join { unit_id } => {
            if state.cache.get(unit_id).await.is_none() {
                return json!({
                    "type": "error",
                    "unitId": unit_id,
                    "error": format!("unit {unit_id} not found"),
                });
            }
            state
                .broadcaster
                .subscribe(client, &unit_topic(unit_id))
                .await;
            tracing::debug!(%client, unit_id, "live client joined unit");
            json!({ "type": "joined", "unitId": unit_id })
        }
        ClientCommand::Leave { unit_id } => {
            state
                .broadcaster
                .unsubscribe(client, &unit_topic(unit_id))
                .await;
            json!({ "type": "left", "unitId": unit_id })
        }
        ClientCommand::WatchUnits => {
            state.broadcaster.subscribe(client, UNITS_TOPIC).await;
            json!({ "type": "watching", "topic": UNITS_TOPIC })
        }
        ClientCommand::UnwatchUnits => {
            state.broadcaster.unsubscribe(client, UNITS_TOPIC).await;
            json!({ "type": "unwatched", "topic": UNITS_TOPIC })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::web::tests::app_state;

    fn parse(s: &str) -> ClientCommand {
        serde_json::from_str(s).unwrap()
    }

    #[test]
    fn commands_and_aliases_parse() {
        assert_eq!(
            parse(r#"{"action":"join","unitId":3}"#),
            ClientCommand::Join { unit_id: 3 }
        );
        assert_eq!(
            parse(r#"{"action":"join-unit","unitId":3}"#),
            ClientCommand::Join { unit_id: 3 }
        );
        assert_eq!(
            parse(r#"{"action":"leave-unit","unitId":4}"#),
            ClientCommand::Leave { unit_id: 4 }
        );
        assert_eq!(parse(r#"{"action":"watch-units"}"#), ClientCommand::WatchUnits);
        assert!(serde_json::from_str::<ClientCommand>(r#"{"action":"join"}"#).is_err());
        assert!(serde_json::from_str::<ClientCommand>(r#"{"action":"dance"}"#).is_err());
    }

    #[tokio::test]
    async fn join_subscribes_known_units_only() {
        let state = app_state().await;
        let (client, mut rx) = state.broadcaster.connect().await;

        let reply = handle_command(&state, client, r#"{"action":"join","unitId":1}"#).await;
        assert_eq!(reply["type"], "joined");
        assert_eq!(state.broadcaster.subscriber_count("unit-1").await, 1);

        let reply = handle_command(&state, client, r#"{"action":"join","unitId":99}"#).await;
        assert_eq!(reply["type"], "error");
        assert_eq!(state.broadcaster.subscriber_count("unit-99").await, 0);

        let reply = handle_command(&state, client, "not json").await;
        assert_eq!(reply["type"], "error");

        // a reading for unit 1 now reaches the client
        let body = serde_json::json!({"waterLevel": 55, "temperature": 21, "floatSwitches": [true]});
        state.ingestor.submit(Some("key-1"), &body).await.unwrap();
        let mut saw_update = false;
        while let Ok(frame) = rx.try_recv() {
            let v: serde_json::Value = serde_json::from_str(&frame).unwrap();
            if v["type"] == "unitUpdate" {
                assert_eq!(v["reading"]["waterLevel"], 55.0);
                saw_update = true;
            }
        }
        assert!(saw_update);

        handle_command(&state, client, r#"{"action":"leave","unitId":1}"#).await;
        assert_eq!(state.broadcaster.subscriber_count("unit-1").await, 0);
    }
}
