//! WebSocket endpoint.
//!
//! One task reads frames and feeds them to the hub; a second drains the
//! connection's outbound queue into the socket. The writer stops once the
//! hub drops the queue's sender during teardown, and the reader stops with
//! it, so a connection the hub closed (shutdown, full queue) ends promptly.

use std::sync::Arc;

use axum::extract::ws::{close_code, CloseFrame, Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::api::{bearer_token, AppState};
use crate::error::HubError;
use crate::hub::{Flow, Hub};
use crate::protocol::{ClientEvent, ServerEvent};

#[derive(Debug, Deserialize)]
pub struct ConnectParams {
    token: Option<String>,
}

/// `GET /ws`. The token comes from `?token=` or an `Authorization: Bearer`
/// header and is checked after the upgrade so the client gets a close frame
/// with a reason.
pub async fn ws_upgrade(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(params): Query<ConnectParams>,
    headers: HeaderMap,
) -> Response {
    let token = params.token.or_else(|| bearer_token(&headers).map(str::to_string));
    let hub = Arc::clone(&state.hub);
    ws.on_upgrade(move |socket| handle_socket(socket, hub, token))
}

async fn handle_socket(socket: WebSocket, hub: Arc<Hub>, token: Option<String>) {
    let (mut sink, mut stream) = socket.split();

    let session = match hub.connect(token.as_deref()).await {
        Ok(session) => session,
        Err(e) => {
            debug!(error = %e, "rejecting websocket");
            let code = match e {
                HubError::Capacity => close_code::AGAIN,
                HubError::Persistence(_) => close_code::ERROR,
                _ => close_code::POLICY,
            };
            if let Ok(json) = ServerEvent::Error(e.to_event()).to_json() {
                let _ = sink.send(WsMessage::Text(json.into())).await;
            }
            let _ = sink
                .send(WsMessage::Close(Some(CloseFrame {
                    code,
                    reason: e.code().into(),
                })))
                .await;
            return;
        }
    };

    let connection = session.connection;
    let mut events = session.events;

    let mut writer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let json = match event.to_json() {
                Ok(json) => json,
                Err(e) => {
                    warn!(event = event.name(), error = %e, "failed to encode event");
                    continue;
                }
            };
            if sink.send(WsMessage::Text(json.into())).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let mut writer_result = None;
    loop {
        let frame = tokio::select! {
            frame = stream.next() => frame,
            result = &mut writer => {
                writer_result = Some(result);
                break;
            }
        };
        let frame = match frame {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => {
                debug!(connection = %connection.id, error = %e, "websocket read failed");
                break;
            }
            None => break,
        };

        match frame {
            WsMessage::Text(text) => match ClientEvent::parse(text.as_str()) {
                Ok(event) => {
                    if hub.dispatch(&connection, event).await == Flow::Close {
                        break;
                    }
                }
                Err(e) => hub.reject(&connection, &e),
            },
            WsMessage::Binary(_) => hub.reject(
                &connection,
                &HubError::Validation("binary frames are not supported".into()),
            ),
            WsMessage::Close(_) => break,
            // axum answers pings itself.
            WsMessage::Ping(_) | WsMessage::Pong(_) => {}
        }
    }

    hub.disconnect(connection.id).await;
    let result = match writer_result {
        Some(result) => result,
        None => writer.await,
    };
    if let Err(e) = result {
        warn!(connection = %connection.id, error = %e, "websocket writer task failed");
    }
}
