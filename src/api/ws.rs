//! Observer WebSocket.
//!
//! Each socket gets its own broadcaster connection. Events go out as JSON
//! text frames; when the connection falls behind, a `lagged` frame reports
//! how many events were dropped. Inbound frames only keep the socket alive.

use axum::{
    extract::{
        Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info};

use super::AppState;
use super::error::ApiResult;
use crate::broadcast::{Broadcaster, Delivery};
use crate::model::UserId;
use crate::store::Store;

#[derive(Debug, Deserialize)]
pub struct ObserveParams {
    pub token: String,
}

pub async fn observe<S: Store>(
    State(state): State<AppState<S>>,
    Query(params): Query<ObserveParams>,
    ws: WebSocketUpgrade,
) -> ApiResult<Response> {
    let principal = state.engine.sessions.authenticate(&params.token).await?;
    let events = Arc::clone(&state.engine.events);
    let user = principal.user_id();
    Ok(ws.on_upgrade(move |socket| stream_events(socket, events, user)))
}

async fn stream_events(socket: WebSocket, events: Arc<Broadcaster>, user: UserId) {
    let mut subscription = events.connect();
    let connection = subscription.id();
    info!(%connection, user_id = %user, "observer attached");

    let (mut outbound, mut inbound) = socket.split();
    loop {
        tokio::select! {
            delivery = subscription.next() => {
                let frame = match delivery {
                    Delivery::Event(event) => match serde_json::to_string(&event) {
                        Ok(text) => text,
                        Err(e) => {
                            debug!(%connection, "skipping unserializable event: {e}");
                            continue;
                        }
                    },
                    Delivery::Lagged(skipped) => json!({"type": "lagged", "skipped": skipped}).to_string(),
                    Delivery::Closed => break,
                };
                if outbound.send(Message::Text(frame.into())).await.is_err() {
                    break;
                }
            }
            inbound_msg = inbound.next() => match inbound_msg {
                None | Some(Err(_)) | Some(Ok(Message::Close(_))) => break,
                Some(Ok(_)) => {}
            },
        }
    }

    events.disconnect(connection);
    info!(%connection, "observer detached");
}
