//! NIP-01 WebSocket endpoint of the relay.

use std::{collections::HashSet, future::Future, net::SocketAddr};

use anyhow::Result;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use futures_util::StreamExt;
use tracing::{debug, info};

use crate::{
    message::{ClientMessage, Filter, RelayMessage},
    storage::Store,
};

/// Start a WebSocket server speaking EVENT / REQ / CLOSE.
pub async fn serve_ws(
    addr: SocketAddr,
    store: Store,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("relay websocket listening on {}", listener.local_addr()?);
    axum::serve(listener, router(store).into_make_service())
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

fn router(store: Store) -> Router {
    Router::new().route("/", get(handler)).with_state(store)
}

/// Handle the HTTP upgrade and spawn the connection processor.
async fn handler(ws: WebSocketUpgrade, State(store): State<Store>) -> impl IntoResponse {
    ws.on_upgrade(|socket| async move { process(socket, store).await })
}

/// Process frames on one connection until the peer goes away.
///
/// Malformed frames and unknown commands are dropped without a reply.
async fn process(mut socket: WebSocket, store: Store) {
    while let Some(Ok(msg)) = socket.next().await {
        let Message::Text(txt) = msg else {
            continue;
        };
        let parsed = match ClientMessage::parse(&txt) {
            Ok(m) => m,
            Err(e) => {
                debug!("dropping frame: {e}");
                continue;
            }
        };
        let replies = match parsed {
            ClientMessage::Event(ev) => {
                debug!(id = %ev.id, "EVENT");
                vec![RelayMessage::Ok(store.ingest(*ev))]
            }
            ClientMessage::Req {
                subscription_id,
                filters,
            } => {
                debug!(sub = %subscription_id, ?filters, "REQ");
                let mut replies: Vec<RelayMessage> = matching_events(&store, &filters)
                    .into_iter()
                    .map(|event| RelayMessage::Event {
                        subscription_id: subscription_id.clone(),
                        event: Box::new(event),
                    })
                    .collect();
                debug!(sub = %subscription_id, count = replies.len(), "answering REQ");
                replies.push(RelayMessage::Eose(subscription_id));
                replies
            }
            // Subscriptions end at EOSE, so there is nothing to close.
            ClientMessage::Close(_) => vec![],
        };
        for reply in replies {
            if socket.send(Message::Text(reply.to_json())).await.is_err() {
                return;
            }
        }
    }
}

/// Union of the matches of every filter, without duplicates.
fn matching_events(store: &Store, filters: &[Filter]) -> Vec<crate::event::Event> {
    let mut seen = HashSet::new();
    filters
        .iter()
        .flat_map(|f| store.query(f))
        .filter(|ev| seen.insert(ev.id.clone()))
        .collect()
}
