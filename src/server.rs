//! HTTP endpoints for health checks and relay info.

use anyhow::Result;
use axum::{extract::State, http::header, response::IntoResponse, routing::get, Json, Router};
use serde::{Deserialize, Serialize};
use std::{future::Future, net::SocketAddr};
use tracing::{debug, info};

use crate::{
    event::{DIRECTORY_KIND, RELAY_LIST_KIND},
    storage::Store,
};

/// Response body for the `/healthz` endpoint.
#[derive(Serialize, Deserialize)]
struct Health {
    /// Always "ok" when the server is running.
    status: String,
    /// Number of live events in the store.
    events: usize,
}

/// Start an HTTP server exposing `/healthz` and relay info.
pub async fn serve_http(
    addr: SocketAddr,
    store: Store,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("relay http listening on {}", listener.local_addr()?);
    axum::serve(listener, router(store).into_make_service())
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

fn router(store: Store) -> Router {
    Router::new()
        .route("/", get(relay_info))
        .route("/healthz", get(healthz))
        .with_state(store)
}

async fn healthz(State(store): State<Store>) -> Json<Health> {
    debug!("GET /healthz");
    Json(Health {
        status: "ok".to_string(),
        events: store.len(),
    })
}

/// NIP-11 style relay information document.
#[derive(Serialize, Deserialize)]
struct RelayInfo {
    name: String,
    description: String,
    software: String,
    version: String,
    supported_nips: Vec<u32>,
    /// Replaceable kinds this relay compacts and serves.
    kinds: Vec<u32>,
}

async fn relay_info() -> impl IntoResponse {
    debug!("GET /");
    (
        [(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*")],
        Json(RelayInfo {
            name: "ncc05".into(),
            description: "in-memory NCC-05 directory relay".into(),
            software: "ncc05".into(),
            version: env!("CARGO_PKG_VERSION").into(),
            supported_nips: vec![1, 11, 44, 65],
            kinds: vec![DIRECTORY_KIND, RELAY_LIST_KIND],
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Event, Tag};
    use reqwest::{self, header::ACCESS_CONTROL_ALLOW_ORIGIN};
    use tokio::task;

    fn event(id: &str, pubkey: &str, kind: u32, d: Option<&str>, created_at: u64) -> Event {
        Event {
            id: id.into(),
            pubkey: pubkey.into(),
            kind,
            created_at,
            tags: d.map(|d| vec![Tag::new(["d", d])]).unwrap_or_default(),
            content: String::new(),
            sig: String::new(),
        }
    }

    async fn spawn(store: Store) -> (std::net::SocketAddr, task::JoinHandle<()>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = axum::serve(listener, router(store).into_make_service());
        let handle = task::spawn(async move {
            server.await.unwrap();
        });
        (addr, handle)
    }

    #[tokio::test]
    async fn health_endpoint() {
        let store = Store::new(false);
        store.ingest(event("aa11", "p1", 1, None, 1));
        let (addr, handle) = spawn(store).await;
        let body: Health = reqwest::get(format!("http://{}/healthz", addr))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body.status, "ok");
        assert_eq!(body.events, 1);
        handle.abort();
    }

    #[tokio::test]
    async fn relay_info_endpoint() {
        let (addr, handle) = spawn(Store::new(false)).await;
        let resp = reqwest::get(format!("http://{}/", addr)).await.unwrap();
        assert_eq!(
            resp.headers().get(ACCESS_CONTROL_ALLOW_ORIGIN).unwrap(),
            "*"
        );
        let info: RelayInfo = resp.json().await.unwrap();
        assert_eq!(info.name, "ncc05");
        assert!(info.kinds.contains(&DIRECTORY_KIND));
        handle.abort();
    }

    #[tokio::test]
    async fn serve_http_bind_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        // binding to the same address should error because it's already taken
        assert!(serve_http(addr, Store::new(false), std::future::pending())
            .await
            .is_err());
    }
}
