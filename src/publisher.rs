//! Assemble, seal, sign and submit directory records.

use std::time::Duration;

use futures_util::future::join_all;
use tracing::{info, warn};

use crate::{
    client::RelayConnection,
    discovery::{collect_endpoints, EndpointConfig},
    envelope::{self, DirectoryPayload, Endpoint, Policy, PAYLOAD_VERSION},
    error::Ncc05Error,
    event::{unix_now, Event, EventDraft, Keys, Signer, Tag, DIRECTORY_KIND, IDENTIFIER_TAG},
    message::Ack,
    relay_list::RelayList,
};

pub const DEFAULT_IDENTIFIER: &str = "addr";
pub const DEFAULT_TTL: u64 = 600;
pub const DEFAULT_NOTES: &str = "NCC-05";

/// Where and how records are submitted.
#[derive(Debug, Clone)]
pub struct PublishOptions {
    pub relays: Vec<String>,
    pub identifier: String,
    pub ttl: u64,
    pub notes: String,
    /// Bound on each relay's connect plus acknowledgement.
    pub timeout: Duration,
    pub socks_proxy: Option<String>,
}

impl Default for PublishOptions {
    fn default() -> Self {
        Self {
            relays: Vec::new(),
            identifier: DEFAULT_IDENTIFIER.to_string(),
            ttl: DEFAULT_TTL,
            notes: DEFAULT_NOTES.to_string(),
            timeout: Duration::from_secs(15),
            socks_proxy: None,
        }
    }
}

/// Outcome of a successful publish.
#[derive(Debug, Clone)]
pub struct Publication {
    pub event_id: String,
    pub payload: DirectoryPayload,
    /// Relays that answered `OK true`.
    pub accepted_by: Vec<String>,
}

pub fn build_payload(endpoints: Vec<Endpoint>, ttl: u64, notes: impl Into<String>) -> DirectoryPayload {
    DirectoryPayload {
        v: PAYLOAD_VERSION,
        ttl,
        updated_at: unix_now(),
        endpoints,
        notes: notes.into(),
    }
}

/// Seal `payload` and sign it as a directory record under `identifier`.
pub fn build_record(
    keys: &Keys,
    payload: &DirectoryPayload,
    policy: &Policy,
    identifier: &str,
) -> Result<Event, Ncc05Error> {
    let content = envelope::encode(payload, policy, keys)?;
    keys.sign(EventDraft::new(
        DIRECTORY_KIND,
        vec![Tag::new([IDENTIFIER_TAG, identifier])],
        content,
    ))
}

/// Collect endpoints, build and seal the record, and submit it everywhere.
pub async fn publish(
    keys: &Keys,
    endpoints: &EndpointConfig,
    policy: &Policy,
    opts: &PublishOptions,
) -> Result<Publication, Ncc05Error> {
    let found = collect_endpoints(&endpoints.sources(), endpoints.port).await;
    if found.is_empty() {
        warn!("publishing a record without endpoints");
    }
    publish_payload(keys, build_payload(found, opts.ttl, opts.notes.clone()), policy, opts).await
}

/// Seal, sign and submit an already assembled payload.
pub async fn publish_payload(
    keys: &Keys,
    payload: DirectoryPayload,
    policy: &Policy,
    opts: &PublishOptions,
) -> Result<Publication, Ncc05Error> {
    let ev = build_record(keys, &payload, policy, &opts.identifier)?;
    info!(id = %ev.id, d = %opts.identifier, "publishing directory record");
    let accepted_by = submit(&ev, opts).await?;
    Ok(Publication {
        event_id: ev.id,
        payload,
        accepted_by,
    })
}

/// Sign and submit a relay list so gossip resolvers can find `list`'s relays.
pub async fn publish_relay_list(keys: &Keys, list: &RelayList, opts: &PublishOptions) -> Result<String, Ncc05Error> {
    let ev = keys.sign(list.to_draft())?;
    info!(id = %ev.id, relays = list.entries.len(), "publishing relay list");
    submit(&ev, opts).await?;
    Ok(ev.id)
}

/// Send `ev` to every relay concurrently. Succeeds when at least one relay
/// accepted it.
async fn submit(ev: &Event, opts: &PublishOptions) -> Result<Vec<String>, Ncc05Error> {
    if opts.relays.is_empty() {
        return Err(Ncc05Error::Configuration("no relays configured".into()));
    }
    let results = join_all(
        opts.relays
            .iter()
            .map(|relay| submit_one(relay, ev, opts.timeout, opts.socks_proxy.as_deref())),
    )
    .await;

    let mut accepted = Vec::new();
    let mut last_err = None;
    for (relay, result) in opts.relays.iter().zip(results) {
        match result {
            Ok(ack) if ack.accepted => {
                info!(relay, message = %ack.message, "accepted");
                accepted.push(relay.clone());
            }
            Ok(ack) => {
                warn!(relay, "rejected: {}", ack.message);
                last_err = Some(Ncc05Error::Rejected(format!("{relay}: {}", ack.message)));
            }
            Err(e) => {
                warn!(relay, "submit failed: {e}");
                last_err = Some(e);
            }
        }
    }
    match (accepted.is_empty(), last_err) {
        (false, _) => Ok(accepted),
        (true, Some(e)) => Err(e),
        (true, None) => Err(Ncc05Error::Network("no relay acknowledged the event".into())),
    }
}

async fn submit_one(relay: &str, ev: &Event, timeout: Duration, proxy: Option<&str>) -> Result<Ack, Ncc05Error> {
    let attempt = async {
        let mut conn = RelayConnection::connect(relay, proxy).await?;
        let ack = conn.send_event(ev).await?;
        conn.close().await;
        Ok::<_, Ncc05Error>(ack)
    };
    tokio::time::timeout(timeout, attempt)
        .await
        .map_err(|_| Ncc05Error::Timeout(timeout))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        envelope::{Family, PRIORITY_IP},
        event::RELAY_LIST_KIND,
        message::Filter,
        storage::Store,
    };

    async fn spawn_relay(store: Store) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        tokio::spawn(crate::ws::serve_ws(addr, store, std::future::pending()));
        tokio::time::sleep(Duration::from_millis(50)).await;
        format!("ws://{}", addr)
    }

    fn opts(relays: Vec<String>) -> PublishOptions {
        PublishOptions {
            relays,
            timeout: Duration::from_secs(2),
            ..PublishOptions::default()
        }
    }

    #[test]
    fn payload_defaults() {
        let p = build_payload(vec![], DEFAULT_TTL, DEFAULT_NOTES);
        assert_eq!(p.v, 1);
        assert_eq!(p.ttl, 600);
        assert_eq!(p.notes, "NCC-05");
        assert!(p.updated_at > 0);
    }

    #[test]
    fn record_is_tagged_and_signed() {
        let keys = Keys::generate();
        let payload = build_payload(vec![], 600, "");
        let ev = build_record(&keys, &payload, &Policy::Plain, "home").unwrap();
        assert_eq!(ev.kind, DIRECTORY_KIND);
        assert_eq!(ev.identifier(), Some("home"));
        assert_eq!(ev.pubkey, keys.public_key());
        crate::event::verify_event(&ev).unwrap();
        assert_eq!(serde_json::from_str::<DirectoryPayload>(&ev.content).unwrap(), payload);
    }

    #[tokio::test]
    async fn publish_stores_one_record_per_identifier() {
        let store = Store::new(true);
        let url = spawn_relay(store.clone()).await;
        let keys = Keys::generate();
        let endpoints = EndpointConfig {
            ip: Some("1.2.3.4".into()),
            port: 8080,
            ..EndpointConfig::default()
        };
        let first = publish(&keys, &endpoints, &Policy::default(), &opts(vec![url.clone()]))
            .await
            .unwrap();
        assert_eq!(first.accepted_by, vec![url.clone()]);
        assert_eq!(
            first.payload.endpoints,
            vec![Endpoint::tcp("1.2.3.4:8080", PRIORITY_IP, Family::Ipv4)]
        );
        let second = publish(&keys, &endpoints, &Policy::default(), &opts(vec![url]))
            .await
            .unwrap();

        let stored = store.query(&Filter::new().author(keys.public_key()).kind(DIRECTORY_KIND));
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].id, second.event_id);
    }

    #[tokio::test]
    async fn one_reachable_relay_is_enough() {
        let url = spawn_relay(Store::new(false)).await;
        let keys = Keys::generate();
        let payload = build_payload(vec![], 600, "");
        let publication = publish_payload(
            &keys,
            payload,
            &Policy::Plain,
            &opts(vec!["ws://127.0.0.1:9".into(), url.clone()]),
        )
        .await
        .unwrap();
        assert_eq!(publication.accepted_by, vec![url]);
    }

    #[tokio::test]
    async fn all_relays_failing_is_an_error() {
        let keys = Keys::generate();
        let payload = build_payload(vec![], 600, "");
        let err = publish_payload(&keys, payload.clone(), &Policy::Plain, &opts(vec!["ws://127.0.0.1:9".into()]))
            .await
            .unwrap_err();
        assert!(matches!(err, Ncc05Error::Network(_)));

        let err = publish_payload(&keys, payload, &Policy::Plain, &opts(vec![]))
            .await
            .unwrap_err();
        assert!(matches!(err, Ncc05Error::Configuration(_)));
    }

    #[tokio::test]
    async fn rejection_surfaces() {
        let url = spawn_relay(Store::new(true)).await;
        let keys = Keys::generate();
        let mut ev = build_record(&keys, &build_payload(vec![], 600, ""), &Policy::Plain, "addr").unwrap();
        ev.content.push(' ');
        let err = submit(&ev, &opts(vec![url])).await.unwrap_err();
        assert!(matches!(err, Ncc05Error::Rejected(msg) if msg.contains("invalid:")));
    }

    #[tokio::test]
    async fn relay_list_is_published() {
        let store = Store::new(true);
        let url = spawn_relay(store.clone()).await;
        let keys = Keys::generate();
        let list = RelayList::from_urls(["wss://a.example", "wss://b.example"]);
        let id = publish_relay_list(&keys, &list, &opts(vec![url])).await.unwrap();
        let stored = store.query(&Filter::new().author(keys.public_key()).kind(RELAY_LIST_KIND));
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].id, id);
        assert_eq!(RelayList::from_event(&stored[0]).unwrap(), list);
    }
}
