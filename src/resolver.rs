//! Locate and open the latest directory record of an identity.
//!
//! ```text
//! Idle -> [GossipLookup] -> Query -> SelectLatest -> Decode -> Done
//! ```
//!
//! Relays are queried concurrently. One deadline, set when `resolve` starts,
//! bounds the relay list lookup and the record query together.

use std::{collections::HashSet, time::Duration};

use futures_util::future::join_all;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::{
    client::RelayConnection,
    envelope::{self, DirectoryPayload},
    error::Ncc05Error,
    event::{parse_public_key, verify_event, Event, Keys, DIRECTORY_KIND, RELAY_LIST_KIND},
    message::Filter,
    relay_list::{RelayList, MAX_READ_RELAYS},
};

/// How many candidate records to ask each relay for.
const QUERY_LIMIT: usize = 10;

#[derive(Debug, Clone)]
pub struct ResolveOptions {
    /// Relays queried directly, or consulted for the relay list in gossip mode.
    pub bootstrap: Vec<String>,
    /// Look up the target's relay list first and query its read relays.
    pub gossip: bool,
    /// Bound on the whole resolve, gossip lookup included.
    pub timeout: Duration,
    pub socks_proxy: Option<String>,
}

impl Default for ResolveOptions {
    fn default() -> Self {
        Self {
            bootstrap: Vec::new(),
            gossip: false,
            timeout: Duration::from_secs(15),
            socks_proxy: None,
        }
    }
}

/// A decoded record and where it came from.
#[derive(Debug, Clone)]
pub struct Resolution {
    pub event: Event,
    pub payload: DirectoryPayload,
    /// Relays that were queried for the record.
    pub relays: Vec<String>,
}

/// Resolve `target`'s record under `identifier`.
///
/// `Ok(None)` means no relay holds a record. Errors are a malformed target, a
/// configuration or decode problem, or every relay failing to answer.
pub async fn resolve(
    keys: Option<&Keys>,
    target: &str,
    identifier: &str,
    opts: &ResolveOptions,
) -> Result<Option<Resolution>, Ncc05Error> {
    if opts.bootstrap.is_empty() {
        return Err(Ncc05Error::Configuration("no relays configured".into()));
    }
    let target = target.trim().to_lowercase();
    parse_public_key(&target)?;
    let target = target.as_str();
    let deadline = Instant::now() + opts.timeout;
    let relays = if opts.gossip {
        gossip_relays(target, opts, deadline).await
    } else {
        opts.bootstrap.clone()
    };

    let filter = Filter::new()
        .author(target)
        .kind(DIRECTORY_KIND)
        .identifier(identifier)
        .limit(QUERY_LIMIT);
    let candidates: Vec<Event> = query_relays(&relays, &filter, opts, deadline)
        .await?
        .into_iter()
        .filter(|ev| {
            ev.pubkey == target && ev.kind == DIRECTORY_KIND && ev.identifier() == Some(identifier)
        })
        .filter(signature_holds)
        .collect();

    let Some(event) = select_latest(candidates) else {
        info!(pubkey = target, identifier, "no record found");
        return Ok(None);
    };
    debug!(id = %event.id, created_at = event.created_at, "selected record");
    let payload = envelope::decode(&event.content, keys, &event.pubkey)?;
    Ok(Some(Resolution {
        event,
        payload,
        relays,
    }))
}

/// Read relays declared by `target`, or the bootstrap relays when it declares
/// none. The lookup gives up at `deadline`.
pub async fn gossip_relays(target: &str, opts: &ResolveOptions, deadline: Instant) -> Vec<String> {
    let filter = Filter::new().author(target).kind(RELAY_LIST_KIND).limit(1);
    let lists = match query_relays(&opts.bootstrap, &filter, opts, deadline).await {
        Ok(events) => events,
        Err(e) => {
            warn!("relay list lookup failed: {e}");
            Vec::new()
        }
    };
    let lists = lists
        .into_iter()
        .filter(|ev| ev.pubkey == target && ev.kind == RELAY_LIST_KIND)
        .filter(signature_holds)
        .collect();
    let declared = select_latest(lists)
        .and_then(|ev| RelayList::from_event(&ev))
        .map(|list| list.read_relays(MAX_READ_RELAYS))
        .unwrap_or_default();
    if declared.is_empty() {
        debug!(pubkey = target, "no relay list, using bootstrap relays");
        opts.bootstrap.clone()
    } else {
        info!(?declared, "using relays from relay list");
        declared
    }
}

fn signature_holds(ev: &Event) -> bool {
    match verify_event(ev) {
        Ok(()) => true,
        Err(e) => {
            warn!(id = %ev.id, kind = ev.kind, "discarding event with bad signature: {e}");
            false
        }
    }
}

/// Newest by `created_at`; ties go to the lexicographically smallest id.
pub fn select_latest(events: Vec<Event>) -> Option<Event> {
    events.into_iter().min_by(|a, b| {
        b.created_at
            .cmp(&a.created_at)
            .then_with(|| a.id.cmp(&b.id))
    })
}

/// Query every relay concurrently and merge the results by id.
///
/// Fails only if no relay answered at all.
async fn query_relays(
    relays: &[String],
    filter: &Filter,
    opts: &ResolveOptions,
    deadline: Instant,
) -> Result<Vec<Event>, Ncc05Error> {
    let subscription_id = format!("ncc05-{:08x}", rand::random::<u32>());
    let results = join_all(relays.iter().map(|relay| {
        query_one(
            relay,
            &subscription_id,
            filter.clone(),
            deadline,
            opts.timeout,
            opts.socks_proxy.as_deref(),
        )
    }))
    .await;

    let mut seen = HashSet::new();
    let mut events = Vec::new();
    let mut answered = false;
    let mut last_err = None;
    for (relay, result) in relays.iter().zip(results) {
        match result {
            Ok(batch) => {
                debug!(relay, count = batch.len(), "relay answered");
                answered = true;
                events.extend(batch.into_iter().filter(|ev| seen.insert(ev.id.clone())));
            }
            Err(e) => {
                warn!(relay, "query failed: {e}");
                last_err = Some(e);
            }
        }
    }
    match (answered, last_err) {
        (false, Some(e)) => Err(e),
        _ => Ok(events),
    }
}

async fn query_one(
    relay: &str,
    subscription_id: &str,
    filter: Filter,
    deadline: Instant,
    timeout: Duration,
    proxy: Option<&str>,
) -> Result<Vec<Event>, Ncc05Error> {
    let attempt = async {
        let mut conn = RelayConnection::connect(relay, proxy).await?;
        let events = conn.fetch(subscription_id, filter).await?;
        conn.close().await;
        Ok::<_, Ncc05Error>(events)
    };
    tokio::time::timeout_at(deadline, attempt)
        .await
        .map_err(|_| Ncc05Error::Timeout(timeout))?
}
