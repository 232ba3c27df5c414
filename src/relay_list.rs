//! Relay list record (kind 10002).
//!
//! Each relay is an `r` tag with an optional `read` or `write` marker; no
//! marker means both.

use tracing::debug;
use url::Url;

use crate::event::{Event, EventDraft, Tag, RELAY_LIST_KIND};

const RELAY_TAG: &str = "r";

/// Maximum number of declared read relays a resolver will query.
pub const MAX_READ_RELAYS: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Marker {
    Read,
    Write,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayEntry {
    pub url: String,
    pub marker: Option<Marker>,
}

impl RelayEntry {
    pub fn can_read(&self) -> bool {
        self.marker != Some(Marker::Write)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayList {
    pub entries: Vec<RelayEntry>,
}

impl RelayList {
    /// Undecorated list: every relay is used for reading and writing.
    pub fn from_urls<I, S>(urls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let entries = urls
            .into_iter()
            .filter_map(|u| normalize(u.as_ref()))
            .map(|url| RelayEntry { url, marker: None })
            .collect();
        Self { entries }
    }

    /// Parse `r` tags; entries with unusable URLs are skipped.
    pub fn from_event(ev: &Event) -> Option<Self> {
        if ev.kind != RELAY_LIST_KIND {
            return None;
        }
        let entries = ev
            .tags
            .iter()
            .filter(|t| t.name() == Some(RELAY_TAG))
            .filter_map(|t| {
                let url = normalize(t.value()?)?;
                let marker = match t.0.get(2).map(String::as_str) {
                    Some("read") => Some(Marker::Read),
                    Some("write") => Some(Marker::Write),
                    _ => None,
                };
                Some(RelayEntry { url, marker })
            })
            .collect();
        Some(Self { entries })
    }

    pub fn to_draft(&self) -> EventDraft {
        let tags = self
            .entries
            .iter()
            .map(|e| {
                let mut fields = vec![RELAY_TAG.to_string(), e.url.clone()];
                match e.marker {
                    Some(Marker::Read) => fields.push("read".into()),
                    Some(Marker::Write) => fields.push("write".into()),
                    None => {}
                }
                Tag(fields)
            })
            .collect();
        EventDraft::new(RELAY_LIST_KIND, tags, "")
    }

    /// Read-capable relays in declaration order, at most `cap`, no duplicates.
    pub fn read_relays(&self, cap: usize) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for e in self.entries.iter().filter(|e| e.can_read()) {
            if out.len() == cap {
                break;
            }
            if !out.contains(&e.url) {
                out.push(e.url.clone());
            }
        }
        out
    }
}

/// Accept only ws/wss URLs; trims whitespace and a trailing slash.
fn normalize(raw: &str) -> Option<String> {
    let raw = raw.trim();
    match Url::parse(raw) {
        Ok(url) if matches!(url.scheme(), "ws" | "wss") && url.host_str().is_some() => {
            Some(raw.trim_end_matches('/').to_string())
        }
        Ok(_) | Err(_) => {
            debug!("ignoring relay url {raw:?}");
            None
        }
    }
}
