//! Nostr event model, signing and verification.

use std::time::{SystemTime, UNIX_EPOCH};

use secp256k1::{
    schnorr::Signature, Keypair, Message, PublicKey, Secp256k1, SecretKey, XOnlyPublicKey,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::Ncc05Error;

/// Kind of the replaceable directory record.
pub const DIRECTORY_KIND: u32 = 30058;
/// Kind of the relay list record.
pub const RELAY_LIST_KIND: u32 = 10002;
/// Tag carrying the replaceable-event discriminator.
pub const IDENTIFIER_TAG: &str = "d";

/// Wrapper for a Nostr tag expressed as an array of strings.
///
/// The first element names the tag and the following elements hold data,
/// e.g. `["d", "addr"]` or `["r", "wss://relay.example", "read"]`. Tags are
/// kept verbatim so unknown tags survive a round trip through the relay.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Tag(pub Vec<String>);

impl Tag {
    pub fn new<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Tag(fields.into_iter().map(Into::into).collect())
    }

    /// Tag name, e.g. `d`.
    pub fn name(&self) -> Option<&str> {
        self.0.first().map(String::as_str)
    }

    /// First value after the name.
    pub fn value(&self) -> Option<&str> {
        self.0.get(1).map(String::as_str)
    }
}

/// Signed event as it travels between publisher, relay and resolver.
///
/// ```json
/// {
///   "id": "aa11",
///   "pubkey": "79be...",
///   "kind": 30058,
///   "created_at": 1700000000,
///   "tags": [["d", "addr"]],
///   "content": "AgF0...",
///   "sig": "deadbeef"
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Event {
    /// Event identifier (hex of SHA-256 hash).
    pub id: String,
    /// Author public key (x-only, hex).
    pub pubkey: String,
    /// Kind number, e.g. `30058` or `10002`.
    pub kind: u32,
    /// Unix timestamp of creation.
    pub created_at: u64,
    /// Arbitrary tags such as `d` (identifier) or `r` (relay).
    pub tags: Vec<Tag>,
    /// Opaque content; for directory records one of the envelope encodings.
    pub content: String,
    /// Schnorr signature over the event hash.
    pub sig: String,
}

impl Event {
    /// Replaceable kinds keep at most one live event per address.
    pub fn is_replaceable(&self) -> bool {
        is_replaceable_kind(self.kind)
    }

    /// Value of the first `d` tag, if any.
    pub fn identifier(&self) -> Option<&str> {
        self.tags
            .iter()
            .find(|t| t.name() == Some(IDENTIFIER_TAG))
            .and_then(Tag::value)
    }

    /// Discriminator used for compaction; a missing `d` tag counts as `""`.
    pub fn discriminator(&self) -> &str {
        self.identifier().unwrap_or_default()
    }
}

pub fn is_replaceable_kind(kind: u32) -> bool {
    (30000..40000).contains(&kind) || kind == RELAY_LIST_KIND
}

/// Unsigned event fields prior to signing.
#[derive(Debug, Clone)]
pub struct EventDraft {
    pub kind: u32,
    pub created_at: u64,
    pub tags: Vec<Tag>,
    pub content: String,
}

impl EventDraft {
    /// Draft stamped with the current time.
    pub fn new(kind: u32, tags: Vec<Tag>, content: impl Into<String>) -> Self {
        Self {
            kind,
            created_at: unix_now(),
            tags,
            content: content.into(),
        }
    }
}

/// Seconds since the Unix epoch.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

/// Something able to turn drafts into signed events.
pub trait Signer {
    /// Hex x-only public key of the signing identity.
    fn public_key(&self) -> String;
    fn sign(&self, draft: EventDraft) -> Result<Event, Ncc05Error>;
}

/// A secp256k1 identity.
#[derive(Clone)]
pub struct Keys {
    keypair: Keypair,
}

impl Keys {
    pub fn generate() -> Self {
        let secp = Secp256k1::new();
        Self {
            keypair: Keypair::new(&secp, &mut rand::thread_rng()),
        }
    }

    /// Parse a hex-encoded 32 byte secret key.
    pub fn parse(secret_hex: &str) -> Result<Self, Ncc05Error> {
        let bytes = hex::decode(secret_hex.trim())
            .map_err(|e| Ncc05Error::Key(format!("secret key is not hex: {e}")))?;
        let secp = Secp256k1::new();
        let keypair = Keypair::from_seckey_slice(&secp, &bytes)
            .map_err(|e| Ncc05Error::Key(format!("invalid secret key: {e}")))?;
        Ok(Self { keypair })
    }

    pub fn secret_key(&self) -> SecretKey {
        self.keypair.secret_key()
    }

    pub fn secret_hex(&self) -> String {
        hex::encode(self.keypair.secret_bytes())
    }
}

impl std::fmt::Debug for Keys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keys")
            .field("public_key", &self.public_key())
            .finish_non_exhaustive()
    }
}

impl Signer for Keys {
    fn public_key(&self) -> String {
        hex::encode(self.keypair.x_only_public_key().0.serialize())
    }

    fn sign(&self, draft: EventDraft) -> Result<Event, Ncc05Error> {
        let mut ev = Event {
            id: String::new(),
            pubkey: self.public_key(),
            kind: draft.kind,
            created_at: draft.created_at,
            tags: draft.tags,
            content: draft.content,
            sig: String::new(),
        };
        let hash = event_hash(&ev)?;
        let msg = Message::from_digest_slice(&hash)
            .map_err(|e| Ncc05Error::Key(format!("event hash: {e}")))?;
        let secp = Secp256k1::signing_only();
        let sig = secp.sign_schnorr_no_aux_rand(&msg, &self.keypair);
        ev.id = hex::encode(hash);
        ev.sig = hex::encode(sig.as_ref());
        Ok(ev)
    }
}

/// Parse a hex x-only public key into a full (even parity) point.
pub fn parse_public_key(pubkey_hex: &str) -> Result<PublicKey, Ncc05Error> {
    let bytes = hex::decode(pubkey_hex.trim())
        .map_err(|e| Ncc05Error::Key(format!("public key is not hex: {e}")))?;
    let xonly = XOnlyPublicKey::from_slice(&bytes)
        .map_err(|e| Ncc05Error::Key(format!("invalid public key: {e}")))?;
    Ok(xonly.public_key(secp256k1::Parity::Even))
}

/// Recompute the Nostr event hash from its fields.
pub fn event_hash(ev: &Event) -> Result<[u8; 32], Ncc05Error> {
    let arr = serde_json::json!([0, ev.pubkey, ev.created_at, ev.kind, ev.tags, ev.content]);
    let data = serde_json::to_vec(&arr)
        .map_err(|e| Ncc05Error::Key(format!("serializing event: {e}")))?;
    Ok(Sha256::digest(&data).into())
}

/// Verify an event's ID and Schnorr signature.
pub fn verify_event(ev: &Event) -> anyhow::Result<()> {
    let hash = event_hash(ev)?;
    if hex::encode(hash) != ev.id {
        anyhow::bail!("id mismatch");
    }
    let sig = Signature::from_slice(&hex::decode(&ev.sig)?)?;
    let pk = XOnlyPublicKey::from_slice(&hex::decode(&ev.pubkey)?)?;
    let secp = Secp256k1::verification_only();
    let msg = Message::from_digest_slice(&hash)?;
    secp.verify_schnorr(&sig, &msg, &pk)?;
    Ok(())
}
