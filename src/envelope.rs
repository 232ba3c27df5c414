//! Directory payload and its three content encodings.
//!
//! * plain: the payload JSON as-is
//! * direct: NIP-44 ciphertext of the payload for one target key (self by default)
//! * group-wrapped: `{"ciphertext": .., "wraps": {pubkey: ..}}` where the
//!   payload is sealed under a throwaway session key and the session secret is
//!   sealed once per recipient
//!
//! Content whose first non-blank byte is `{` or `[` is treated as JSON and never
//! decrypted; this is how plain and group-wrapped records are told apart from
//! direct ciphertext (base64 never starts with either byte).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    error::{DecodeError, Ncc05Error},
    event::{parse_public_key, Keys, Signer},
    nip44,
};

/// Payload format version.
pub const PAYLOAD_VERSION: u32 = 1;

/// Preference ranks; lower is preferred.
pub const PRIORITY_PROVISIONED_ONION: u32 = 1;
pub const PRIORITY_ONION: u32 = 5;
pub const PRIORITY_IP: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Family {
    Ipv4,
    Ipv6,
    Onion,
}

/// One reachable address of the publisher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    /// Transport, always `tcp` today.
    #[serde(rename = "type")]
    pub transport: String,
    /// `host:port`, with IPv6 hosts in brackets.
    pub uri: String,
    pub priority: u32,
    pub family: Family,
}

impl Endpoint {
    pub fn tcp(uri: impl Into<String>, priority: u32, family: Family) -> Self {
        Self {
            transport: "tcp".into(),
            uri: uri.into(),
            priority,
            family,
        }
    }
}

/// The record a publisher advertises.
///
/// `ttl` is advisory for consumers and not enforced here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryPayload {
    pub v: u32,
    pub ttl: u64,
    pub updated_at: u64,
    pub endpoints: Vec<Endpoint>,
    #[serde(default)]
    pub notes: String,
}

/// Group-wrapped content shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupWrap {
    pub ciphertext: String,
    /// Recipient public key (hex) to that recipient's sealed session secret.
    pub wraps: BTreeMap<String, String>,
}

/// How a payload is sealed before publishing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Policy {
    Plain,
    /// Encrypt for one key; `None` encrypts to the publisher itself.
    Direct { target: Option<String> },
    /// Encrypt once, wrap the session secret for each recipient.
    GroupWrap { recipients: Vec<String> },
}

impl Default for Policy {
    fn default() -> Self {
        Policy::Direct { target: None }
    }
}

/// Classified content, before any decryption.
#[derive(Debug)]
pub enum Envelope {
    Plain(DirectoryPayload),
    Wrapped(GroupWrap),
    Direct(String),
}

/// Seal `payload` according to `policy` using the publisher's `keys`.
pub fn encode(payload: &DirectoryPayload, policy: &Policy, keys: &Keys) -> Result<String, Ncc05Error> {
    let json = serde_json::to_string(payload)
        .map_err(|e| Ncc05Error::Configuration(format!("serializing payload: {e}")))?;
    match policy {
        Policy::Plain => Ok(json),
        Policy::Direct { target } => {
            let target = target.clone().unwrap_or_else(|| keys.public_key());
            let pk = parse_public_key(&target)?;
            nip44::encrypt(&keys.secret_key(), &pk, &json).map_err(Ncc05Error::Encrypt)
        }
        Policy::GroupWrap { recipients } => {
            if recipients.is_empty() {
                return Err(Ncc05Error::Configuration(
                    "group wrap needs at least one recipient".into(),
                ));
            }
            let session = Keys::generate();
            let session_pk = parse_public_key(&session.public_key())?;
            let ciphertext = nip44::encrypt(&session.secret_key(), &session_pk, &json)
                .map_err(Ncc05Error::Encrypt)?;
            let session_secret = session.secret_hex();
            let mut wraps = BTreeMap::new();
            for recipient in recipients {
                let recipient = recipient.trim().to_lowercase();
                let pk = parse_public_key(&recipient)?;
                let wrapped = nip44::encrypt(&keys.secret_key(), &pk, &session_secret)
                    .map_err(Ncc05Error::Encrypt)?;
                wraps.insert(recipient, wrapped);
            }
            serde_json::to_string(&GroupWrap { ciphertext, wraps })
                .map_err(|e| Ncc05Error::Configuration(format!("serializing wrap: {e}")))
        }
    }
}

/// Sort content into one of the three encodings without decrypting anything.
pub fn classify(content: &str) -> Result<Envelope, DecodeError> {
    let trimmed = content.trim_start();
    if !(trimmed.starts_with('{') || trimmed.starts_with('[')) {
        return Ok(Envelope::Direct(content.to_string()));
    }
    let value: Value = serde_json::from_str(trimmed)?;
    let is_wrap = value
        .as_object()
        .map(|obj| obj.contains_key("ciphertext") && obj.contains_key("wraps"))
        .unwrap_or(false);
    if is_wrap {
        Ok(Envelope::Wrapped(serde_json::from_value(value)?))
    } else {
        Ok(Envelope::Plain(serde_json::from_value(value)?))
    }
}

/// Recover the payload from `content` published by `author`.
///
/// `keys` is the reader's own identity. Plain content needs none; anything
/// encrypted without keys fails with [`Ncc05Error::Configuration`].
pub fn decode(content: &str, keys: Option<&Keys>, author: &str) -> Result<DirectoryPayload, Ncc05Error> {
    match classify(content)? {
        Envelope::Plain(payload) => Ok(payload),
        Envelope::Wrapped(wrap) => Ok(unwrap_group(&wrap, require_keys(keys)?, author)?),
        Envelope::Direct(ciphertext) => {
            let keys = require_keys(keys)?;
            let author_pk = parse_author(author)?;
            let text = nip44::decrypt(&keys.secret_key(), &author_pk, &ciphertext)
                .map_err(DecodeError::from)?;
            // a direct seal may itself carry a group wrap
            match classify(&text)? {
                Envelope::Plain(payload) => Ok(payload),
                Envelope::Wrapped(wrap) => Ok(unwrap_group(&wrap, keys, author)?),
                Envelope::Direct(_) => Ok(serde_json::from_str(&text).map_err(DecodeError::from)?),
            }
        }
    }
}

fn require_keys(keys: Option<&Keys>) -> Result<&Keys, Ncc05Error> {
    keys.ok_or_else(|| Ncc05Error::Configuration("decryption requires a key".into()))
}

fn parse_author(author: &str) -> Result<secp256k1::PublicKey, DecodeError> {
    parse_public_key(author).map_err(|e| DecodeError::InvalidAuthor(e.to_string()))
}

fn unwrap_group(wrap: &GroupWrap, keys: &Keys, author: &str) -> Result<DirectoryPayload, DecodeError> {
    let own = keys.public_key();
    let sealed = wrap
        .wraps
        .get(&own)
        .ok_or_else(|| DecodeError::NotARecipient(own.clone()))?;
    let author_pk = parse_author(author)?;
    let session_secret = nip44::decrypt(&keys.secret_key(), &author_pk, sealed)?;
    let session =
        Keys::parse(&session_secret).map_err(|e| DecodeError::InvalidSessionKey(e.to_string()))?;
    let session_pk = parse_public_key(&session.public_key())
        .map_err(|e| DecodeError::InvalidSessionKey(e.to_string()))?;
    let text = nip44::decrypt(&session.secret_key(), &session_pk, &wrap.ciphertext)?;
    Ok(serde_json::from_str(&text)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nip44::CryptoError;

    fn payload() -> DirectoryPayload {
        DirectoryPayload {
            v: PAYLOAD_VERSION,
            ttl: 600,
            updated_at: 1_700_000_000,
            endpoints: vec![
                Endpoint::tcp("1.2.3.4:8080", PRIORITY_IP, Family::Ipv4),
                Endpoint::tcp("[2001:db8::1]:8080", PRIORITY_IP, Family::Ipv6),
                Endpoint::tcp("abc.onion:8080", PRIORITY_ONION, Family::Onion),
            ],
            notes: "NCC-05".into(),
        }
    }

    #[test]
    fn endpoint_wire_shape() {
        let ep = Endpoint::tcp("1.2.3.4:8080", PRIORITY_IP, Family::Ipv4);
        let v = serde_json::to_value(&ep).unwrap();
        assert_eq!(
            v,
            serde_json::json!({"type": "tcp", "uri": "1.2.3.4:8080", "priority": 10, "family": "ipv4"})
        );
    }

    #[test]
    fn plain_is_readable_without_keys() {
        let keys = Keys::generate();
        let content = encode(&payload(), &Policy::Plain, &keys).unwrap();
        assert!(content.starts_with('{'));
        assert_eq!(decode(&content, None, &keys.public_key()).unwrap(), payload());
    }

    #[test]
    fn plain_with_empty_endpoints_survives() {
        let keys = Keys::generate();
        let mut p = payload();
        p.endpoints.clear();
        p.notes.clear();
        for policy in [Policy::Plain, Policy::default()] {
            let content = encode(&p, &policy, &keys).unwrap();
            assert_eq!(decode(&content, Some(&keys), &keys.public_key()).unwrap(), p);
        }
    }

    #[test]
    fn missing_notes_defaults_to_empty() {
        let content = r#"{"v":1,"ttl":600,"updated_at":5,"endpoints":[]}"#;
        let p = decode(content, None, "").unwrap();
        assert_eq!(p.notes, "");
    }

    #[test]
    fn direct_to_self() {
        let keys = Keys::generate();
        let content = encode(&payload(), &Policy::default(), &keys).unwrap();
        assert!(matches!(classify(&content).unwrap(), Envelope::Direct(_)));
        assert_eq!(
            decode(&content, Some(&keys), &keys.public_key()).unwrap(),
            payload()
        );
    }

    #[test]
    fn direct_to_other_target() {
        let publisher = Keys::generate();
        let reader = Keys::generate();
        let content = encode(
            &payload(),
            &Policy::Direct {
                target: Some(reader.public_key()),
            },
            &publisher,
        )
        .unwrap();
        assert_eq!(
            decode(&content, Some(&reader), &publisher.public_key()).unwrap(),
            payload()
        );
        let outsider = Keys::generate();
        let err = decode(&content, Some(&outsider), &publisher.public_key()).unwrap_err();
        assert!(matches!(
            err,
            Ncc05Error::Decode(DecodeError::Crypto(CryptoError::Mac))
        ));
    }

    #[test]
    fn encrypted_without_keys_is_configuration_error() {
        let keys = Keys::generate();
        let content = encode(&payload(), &Policy::default(), &keys).unwrap();
        assert!(matches!(
            decode(&content, None, &keys.public_key()),
            Err(Ncc05Error::Configuration(_))
        ));
    }

    #[test]
    fn group_wrap_opens_for_each_recipient_only() {
        let publisher = Keys::generate();
        let a = Keys::generate();
        let b = Keys::generate();
        let c = Keys::generate();
        let policy = Policy::GroupWrap {
            recipients: vec![a.public_key(), b.public_key()],
        };
        let content = encode(&payload(), &policy, &publisher).unwrap();

        let wrap = match classify(&content).unwrap() {
            Envelope::Wrapped(w) => w,
            other => panic!("expected wrap, got {other:?}"),
        };
        assert_eq!(wrap.wraps.len(), 2);
        assert!(wrap.wraps.contains_key(&a.public_key()));
        assert!(wrap.wraps.contains_key(&b.public_key()));

        let author = publisher.public_key();
        assert_eq!(decode(&content, Some(&a), &author).unwrap(), payload());
        assert_eq!(decode(&content, Some(&b), &author).unwrap(), payload());
        assert!(matches!(
            decode(&content, Some(&c), &author),
            Err(Ncc05Error::Decode(DecodeError::NotARecipient(_)))
        ));
    }

    #[test]
    fn group_wrap_collapses_duplicate_recipients() {
        let publisher = Keys::generate();
        let a = Keys::generate();
        let policy = Policy::GroupWrap {
            recipients: vec![a.public_key(), a.public_key().to_uppercase()],
        };
        let content = encode(&payload(), &policy, &publisher).unwrap();
        let wrap: GroupWrap = serde_json::from_str(&content).unwrap();
        assert_eq!(wrap.wraps.len(), 1);
    }

    #[test]
    fn group_wrap_requires_recipients() {
        let keys = Keys::generate();
        let policy = Policy::GroupWrap { recipients: vec![] };
        assert!(matches!(
            encode(&payload(), &policy, &keys),
            Err(Ncc05Error::Configuration(_))
        ));
    }

    #[test]
    fn direct_seal_around_group_wrap_is_unwrapped() {
        let publisher = Keys::generate();
        let reader = Keys::generate();
        let wrapped = encode(
            &payload(),
            &Policy::GroupWrap {
                recipients: vec![reader.public_key()],
            },
            &publisher,
        )
        .unwrap();
        let reader_pk = parse_public_key(&reader.public_key()).unwrap();
        let outer = nip44::encrypt(&publisher.secret_key(), &reader_pk, &wrapped).unwrap();
        assert_eq!(
            decode(&outer, Some(&reader), &publisher.public_key()).unwrap(),
            payload()
        );
    }

    #[test]
    fn garbage_json_is_decode_error() {
        assert!(matches!(
            decode("{not json", None, ""),
            Err(Ncc05Error::Decode(DecodeError::Json(_)))
        ));
        assert!(matches!(
            decode(r#"{"hello": 1}"#, None, ""),
            Err(Ncc05Error::Decode(DecodeError::Json(_)))
        ));
    }
}
