//! Canonical NIP-01 event encoding
//!
//! The hashed form of an event is a compact JSON array of exactly six
//! elements: `[0, pubkey, created_at, kind, tags, content]`. No whitespace,
//! integers in shortest-decimal form, standard JSON string escaping.
//! Implementations on other platforms MUST produce identical bytes.

use crate::error::Result;
use crate::types::{Event, KindClass, Rumor, UnsignedEvent};
use serde_json::json;
use sha2::{Digest, Sha256};

/// Serialize the canonical array form used for event-id hashing.
pub fn canonical_form(
    pubkey: &str,
    created_at: u64,
    kind: u16,
    tags: &[Vec<String>],
    content: &str,
) -> Result<String> {
    let value = json!([0, pubkey, created_at, kind, tags, content]);
    Ok(serde_json::to_string(&value)?)
}

/// Compute an event id: lowercase hex SHA-256 of the canonical form.
pub fn compute_event_id(
    pubkey: &str,
    created_at: u64,
    kind: u16,
    tags: &[Vec<String>],
    content: &str,
) -> Result<String> {
    let serialized = canonical_form(pubkey, created_at, kind, tags, content)?;
    let digest = Sha256::digest(serialized.as_bytes());
    Ok(hex::encode(digest))
}

impl UnsignedEvent {
    /// Canonical serialization of this event's fields.
    pub fn canonical_form(&self) -> Result<String> {
        canonical_form(
            &self.pubkey,
            self.created_at,
            self.kind,
            &self.tags,
            &self.content,
        )
    }

    /// Event id these fields hash to.
    pub fn compute_id(&self) -> Result<String> {
        compute_event_id(
            &self.pubkey,
            self.created_at,
            self.kind,
            &self.tags,
            &self.content,
        )
    }

    /// Promote to a rumor: id computed, never signed.
    pub fn into_rumor(self) -> Result<Rumor> {
        let id = self.compute_id()?;
        Ok(Rumor {
            id,
            pubkey: self.pubkey,
            created_at: self.created_at,
            kind: self.kind,
            tags: self.tags,
            content: self.content,
        })
    }
}

impl Event {
    /// Recompute this event's id from its fields.
    pub fn compute_id(&self) -> Result<String> {
        compute_event_id(
            &self.pubkey,
            self.created_at,
            self.kind,
            &self.tags,
            &self.content,
        )
    }

    /// Whether the stored id matches the canonical hash.
    pub fn id_matches(&self) -> bool {
        self.compute_id().map(|id| id == self.id).unwrap_or(false)
    }
}

impl Rumor {
    /// Recompute this rumor's id from its fields.
    pub fn compute_id(&self) -> Result<String> {
        compute_event_id(
            &self.pubkey,
            self.created_at,
            self.kind,
            &self.tags,
            &self.content,
        )
    }
}

/// Relay replacement key for an event.
///
/// Parameterized-replaceable kinds key on `kind:pubkey:d`, plain
/// replaceable kinds on `kind:pubkey`, everything else on the event id
/// (computed on the fly when the event carries none).
pub fn replaceable_address(event: &Event) -> Result<String> {
    match event.kind_class() {
        KindClass::ParamReplaceable => {
            let d = event.first_tag_value("d").unwrap_or("");
            Ok(format!("{}:{}:{}", event.kind, event.pubkey, d))
        }
        KindClass::Replaceable => Ok(format!("{}:{}", event.kind, event.pubkey)),
        _ => {
            if event.id.is_empty() {
                event.compute_id()
            } else {
                Ok(event.id.clone())
            }
        }
    }
}
