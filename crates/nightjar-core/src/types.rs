//! Core protocol types for nightjar (NIP-01 event model)
//!
//! Events serialize to the exact JSON shape relays expect; field order in
//! the canonical hash form is fixed by [`crate::canonical`].

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// =============================================================================
// EVENT KINDS
// =============================================================================

/// Profile metadata (replaceable)
pub const KIND_METADATA: u16 = 0;
/// Plain text note
pub const KIND_TEXT_NOTE: u16 = 1;
/// Contact list (replaceable)
pub const KIND_CONTACTS: u16 = 3;
/// Legacy NIP-04 encrypted direct message
pub const KIND_ENCRYPTED_DM: u16 = 4;
/// NIP-59 seal wrapping an encrypted rumor
pub const KIND_SEAL: u16 = 13;
/// NIP-17 chat message rumor
pub const KIND_CHAT_MESSAGE: u16 = 14;
/// NIP-59 gift wrap
pub const KIND_GIFT_WRAP: u16 = 1059;
/// Ephemeral location broadcast carrying geohash tags
pub const KIND_EPHEMERAL_LOCATION: u16 = 20000;

/// Storage/replacement semantics a relay applies to a kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KindClass {
    /// Stored as-is
    Regular,
    /// Newest event per (kind, pubkey) wins
    Replaceable,
    /// Not stored by relays
    Ephemeral,
    /// Newest event per (kind, pubkey, d-tag) wins
    ParamReplaceable,
}

impl KindClass {
    /// Classify a kind per NIP-01 ranges. Kinds outside every special
    /// range (including the low kinds 1, 4, 13, 14) are regular.
    pub fn of(kind: u16) -> Self {
        match kind {
            0 | 3 => KindClass::Replaceable,
            10000..=19999 => KindClass::Replaceable,
            20000..=29999 => KindClass::Ephemeral,
            30000..=39999 => KindClass::ParamReplaceable,
            _ => KindClass::Regular,
        }
    }
}

// =============================================================================
// EVENTS
// =============================================================================

/// Signed wire event.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Event {
    /// 32-byte lowercase hex SHA-256 of the canonical serialization
    pub id: String,
    /// 32-byte lowercase hex x-only public key of the author
    pub pubkey: String,
    /// Unix seconds
    pub created_at: u64,
    /// Event kind
    pub kind: u16,
    /// Ordered tag list; inner order significant, duplicates permitted
    pub tags: Vec<Vec<String>>,
    /// Arbitrary UTF-8 payload
    pub content: String,
    /// 64-byte lowercase hex Schnorr signature over `id`
    pub sig: String,
}

/// Event fields prior to hashing and signing.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct UnsignedEvent {
    pub pubkey: String,
    pub created_at: u64,
    pub kind: u16,
    pub tags: Vec<Vec<String>>,
    pub content: String,
}

/// An unsigned event with a computed id. Rumors carry the real DM payload
/// inside a seal and are never signed; the missing `sig` is what makes a
/// leaked rumor deniable.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Rumor {
    pub id: String,
    pub pubkey: String,
    pub created_at: u64,
    pub kind: u16,
    pub tags: Vec<Vec<String>>,
    pub content: String,
}

impl Event {
    /// Strip the computed fields, recovering the pre-signing form.
    pub fn to_unsigned(&self) -> UnsignedEvent {
        UnsignedEvent {
            pubkey: self.pubkey.clone(),
            created_at: self.created_at,
            kind: self.kind,
            tags: self.tags.clone(),
            content: self.content.clone(),
        }
    }

    /// Values of every tag whose first element equals `name`.
    pub fn tag_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> {
        self.tags
            .iter()
            .filter(move |t| t.first().map(String::as_str) == Some(name))
            .filter_map(|t| t.get(1).map(String::as_str))
    }

    /// First value of the first tag named `name`, if any.
    pub fn first_tag_value<'a>(&'a self, name: &'a str) -> Option<&'a str> {
        self.tag_values(name).next()
    }

    /// Number of tags named `name`.
    pub fn tag_count(&self, name: &str) -> usize {
        self.tags
            .iter()
            .filter(|t| t.first().map(String::as_str) == Some(name))
            .count()
    }

    pub fn kind_class(&self) -> KindClass {
        KindClass::of(self.kind)
    }
}

impl UnsignedEvent {
    /// Convenience constructor for a plain text note.
    pub fn text_note(pubkey: impl Into<String>, content: impl Into<String>, created_at: u64) -> Self {
        Self {
            pubkey: pubkey.into(),
            created_at,
            kind: KIND_TEXT_NOTE,
            tags: Vec::new(),
            content: content.into(),
        }
    }

    /// Profile metadata event; `content` must be a JSON object body.
    pub fn metadata(pubkey: impl Into<String>, content: impl Into<String>, created_at: u64) -> Self {
        Self {
            pubkey: pubkey.into(),
            created_at,
            kind: KIND_METADATA,
            tags: Vec::new(),
            content: content.into(),
        }
    }

    /// Ephemeral location broadcast with pre-built geohash tags.
    pub fn ephemeral_location(
        pubkey: impl Into<String>,
        content: impl Into<String>,
        geohash_tags: Vec<Vec<String>>,
        created_at: u64,
    ) -> Self {
        Self {
            pubkey: pubkey.into(),
            created_at,
            kind: KIND_EPHEMERAL_LOCATION,
            tags: geohash_tags,
            content: content.into(),
        }
    }
}

impl Rumor {
    /// All conversation participants: the author plus every `p`-tagged key,
    /// deduplicated and sorted.
    pub fn participants(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::with_capacity(1 + self.tags.len());
        out.push(self.pubkey.clone());
        for tag in &self.tags {
            if tag.first().map(String::as_str) == Some("p") {
                if let Some(pk) = tag.get(1) {
                    out.push(pk.clone());
                }
            }
        }
        out.sort();
        out.dedup();
        out
    }

    /// Stable conversation identifier: sorted participants joined by `:`.
    pub fn conversation_id(&self) -> String {
        self.participants().join(":")
    }

    /// Subject tag value, if the rumor carries one.
    pub fn subject(&self) -> Option<&str> {
        self.tags
            .iter()
            .find(|t| t.first().map(String::as_str) == Some("subject"))
            .and_then(|t| t.get(1).map(String::as_str))
    }
}

// =============================================================================
// SUBSCRIPTION FILTERS
// =============================================================================

/// Subscription selector (NIP-01 REQ filter).
///
/// Single-letter tag filters are carried in `tags` with their `#`-prefixed
/// wire key (e.g. `"#p"`), which `serde(flatten)` maps directly to the
/// wire shape.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Filter {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ids: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authors: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kinds: Option<Vec<u16>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub since: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub until: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
    #[serde(flatten)]
    pub tags: BTreeMap<String, Vec<String>>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn kinds(mut self, kinds: impl IntoIterator<Item = u16>) -> Self {
        self.kinds = Some(kinds.into_iter().collect());
        self
    }

    pub fn authors(mut self, authors: impl IntoIterator<Item = String>) -> Self {
        self.authors = Some(authors.into_iter().collect());
        self
    }

    pub fn ids(mut self, ids: impl IntoIterator<Item = String>) -> Self {
        self.ids = Some(ids.into_iter().collect());
        self
    }

    pub fn since(mut self, since: u64) -> Self {
        self.since = Some(since);
        self
    }

    pub fn until(mut self, until: u64) -> Self {
        self.until = Some(until);
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Add a single-letter tag filter, e.g. `tag('p', [pk])`.
    pub fn tag(mut self, letter: char, values: impl IntoIterator<Item = String>) -> Self {
        self.tags
            .entry(format!("#{letter}"))
            .or_default()
            .extend(values);
        self
    }

    /// Whether `event` satisfies every populated constraint.
    pub fn matches(&self, event: &Event) -> bool {
        if let Some(ids) = &self.ids {
            if !ids.iter().any(|id| id == &event.id) {
                return false;
            }
        }
        if let Some(authors) = &self.authors {
            if !authors.iter().any(|a| a == &event.pubkey) {
                return false;
            }
        }
        if let Some(kinds) = &self.kinds {
            if !kinds.contains(&event.kind) {
                return false;
            }
        }
        if let Some(since) = self.since {
            if event.created_at < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if event.created_at > until {
                return false;
            }
        }
        for (key, accepted) in &self.tags {
            let Some(letter) = key.strip_prefix('#') else {
                continue;
            };
            let mut values = event.tag_values(letter);
            if !values.any(|v| accepted.iter().any(|a| a == v)) {
                return false;
            }
        }
        true
    }
}
