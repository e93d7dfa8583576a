//! NIP-17/59 gift-wrapped direct messages
//!
//! Three layers: a kind-14 rumor (unsigned, carries the plaintext and
//! recipient tags), a kind-13 seal (signed by the sender, content is the
//! NIP-44-encrypted rumor, tags empty), and a kind-1059 gift wrap (signed
//! by a throwaway key, content is the encrypted seal, a single `p` tag
//! routes it). Seal and wrap timestamps are randomized into the past two
//! days so relay logs don't leak send times.

use crate::crypto::{self, Keys};
use crate::error::{Error, Result};
use crate::nip44;
use crate::types::{
    Event, Rumor, UnsignedEvent, KIND_CHAT_MESSAGE, KIND_GIFT_WRAP, KIND_SEAL,
};
use rand::Rng;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::warn;

/// Timestamp randomization window (two days of seconds).
pub const TIMESTAMP_WINDOW_SECS: u64 = 172_800;

/// Reference to the message being replied to, carried as an `e` tag.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReplyRef {
    /// Id of the rumor being replied to
    pub event_id: String,
    /// Relay hint, may be empty
    pub relay_url: String,
}

/// Fully unwrapped direct message.
#[derive(Clone, Debug)]
pub struct DecryptedMessage {
    /// The outer kind-1059 event as received
    pub gift_wrap: Event,
    /// The intermediate kind-13 seal
    pub seal: Event,
    /// The inner rumor carrying the plaintext
    pub rumor: Rumor,
    /// Real author (rumor pubkey, verified against the seal)
    pub sender_pubkey: String,
    /// Message plaintext
    pub content: String,
    /// Real send time (rumor `created_at`)
    pub timestamp: u64,
    /// Sorted participants joined by `:`
    pub conversation_id: String,
}

/// Aggregate view of one conversation.
#[derive(Clone, Debug)]
pub struct ConversationSummary {
    pub id: String,
    pub participants: Vec<String>,
    /// Subject of the most recent message that carried one
    pub title: Option<String>,
    pub last_message_at: u64,
    pub message_count: usize,
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Uniformly random timestamp within the past two days.
fn random_past_timestamp(now: u64) -> u64 {
    now.saturating_sub(rand::thread_rng().gen_range(0..TIMESTAMP_WINDOW_SECS))
}

// =============================================================================
// WRAPPING
// =============================================================================

/// Build the kind-14 rumor shared by every wrap of one send.
fn build_rumor(
    sender: &Keys,
    recipients: &[[u8; 32]],
    message: &str,
    subject: Option<&str>,
    reply_to: Option<&ReplyRef>,
) -> Result<Rumor> {
    let mut tags: Vec<Vec<String>> = recipients
        .iter()
        .map(|pk| vec!["p".to_string(), hex::encode(pk)])
        .collect();
    if let Some(subject) = subject {
        tags.push(vec!["subject".to_string(), subject.to_string()]);
    }
    if let Some(reply) = reply_to {
        tags.push(vec![
            "e".to_string(),
            reply.event_id.clone(),
            reply.relay_url.clone(),
            "reply".to_string(),
        ]);
    }
    UnsignedEvent {
        pubkey: sender.public_key_hex(),
        created_at: unix_now(),
        kind: KIND_CHAT_MESSAGE,
        tags,
        content: message.to_string(),
    }
    .into_rumor()
}

/// Seal a rumor for one recipient: kind 13, empty tags, randomized
/// timestamp, signed by the real sender.
fn seal_rumor(rumor: &Rumor, sender: &Keys, recipient: &[u8; 32]) -> Result<Event> {
    let conversation = nip44::conversation_key(&sender.secret_bytes(), recipient)?;
    let rumor_json = serde_json::to_string(rumor)?;
    let content = nip44::encrypt(&rumor_json, &conversation)?;
    crypto::sign_event(
        UnsignedEvent {
            pubkey: sender.public_key_hex(),
            created_at: random_past_timestamp(unix_now()),
            kind: KIND_SEAL,
            tags: Vec::new(),
            content,
        },
        sender,
    )
}

/// Wrap a seal for one recipient under a fresh ephemeral key.
fn wrap_seal(seal: &Event, recipient: &[u8; 32]) -> Result<Event> {
    let ephemeral = Keys::generate();
    let conversation = nip44::conversation_key(&ephemeral.secret_bytes(), recipient)?;
    let seal_json = serde_json::to_string(seal)?;
    let content = nip44::encrypt(&seal_json, &conversation)?;
    crypto::sign_event(
        UnsignedEvent {
            pubkey: ephemeral.public_key_hex(),
            created_at: random_past_timestamp(unix_now()),
            kind: KIND_GIFT_WRAP,
            tags: vec![vec!["p".to_string(), hex::encode(recipient)]],
            content,
        },
        &ephemeral,
    )
}

/// Gift-wrap a direct message for a single recipient.
pub fn wrap(
    sender: &Keys,
    recipient: &[u8; 32],
    message: &str,
    subject: Option<&str>,
    reply_to: Option<&ReplyRef>,
) -> Result<Event> {
    let rumor = build_rumor(sender, std::slice::from_ref(recipient), message, subject, reply_to)?;
    let seal = seal_rumor(&rumor, sender, recipient)?;
    wrap_seal(&seal, recipient)
}

/// Gift-wrap a message for a group: one wrap per recipient, in recipient
/// order, plus a final self-addressed wrap so the sender's other devices
/// can sync the conversation.
pub fn wrap_many(
    sender: &Keys,
    recipients: &[[u8; 32]],
    message: &str,
    subject: Option<&str>,
    reply_to: Option<&ReplyRef>,
) -> Result<Vec<Event>> {
    if recipients.is_empty() {
        return Err(Error::NoRecipients);
    }
    let rumor = build_rumor(sender, recipients, message, subject, reply_to)?;

    let mut wraps = Vec::with_capacity(recipients.len() + 1);
    for recipient in recipients {
        let seal = seal_rumor(&rumor, sender, recipient)?;
        wraps.push(wrap_seal(&seal, recipient)?);
    }
    let self_pubkey = sender.public_key_bytes();
    let seal = seal_rumor(&rumor, sender, &self_pubkey)?;
    wraps.push(wrap_seal(&seal, &self_pubkey)?);
    Ok(wraps)
}

// =============================================================================
// UNWRAPPING
// =============================================================================

/// Unwrap a gift wrap addressed to `recipient`.
///
/// Decrypts the two NIP-44 layers, checks kinds at each step, verifies the
/// seal's signature, and rejects seals whose inner rumor claims a different
/// author than the seal's signer.
pub fn unwrap(gift_wrap: &Event, recipient: &Keys) -> Result<DecryptedMessage> {
    if gift_wrap.kind != KIND_GIFT_WRAP {
        return Err(Error::UnexpectedKind {
            expected: KIND_GIFT_WRAP,
            got: gift_wrap.kind,
        });
    }

    let wrap_pubkey = crate::nip19::decode_hex32(&gift_wrap.pubkey)
        .map_err(|_| Error::invalid_event("malformed gift wrap pubkey"))?;
    let outer = nip44::conversation_key(&recipient.secret_bytes(), &wrap_pubkey)?;
    let seal_json = nip44::decrypt(&gift_wrap.content, &outer)?;
    let seal: Event = serde_json::from_str(&seal_json)
        .map_err(|_| Error::invalid_event("seal is not a valid event"))?;

    if seal.kind != KIND_SEAL {
        return Err(Error::UnexpectedKind {
            expected: KIND_SEAL,
            got: seal.kind,
        });
    }
    crypto::verify_event(&seal)?;

    let seal_pubkey = crate::nip19::decode_hex32(&seal.pubkey)
        .map_err(|_| Error::invalid_event("malformed seal pubkey"))?;
    let inner = nip44::conversation_key(&recipient.secret_bytes(), &seal_pubkey)?;
    let rumor_json = nip44::decrypt(&seal.content, &inner)?;
    let rumor: Rumor = serde_json::from_str(&rumor_json)
        .map_err(|_| Error::invalid_event("rumor is not a valid event"))?;

    if rumor.pubkey != seal.pubkey {
        return Err(Error::Impersonation);
    }

    Ok(DecryptedMessage {
        sender_pubkey: rumor.pubkey.clone(),
        content: rumor.content.clone(),
        timestamp: rumor.created_at,
        conversation_id: rumor.conversation_id(),
        gift_wrap: gift_wrap.clone(),
        seal,
        rumor,
    })
}

/// Unwrap a batch, swallowing (and logging) per-event failures.
///
/// Results are sorted by the real send time ascending; ties keep input
/// order. Callers deduplicate by `rumor.id` when the same message arrived
/// via several relays.
pub fn unwrap_many(gift_wraps: &[Event], recipient: &Keys) -> Vec<DecryptedMessage> {
    let mut messages: Vec<DecryptedMessage> = Vec::with_capacity(gift_wraps.len());
    for event in gift_wraps {
        match unwrap(event, recipient) {
            Ok(message) => messages.push(message),
            Err(err) => {
                warn!(gift_wrap = %event.id, %err, "failed to unwrap gift wrap");
            }
        }
    }
    messages.sort_by_key(|m| m.timestamp);
    messages
}

/// Drop messages whose rumor id was already seen, keeping first occurrence.
pub fn dedup_by_rumor_id(messages: Vec<DecryptedMessage>) -> Vec<DecryptedMessage> {
    let mut seen = std::collections::HashSet::new();
    messages
        .into_iter()
        .filter(|m| seen.insert(m.rumor.id.clone()))
        .collect()
}

/// Group messages into per-conversation aggregates, most recent first.
pub fn group_conversations(messages: &[DecryptedMessage]) -> Vec<ConversationSummary> {
    let mut groups: std::collections::HashMap<String, ConversationSummary> =
        std::collections::HashMap::new();
    for message in messages {
        let entry = groups
            .entry(message.conversation_id.clone())
            .or_insert_with(|| ConversationSummary {
                id: message.conversation_id.clone(),
                participants: message.rumor.participants(),
                title: None,
                last_message_at: 0,
                message_count: 0,
            });
        entry.message_count += 1;
        if message.timestamp >= entry.last_message_at {
            entry.last_message_at = message.timestamp;
            if let Some(subject) = message.rumor.subject() {
                entry.title = Some(subject.to_string());
            }
        }
    }
    let mut summaries: Vec<ConversationSummary> = groups.into_values().collect();
    summaries.sort_by(|a, b| b.last_message_at.cmp(&a.last_message_at));
    summaries
}
