//! Structural event validation by kind
//!
//! These checks are what the client applies to anything a relay hands us
//! before the event reaches decryption or display. Failures carry a
//! human-readable reason; they never panic.

use crate::error::{Error, Result};
use crate::geohash;
use crate::types::{
    Event, KIND_CHAT_MESSAGE, KIND_ENCRYPTED_DM, KIND_EPHEMERAL_LOCATION, KIND_GIFT_WRAP,
    KIND_METADATA, KIND_SEAL, KIND_TEXT_NOTE,
};

fn is_lower_hex(s: &str, len: usize) -> bool {
    s.len() == len
        && s.bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

/// Validate the fields every signed event must carry.
fn validate_structure(event: &Event) -> Result<()> {
    if !is_lower_hex(&event.id, 64) {
        return Err(Error::invalid_event("id must be 64 lowercase hex chars"));
    }
    if !is_lower_hex(&event.pubkey, 64) {
        return Err(Error::invalid_event("pubkey must be 64 lowercase hex chars"));
    }
    if !is_lower_hex(&event.sig, 128) {
        return Err(Error::invalid_event("sig must be 128 lowercase hex chars"));
    }
    Ok(())
}

fn validate_metadata(event: &Event) -> Result<()> {
    let body: serde_json::Value = serde_json::from_str(&event.content)
        .map_err(|_| Error::invalid_event("metadata content is not JSON"))?;
    let Some(object) = body.as_object() else {
        return Err(Error::invalid_event("metadata content is not a JSON object"));
    };
    for field in ["name", "about", "picture", "nip05", "lud16"] {
        if let Some(value) = object.get(field) {
            if !value.is_string() {
                return Err(Error::invalid_event(format!(
                    "metadata field {field} must be a string"
                )));
            }
        }
    }
    Ok(())
}

/// Validate an event against its kind's structural rules.
pub fn validate_event(event: &Event) -> Result<()> {
    validate_structure(event)?;
    match event.kind {
        KIND_METADATA => validate_metadata(event),
        KIND_TEXT_NOTE => {
            if event.content.is_empty() {
                return Err(Error::invalid_event("text note content is empty"));
            }
            Ok(())
        }
        KIND_ENCRYPTED_DM => {
            if event.tag_count("p") != 1 {
                return Err(Error::invalid_event("dm must have exactly one p tag"));
            }
            if !event.content.contains("?iv=") {
                return Err(Error::invalid_event("dm content missing ?iv= marker"));
            }
            Ok(())
        }
        KIND_SEAL => {
            if !event.tags.is_empty() {
                return Err(Error::invalid_event("seal tags must be empty"));
            }
            Ok(())
        }
        KIND_CHAT_MESSAGE => {
            if event.tag_count("p") == 0 {
                return Err(Error::invalid_event("chat message needs a p tag"));
            }
            Ok(())
        }
        KIND_GIFT_WRAP => {
            if event.tag_count("p") != 1 {
                return Err(Error::invalid_event(
                    "gift wrap must have exactly one p tag",
                ));
            }
            if event.content.is_empty() {
                return Err(Error::invalid_event("gift wrap content is empty"));
            }
            Ok(())
        }
        KIND_EPHEMERAL_LOCATION => {
            let mut count = 0;
            for value in event.tag_values("g") {
                if !geohash::is_valid(value) {
                    return Err(Error::invalid_event(format!("invalid geohash: {value}")));
                }
                count += 1;
            }
            if count == 0 {
                return Err(Error::invalid_event("location event needs a g tag"));
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_event(kind: u16) -> Event {
        Event {
            id: "0".repeat(64),
            pubkey: "1".repeat(64),
            created_at: 1_700_000_000,
            kind,
            tags: Vec::new(),
            content: "content".into(),
            sig: "2".repeat(128),
        }
    }

    #[test]
    fn test_structure_checks() {
        let mut event = base_event(KIND_TEXT_NOTE);
        validate_event(&event).unwrap();

        event.id = "short".into();
        assert!(validate_event(&event).is_err());

        event.id = "0".repeat(64);
        event.pubkey = "A".repeat(64);
        assert!(validate_event(&event).is_err());
    }

    #[test]
    fn test_text_note_content() {
        let mut event = base_event(KIND_TEXT_NOTE);
        event.content = String::new();
        assert!(validate_event(&event).is_err());
    }

    #[test]
    fn test_metadata_shape() {
        let mut event = base_event(KIND_METADATA);
        event.content = r#"{"name":"alice","about":"chats"}"#.into();
        validate_event(&event).unwrap();

        event.content = r#"{"name":42}"#.into();
        assert!(validate_event(&event).is_err());

        event.content = "not json".into();
        assert!(validate_event(&event).is_err());
    }

    #[test]
    fn test_legacy_dm_shape() {
        let mut event = base_event(KIND_ENCRYPTED_DM);
        event.tags = vec![vec!["p".into(), "3".repeat(64)]];
        event.content = "Y2lwaGVy?iv=aXY=".into();
        validate_event(&event).unwrap();

        event.content = "no marker".into();
        assert!(validate_event(&event).is_err());

        event.content = "Y2lwaGVy?iv=aXY=".into();
        event.tags.push(vec!["p".into(), "4".repeat(64)]);
        assert!(validate_event(&event).is_err());
    }

    #[test]
    fn test_seal_and_gift_wrap_tags() {
        let mut seal = base_event(KIND_SEAL);
        validate_event(&seal).unwrap();
        seal.tags = vec![vec!["p".into(), "x".into()]];
        assert!(validate_event(&seal).is_err());

        let mut wrap = base_event(KIND_GIFT_WRAP);
        assert!(validate_event(&wrap).is_err());
        wrap.tags = vec![vec!["p".into(), "5".repeat(64)]];
        validate_event(&wrap).unwrap();
        wrap.content = String::new();
        assert!(validate_event(&wrap).is_err());
    }

    #[test]
    fn test_chat_message_needs_recipient() {
        let mut event = base_event(KIND_CHAT_MESSAGE);
        assert!(validate_event(&event).is_err());
        event.tags = vec![vec!["p".into(), "6".repeat(64)]];
        validate_event(&event).unwrap();
    }

    #[test]
    fn test_location_geohashes() {
        let mut event = base_event(KIND_EPHEMERAL_LOCATION);
        assert!(validate_event(&event).is_err());

        event.tags = vec![vec!["g".into(), "dr5regw7".into()]];
        validate_event(&event).unwrap();

        // 'a' is outside the geohash alphabet.
        event.tags = vec![vec!["g".into(), "dr5rega".into()]];
        assert!(validate_event(&event).is_err());
    }
}
