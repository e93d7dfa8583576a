//! Legacy NIP-04 encrypted direct messages
//!
//! Kept for interoperability with clients that never migrated to gift
//! wraps: AES-256-CBC over the raw ECDH x coordinate, content shaped
//! `base64(ciphertext)?iv=base64(iv)`, kind 4 with a single `p` tag.
//! New conversations always use the NIP-17 pipeline instead.

use crate::crypto::{self, Keys};
use crate::error::{Error, Result};
use crate::types::{UnsignedEvent, KIND_ENCRYPTED_DM};
use aes::cipher::block_padding::Pkcs7;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::RngCore;
use std::time::{SystemTime, UNIX_EPOCH};

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// Encrypt a NIP-04 content string. The shared key is the unhashed ECDH x
/// coordinate, as the legacy clients compute it.
pub fn encrypt(plaintext: &str, secret: &[u8; 32], peer_public: &[u8; 32]) -> Result<String> {
    let key = crypto::ecdh_shared_x(secret, peer_public)?;
    let mut iv = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut iv);
    let ciphertext = Aes256CbcEnc::new(&key.into(), &iv.into())
        .encrypt_padded_vec_mut::<Pkcs7>(plaintext.as_bytes());
    Ok(format!(
        "{}?iv={}",
        BASE64.encode(ciphertext),
        BASE64.encode(iv)
    ))
}

/// Decrypt a NIP-04 content string.
pub fn decrypt(content: &str, secret: &[u8; 32], peer_public: &[u8; 32]) -> Result<String> {
    let key = crypto::ecdh_shared_x(secret, peer_public)?;
    let (ciphertext_b64, iv_b64) = content
        .split_once("?iv=")
        .ok_or(Error::DecryptionFailed)?;
    let ciphertext = BASE64
        .decode(ciphertext_b64.trim())
        .map_err(|_| Error::DecryptionFailed)?;
    let iv: [u8; 16] = BASE64
        .decode(iv_b64.trim())
        .map_err(|_| Error::DecryptionFailed)?
        .try_into()
        .map_err(|_| Error::DecryptionFailed)?;
    let plaintext = Aes256CbcDec::new(&key.into(), &iv.into())
        .decrypt_padded_vec_mut::<Pkcs7>(&ciphertext)
        .map_err(|_| Error::DecryptionFailed)?;
    String::from_utf8(plaintext).map_err(|_| Error::DecryptionFailed)
}

/// Build and sign a kind-4 DM event addressed to `recipient`.
pub fn create_dm(sender: &Keys, recipient: &[u8; 32], plaintext: &str) -> Result<crate::types::Event> {
    let content = encrypt(plaintext, &sender.secret_bytes(), recipient)?;
    let created_at = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    crypto::sign_event(
        UnsignedEvent {
            pubkey: sender.public_key_hex(),
            created_at,
            kind: KIND_ENCRYPTED_DM,
            tags: vec![vec!["p".to_string(), hex::encode(recipient)]],
            content,
        },
        sender,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validation::validate_event;

    #[test]
    fn test_round_trip() {
        let alice = Keys::generate();
        let bob = Keys::generate();
        let content = encrypt(
            "legacy hello",
            &alice.secret_bytes(),
            &bob.public_key_bytes(),
        )
        .unwrap();
        assert!(content.contains("?iv="));

        let plaintext = decrypt(
            &content,
            &bob.secret_bytes(),
            &alice.public_key_bytes(),
        )
        .unwrap();
        assert_eq!(plaintext, "legacy hello");
    }

    #[test]
    fn test_wrong_key_fails() {
        let alice = Keys::generate();
        let bob = Keys::generate();
        let carol = Keys::generate();
        let content = encrypt("secret", &alice.secret_bytes(), &bob.public_key_bytes()).unwrap();
        assert!(decrypt(
            &content,
            &carol.secret_bytes(),
            &alice.public_key_bytes()
        )
        .is_err());
    }

    #[test]
    fn test_dm_event_shape() {
        let alice = Keys::generate();
        let bob = Keys::generate();
        let event = create_dm(&alice, &bob.public_key_bytes(), "hi").unwrap();
        assert_eq!(event.kind, KIND_ENCRYPTED_DM);
        validate_event(&event).unwrap();
    }

    #[test]
    fn test_malformed_content_rejected() {
        let alice = Keys::generate();
        let bob = Keys::generate();
        assert!(decrypt("no marker", &alice.secret_bytes(), &bob.public_key_bytes()).is_err());
        assert!(decrypt("x?iv=y", &alice.secret_bytes(), &bob.public_key_bytes()).is_err());
    }
}
