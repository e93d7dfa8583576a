//! NIP-44 v2 payload encryption
//!
//! Conversation keys come from HKDF-extract over the ECDH x coordinate with
//! the fixed salt `"nip44-v2"`; per-message keys from HKDF-expand keyed by a
//! random 32-byte nonce. The payload is `0x02 || nonce || ciphertext || mac`
//! in padded base64. All decrypt failures collapse into the single opaque
//! [`Error::DecryptionFailed`] so the cipher cannot be used as an oracle.

use crate::crypto;
use crate::error::{Error, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::RngCore;

/// Version byte of the v2 payload format.
const VERSION: u8 = 0x02;
/// HKDF salt fixed by NIP-44 v2 (8 ASCII bytes).
const CONVERSATION_SALT: &[u8] = b"nip44-v2";
/// Smallest decoded payload: version + nonce + 34-byte frame + mac.
const MIN_PAYLOAD_LEN: usize = 99;
/// Largest decoded payload: version + nonce + (2 + 65536)-byte frame + mac.
const MAX_PAYLOAD_LEN: usize = 65_603;
/// Plaintext length bounds imposed by the length-prefixed frame.
const MIN_PLAINTEXT_LEN: usize = 1;
const MAX_PLAINTEXT_LEN: usize = 65_535;

/// Per-message keys expanded from the conversation key and nonce.
struct MessageKeys {
    chacha_key: [u8; 32],
    chacha_nonce: [u8; 12],
    hmac_key: [u8; 32],
}

/// Derive the symmetric conversation key for a key pair.
///
/// `conversation_key(a.priv, b.pub) == conversation_key(b.priv, a.pub)`.
pub fn conversation_key(secret: &[u8; 32], peer_public: &[u8; 32]) -> Result<[u8; 32]> {
    let shared_x = crypto::ecdh_shared_x(secret, peer_public)?;
    Ok(crypto::hkdf_extract_sha256(CONVERSATION_SALT, &shared_x))
}

fn message_keys(conversation_key: &[u8; 32], nonce: &[u8; 32]) -> Result<MessageKeys> {
    let mut okm = [0u8; 76];
    crypto::hkdf_expand_sha256(conversation_key, nonce, &mut okm)?;
    let mut keys = MessageKeys {
        chacha_key: [0u8; 32],
        chacha_nonce: [0u8; 12],
        hmac_key: [0u8; 32],
    };
    keys.chacha_key.copy_from_slice(&okm[0..32]);
    keys.chacha_nonce.copy_from_slice(&okm[32..44]);
    keys.hmac_key.copy_from_slice(&okm[44..76]);
    Ok(keys)
}

/// Padded frame length for a plaintext: next power of two, floored at 32,
/// quantized to chunks above 256.
fn calc_padded_len(unpadded_len: usize) -> usize {
    if unpadded_len <= 32 {
        return 32;
    }
    let next_power = 1usize << (usize::BITS - (unpadded_len - 1).leading_zeros());
    let chunk = if next_power <= 256 { 32 } else { next_power / 8 };
    chunk * (((unpadded_len - 1) / chunk) + 1)
}

/// Frame a plaintext: big-endian u16 length prefix, zero padding.
fn pad(plaintext: &[u8]) -> Vec<u8> {
    let padded_len = calc_padded_len(plaintext.len());
    let mut framed = Vec::with_capacity(2 + padded_len);
    framed.extend_from_slice(&(plaintext.len() as u16).to_be_bytes());
    framed.extend_from_slice(plaintext);
    framed.resize(2 + padded_len, 0);
    framed
}

/// Strip the frame; every inconsistency is a decryption failure.
fn unpad(framed: &[u8]) -> Result<Vec<u8>> {
    if framed.len() < 2 {
        return Err(Error::DecryptionFailed);
    }
    let unpadded_len = u16::from_be_bytes([framed[0], framed[1]]) as usize;
    if unpadded_len < MIN_PLAINTEXT_LEN
        || 2 + unpadded_len > framed.len()
        || framed.len() != 2 + calc_padded_len(unpadded_len)
    {
        return Err(Error::DecryptionFailed);
    }
    Ok(framed[2..2 + unpadded_len].to_vec())
}

/// Encrypt a plaintext under a conversation key with a fresh random nonce.
pub fn encrypt(plaintext: &str, conversation_key: &[u8; 32]) -> Result<String> {
    let mut nonce = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut nonce);
    encrypt_with_nonce(plaintext, conversation_key, &nonce)
}

/// Deterministic encryption core; the nonce is a parameter so test vectors
/// can pin it down.
pub fn encrypt_with_nonce(
    plaintext: &str,
    conversation_key: &[u8; 32],
    nonce: &[u8; 32],
) -> Result<String> {
    let bytes = plaintext.as_bytes();
    if bytes.len() < MIN_PLAINTEXT_LEN || bytes.len() > MAX_PLAINTEXT_LEN {
        return Err(Error::invalid_event(format!(
            "plaintext length {} outside 1..=65535",
            bytes.len()
        )));
    }
    let keys = message_keys(conversation_key, nonce)?;
    let mut ciphertext = pad(bytes);
    crypto::chacha20_apply(&keys.chacha_key, &keys.chacha_nonce, &mut ciphertext);
    let mac = crypto::hmac_sha256(&keys.hmac_key, &[nonce, &ciphertext]);

    let mut payload = Vec::with_capacity(1 + 32 + ciphertext.len() + 32);
    payload.push(VERSION);
    payload.extend_from_slice(nonce);
    payload.extend_from_slice(&ciphertext);
    payload.extend_from_slice(&mac);
    Ok(BASE64.encode(payload))
}

/// Decrypt a base64 payload under a conversation key.
///
/// The MAC is verified in constant time before any decryption work; the
/// error never distinguishes which check failed.
pub fn decrypt(payload: &str, conversation_key: &[u8; 32]) -> Result<String> {
    let data = BASE64
        .decode(payload)
        .map_err(|_| Error::DecryptionFailed)?;
    if data.len() < MIN_PAYLOAD_LEN || data.len() > MAX_PAYLOAD_LEN {
        return Err(Error::DecryptionFailed);
    }
    if data[0] != VERSION {
        return Err(Error::DecryptionFailed);
    }
    let nonce: [u8; 32] = data[1..33].try_into().map_err(|_| Error::DecryptionFailed)?;
    let ciphertext = &data[33..data.len() - 32];
    let mac = &data[data.len() - 32..];

    let keys = message_keys(conversation_key, &nonce)?;
    if !crypto::hmac_sha256_verify(&keys.hmac_key, &[&nonce, ciphertext], mac) {
        return Err(Error::DecryptionFailed);
    }

    let mut framed = ciphertext.to_vec();
    crypto::chacha20_apply(&keys.chacha_key, &keys.chacha_nonce, &mut framed);
    let plaintext = unpad(&framed)?;
    String::from_utf8(plaintext).map_err(|_| Error::DecryptionFailed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Keys;

    fn pair() -> (Keys, Keys) {
        (Keys::generate(), Keys::generate())
    }

    #[test]
    fn test_conversation_key_symmetry() {
        let (alice, bob) = pair();
        let ab = conversation_key(&alice.secret_bytes(), &bob.public_key_bytes()).unwrap();
        let ba = conversation_key(&bob.secret_bytes(), &alice.public_key_bytes()).unwrap();
        assert_eq!(ab, ba);
    }

    #[test]
    fn test_encrypt_decrypt_round_trip() {
        let (alice, bob) = pair();
        let key_a = conversation_key(&alice.secret_bytes(), &bob.public_key_bytes()).unwrap();
        let key_b = conversation_key(&bob.secret_bytes(), &alice.public_key_bytes()).unwrap();

        let long = "long ".repeat(500);
        for msg in ["x", "hello world", long.as_str()] {
            let payload = encrypt(msg, &key_a).unwrap();
            assert_eq!(decrypt(&payload, &key_b).unwrap(), msg);
        }
    }

    #[test]
    fn test_nonce_randomness_changes_ciphertext() {
        let (alice, bob) = pair();
        let key = conversation_key(&alice.secret_bytes(), &bob.public_key_bytes()).unwrap();
        let one = encrypt("same message", &key).unwrap();
        let two = encrypt("same message", &key).unwrap();
        assert_ne!(one, two);
    }

    #[test]
    fn test_payload_layout() {
        let key = [7u8; 32];
        let nonce = [9u8; 32];
        let payload = encrypt_with_nonce("a", &key, &nonce).unwrap();
        let decoded = BASE64.decode(&payload).unwrap();
        assert_eq!(decoded.len(), MIN_PAYLOAD_LEN);
        assert_eq!(decoded[0], VERSION);
        assert_eq!(&decoded[1..33], &nonce);
    }

    #[test]
    fn test_single_byte_flip_fails() {
        let key = [7u8; 32];
        let payload = encrypt("integrity matters", &key).unwrap();
        let mut bytes = BASE64.decode(&payload).unwrap();
        for i in 0..bytes.len() {
            bytes[i] ^= 0x01;
            let tampered = BASE64.encode(&bytes);
            assert!(matches!(
                decrypt(&tampered, &key),
                Err(Error::DecryptionFailed)
            ));
            bytes[i] ^= 0x01;
        }
    }

    #[test]
    fn test_wrong_key_fails_opaquely() {
        let (alice, bob) = pair();
        let charlie = Keys::generate();
        let key = conversation_key(&alice.secret_bytes(), &bob.public_key_bytes()).unwrap();
        let wrong =
            conversation_key(&charlie.secret_bytes(), &alice.public_key_bytes()).unwrap();
        let payload = encrypt("for bob only", &key).unwrap();
        assert!(matches!(
            decrypt(&payload, &wrong),
            Err(Error::DecryptionFailed)
        ));
    }

    #[test]
    fn test_plaintext_length_bounds() {
        let key = [1u8; 32];
        assert!(encrypt("", &key).is_err());
        assert!(encrypt(&"a".repeat(65_536), &key).is_err());
        assert!(encrypt(&"a".repeat(65_535), &key).is_ok());
    }

    #[test]
    fn test_version_and_length_rejected() {
        let key = [1u8; 32];
        let payload = encrypt("ok", &key).unwrap();
        let mut bytes = BASE64.decode(&payload).unwrap();
        bytes[0] = 0x01;
        assert!(decrypt(&BASE64.encode(&bytes), &key).is_err());
        assert!(decrypt(&BASE64.encode([VERSION; 10]), &key).is_err());
        assert!(decrypt("not base64 !!!", &key).is_err());
    }

    #[test]
    fn test_padded_len_schedule() {
        assert_eq!(calc_padded_len(1), 32);
        assert_eq!(calc_padded_len(32), 32);
        assert_eq!(calc_padded_len(33), 64);
        assert_eq!(calc_padded_len(37), 64);
        assert_eq!(calc_padded_len(255), 256);
        assert_eq!(calc_padded_len(257), 320);
        assert_eq!(calc_padded_len(1000), 1024);
    }
}
