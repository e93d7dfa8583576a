//! Cryptographic primitives for nightjar
//!
//! secp256k1 key handling, BIP-340 Schnorr signatures, x-only ECDH, and the
//! hash/KDF/stream building blocks the NIP-44 cipher is assembled from.
//! Event-level signing lives here too, on top of [`crate::canonical`].

use crate::error::{Error, Result};
use crate::types::{Event, UnsignedEvent};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use secp256k1::ecdh::shared_secret_point;
use secp256k1::schnorr::Signature;
use secp256k1::{Keypair, Message, PublicKey, Secp256k1, SecretKey, XOnlyPublicKey};
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

// =============================================================================
// KEYS
// =============================================================================

/// A secp256k1 identity: secret key plus its x-only public key.
#[derive(Clone)]
pub struct Keys {
    secret_key: SecretKey,
    keypair: Keypair,
    public_key: XOnlyPublicKey,
}

impl Keys {
    /// Generate a new random identity.
    pub fn generate() -> Self {
        let secp = Secp256k1::new();
        let (secret_key, _) = secp.generate_keypair(&mut rand::thread_rng());
        let keypair = Keypair::from_secret_key(&secp, &secret_key);
        let (public_key, _) = XOnlyPublicKey::from_keypair(&keypair);
        Self {
            secret_key,
            keypair,
            public_key,
        }
    }

    /// Build from 32 secret bytes. Zero and values at or above the curve
    /// order are rejected.
    pub fn from_secret_bytes(bytes: &[u8; 32]) -> Result<Self> {
        let secret_key =
            SecretKey::from_slice(bytes).map_err(|e| Error::InvalidKey(e.to_string()))?;
        let secp = Secp256k1::new();
        let keypair = Keypair::from_secret_key(&secp, &secret_key);
        let (public_key, _) = XOnlyPublicKey::from_keypair(&keypair);
        Ok(Self {
            secret_key,
            keypair,
            public_key,
        })
    }

    /// Build from a 64-char lowercase hex secret key.
    pub fn from_secret_hex(hex_key: &str) -> Result<Self> {
        let bytes = crate::nip19::decode_hex32(hex_key)?;
        Self::from_secret_bytes(&bytes)
    }

    pub fn secret_bytes(&self) -> [u8; 32] {
        self.secret_key.secret_bytes()
    }

    /// 32-byte x-only public key.
    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.public_key.serialize()
    }

    /// Lowercase hex x-only public key.
    pub fn public_key_hex(&self) -> String {
        hex::encode(self.public_key_bytes())
    }

    /// Schnorr-sign a 32-byte digest.
    pub fn sign_digest(&self, digest: &[u8; 32]) -> [u8; 64] {
        let secp = Secp256k1::new();
        let message = Message::from_digest(*digest);
        secp.sign_schnorr(&message, &self.keypair).serialize()
    }

    /// `npub1…` form of the public key, for display and logs.
    pub fn npub(&self) -> Result<String> {
        crate::nip19::encode_npub(&self.public_key_bytes())
    }

    /// `nsec1…` form of the secret key. Handle with care.
    pub fn nsec(&self) -> Result<String> {
        crate::nip19::encode_nsec(&self.secret_bytes())
    }
}

impl std::fmt::Debug for Keys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print the secret key.
        f.debug_struct("Keys")
            .field("public_key", &self.public_key_hex())
            .finish()
    }
}

/// Derive the x-only public key for 32 secret-key bytes.
pub fn derive_public_key(secret: &[u8; 32]) -> Result<[u8; 32]> {
    Ok(Keys::from_secret_bytes(secret)?.public_key_bytes())
}

// =============================================================================
// SCHNORR
// =============================================================================

/// Verify a BIP-340 Schnorr signature over a 32-byte digest.
pub fn schnorr_verify(public_key: &[u8; 32], digest: &[u8; 32], signature: &[u8; 64]) -> bool {
    let secp = Secp256k1::verification_only();
    let Ok(xonly) = XOnlyPublicKey::from_slice(public_key) else {
        return false;
    };
    let Ok(sig) = Signature::from_slice(signature) else {
        return false;
    };
    let message = Message::from_digest(*digest);
    secp.verify_schnorr(&sig, &message, &xonly).is_ok()
}

// =============================================================================
// ECDH
// =============================================================================

/// Lift an x-only key to a full curve point.
///
/// The 32-byte input carries no y parity, so try the even-y compressed
/// encoding first and fall back to odd-y; an x that lies on the curve
/// always admits the even lift, anything else is off-curve.
fn lift_x(peer: &[u8; 32]) -> Result<PublicKey> {
    let mut compressed = [0u8; 33];
    compressed[1..].copy_from_slice(peer);
    compressed[0] = 0x02;
    if let Ok(point) = PublicKey::from_slice(&compressed) {
        return Ok(point);
    }
    compressed[0] = 0x03;
    PublicKey::from_slice(&compressed).map_err(|_| Error::InvalidPoint)
}

/// ECDH shared-point x coordinate between our secret key and a peer's
/// x-only public key. This is the unhashed coordinate NIP-44 feeds into
/// HKDF-extract.
pub fn ecdh_shared_x(secret: &[u8; 32], peer: &[u8; 32]) -> Result<[u8; 32]> {
    let secret_key =
        SecretKey::from_slice(secret).map_err(|e| Error::InvalidKey(e.to_string()))?;
    let point = lift_x(peer)?;
    let shared = shared_secret_point(&point, &secret_key);
    let mut x = [0u8; 32];
    x.copy_from_slice(&shared[..32]);
    Ok(x)
}

// =============================================================================
// HASH / KDF / STREAM
// =============================================================================

/// SHA-256 digest.
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut out = [0u8; 32];
    out.copy_from_slice(&Sha256::digest(data));
    out
}

/// HKDF-SHA256 extract: returns the 32-byte PRK.
pub fn hkdf_extract_sha256(salt: &[u8], ikm: &[u8]) -> [u8; 32] {
    let (prk, _) = Hkdf::<Sha256>::extract(Some(salt), ikm);
    let mut out = [0u8; 32];
    out.copy_from_slice(&prk);
    out
}

/// HKDF-SHA256 expand from a 32-byte PRK into `okm`.
pub fn hkdf_expand_sha256(prk: &[u8; 32], info: &[u8], okm: &mut [u8]) -> Result<()> {
    let hk = Hkdf::<Sha256>::from_prk(prk)
        .map_err(|_| Error::InvalidKey("invalid hkdf prk length".into()))?;
    hk.expand(info, okm)
        .map_err(|_| Error::InvalidKey("invalid hkdf output length".into()))
}

/// Apply the ChaCha20 (IETF, 12-byte nonce) keystream in place.
pub fn chacha20_apply(key: &[u8; 32], nonce: &[u8; 12], data: &mut [u8]) {
    use chacha20::cipher::{KeyIvInit, StreamCipher};
    let mut cipher = chacha20::ChaCha20::new(key.into(), nonce.into());
    cipher.apply_keystream(data);
}

/// HMAC-SHA256 over concatenated parts.
pub fn hmac_sha256(key: &[u8; 32], parts: &[&[u8]]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key).expect("hmac accepts any key length");
    for part in parts {
        mac.update(part);
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&mac.finalize().into_bytes());
    out
}

/// Constant-time HMAC-SHA256 verification.
pub fn hmac_sha256_verify(key: &[u8; 32], parts: &[&[u8]], tag: &[u8]) -> bool {
    let mut mac = HmacSha256::new_from_slice(key).expect("hmac accepts any key length");
    for part in parts {
        mac.update(part);
    }
    mac.verify_slice(tag).is_ok()
}

// =============================================================================
// EVENT SIGNING
// =============================================================================

/// Hash and sign an unsigned event. The event's `pubkey` must match the
/// signing identity; a mismatched signature would never verify anyway.
pub fn sign_event(unsigned: UnsignedEvent, keys: &Keys) -> Result<Event> {
    if unsigned.pubkey != keys.public_key_hex() {
        return Err(Error::InvalidKey(format!(
            "event pubkey {} does not match signing key {}",
            unsigned.pubkey,
            keys.public_key_hex()
        )));
    }
    let id = unsigned.compute_id()?;
    let digest = crate::nip19::decode_hex32(&id)?;
    let sig = keys.sign_digest(&digest);
    Ok(Event {
        id,
        pubkey: unsigned.pubkey,
        created_at: unsigned.created_at,
        kind: unsigned.kind,
        tags: unsigned.tags,
        content: unsigned.content,
        sig: hex::encode(sig),
    })
}

/// Verify an event's id and signature.
pub fn verify_event(event: &Event) -> Result<()> {
    let computed = event.compute_id()?;
    if computed != event.id {
        return Err(Error::invalid_event(format!(
            "id mismatch: computed {computed}, event carries {}",
            event.id
        )));
    }
    let pubkey = crate::nip19::decode_hex32(&event.pubkey)
        .map_err(|_| Error::invalid_event("malformed pubkey"))?;
    let digest = crate::nip19::decode_hex32(&event.id)
        .map_err(|_| Error::invalid_event("malformed id"))?;
    let sig: [u8; 64] = crate::nip19::decode_hex(&event.sig)?
        .try_into()
        .map_err(|_| Error::invalid_event("malformed signature"))?;
    if !schnorr_verify(&pubkey, &digest, &sig) {
        return Err(Error::invalid_event("signature verification failed"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keygen_and_derive() {
        let keys = Keys::generate();
        let derived = derive_public_key(&keys.secret_bytes()).unwrap();
        assert_eq!(derived, keys.public_key_bytes());
    }

    #[test]
    fn test_bech32_forms_round_trip() {
        let keys = Keys::generate();
        let npub = keys.npub().unwrap();
        assert_eq!(
            crate::nip19::decode_npub(&npub).unwrap(),
            keys.public_key_bytes()
        );
        let nsec = keys.nsec().unwrap();
        let restored = Keys::from_secret_bytes(&crate::nip19::decode_nsec(&nsec).unwrap())
            .unwrap();
        assert_eq!(restored.public_key_hex(), keys.public_key_hex());
    }

    #[test]
    fn test_rejects_invalid_secret_keys() {
        assert!(Keys::from_secret_bytes(&[0u8; 32]).is_err());
        // Curve order is below 2^256 - 2^128, so all-ones is out of range.
        assert!(Keys::from_secret_bytes(&[0xff; 32]).is_err());
    }

    #[test]
    fn test_sign_verify_digest() {
        let keys = Keys::generate();
        let digest = sha256(b"payload");
        let sig = keys.sign_digest(&digest);
        assert!(schnorr_verify(&keys.public_key_bytes(), &digest, &sig));

        let other = Keys::generate();
        assert!(!schnorr_verify(&other.public_key_bytes(), &digest, &sig));
    }

    #[test]
    fn test_ecdh_is_symmetric() {
        let alice = Keys::generate();
        let bob = Keys::generate();
        let ab = ecdh_shared_x(&alice.secret_bytes(), &bob.public_key_bytes()).unwrap();
        let ba = ecdh_shared_x(&bob.secret_bytes(), &alice.public_key_bytes()).unwrap();
        assert_eq!(ab, ba);
    }

    #[test]
    fn test_ecdh_rejects_off_curve_x() {
        let keys = Keys::generate();
        // 2^256 - 1 exceeds the field modulus, so no point carries this x.
        let bad = [0xffu8; 32];
        assert!(matches!(
            ecdh_shared_x(&keys.secret_bytes(), &bad),
            Err(Error::InvalidPoint)
        ));
    }

    #[test]
    fn test_hkdf_extract_expand_layout() {
        let prk = hkdf_extract_sha256(b"nip44-v2", &[7u8; 32]);
        let mut okm = [0u8; 76];
        hkdf_expand_sha256(&prk, &[1u8; 32], &mut okm).unwrap();
        // Deterministic for fixed inputs.
        let mut okm2 = [0u8; 76];
        hkdf_expand_sha256(&prk, &[1u8; 32], &mut okm2).unwrap();
        assert_eq!(okm, okm2);
    }

    #[test]
    fn test_chacha_round_trip() {
        let key = [9u8; 32];
        let nonce = [3u8; 12];
        let mut data = b"attack at dawn".to_vec();
        chacha20_apply(&key, &nonce, &mut data);
        assert_ne!(data.as_slice(), b"attack at dawn");
        chacha20_apply(&key, &nonce, &mut data);
        assert_eq!(data.as_slice(), b"attack at dawn");
    }

    #[test]
    fn test_hmac_verify_rejects_tamper() {
        let key = [5u8; 32];
        let tag = hmac_sha256(&key, &[b"aad", b"body"]);
        assert!(hmac_sha256_verify(&key, &[b"aad", b"body"], &tag));
        assert!(!hmac_sha256_verify(&key, &[b"aad", b"tampered"], &tag));
    }

    #[test]
    fn test_event_sign_verify_round_trip() {
        let keys = Keys::generate();
        let unsigned =
            UnsignedEvent::text_note(keys.public_key_hex(), "hello", 1_700_000_000);
        let event = sign_event(unsigned.clone(), &keys).unwrap();
        verify_event(&event).unwrap();
        assert_eq!(event.to_unsigned(), unsigned);
    }

    #[test]
    fn test_sign_rejects_foreign_pubkey() {
        let keys = Keys::generate();
        let other = Keys::generate();
        let unsigned = UnsignedEvent::text_note(other.public_key_hex(), "hello", 0);
        assert!(matches!(
            sign_event(unsigned, &keys),
            Err(Error::InvalidKey(_))
        ));
    }
}
