//! Identity encodings: lowercase hex and NIP-19 bech32 (`npub` / `nsec`)

use crate::error::{Error, Result};
use bech32::{Bech32, Hrp};

const HRP_NPUB: &str = "npub";
const HRP_NSEC: &str = "nsec";

/// Decode lowercase even-length hex. Uppercase digits are rejected: every
/// identifier on the wire is normalized lowercase.
pub fn decode_hex(s: &str) -> Result<Vec<u8>> {
    if s.len() % 2 != 0 {
        return Err(Error::InvalidEncoding("odd-length hex".into()));
    }
    if s.bytes().any(|b| b.is_ascii_uppercase()) {
        return Err(Error::InvalidEncoding("hex must be lowercase".into()));
    }
    hex::decode(s).map_err(|e| Error::InvalidEncoding(e.to_string()))
}

/// Decode exactly 32 bytes of lowercase hex.
pub fn decode_hex32(s: &str) -> Result<[u8; 32]> {
    decode_hex(s)?
        .try_into()
        .map_err(|_| Error::InvalidEncoding("expected 32 bytes of hex".into()))
}

fn encode_bech32(hrp: &str, data: &[u8; 32]) -> Result<String> {
    let hrp = Hrp::parse(hrp).map_err(|e| Error::InvalidEncoding(e.to_string()))?;
    bech32::encode::<Bech32>(hrp, data).map_err(|e| Error::InvalidEncoding(e.to_string()))
}

fn decode_bech32(expected_hrp: &str, s: &str) -> Result<[u8; 32]> {
    let (hrp, data) = bech32::decode(s).map_err(|e| Error::InvalidEncoding(e.to_string()))?;
    let expected = Hrp::parse(expected_hrp).map_err(|e| Error::InvalidEncoding(e.to_string()))?;
    if hrp != expected {
        return Err(Error::InvalidEncoding(format!(
            "expected {expected_hrp} prefix, got {hrp}"
        )));
    }
    data.try_into()
        .map_err(|_| Error::InvalidEncoding("expected 32 bytes of payload".into()))
}

/// Encode an x-only public key as `npub1…`.
pub fn encode_npub(public_key: &[u8; 32]) -> Result<String> {
    encode_bech32(HRP_NPUB, public_key)
}

/// Encode a secret key as `nsec1…`.
pub fn encode_nsec(secret_key: &[u8; 32]) -> Result<String> {
    encode_bech32(HRP_NSEC, secret_key)
}

/// Decode an `npub1…` string to the 32 public-key bytes.
pub fn decode_npub(s: &str) -> Result<[u8; 32]> {
    decode_bech32(HRP_NPUB, s)
}

/// Decode an `nsec1…` string to the 32 secret-key bytes.
pub fn decode_nsec(s: &str) -> Result<[u8; 32]> {
    decode_bech32(HRP_NSEC, s)
}

/// Accept a public key as either 64-char hex or `npub1…`.
pub fn public_key_from_str(s: &str) -> Result<[u8; 32]> {
    if s.starts_with(HRP_NPUB) {
        decode_npub(s)
    } else {
        decode_hex32(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_round_trip() {
        let bytes = [0xabu8; 32];
        let encoded = hex::encode(bytes);
        assert_eq!(decode_hex32(&encoded).unwrap(), bytes);
    }

    #[test]
    fn test_hex_rejects_uppercase_and_odd() {
        assert!(decode_hex("AB").is_err());
        assert!(decode_hex("abc").is_err());
        assert!(decode_hex("zz").is_err());
    }

    #[test]
    fn test_npub_round_trip() {
        let pk = [0x17u8; 32];
        let npub = encode_npub(&pk).unwrap();
        assert!(npub.starts_with("npub1"));
        assert_eq!(decode_npub(&npub).unwrap(), pk);
    }

    #[test]
    fn test_nsec_round_trip() {
        let sk = [0x42u8; 32];
        let nsec = encode_nsec(&sk).unwrap();
        assert!(nsec.starts_with("nsec1"));
        assert_eq!(decode_nsec(&nsec).unwrap(), sk);
    }

    #[test]
    fn test_hrp_mismatch_rejected() {
        let nsec = encode_nsec(&[1u8; 32]).unwrap();
        assert!(decode_npub(&nsec).is_err());
    }

    #[test]
    fn test_public_key_from_str_accepts_both() {
        let pk = [0x33u8; 32];
        assert_eq!(public_key_from_str(&hex::encode(pk)).unwrap(), pk);
        assert_eq!(
            public_key_from_str(&encode_npub(&pk).unwrap()).unwrap(),
            pk
        );
    }
}
