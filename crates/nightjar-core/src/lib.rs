//! nightjar core library
//!
//! Deterministic protocol core of the nightjar messaging client: the
//! NIP-01 event model, canonical encoding, secp256k1 crypto, the NIP-44 v2
//! cipher, and the NIP-17/59 gift-wrap pipeline. No I/O lives here; the
//! relay pool and persistence sit in `nightjar-net`.
//!
//! # Modules
//!
//! - [`types`]: events, kinds, filters
//! - [`canonical`]: canonical serialization and event ids
//! - [`validation`]: per-kind structural checks
//! - [`crypto`]: keys, Schnorr, ECDH, KDF/stream primitives
//! - [`nip44`]: payload encryption
//! - [`giftwrap`]: rumor / seal / gift wrap pipeline
//! - [`nip04`]: legacy encrypted DMs
//! - [`nip19`]: hex and bech32 identity encodings
//! - [`geohash`]: opaque location tag handling
//! - [`error`]: error types

pub mod canonical;
pub mod crypto;
pub mod error;
pub mod geohash;
pub mod giftwrap;
pub mod nip04;
pub mod nip19;
pub mod nip44;
pub mod types;
pub mod validation;

pub use error::{Error, Result};
pub use types::*;
