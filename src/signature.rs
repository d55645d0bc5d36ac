//! Archive signatures — ed25519 over SHA-512 of signed byte ranges.
//!
//! Each SIGN chunk covers the byte range from the end of the previous SIGN
//! chunk (or the volume start) up to its own chunk header.  The body is
//! `algorithm u16 ∥ signature bytes`; algorithm 1 is ed25519.
//!
//! Verification aggregates over all SIGN chunks of a volume.  `Skipped`
//! counts as valid unless force-verify is in effect.
//!
//! Key files hold the 32-byte key as one line of hex.

use std::fs;
use std::path::Path;

use byteorder::{BigEndian, ByteOrder};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use sha2::{Digest, Sha512};

use crate::errors::{Error, Result};

/// Wire code of the only signature algorithm in this build.
pub const SIGNATURE_ALGORITHM_ED25519: u16 = 1;
/// ed25519 signature length.
pub const SIGNATURE_LEN: usize = 64;

// ── Aggregate state ──────────────────────────────────────────────────────────

/// Outcome of verifying all SIGN chunks of an archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureState {
    /// Every signature present and valid.
    Ok,
    /// At least one signature failed verification.
    Invalid,
    /// Verification was not performed (no signatures, or skip requested).
    Skipped,
    /// Signatures present but no public key was supplied.
    NoKey,
}

impl SignatureState {
    /// Combine per-chunk outcomes; `Invalid` dominates, then `NoKey`.
    pub fn merge(self, other: SignatureState) -> SignatureState {
        use SignatureState::*;
        match (self, other) {
            (Invalid, _) | (_, Invalid) => Invalid,
            (NoKey, _) | (_, NoKey) => NoKey,
            (Ok, _) | (_, Ok) => Ok,
            (Skipped, Skipped) => Skipped,
        }
    }

    /// `Skipped` is considered valid unless force-verify is set.
    pub fn is_acceptable(self, force_verify: bool) -> bool {
        match self {
            SignatureState::Ok => true,
            SignatureState::Skipped => !force_verify,
            SignatureState::Invalid | SignatureState::NoKey => false,
        }
    }
}

impl std::fmt::Display for SignatureState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SignatureState::Ok => "ok",
            SignatureState::Invalid => "invalid",
            SignatureState::Skipped => "skipped",
            SignatureState::NoKey => "no-key",
        };
        write!(f, "{s}")
    }
}

// ── Range hashing ────────────────────────────────────────────────────────────

/// SHA-512 accumulator over one signed byte range.
pub struct RangeHasher(Sha512);

impl RangeHasher {
    pub fn new() -> Self {
        Self(Sha512::new())
    }

    pub fn update(&mut self, bytes: &[u8]) {
        self.0.update(bytes);
    }

    pub fn finalize(self) -> [u8; 64] {
        self.0.finalize().into()
    }
}

impl Default for RangeHasher {
    fn default() -> Self {
        Self::new()
    }
}

// ── Sign / verify ────────────────────────────────────────────────────────────

/// SIGN chunk body for a range digest.
pub fn sign_chunk_body(key: &SigningKey, digest: &[u8; 64]) -> Vec<u8> {
    let sig = key.sign(digest);
    let mut body = Vec::with_capacity(2 + SIGNATURE_LEN);
    body.extend_from_slice(&SIGNATURE_ALGORITHM_ED25519.to_be_bytes());
    body.extend_from_slice(&sig.to_bytes());
    body
}

/// Verify one SIGN chunk body against a range digest.
pub fn verify_chunk_body(
    key: Option<&VerifyingKey>,
    digest: &[u8; 64],
    body: &[u8],
) -> Result<SignatureState> {
    if body.len() < 2 {
        return Err(Error::CorruptData("signature chunk too short".into()));
    }
    let algorithm = BigEndian::read_u16(&body[..2]);
    if algorithm != SIGNATURE_ALGORITHM_ED25519 {
        return Err(Error::FunctionNotSupported("signature algorithm"));
    }
    let raw: [u8; SIGNATURE_LEN] = body[2..]
        .try_into()
        .map_err(|_| Error::CorruptData("signature length".into()))?;
    let Some(key) = key else {
        return Ok(SignatureState::NoKey);
    };
    let sig = Signature::from_bytes(&raw);
    Ok(match key.verify(digest, &sig) {
        Ok(()) => SignatureState::Ok,
        Err(_) => SignatureState::Invalid,
    })
}

// ── Key files ────────────────────────────────────────────────────────────────

fn read_key_bytes(path: &Path) -> Result<[u8; 32]> {
    let text = fs::read_to_string(path)
        .map_err(|_| Error::FileNotFound(path.display().to_string()))?;
    let raw = hex::decode(text.trim())
        .map_err(|e| Error::CorruptData(format!("key file {}: {e}", path.display())))?;
    raw.as_slice()
        .try_into()
        .map_err(|_| Error::CorruptData(format!("key file {}: expected 32 bytes", path.display())))
}

pub fn load_signing_key(path: &Path) -> Result<SigningKey> {
    Ok(SigningKey::from_bytes(&read_key_bytes(path)?))
}

pub fn load_verifying_key(path: &Path) -> Result<VerifyingKey> {
    VerifyingKey::from_bytes(&read_key_bytes(path)?)
        .map_err(|_| Error::CorruptData(format!("invalid public key in {}", path.display())))
}

/// Fresh ed25519 keypair as (private-hex, public-hex) for key files.
pub fn generate_keypair_hex() -> (String, String) {
    let mut seed = [0u8; 32];
    rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut seed);
    let signing = SigningKey::from_bytes(&seed);
    let public = signing.verifying_key();
    (hex::encode(signing.to_bytes()), hex::encode(public.to_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn digest_of(bytes: &[u8]) -> [u8; 64] {
        let mut h = RangeHasher::new();
        h.update(bytes);
        h.finalize()
    }

    #[test]
    fn sign_verify_roundtrip() {
        let key = SigningKey::from_bytes(&[9u8; 32]);
        let digest = digest_of(b"signed range bytes");
        let body = sign_chunk_body(&key, &digest);
        let state = verify_chunk_body(Some(&key.verifying_key()), &digest, &body).unwrap();
        assert_eq!(state, SignatureState::Ok);
    }

    #[test]
    fn wrong_key_is_invalid_and_missing_key_is_no_key() {
        let key = SigningKey::from_bytes(&[9u8; 32]);
        let other = SigningKey::from_bytes(&[1u8; 32]);
        let digest = digest_of(b"range");
        let body = sign_chunk_body(&key, &digest);
        assert_eq!(
            verify_chunk_body(Some(&other.verifying_key()), &digest, &body).unwrap(),
            SignatureState::Invalid
        );
        assert_eq!(
            verify_chunk_body(None, &digest, &body).unwrap(),
            SignatureState::NoKey
        );
    }

    #[test]
    fn tampered_range_is_invalid() {
        let key = SigningKey::from_bytes(&[9u8; 32]);
        let body = sign_chunk_body(&key, &digest_of(b"original"));
        assert_eq!(
            verify_chunk_body(Some(&key.verifying_key()), &digest_of(b"tampered"), &body).unwrap(),
            SignatureState::Invalid
        );
    }

    #[test]
    fn merge_priority() {
        use SignatureState::*;
        assert_eq!(Ok.merge(Invalid), Invalid);
        assert_eq!(NoKey.merge(Ok), NoKey);
        assert_eq!(Skipped.merge(Ok), Ok);
        assert_eq!(Skipped.merge(Skipped), Skipped);
        assert!(Skipped.is_acceptable(false));
        assert!(!Skipped.is_acceptable(true));
    }
}
