//! Symmetric crypt layer — algorithm table, key derivation, CTR ciphers.
//!
//! # Key material
//! Password mode derives a 64-byte session key with PBKDF2-HMAC-SHA512 over
//! the archive's 64-byte salt (SALT chunk), 100 000 iterations.  Public-key
//! mode generates a random session key and wraps it with RSA-OAEP-SHA256
//! into the KEY chunk.  Either way the session key lives in zeroized memory
//! and is wiped when the archive handle closes.
//!
//! # Cipher operation
//! All build-enabled algorithms run in counter mode, so encrypt and decrypt
//! are the same keystream XOR.  The 16-byte counter block is reset per entry
//! fragment to `archiveSalt[0..8] ∥ entrySequence u64 BE` and persisted in
//! the entry header's crypt-salt field; readers never re-derive it.
//!
//! Entry ciphertexts are zero-padded to the cipher block size.  Readers
//! unpad on close: the compressed stream terminates itself, and for
//! uncompressed payloads the plaintext is cut at the fragment size.
//!
//! # Wire codes (u16, frozen)
//! 0 none · 1 aes128-ctr · 2 aes256-ctr · 3 serpent256-ctr (reserved, not in
//! this build) · 4 twofish256-ctr · 5 camellia256-ctr

use cipher::{KeyIvInit, StreamCipher};
use hmac::Hmac;
use rand::RngCore;
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha512};
use zeroize::Zeroizing;

use crate::errors::{Error, Result};

/// Archive salt length (SALT chunk body).
pub const SALT_LEN: usize = 64;
/// Per-entry crypt-salt field length in the entry header.
pub const ENTRY_SALT_LEN: usize = 32;
/// Block length shared by every build-enabled cipher.
pub const CIPHER_BLOCK_LEN: usize = 16;
/// PBKDF2 iteration count, fixed by the format.
pub const KEY_DERIVE_ITERATIONS: u32 = 100_000;
/// Derived session-key length; algorithms take a prefix of it.
pub const SESSION_KEY_LEN: usize = 64;

type Aes128Ctr = ctr::Ctr128BE<aes::Aes128>;
type Aes256Ctr = ctr::Ctr128BE<aes::Aes256>;
type Twofish256Ctr = ctr::Ctr128BE<twofish::Twofish>;
type Camellia256Ctr = ctr::Ctr128BE<camellia::Camellia256>;

// ── Algorithm table ──────────────────────────────────────────────────────────

/// Build-enabled crypt algorithms.  The wire code space is frozen; membership
/// of this enum is what the build ships.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CryptAlgorithm {
    None,
    Aes128Ctr,
    Aes256Ctr,
    Twofish256Ctr,
    Camellia256Ctr,
}

impl CryptAlgorithm {
    pub fn wire_code(self) -> u16 {
        match self {
            CryptAlgorithm::None => 0,
            CryptAlgorithm::Aes128Ctr => 1,
            CryptAlgorithm::Aes256Ctr => 2,
            CryptAlgorithm::Twofish256Ctr => 4,
            CryptAlgorithm::Camellia256Ctr => 5,
        }
    }

    pub fn from_wire_code(code: u16) -> Result<Self> {
        match code {
            0 => Ok(CryptAlgorithm::None),
            1 => Ok(CryptAlgorithm::Aes128Ctr),
            2 => Ok(CryptAlgorithm::Aes256Ctr),
            3 => Err(Error::FunctionNotSupported("serpent256-ctr cipher")),
            4 => Ok(CryptAlgorithm::Twofish256Ctr),
            5 => Ok(CryptAlgorithm::Camellia256Ctr),
            _ => Err(Error::CorruptData(format!("unknown crypt algorithm code {code}"))),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            CryptAlgorithm::None => "none",
            CryptAlgorithm::Aes128Ctr => "aes128-ctr",
            CryptAlgorithm::Aes256Ctr => "aes256-ctr",
            CryptAlgorithm::Twofish256Ctr => "twofish256-ctr",
            CryptAlgorithm::Camellia256Ctr => "camellia256-ctr",
        }
    }

    pub fn from_name(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "none" => Some(CryptAlgorithm::None),
            "aes128-ctr" => Some(CryptAlgorithm::Aes128Ctr),
            "aes256-ctr" => Some(CryptAlgorithm::Aes256Ctr),
            "twofish256-ctr" => Some(CryptAlgorithm::Twofish256Ctr),
            "camellia256-ctr" => Some(CryptAlgorithm::Camellia256Ctr),
            _ => None,
        }
    }

    /// Key bytes consumed from the session key.
    pub fn key_len(self) -> usize {
        match self {
            CryptAlgorithm::None => 0,
            CryptAlgorithm::Aes128Ctr => 16,
            _ => 32,
        }
    }

    #[inline]
    pub fn is_none(self) -> bool {
        self == CryptAlgorithm::None
    }

    /// Ciphertext length for `n` plaintext bytes (zero-padded to block size).
    pub fn padded_len(self, n: u64) -> u64 {
        if self.is_none() {
            n
        } else {
            let b = CIPHER_BLOCK_LEN as u64;
            n.div_ceil(b) * b
        }
    }
}

// ── Session key ──────────────────────────────────────────────────────────────

/// Archive session key.  Held in zeroizing memory and wiped on drop.
pub struct SessionKey {
    bytes: Zeroizing<[u8; SESSION_KEY_LEN]>,
}

impl SessionKey {
    /// PBKDF2-HMAC-SHA512 over (password, salt), 100 000 iterations.
    pub fn derive(password: &str, salt: &[u8]) -> Result<Self> {
        let mut bytes = Zeroizing::new([0u8; SESSION_KEY_LEN]);
        pbkdf2::pbkdf2::<Hmac<Sha512>>(
            password.as_bytes(),
            salt,
            KEY_DERIVE_ITERATIONS,
            bytes.as_mut(),
        )
        .map_err(|e| Error::Internal(format!("key derivation: {e}")))?;
        Ok(Self { bytes })
    }

    /// Fresh random session key for public-key mode.
    pub fn random() -> Self {
        let mut bytes = Zeroizing::new([0u8; SESSION_KEY_LEN]);
        rand::thread_rng().fill_bytes(bytes.as_mut());
        Self { bytes }
    }

    pub fn from_bytes(raw: &[u8]) -> Result<Self> {
        if raw.len() != SESSION_KEY_LEN {
            return Err(Error::DecryptFail(format!(
                "session key length {} (expected {SESSION_KEY_LEN})",
                raw.len()
            )));
        }
        let mut bytes = Zeroizing::new([0u8; SESSION_KEY_LEN]);
        bytes.copy_from_slice(raw);
        Ok(Self { bytes })
    }

    pub fn bytes(&self) -> &[u8] {
        self.bytes.as_ref()
    }

    /// 8-byte verifier persisted in archive meta so a wrong password is
    /// rejected before any entry is read.
    pub fn verifier(&self, salt: &[u8]) -> [u8; 8] {
        let mut h = Sha512::new();
        h.update(self.bytes.as_ref());
        h.update(salt);
        let digest = h.finalize();
        digest[..8].try_into().unwrap()
    }
}

/// Random archive salt for the SALT chunk.
pub fn random_salt() -> [u8; SALT_LEN] {
    let mut salt = [0u8; SALT_LEN];
    rand::thread_rng().fill_bytes(&mut salt);
    salt
}

/// Counter seed for one entry fragment: archive salt prefix ∥ sequence.
pub fn entry_counter_seed(archive_salt: &[u8], entry_sequence: u64) -> [u8; CIPHER_BLOCK_LEN] {
    let mut iv = [0u8; CIPHER_BLOCK_LEN];
    iv[..8].copy_from_slice(&archive_salt[..8]);
    iv[8..].copy_from_slice(&entry_sequence.to_be_bytes());
    iv
}

// ── Session-key envelope (public-key mode) ───────────────────────────────────

/// Wrap the session key with RSA-OAEP-SHA256 for the KEY chunk.
pub fn wrap_session_key(public_key: &RsaPublicKey, key: &SessionKey) -> Result<Vec<u8>> {
    public_key
        .encrypt(&mut rand::thread_rng(), Oaep::new::<sha2::Sha256>(), key.bytes())
        .map_err(|e| Error::Internal(format!("session key wrap: {e}")))
}

/// Unwrap a KEY-chunk envelope with the matching private key.
pub fn unwrap_session_key(private_key: &RsaPrivateKey, wrapped: &[u8]) -> Result<SessionKey> {
    let raw = private_key
        .decrypt(Oaep::new::<sha2::Sha256>(), wrapped)
        .map_err(|_| Error::DecryptFail("session key envelope".into()))?;
    SessionKey::from_bytes(&raw)
}

// ── Entry cipher ─────────────────────────────────────────────────────────────

/// One entry fragment's cipher state.  CTR mode: the same keystream XOR
/// serves encrypt and decrypt.
pub trait EntryCipher: Send {
    fn apply(&mut self, buf: &mut [u8]);
}

struct NoCipher;

impl EntryCipher for NoCipher {
    fn apply(&mut self, _buf: &mut [u8]) {}
}

struct CtrCipher<C: StreamCipher + Send>(C);

impl<C: StreamCipher + Send> EntryCipher for CtrCipher<C> {
    fn apply(&mut self, buf: &mut [u8]) {
        self.0.apply_keystream(buf);
    }
}

/// Instantiate the cipher for one entry fragment.
pub fn make_entry_cipher(
    algorithm: CryptAlgorithm,
    key: Option<&SessionKey>,
    iv: &[u8; CIPHER_BLOCK_LEN],
) -> Result<Box<dyn EntryCipher>> {
    if algorithm.is_none() {
        return Ok(Box::new(NoCipher));
    }
    let key = key.ok_or(Error::WrongPassword)?;
    let k = &key.bytes()[..algorithm.key_len()];
    let bad = |e: cipher::InvalidLength| Error::Internal(format!("cipher init: {e}"));
    Ok(match algorithm {
        CryptAlgorithm::None => unreachable!(),
        CryptAlgorithm::Aes128Ctr => {
            Box::new(CtrCipher(Aes128Ctr::new_from_slices(k, iv).map_err(bad)?))
        }
        CryptAlgorithm::Aes256Ctr => {
            Box::new(CtrCipher(Aes256Ctr::new_from_slices(k, iv).map_err(bad)?))
        }
        CryptAlgorithm::Twofish256Ctr => {
            Box::new(CtrCipher(Twofish256Ctr::new_from_slices(k, iv).map_err(bad)?))
        }
        CryptAlgorithm::Camellia256Ctr => {
            Box::new(CtrCipher(Camellia256Ctr::new_from_slices(k, iv).map_err(bad)?))
        }
    })
}
