//! Key primitives: Argon2id master keys, AES-GCM file-key wrapping, and
//! RSA-OAEP wrapping for named recipients.
//!
//! Nothing in here persists anything. Callers own salts, wrapped keys and
//! PEM strings; see the keyring in `termrec-session`.

use std::fmt;

use argon2::{Algorithm, Argon2, Params, Version};
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM, NONCE_LEN};
use ring::rand::{SecureRandom, SystemRandom};
use rsa::pkcs1::{DecodeRsaPrivateKey, EncodeRsaPrivateKey};
use rsa::pkcs8::{DecodePublicKey, EncodePublicKey, LineEnding};
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Deserializer};
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::error::{TermrecError, TermrecResult};

/// Length of symmetric keys (master key and file keys).
pub const KEY_LEN: usize = 32;

/// Length of the per-installation KDF salt.
pub const SALT_LEN: usize = 16;

/// RSA modulus size for generated identities.
pub const RSA_BITS: usize = 2048;

/// Algorithm tag stored alongside every wrapped file key.
pub const WRAP_ALGORITHM: &str = "AES-256-GCM";

/// KDF tag stored alongside every wrapped file key.
pub const KDF_ARGON2ID: &str = "argon2id";

/// A 32-byte symmetric key, wiped on drop.
pub type SecretKey = Zeroizing<[u8; KEY_LEN]>;

/// A user-supplied passphrase. Never printed.
#[derive(Clone, Default)]
pub struct Passphrase(Zeroizing<String>);

impl Passphrase {
    pub fn new(value: impl Into<String>) -> Self {
        Self(Zeroizing::new(value.into()))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl fmt::Debug for Passphrase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Passphrase(<redacted>)")
    }
}

impl<'de> Deserialize<'de> for Passphrase {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(Self::new)
    }
}

impl From<String> for Passphrase {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl From<&str> for Passphrase {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Argon2id cost parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KdfParams {
    pub time_cost: u32,
    pub memory_kib: u32,
    pub parallelism: u32,
}

impl Default for KdfParams {
    /// time=3, memory=64 MiB, parallelism=2.
    fn default() -> Self {
        Self {
            time_cost: 3,
            memory_kib: 64 * 1024,
            parallelism: 2,
        }
    }
}

impl KdfParams {
    /// Minimal parameters for tests. Never use for real keys.
    pub fn insecure_fast() -> Self {
        Self {
            time_cost: 1,
            memory_kib: 64,
            parallelism: 1,
        }
    }
}

fn fill_random(buf: &mut [u8]) -> TermrecResult<()> {
    SystemRandom::new()
        .fill(buf)
        .map_err(|_| TermrecError::Crypto("RNG failure".into()))
}

/// Derive the 32-byte master key from a passphrase and the installation salt.
pub fn derive_master_key(
    passphrase: &Passphrase,
    salt: &[u8],
    params: KdfParams,
) -> TermrecResult<SecretKey> {
    if passphrase.is_empty() {
        return Err(TermrecError::InvalidInput("passphrase is empty".into()));
    }
    let params = Params::new(
        params.memory_kib,
        params.time_cost,
        params.parallelism,
        Some(KEY_LEN),
    )
    .map_err(|e| TermrecError::InvalidInput(format!("argon2 params: {e}")))?;

    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    Argon2::new(Algorithm::Argon2id, Version::V0x13, params)
        .hash_password_into(passphrase.as_bytes(), salt, &mut key[..])
        .map_err(|e| TermrecError::Crypto(format!("argon2: {e}")))?;
    Ok(key)
}

pub fn generate_salt() -> TermrecResult<[u8; SALT_LEN]> {
    let mut salt = [0u8; SALT_LEN];
    fill_random(&mut salt)?;
    Ok(salt)
}

/// Fresh random key for one encrypted recording.
pub fn generate_file_key() -> TermrecResult<SecretKey> {
    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    fill_random(&mut key[..])?;
    Ok(key)
}

/// A file key sealed under the master key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrappedKey {
    /// Ciphertext with the 16-byte GCM tag appended.
    pub ciphertext: Vec<u8>,
    pub nonce: [u8; NONCE_LEN],
}

fn gcm_key(key: &[u8; KEY_LEN]) -> TermrecResult<LessSafeKey> {
    let unbound = UnboundKey::new(&AES_256_GCM, key)
        .map_err(|_| TermrecError::Crypto("invalid AES-256 key".into()))?;
    Ok(LessSafeKey::new(unbound))
}

/// Seal `file_key` under `master` with a fresh random nonce.
pub fn wrap_key(master: &[u8; KEY_LEN], file_key: &[u8; KEY_LEN]) -> TermrecResult<WrappedKey> {
    let mut nonce = [0u8; NONCE_LEN];
    fill_random(&mut nonce)?;

    let mut ciphertext = file_key.to_vec();
    gcm_key(master)?
        .seal_in_place_append_tag(
            Nonce::assume_unique_for_key(nonce),
            Aad::empty(),
            &mut ciphertext,
        )
        .map_err(|_| TermrecError::Crypto("file key seal failed".into()))?;
    Ok(WrappedKey { ciphertext, nonce })
}

/// Open a wrapped file key. Any failure reads as a wrong passphrase.
pub fn unwrap_key(master: &[u8; KEY_LEN], wrapped: &WrappedKey) -> TermrecResult<SecretKey> {
    let mut buf = Zeroizing::new(wrapped.ciphertext.clone());
    let plain = gcm_key(master)?
        .open_in_place(Nonce::assume_unique_for_key(wrapped.nonce), Aad::empty(), &mut buf)
        .map_err(|_| TermrecError::wrong_passphrase())?;
    to_secret_key(plain).ok_or_else(TermrecError::wrong_passphrase)
}

fn to_secret_key(bytes: &[u8]) -> Option<SecretKey> {
    if bytes.len() != KEY_LEN {
        return None;
    }
    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    key.copy_from_slice(bytes);
    Some(key)
}

/// PEM pair for a freshly generated local identity.
pub struct IdentityPems {
    /// PKCS#1 RSA private key.
    pub private_pem: Zeroizing<String>,
    /// PKIX (SubjectPublicKeyInfo) public key.
    pub public_pem: String,
}

impl fmt::Debug for IdentityPems {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityPems")
            .field("private_pem", &"<redacted>")
            .field("public_pem", &self.public_pem)
            .finish()
    }
}

/// Generate an RSA-2048 identity.
pub fn generate_identity() -> TermrecResult<IdentityPems> {
    let private = RsaPrivateKey::new(&mut rand::rngs::OsRng, RSA_BITS)
        .map_err(|e| TermrecError::Crypto(format!("rsa keygen: {e}")))?;
    let public_pem = RsaPublicKey::from(&private)
        .to_public_key_pem(LineEnding::LF)
        .map_err(|e| TermrecError::Crypto(format!("encode public key: {e}")))?;
    let private_pem = private
        .to_pkcs1_pem(LineEnding::LF)
        .map_err(|e| TermrecError::Crypto(format!("encode private key: {e}")))?;
    Ok(IdentityPems {
        private_pem,
        public_pem,
    })
}

/// Parse a PKIX public key PEM.
pub fn parse_public_pem(pem: &str) -> TermrecResult<RsaPublicKey> {
    RsaPublicKey::from_public_key_pem(pem.trim())
        .map_err(|e| TermrecError::InvalidInput(format!("not an RSA public key: {e}")))
}

/// DER encoding of a PKIX public key PEM, used for fingerprints.
pub fn public_key_der(pem: &str) -> TermrecResult<Vec<u8>> {
    let der = parse_public_pem(pem)?
        .to_public_key_der()
        .map_err(|e| TermrecError::InvalidInput(format!("encode public key: {e}")))?;
    Ok(der.as_bytes().to_vec())
}

/// RSA-OAEP(SHA-256) wrap a file key for the holder of `public_pem`.
pub fn wrap_for_recipient(public_pem: &str, file_key: &[u8; KEY_LEN]) -> TermrecResult<Vec<u8>> {
    parse_public_pem(public_pem)?
        .encrypt(&mut rand::rngs::OsRng, Oaep::new::<Sha256>(), file_key)
        .map_err(|e| TermrecError::Crypto(format!("rsa wrap: {e}")))
}

/// Inverse of [`wrap_for_recipient`] using a PKCS#1 private key PEM.
pub fn unwrap_as_recipient(private_pem: &str, wrapped: &[u8]) -> TermrecResult<SecretKey> {
    let private = RsaPrivateKey::from_pkcs1_pem(private_pem.trim())
        .map_err(|e| TermrecError::InvalidInput(format!("not an RSA private key: {e}")))?;
    let plain = Zeroizing::new(
        private
            .decrypt(Oaep::new::<Sha256>(), wrapped)
            .map_err(|_| TermrecError::Crypto("unable to unwrap shared file key".into()))?,
    );
    to_secret_key(&plain)
        .ok_or_else(|| TermrecError::Crypto("shared file key has wrong length".into()))
}
