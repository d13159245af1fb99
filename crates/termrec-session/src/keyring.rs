//! Key management: the installation salt, per-recording file keys, the local
//! RSA identity, imported recipients, and sharing.
//!
//! Revoking a share only deletes the recipient's row. The file key is not
//! rotated, so a recipient who already copied the wrapped key keeps access.

use std::sync::Arc;

use termrec_core::keys::{self, KDF_ARGON2ID, SALT_LEN, WRAP_ALGORITHM};
use termrec_core::{
    b64, identity, KdfParams, Passphrase, SecretKey, TermrecError, TermrecResult, WrappedKey,
};
use tracing::info;
use zeroize::Zeroizing;

use crate::store::{
    new_id, now_ms, MetadataStore, RecipientKey, Recording, RecordingKey, UserKey,
};

/// Settings key holding the base64 KDF salt.
pub const SALT_SETTING: &str = "kdf_salt";

/// How a caller proves access to an encrypted recording.
#[derive(Debug, Clone)]
pub enum KeySource {
    Passphrase(Passphrase),
    /// Use the local identity's private key on a recipient row addressed to it.
    LocalIdentity,
}

/// Listing view of a [`UserKey`].
#[derive(Debug, Clone)]
pub struct IdentityInfo {
    pub name: String,
    pub fingerprint: String,
    /// Shortest unique prefix of `fingerprint` among all identities.
    pub short_fingerprint: String,
    pub is_local: bool,
    pub created_at: u64,
}

pub struct Keyring {
    store: Arc<dyn MetadataStore>,
    params: KdfParams,
}

impl Keyring {
    pub fn new(store: Arc<dyn MetadataStore>) -> Self {
        Self::with_params(store, KdfParams::default())
    }

    pub fn with_params(store: Arc<dyn MetadataStore>, params: KdfParams) -> Self {
        Self { store, params }
    }

    /// The installation salt, created on first use.
    pub fn salt(&self) -> TermrecResult<Vec<u8>> {
        let stored = match self.store.get_setting(SALT_SETTING)? {
            Some(s) => s,
            None => {
                let fresh = b64::encode(&keys::generate_salt()?);
                self.store.set_setting_if_absent(SALT_SETTING, &fresh)?
            }
        };
        let salt = b64::decode(&stored)
            .map_err(|e| TermrecError::Other(format!("stored KDF salt is not base64: {e}")))?;
        if salt.len() != SALT_LEN {
            return Err(TermrecError::Other(format!(
                "stored KDF salt has {} bytes, expected {SALT_LEN}",
                salt.len()
            )));
        }
        Ok(salt)
    }

    fn master_key(&self, passphrase: &Passphrase) -> TermrecResult<SecretKey> {
        keys::derive_master_key(passphrase, &self.salt()?, self.params)
    }

    /// Generate a file key for a new recording and wrap it under the
    /// passphrase. Nothing is persisted; the row goes in with the recording.
    pub fn new_file_key(
        &self,
        recording_id: &str,
        passphrase: &Passphrase,
    ) -> TermrecResult<(SecretKey, RecordingKey)> {
        let master = self.master_key(passphrase)?;
        let file_key = keys::generate_file_key()?;
        let wrapped = keys::wrap_key(&master, &file_key)?;
        let row = RecordingKey {
            recording_id: recording_id.to_string(),
            wrapped_key: wrapped.ciphertext,
            nonce: wrapped.nonce.to_vec(),
            algorithm: WRAP_ALGORITHM.to_string(),
            kdf: KDF_ARGON2ID.to_string(),
        };
        Ok((file_key, row))
    }

    /// Unwrap a recording's file key with the passphrase.
    pub fn unwrap_file_key(
        &self,
        recording_id: &str,
        passphrase: &Passphrase,
    ) -> TermrecResult<SecretKey> {
        let row = self
            .store
            .get_recording_key(recording_id)?
            .ok_or_else(|| TermrecError::NotFound(format!("key for recording {recording_id}")))?;
        if row.algorithm != WRAP_ALGORITHM || row.kdf != KDF_ARGON2ID {
            return Err(TermrecError::Crypto(format!(
                "unsupported key wrapping {}/{}",
                row.algorithm, row.kdf
            )));
        }
        let nonce = row
            .nonce
            .as_slice()
            .try_into()
            .map_err(|_| TermrecError::Crypto("stored nonce has wrong length".into()))?;
        let wrapped = WrappedKey {
            ciphertext: row.wrapped_key,
            nonce,
        };
        keys::unwrap_key(&*self.master_key(passphrase)?, &wrapped)
    }

    /// Open a recording's file key through a recipient row addressed to the
    /// local identity.
    pub fn unwrap_with_identity(&self, recording_id: &str) -> TermrecResult<SecretKey> {
        let local = self
            .store
            .local_user_key()?
            .ok_or_else(|| TermrecError::NotFound("no local identity".into()))?;
        let row = self
            .store
            .get_recipient_key(recording_id, &local.name)?
            .ok_or_else(|| {
                TermrecError::NotFound(format!(
                    "recording {recording_id} is not shared with {}",
                    local.name
                ))
            })?;
        let private_pem = Zeroizing::new(local.private_key);
        keys::unwrap_as_recipient(&private_pem, &row.wrapped_key)
    }

    /// File key for `recording`, or `None` if it is not encrypted.
    pub fn resolve(
        &self,
        recording: &Recording,
        source: Option<&KeySource>,
    ) -> TermrecResult<Option<SecretKey>> {
        if !recording.encrypted {
            return Ok(None);
        }
        let key = match source {
            Some(KeySource::Passphrase(p)) => self.unwrap_file_key(&recording.id, p)?,
            Some(KeySource::LocalIdentity) => self.unwrap_with_identity(&recording.id)?,
            None => {
                return Err(TermrecError::InvalidInput(format!(
                    "recording {} is encrypted; a passphrase or identity is required",
                    recording.id
                )))
            }
        };
        Ok(Some(key))
    }

    /// Create the local RSA identity.
    pub fn generate_identity(&self, name: &str) -> TermrecResult<UserKey> {
        validate_name(name)?;
        if self.store.local_user_key()?.is_some() {
            return Err(TermrecError::InvalidInput("a local identity already exists".into()));
        }
        let pems = keys::generate_identity()?;
        let key = UserKey {
            id: new_id(),
            name: name.to_string(),
            public_key: pems.public_pem,
            private_key: pems.private_pem.to_string(),
            created_at: now_ms(),
            is_local: true,
        };
        self.store.insert_user_key(&key)?;
        info!(name, "local identity created");
        Ok(key)
    }

    /// Import a recipient's public key under `name`.
    pub fn import_recipient(&self, name: &str, public_pem: &str) -> TermrecResult<UserKey> {
        validate_name(name)?;
        keys::parse_public_pem(public_pem)?;
        let key = UserKey {
            id: new_id(),
            name: name.to_string(),
            public_key: public_pem.trim().to_string() + "\n",
            private_key: String::new(),
            created_at: now_ms(),
            is_local: false,
        };
        self.store.insert_user_key(&key)?;
        info!(name, "recipient imported");
        Ok(key)
    }

    pub fn identities(&self) -> TermrecResult<Vec<IdentityInfo>> {
        let rows = self.store.list_user_keys()?;
        let fps = rows
            .iter()
            .map(|k| identity::public_key_fingerprint(&k.public_key))
            .collect::<TermrecResult<Vec<_>>>()?;
        let all: Vec<&str> = fps.iter().map(String::as_str).collect();

        Ok(rows
            .iter()
            .zip(&fps)
            .map(|(k, fp)| IdentityInfo {
                name: k.name.clone(),
                short_fingerprint: identity::short_fingerprint(fp, &all, 8),
                fingerprint: fp.clone(),
                is_local: k.is_local,
                created_at: k.created_at,
            })
            .collect())
    }

    /// Public PEM of `name`, or of the local identity when `None`.
    pub fn export_public(&self, name: Option<&str>) -> TermrecResult<String> {
        let key = match name {
            Some(n) => self.store.get_user_key(n)?,
            None => self.store.local_user_key()?,
        };
        key.map(|k| k.public_key)
            .ok_or_else(|| TermrecError::NotFound(name.unwrap_or("local identity").to_string()))
    }

    pub fn delete_identity(&self, name: &str) -> TermrecResult<()> {
        if self.store.delete_user_key(name)? {
            info!(name, "identity deleted");
            Ok(())
        } else {
            Err(TermrecError::NotFound(format!("identity {name}")))
        }
    }

    /// Re-wrap a recording's file key for `recipient`. Sharing again with the
    /// same recipient replaces the earlier row.
    pub fn share(
        &self,
        recording_id: &str,
        recipient: &str,
        passphrase: &Passphrase,
    ) -> TermrecResult<RecipientKey> {
        let recording = self
            .store
            .get_recording(recording_id)?
            .ok_or_else(|| TermrecError::NotFound(format!("recording {recording_id}")))?;
        if !recording.encrypted {
            return Err(TermrecError::InvalidInput(format!(
                "recording {recording_id} is not encrypted"
            )));
        }
        let target = self
            .store
            .get_user_key(recipient)?
            .ok_or_else(|| TermrecError::NotFound(format!("recipient {recipient}")))?;

        let file_key = self.unwrap_file_key(recording_id, passphrase)?;
        let row = RecipientKey {
            recording_id: recording_id.to_string(),
            recipient_name: target.name,
            wrapped_key: keys::wrap_for_recipient(&target.public_key, &file_key)?,
            created_at: now_ms(),
        };
        self.store.upsert_recipient_key(&row)?;
        info!(recording_id, recipient, "recording shared");
        Ok(row)
    }

    /// Remove a recipient's access row. Does not rotate the file key.
    pub fn revoke(&self, recording_id: &str, recipient: &str) -> TermrecResult<()> {
        if self.store.delete_recipient_key(recording_id, recipient)? {
            info!(recording_id, recipient, "share revoked");
            Ok(())
        } else {
            Err(TermrecError::NotFound(format!(
                "recording {recording_id} is not shared with {recipient}"
            )))
        }
    }

    pub fn recipients(&self, recording_id: &str) -> TermrecResult<Vec<RecipientKey>> {
        self.store.list_recipient_keys(recording_id)
    }

}

fn validate_name(name: &str) -> TermrecResult<()> {
    let bad_char = name.chars().any(|c| c.is_whitespace() || c.is_control());
    if name.is_empty() || name.len() > 64 || bad_char {
        return Err(TermrecError::InvalidInput(format!(
            "invalid identity name {name:?}"
        )));
    }
    Ok(())
}
