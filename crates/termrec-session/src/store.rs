//! Metadata rows and their storage.
//!
//! [`MetadataStore`] is the point-lookup row store the recorder, keyring and
//! replay controller talk to. [`JsonStore`] keeps every table in one JSON
//! document, rewritten atomically (temp file + rename) under a file lock
//! after each mutation, or purely in memory for tests.

use std::collections::BTreeMap;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};

use rand::Rng;
use serde::{Deserialize, Serialize};
use termrec_core::{TermrecError, TermrecResult};
use tracing::debug;

/// Unix time in milliseconds.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Random 32-char hex id.
pub fn new_id() -> String {
    let mut rng = rand::thread_rng();
    let bytes: [u8; 16] = rng.gen();
    hex::encode(bytes)
}

/// On-disk format of a recording file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordingFormat {
    #[serde(rename = "termrec")]
    Termrec,
    #[serde(rename = "termrec+gcm")]
    TermrecGcm,
}

impl RecordingFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            RecordingFormat::Termrec => "termrec",
            RecordingFormat::TermrecGcm => "termrec+gcm",
        }
    }
}

impl fmt::Display for RecordingFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One recorded session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Recording {
    pub id: String,
    pub backend_session_id: String,
    pub session_name: String,
    pub session_type: String,
    pub started_at: u64,
    pub ended_at: Option<u64>,
    pub format: RecordingFormat,
    pub path: PathBuf,
    pub size: u64,
    pub encrypted: bool,
    pub capture_input: bool,
}

/// A recording's file key, wrapped under the passphrase-derived master key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingKey {
    pub recording_id: String,
    #[serde(with = "termrec_core::b64")]
    pub wrapped_key: Vec<u8>,
    #[serde(with = "termrec_core::b64")]
    pub nonce: Vec<u8>,
    pub algorithm: String,
    pub kdf: String,
}

/// A recording's file key, RSA-wrapped for a named recipient.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecipientKey {
    pub recording_id: String,
    pub recipient_name: String,
    #[serde(with = "termrec_core::b64")]
    pub wrapped_key: Vec<u8>,
    pub created_at: u64,
}

/// An RSA identity: the local one (with private key) or an imported recipient.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserKey {
    pub id: String,
    pub name: String,
    pub public_key: String,
    /// PKCS#1 PEM; empty unless `is_local`.
    #[serde(default)]
    pub private_key: String,
    pub created_at: u64,
    pub is_local: bool,
}

impl fmt::Debug for UserKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserKey")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("created_at", &self.created_at)
            .field("is_local", &self.is_local)
            .finish_non_exhaustive()
    }
}

/// Row storage used by the recording subsystem.
pub trait MetadataStore: Send + Sync {
    /// Insert a recording row together with its wrapped key. `key` must be
    /// present exactly when `recording.encrypted` is set.
    fn create_recording(
        &self,
        recording: &Recording,
        key: Option<&RecordingKey>,
    ) -> TermrecResult<()>;
    /// Set `ended_at` and `size`.
    fn finish_recording(&self, id: &str, ended_at: u64, size: u64) -> TermrecResult<()>;
    fn get_recording(&self, id: &str) -> TermrecResult<Option<Recording>>;
    /// Newest first.
    fn list_recordings(&self) -> TermrecResult<Vec<Recording>>;
    /// Remove a recording with its key and recipient rows. Returns the
    /// removed row.
    fn delete_recording(&self, id: &str) -> TermrecResult<Option<Recording>>;

    fn get_recording_key(&self, recording_id: &str) -> TermrecResult<Option<RecordingKey>>;

    fn get_setting(&self, key: &str) -> TermrecResult<Option<String>>;
    /// Store `value` unless `key` already has one; returns whichever value
    /// is stored afterwards.
    fn set_setting_if_absent(&self, key: &str, value: &str) -> TermrecResult<String>;

    /// Names are unique and at most one key may be local.
    fn insert_user_key(&self, key: &UserKey) -> TermrecResult<()>;
    fn list_user_keys(&self) -> TermrecResult<Vec<UserKey>>;
    fn get_user_key(&self, name: &str) -> TermrecResult<Option<UserKey>>;
    fn local_user_key(&self) -> TermrecResult<Option<UserKey>>;
    fn delete_user_key(&self, name: &str) -> TermrecResult<bool>;

    /// Insert or replace the row for `(recording_id, recipient_name)`.
    fn upsert_recipient_key(&self, key: &RecipientKey) -> TermrecResult<()>;
    fn get_recipient_key(
        &self,
        recording_id: &str,
        recipient_name: &str,
    ) -> TermrecResult<Option<RecipientKey>>;
    fn list_recipient_keys(&self, recording_id: &str) -> TermrecResult<Vec<RecipientKey>>;
    fn delete_recipient_key(&self, recording_id: &str, recipient_name: &str) -> TermrecResult<bool>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Tables {
    #[serde(default)]
    recordings: BTreeMap<String, Recording>,
    #[serde(default)]
    recording_keys: BTreeMap<String, RecordingKey>,
    #[serde(default)]
    recipient_keys: Vec<RecipientKey>,
    #[serde(default)]
    user_keys: Vec<UserKey>,
    #[serde(default)]
    settings: BTreeMap<String, String>,
}

/// JSON-document store.
///
/// A file-backed store is shared with other termrec processes: every
/// operation takes an advisory lock on a sibling `.lock` file and works on
/// the document as it is on disk, never on a stale copy.
pub struct JsonStore {
    path: Option<PathBuf>,
    tables: Mutex<Tables>,
}

impl JsonStore {
    /// Open (or start) the store at `path`.
    pub fn open(path: impl Into<PathBuf>) -> TermrecResult<Self> {
        let path = path.into();
        let tables = {
            let _lock = StoreLock::shared(&path)?;
            load(&path)?
        };
        debug!(path = %path.display(), "metadata store opened");
        Ok(Self {
            path: Some(path),
            tables: Mutex::new(tables),
        })
    }

    /// A store that never touches disk.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            tables: Mutex::new(Tables::default()),
        }
    }

    fn lock(&self) -> TermrecResult<MutexGuard<'_, Tables>> {
        self.tables
            .lock()
            .map_err(|_| TermrecError::Other("metadata store lock poisoned".into()))
    }

    fn read<T>(&self, f: impl FnOnce(&Tables) -> T) -> TermrecResult<T> {
        let mut guard = self.lock()?;
        if let Some(path) = &self.path {
            let _lock = StoreLock::shared(path)?;
            *guard = load(path)?;
        }
        Ok(f(&*guard))
    }

    /// Apply `f` to the current tables and persist the result. Nothing is
    /// committed if `f` or the write fails.
    fn mutate<T>(&self, f: impl FnOnce(&mut Tables) -> TermrecResult<T>) -> TermrecResult<T> {
        let mut guard = self.lock()?;
        let Some(path) = &self.path else {
            let mut draft = guard.clone();
            let out = f(&mut draft)?;
            *guard = draft;
            return Ok(out);
        };

        let _lock = StoreLock::exclusive(path)?;
        let mut draft = load(path)?;
        let out = f(&mut draft)?;
        persist(path, &draft)?;
        *guard = draft;
        Ok(out)
    }
}

fn load(path: &Path) -> TermrecResult<Tables> {
    match fs::read(path) {
        Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
            TermrecError::Other(format!("metadata store {}: {e}", path.display()))
        }),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Tables::default()),
        Err(e) => Err(e.into()),
    }
}

fn persist(path: &Path, tables: &Tables) -> TermrecResult<()> {
    let bytes = serde_json::to_vec_pretty(tables)
        .map_err(|e| TermrecError::Other(format!("serialize metadata: {e}")))?;
    let tmp = path.with_extension("json.tmp");
    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    // Holds the local private key.
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(&tmp)?;
    // `mode` only applies on creation; a leftover temp file keeps its own.
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.set_permissions(fs::Permissions::from_mode(0o600))?;
    }
    file.write_all(&bytes)?;
    file.sync_all()?;
    drop(file);
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Advisory `flock` on `<store>.lock`, released on drop.
struct StoreLock {
    #[cfg_attr(not(unix), allow(dead_code))]
    file: File,
}

impl StoreLock {
    fn shared(store: &Path) -> TermrecResult<Self> {
        Self::acquire(store, false)
    }

    fn exclusive(store: &Path) -> TermrecResult<Self> {
        Self::acquire(store, true)
    }

    fn acquire(store: &Path, exclusive: bool) -> TermrecResult<Self> {
        if let Some(dir) = store.parent() {
            fs::create_dir_all(dir)?;
        }
        let path = store.with_extension("lock");
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)?;

        #[cfg(unix)]
        {
            use std::os::unix::io::AsRawFd;
            let op = if exclusive { libc::LOCK_EX } else { libc::LOCK_SH };
            // SAFETY: the descriptor belongs to `file`, which outlives the lock.
            if unsafe { libc::flock(file.as_raw_fd(), op) } != 0 {
                let err = io::Error::last_os_error();
                return Err(TermrecError::Other(format!(
                    "failed to lock {}: {err}",
                    path.display()
                )));
            }
        }
        #[cfg(not(unix))]
        let _ = exclusive;

        Ok(Self { file })
    }
}

#[cfg(unix)]
impl Drop for StoreLock {
    fn drop(&mut self) {
        use std::os::unix::io::AsRawFd;
        // SAFETY: the descriptor is still open; unlocking is idempotent.
        let _ = unsafe { libc::flock(self.file.as_raw_fd(), libc::LOCK_UN) };
    }
}

impl MetadataStore for JsonStore {
    fn create_recording(
        &self,
        recording: &Recording,
        key: Option<&RecordingKey>,
    ) -> TermrecResult<()> {
        match (recording.encrypted, key) {
            (true, None) => {
                return Err(TermrecError::InvalidInput(
                    "encrypted recording needs a wrapped key".into(),
                ))
            }
            (false, Some(_)) => {
                return Err(TermrecError::InvalidInput(
                    "plaintext recording cannot carry a wrapped key".into(),
                ))
            }
            (true, Some(k)) if k.recording_id != recording.id => {
                return Err(TermrecError::InvalidInput(
                    "wrapped key belongs to another recording".into(),
                ))
            }
            _ => {}
        }

        self.mutate(|t| {
            if t.recordings.contains_key(&recording.id) {
                return Err(TermrecError::InvalidInput(format!(
                    "recording {} already exists",
                    recording.id
                )));
            }
            t.recordings.insert(recording.id.clone(), recording.clone());
            if let Some(k) = key {
                t.recording_keys.insert(recording.id.clone(), k.clone());
            }
            Ok(())
        })
    }

    fn finish_recording(&self, id: &str, ended_at: u64, size: u64) -> TermrecResult<()> {
        self.mutate(|t| {
            let rec = t
                .recordings
                .get_mut(id)
                .ok_or_else(|| TermrecError::NotFound(format!("recording {id}")))?;
            rec.ended_at = Some(ended_at);
            rec.size = size;
            Ok(())
        })
    }

    fn get_recording(&self, id: &str) -> TermrecResult<Option<Recording>> {
        self.read(|t| t.recordings.get(id).cloned())
    }

    fn list_recordings(&self) -> TermrecResult<Vec<Recording>> {
        self.read(|t| {
            let mut all: Vec<Recording> = t.recordings.values().cloned().collect();
            all.sort_by(|a, b| b.started_at.cmp(&a.started_at).then_with(|| a.id.cmp(&b.id)));
            all
        })
    }

    fn delete_recording(&self, id: &str) -> TermrecResult<Option<Recording>> {
        self.mutate(|t| {
            let removed = t.recordings.remove(id);
            t.recording_keys.remove(id);
            t.recipient_keys.retain(|k| k.recording_id != id);
            Ok(removed)
        })
    }

    fn get_recording_key(&self, recording_id: &str) -> TermrecResult<Option<RecordingKey>> {
        self.read(|t| t.recording_keys.get(recording_id).cloned())
    }

    fn get_setting(&self, key: &str) -> TermrecResult<Option<String>> {
        self.read(|t| t.settings.get(key).cloned())
    }

    fn set_setting_if_absent(&self, key: &str, value: &str) -> TermrecResult<String> {
        if let Some(existing) = self.get_setting(key)? {
            return Ok(existing);
        }
        // Another process may have set it since; the entry is re-checked under the lock.
        self.mutate(|t| {
            Ok(t.settings
                .entry(key.to_string())
                .or_insert_with(|| value.to_string())
                .clone())
        })
    }

    fn insert_user_key(&self, key: &UserKey) -> TermrecResult<()> {
        self.mutate(|t| {
            if t.user_keys.iter().any(|k| k.name == key.name) {
                return Err(TermrecError::InvalidInput(format!(
                    "an identity named {:?} already exists",
                    key.name
                )));
            }
            if key.is_local && t.user_keys.iter().any(|k| k.is_local) {
                return Err(TermrecError::InvalidInput(
                    "a local identity already exists".into(),
                ));
            }
            t.user_keys.push(key.clone());
            Ok(())
        })
    }

    fn list_user_keys(&self) -> TermrecResult<Vec<UserKey>> {
        self.read(|t| {
            let mut keys = t.user_keys.clone();
            keys.sort_by(|a, b| b.is_local.cmp(&a.is_local).then_with(|| a.name.cmp(&b.name)));
            keys
        })
    }

    fn get_user_key(&self, name: &str) -> TermrecResult<Option<UserKey>> {
        self.read(|t| t.user_keys.iter().find(|k| k.name == name).cloned())
    }

    fn local_user_key(&self) -> TermrecResult<Option<UserKey>> {
        self.read(|t| t.user_keys.iter().find(|k| k.is_local).cloned())
    }

    fn delete_user_key(&self, name: &str) -> TermrecResult<bool> {
        self.mutate(|t| {
            let before = t.user_keys.len();
            t.user_keys.retain(|k| k.name != name);
            Ok(t.user_keys.len() != before)
        })
    }

    fn upsert_recipient_key(&self, key: &RecipientKey) -> TermrecResult<()> {
        self.mutate(|t| {
            if !t.recordings.contains_key(&key.recording_id) {
                return Err(TermrecError::NotFound(format!(
                    "recording {}",
                    key.recording_id
                )));
            }
            t.recipient_keys.retain(|k| {
                !(k.recording_id == key.recording_id && k.recipient_name == key.recipient_name)
            });
            t.recipient_keys.push(key.clone());
            Ok(())
        })
    }

    fn get_recipient_key(
        &self,
        recording_id: &str,
        recipient_name: &str,
    ) -> TermrecResult<Option<RecipientKey>> {
        self.read(|t| {
            t.recipient_keys
                .iter()
                .find(|k| k.recording_id == recording_id && k.recipient_name == recipient_name)
                .cloned()
        })
    }

    fn list_recipient_keys(&self, recording_id: &str) -> TermrecResult<Vec<RecipientKey>> {
        self.read(|t| {
            t.recipient_keys
                .iter()
                .filter(|k| k.recording_id == recording_id)
                .cloned()
                .collect()
        })
    }

    fn delete_recipient_key(
        &self,
        recording_id: &str,
        recipient_name: &str,
    ) -> TermrecResult<bool> {
        self.mutate(|t| {
            let before = t.recipient_keys.len();
            t.recipient_keys.retain(|k| {
                !(k.recording_id == recording_id && k.recipient_name == recipient_name)
            });
            Ok(t.recipient_keys.len() != before)
        })
    }
}
