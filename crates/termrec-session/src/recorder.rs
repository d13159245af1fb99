//! Per-session recording lifecycle.
//!
//! A session is `Idle` until [`Recorder::start`], `Recording` while it has an
//! entry in the registry, and `Stopped` once [`Recorder::stop`] has closed the
//! file and finalized its row. Every transition and every append runs on the
//! caller's thread under the registry's recording lock, so events keep their
//! exact call order and a slow disk pushes back on the terminal pump. Only
//! passphrase key derivation happens outside the lock.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use termrec_core::{ChunkWriter, Encoder, Header, Passphrase, TermrecError, TermrecResult};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::keyring::Keyring;
use crate::registry::Registry;
use crate::store::{new_id, now_ms, MetadataStore, Recording, RecordingFormat};

/// Parameters for [`Recorder::start`].
#[derive(Debug, Clone)]
pub struct StartOptions {
    pub session_id: String,
    pub session_name: String,
    pub session_type: String,
    pub cols: u16,
    pub rows: u16,
    pub capture_input: bool,
    pub encrypt: bool,
    /// Only consulted when `encrypt` is set. Never persisted.
    pub passphrase: Option<Passphrase>,
}

impl StartOptions {
    pub fn new(session_id: impl Into<String>, cols: u16, rows: u16) -> Self {
        let session_id = session_id.into();
        Self {
            session_name: session_id.clone(),
            session_id,
            session_type: "pty".to_string(),
            cols,
            rows,
            capture_input: false,
            encrypt: false,
            passphrase: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum StartWarning {
    /// Encryption was requested without a passphrase; the recording is plaintext.
    EncryptionDowngraded,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    Started {
        recording: Recording,
        warning: Option<StartWarning>,
    },
    /// The session already had a recording; nothing changed.
    AlreadyActive { recording_id: String },
}

/// Lifecycle notifications for UI listeners.
#[derive(Debug, Clone)]
pub enum RecorderNotice {
    Started { session_id: String, recording: Recording },
    Stopped { session_id: String, recording: Recording },
}

/// Counts bytes that actually reach the file.
struct CountingWriter {
    file: File,
    written: Arc<AtomicU64>,
}

impl Write for CountingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.file.write(buf)?;
        self.written.fetch_add(n as u64, Ordering::Relaxed);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

enum Sink {
    Plain(BufWriter<CountingWriter>),
    Sealed(ChunkWriter<CountingWriter>),
}

impl Sink {
    /// Flush everything (sealing the last chunk) and sync the file.
    fn close(self) -> io::Result<()> {
        let counting = match self {
            Sink::Plain(w) => w.into_inner().map_err(|e| e.into_error())?,
            Sink::Sealed(w) => w.finish()?,
        };
        counting.file.sync_all()
    }
}

impl Write for Sink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Sink::Plain(w) => w.write(buf),
            Sink::Sealed(w) => w.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Sink::Plain(w) => w.flush(),
            Sink::Sealed(w) => w.flush(),
        }
    }
}

/// The in-memory handle of a live recording. The file key only survives
/// inside the chunk writer and is dropped with it.
pub(crate) struct ActiveRecording {
    recording_id: String,
    encoder: Encoder<Sink>,
    written: Arc<AtomicU64>,
    capture_input: bool,
}

impl ActiveRecording {
    pub(crate) fn recording_id(&self) -> &str {
        &self.recording_id
    }
}

pub struct Recorder {
    store: Arc<dyn MetadataStore>,
    keyring: Arc<Keyring>,
    registry: Arc<Registry>,
    recordings_dir: PathBuf,
    notices: broadcast::Sender<RecorderNotice>,
}

impl Recorder {
    pub fn new(
        store: Arc<dyn MetadataStore>,
        keyring: Arc<Keyring>,
        registry: Arc<Registry>,
        recordings_dir: impl Into<PathBuf>,
    ) -> Self {
        let (notices, _) = broadcast::channel(64);
        Self {
            store,
            keyring,
            registry,
            recordings_dir: recordings_dir.into(),
            notices,
        }
    }

    /// Receive `Started`/`Stopped` notices.
    pub fn subscribe(&self) -> broadcast::Receiver<RecorderNotice> {
        self.notices.subscribe()
    }

    /// Begin recording `opts.session_id`. A no-op if it is already recording.
    pub fn start(&self, opts: StartOptions) -> TermrecResult<StartOutcome> {
        if let Some(outcome) = self.already_active(&opts.session_id)? {
            return Ok(outcome);
        }

        let recording_id = new_id();
        let passphrase = opts.passphrase.as_ref().filter(|p| !p.is_empty());
        let warning = (opts.encrypt && passphrase.is_none())
            .then_some(StartWarning::EncryptionDowngraded);
        if warning.is_some() {
            warn!(
                session_id = %opts.session_id,
                "encryption requested without passphrase, recording in plaintext"
            );
        }
        // Key derivation is slow; other sessions keep appending meanwhile.
        let sealed = match passphrase.filter(|_| opts.encrypt) {
            Some(p) => Some(self.keyring.new_file_key(&recording_id, p)?),
            None => None,
        };

        let mut active = self.registry.recordings()?;
        if let Some(existing) = active.get(&opts.session_id) {
            debug!(session_id = %opts.session_id, "recording started concurrently");
            return Ok(StartOutcome::AlreadyActive {
                recording_id: existing.recording_id.clone(),
            });
        }

        fs::create_dir_all(&self.recordings_dir)?;
        let path = self.recordings_dir.join(format!("{recording_id}.termrec"));
        let file = OpenOptions::new().write(true).create_new(true).open(&path)?;

        let written = Arc::new(AtomicU64::new(0));
        let counting = CountingWriter {
            file,
            written: written.clone(),
        };
        let header = Header::new(unix_nanos(), opts.cols, opts.rows, opts.capture_input);
        let opened = match &sealed {
            Some((file_key, _)) => ChunkWriter::new(counting, file_key)
                .and_then(|w| Encoder::new(Sink::Sealed(w), &header)),
            None => Encoder::new(Sink::Plain(BufWriter::new(counting)), &header),
        };
        let encoder = match opened {
            Ok(e) => e,
            Err(e) => {
                let _ = fs::remove_file(&path);
                return Err(e);
            }
        };

        let recording = Recording {
            id: recording_id.clone(),
            backend_session_id: opts.session_id.clone(),
            session_name: opts.session_name,
            session_type: opts.session_type,
            started_at: now_ms(),
            ended_at: None,
            format: if sealed.is_some() {
                RecordingFormat::TermrecGcm
            } else {
                RecordingFormat::Termrec
            },
            path: path.clone(),
            size: 0,
            encrypted: sealed.is_some(),
            capture_input: opts.capture_input,
        };
        if let Err(e) = self
            .store
            .create_recording(&recording, sealed.as_ref().map(|(_, row)| row))
        {
            drop(encoder);
            let _ = fs::remove_file(&path);
            return Err(e);
        }

        active.insert(
            opts.session_id.clone(),
            ActiveRecording {
                recording_id: recording_id.clone(),
                encoder,
                written,
                capture_input: opts.capture_input,
            },
        );
        drop(active);

        info!(
            session_id = %opts.session_id,
            recording_id = %recording_id,
            encrypted = recording.encrypted,
            "recording started"
        );
        let _ = self.notices.send(RecorderNotice::Started {
            session_id: opts.session_id,
            recording: recording.clone(),
        });
        Ok(StartOutcome::Started { recording, warning })
    }

    fn already_active(&self, session_id: &str) -> TermrecResult<Option<StartOutcome>> {
        let active = self.registry.recordings()?;
        Ok(active.get(session_id).map(|existing| {
            debug!(session_id, "recording already active");
            StartOutcome::AlreadyActive {
                recording_id: existing.recording_id.clone(),
            }
        }))
    }

    pub fn append_output(&self, session_id: &str, data: &[u8]) -> TermrecResult<()> {
        self.append(session_id, |enc| enc.write_output(data))
    }

    /// Dropped unless the recording captures input.
    pub fn append_input(&self, session_id: &str, data: &[u8]) -> TermrecResult<()> {
        let mut active = self.registry.recordings()?;
        match active.get(session_id) {
            Some(handle) if handle.capture_input => {}
            _ => return Ok(()),
        }
        self.append_locked(&mut active, session_id, |enc| enc.write_input(data))
    }

    pub fn append_resize(&self, session_id: &str, cols: u16, rows: u16) -> TermrecResult<()> {
        self.append(session_id, |enc| enc.write_resize(cols, rows))
    }

    fn append(
        &self,
        session_id: &str,
        write: impl FnOnce(&mut Encoder<Sink>) -> TermrecResult<()>,
    ) -> TermrecResult<()> {
        let mut active = self.registry.recordings()?;
        self.append_locked(&mut active, session_id, write)
    }

    fn append_locked(
        &self,
        active: &mut std::collections::HashMap<String, ActiveRecording>,
        session_id: &str,
        write: impl FnOnce(&mut Encoder<Sink>) -> TermrecResult<()>,
    ) -> TermrecResult<()> {
        let Some(handle) = active.get_mut(session_id) else {
            return Ok(());
        };
        let Err(err) = write(&mut handle.encoder) else {
            return Ok(());
        };

        // The stream can't be trusted past a failed write: close what we have.
        let Some(handle) = active.remove(session_id) else {
            return Err(err);
        };
        error!(
            session_id,
            recording_id = %handle.recording_id,
            error = %err,
            "recording write failed, finalizing"
        );
        let written = handle.written.clone();
        let recording_id = handle.recording_id.clone();
        let _ = handle.encoder.into_inner().close();
        if let Ok(recording) = self.finalize(&recording_id, written.load(Ordering::Relaxed)) {
            let _ = self.notices.send(RecorderNotice::Stopped {
                session_id: session_id.to_string(),
                recording,
            });
        }
        Err(err)
    }

    /// Close the session's recording. Returns `None` if it wasn't recording.
    pub fn stop(&self, session_id: &str) -> TermrecResult<Option<Recording>> {
        let Some(handle) = self.registry.recordings()?.remove(session_id) else {
            debug!(session_id, "stop: not recording");
            return Ok(None);
        };
        // The entry is gone, so appends from here on are dropped.

        let events = handle.encoder.events_written();
        let closed = handle.encoder.into_inner().close();
        let size = handle.written.load(Ordering::Relaxed);
        let recording = self.finalize(&handle.recording_id, size)?;

        info!(
            session_id,
            recording_id = %handle.recording_id,
            events,
            size,
            "recording stopped"
        );
        let _ = self.notices.send(RecorderNotice::Stopped {
            session_id: session_id.to_string(),
            recording: recording.clone(),
        });

        closed.map_err(TermrecError::from_io)?;
        Ok(Some(recording))
    }

    fn finalize(&self, recording_id: &str, size: u64) -> TermrecResult<Recording> {
        self.store.finish_recording(recording_id, now_ms(), size)?;
        self.store
            .get_recording(recording_id)?
            .ok_or_else(|| TermrecError::NotFound(format!("recording {recording_id}")))
    }

    /// Stop every active recording, e.g. at shutdown.
    pub fn stop_all(&self) -> Vec<Recording> {
        let sessions = self.active_sessions();
        sessions
            .iter()
            .filter_map(|sid| match self.stop(sid) {
                Ok(rec) => rec,
                Err(e) => {
                    error!(session_id = %sid, error = %e, "failed to stop recording");
                    None
                }
            })
            .collect()
    }

    pub fn is_recording(&self, session_id: &str) -> bool {
        self.registry
            .recordings()
            .map(|m| m.contains_key(session_id))
            .unwrap_or(false)
    }

    /// Whether `recording_id` is still being written.
    pub fn is_active_recording(&self, recording_id: &str) -> bool {
        self.registry
            .recordings()
            .map(|m| m.values().any(|h| h.recording_id() == recording_id))
            .unwrap_or(false)
    }

    /// Session ids with an active recording.
    pub fn active_sessions(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .registry
            .recordings()
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }
}

fn unix_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_nanos()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::JsonStore;
    use termrec_core::{Decoder, EventKind, KdfParams, HEADER_LEN};

    struct Fixture {
        _dir: tempfile::TempDir,
        store: Arc<JsonStore>,
        recorder: Recorder,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(JsonStore::in_memory());
        let keyring = Arc::new(Keyring::with_params(store.clone(), KdfParams::insecure_fast()));
        let recorder = Recorder::new(
            store.clone(),
            keyring,
            Arc::new(Registry::new()),
            dir.path().join("recordings"),
        );
        Fixture {
            _dir: dir,
            store,
            recorder,
        }
    }

    fn started(outcome: StartOutcome) -> (Recording, Option<StartWarning>) {
        match outcome {
            StartOutcome::Started { recording, warning } => (recording, warning),
            other => panic!("expected Started, got {other:?}"),
        }
    }

    #[test]
    fn start_is_idempotent_per_session() {
        let f = fixture();
        let (rec, warning) = started(f.recorder.start(StartOptions::new("s1", 80, 24)).unwrap());
        assert!(warning.is_none());
        assert_eq!(rec.format, RecordingFormat::Termrec);

        let again = f.recorder.start(StartOptions::new("s1", 80, 24)).unwrap();
        assert_eq!(again, StartOutcome::AlreadyActive { recording_id: rec.id.clone() });
        assert_eq!(f.store.list_recordings().unwrap().len(), 1);
        assert!(f.recorder.is_recording("s1"));
        assert!(f.recorder.is_active_recording(&rec.id));
    }

    #[test]
    fn appends_without_recording_are_dropped() {
        let f = fixture();
        f.recorder.append_output("nobody", b"x").unwrap();
        f.recorder.append_resize("nobody", 1, 1).unwrap();
        assert_eq!(f.recorder.stop("nobody").unwrap(), None);
    }

    #[test]
    fn input_gated_on_capture() {
        let f = fixture();
        let mut opts = StartOptions::new("quiet", 80, 24);
        f.recorder.start(opts.clone()).unwrap();
        opts.session_id = "loud".into();
        opts.capture_input = true;
        f.recorder.start(opts).unwrap();

        for sid in ["quiet", "loud"] {
            f.recorder.append_input(sid, b"ls\r").unwrap();
            f.recorder.append_output(sid, b"ls\r\n").unwrap();
        }

        let expectations = [
            ("quiet", vec![EventKind::Output]),
            ("loud", vec![EventKind::Input, EventKind::Output]),
        ];
        for (sid, expected) in expectations {
            let rec = f.recorder.stop(sid).unwrap().unwrap();
            let mut dec = Decoder::new(File::open(&rec.path).unwrap());
            let header = dec.read_header().unwrap();
            assert_eq!(header.capture_input(), sid == "loud");
            let mut kinds = Vec::new();
            while let Some(ev) = dec.read_event(Vec::new()).unwrap() {
                kinds.push(ev.kind);
            }
            assert_eq!(kinds, expected);
        }
    }

    #[test]
    fn size_counts_bytes_on_disk() {
        let f = fixture();
        let (rec, _) = started(f.recorder.start(StartOptions::new("s", 80, 24)).unwrap());
        f.recorder.append_output("s", b"hello\r\n").unwrap();
        let done = f.recorder.stop("s").unwrap().unwrap();
        let on_disk = fs::metadata(&rec.path).unwrap().len();
        assert_eq!(done.size, on_disk);
        assert!(done.size > HEADER_LEN as u64);
        assert!(done.ended_at.is_some());
        assert!(!f.recorder.is_recording("s"));
    }

    #[test]
    fn encryption_without_passphrase_downgrades() {
        let f = fixture();
        let mut opts = StartOptions::new("s", 80, 24);
        opts.encrypt = true;
        opts.passphrase = Some(Passphrase::default());
        let (rec, warning) = started(f.recorder.start(opts).unwrap());
        assert_eq!(warning, Some(StartWarning::EncryptionDowngraded));
        assert!(!rec.encrypted);
        assert!(f.store.get_recording_key(&rec.id).unwrap().is_none());
    }

    #[test]
    fn encrypted_recording_has_key_and_no_plain_magic() {
        let f = fixture();
        let mut opts = StartOptions::new("s", 80, 24);
        opts.encrypt = true;
        opts.passphrase = Some("pw".into());
        let (rec, warning) = started(f.recorder.start(opts).unwrap());
        assert!(warning.is_none());
        assert_eq!(rec.format, RecordingFormat::TermrecGcm);
        assert!(f.store.get_recording_key(&rec.id).unwrap().is_some());

        f.recorder.append_output("s", b"top secret").unwrap();
        let done = f.recorder.stop("s").unwrap().unwrap();
        let bytes = fs::read(&done.path).unwrap();
        assert_eq!(bytes.len() as u64, done.size);
        assert!(!bytes.windows(7).any(|w| w == b"TERMREC"));
        assert!(!bytes.windows(10).any(|w| w == b"top secret"));
    }

    #[tokio::test]
    async fn notices_follow_lifecycle() {
        let f = fixture();
        let mut rx = f.recorder.subscribe();
        f.recorder.start(StartOptions::new("s", 80, 24)).unwrap();
        f.recorder.stop("s").unwrap();

        assert!(matches!(
            rx.recv().await.unwrap(),
            RecorderNotice::Started { session_id, .. } if session_id == "s"
        ));
        match rx.recv().await.unwrap() {
            RecorderNotice::Stopped { recording, .. } => assert!(recording.ended_at.is_some()),
            other => panic!("unexpected notice {other:?}"),
        }
    }

    /// Swap the live file of `session_id` for `/dev/full`, which rejects
    /// every write. What was buffered so far still reaches the real file.
    #[cfg(target_os = "linux")]
    fn fill_disk(recorder: &Recorder, session_id: &str) {
        let mut active = recorder.registry.recordings().unwrap();
        let handle = active.get_mut(session_id).unwrap();
        let full = CountingWriter {
            file: OpenOptions::new().write(true).open("/dev/full").unwrap(),
            written: handle.written.clone(),
        };
        let header = Header::new(0, 80, 24, false);
        let broken = Encoder::new(Sink::Plain(BufWriter::new(full)), &header).unwrap();
        let live = std::mem::replace(&mut handle.encoder, broken);
        live.into_inner().close().unwrap();
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn failed_write_finalizes_at_flushed_size() {
        let f = fixture();
        let mut rx = f.recorder.subscribe();
        let (rec, _) = started(f.recorder.start(StartOptions::new("s", 80, 24)).unwrap());
        assert!(matches!(rx.recv().await.unwrap(), RecorderNotice::Started { .. }));
        f.recorder.append_output("s", b"hello\r\n").unwrap();
        fill_disk(&f.recorder, "s");

        // Larger than the write buffer, so it reaches the device at once.
        let err = f.recorder.append_output("s", &[b'x'; 64 * 1024]).unwrap_err();
        assert!(matches!(err, TermrecError::Io(_)), "{err:?}");
        assert!(!f.recorder.is_recording("s"));
        assert!(!f.recorder.is_active_recording(&rec.id));

        let on_disk = fs::metadata(&rec.path).unwrap().len();
        let row = f.store.get_recording(&rec.id).unwrap().unwrap();
        assert!(row.ended_at.is_some());
        assert_eq!(row.size, on_disk);
        assert!(row.size > HEADER_LEN as u64);
        match rx.recv().await.unwrap() {
            RecorderNotice::Stopped { session_id, recording } => {
                assert_eq!(session_id, "s");
                assert_eq!(recording.size, on_disk);
            }
            other => panic!("unexpected notice {other:?}"),
        }

        // Later appends find no recording and are dropped.
        f.recorder.append_output("s", b"late").unwrap();
        assert_eq!(f.recorder.stop("s").unwrap(), None);
    }

    #[test]
    fn second_encrypted_start_is_a_no_op() {
        let f = fixture();
        let mut opts = StartOptions::new("enc", 80, 24);
        opts.encrypt = true;
        opts.passphrase = Some("pw".into());
        let (rec, _) = started(f.recorder.start(opts.clone()).unwrap());
        // A second encrypted start for the session derives nothing and changes nothing.
        assert_eq!(
            f.recorder.start(opts).unwrap(),
            StartOutcome::AlreadyActive { recording_id: rec.id }
        );
        assert_eq!(f.store.list_recordings().unwrap().len(), 1);
    }

    #[test]
    fn stop_all_closes_everything() {
        let f = fixture();
        f.recorder.start(StartOptions::new("a", 80, 24)).unwrap();
        f.recorder.start(StartOptions::new("b", 80, 24)).unwrap();
        assert_eq!(f.recorder.active_sessions(), ["a", "b"]);
        assert_eq!(f.recorder.stop_all().len(), 2);
        assert!(f.recorder.active_sessions().is_empty());
    }
}
