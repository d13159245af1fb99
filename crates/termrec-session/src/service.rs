//! Command/event surface for a UI or transport layer.
//!
//! Commands and events are JSON objects tagged by `"type"`. Passphrases
//! arrive inside commands and are only ever held in memory.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use termrec_core::{resolve_prefix, KdfParams, Passphrase, SecretKey, TermrecError, TermrecResult};
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::config::Config;
use crate::keyring::{KeySource, Keyring};
use crate::recorder::{Recorder, StartOptions, StartOutcome, StartWarning};
use crate::registry::Registry;
use crate::replay::{inspect_recording, RecordingSummary, ReplayEvent, ReplayManager, ReplayUpdate};
use crate::store::{JsonStore, MetadataStore, Recording};

/// Capacity of each replay's event channel into the service.
const REPLAY_EVENT_BUFFER: usize = 64;

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum UiCommand {
    #[serde(rename = "start", rename_all = "camelCase")]
    Start {
        session_id: String,
        #[serde(default)]
        session_name: Option<String>,
        #[serde(default)]
        session_type: Option<String>,
        cols: u16,
        rows: u16,
        #[serde(default)]
        capture_input: Option<bool>,
        #[serde(default)]
        encrypt: Option<bool>,
        #[serde(default)]
        passphrase: Option<Passphrase>,
    },
    #[serde(rename = "stop", rename_all = "camelCase")]
    Stop { session_id: String },
    #[serde(rename = "list")]
    List,
    #[serde(rename = "delete", rename_all = "camelCase")]
    Delete { recording_id: String },
    #[serde(rename = "replay:start", rename_all = "camelCase")]
    ReplayStart {
        recording_id: String,
        #[serde(default)]
        passphrase: Option<Passphrase>,
        /// Open through a share addressed to the local identity.
        #[serde(default)]
        use_identity: bool,
        #[serde(default)]
        speed: Option<f64>,
    },
    #[serde(rename = "replay:stop", rename_all = "camelCase")]
    ReplayStop { replay_id: String },
    #[serde(rename = "replay:pause", rename_all = "camelCase")]
    ReplayPause { replay_id: String },
    #[serde(rename = "replay:resume", rename_all = "camelCase")]
    ReplayResume { replay_id: String },
    #[serde(rename = "replay:rewind", rename_all = "camelCase")]
    ReplayRewind { replay_id: String },
    #[serde(rename = "replay:seek", rename_all = "camelCase")]
    ReplaySeek { replay_id: String, target_ns: u64 },
    #[serde(rename = "replay:setSpeed", rename_all = "camelCase")]
    ReplaySetSpeed { replay_id: String, speed: f64 },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum UiEvent {
    #[serde(rename = "started", rename_all = "camelCase")]
    Started {
        session_id: String,
        recording: Recording,
        #[serde(skip_serializing_if = "Option::is_none")]
        warning: Option<StartWarning>,
    },
    #[serde(rename = "stopped", rename_all = "camelCase")]
    Stopped { session_id: String, recording: Recording },
    #[serde(rename = "recordings")]
    Recordings { recordings: Vec<Recording> },
    #[serde(rename = "replay:started", rename_all = "camelCase")]
    ReplayStarted { replay_id: String, recording_id: String },
    #[serde(rename = "replay", rename_all = "camelCase")]
    Replay { replay_id: String, event: ReplayEvent },
    #[serde(rename = "error")]
    Error { message: String },
}

/// Owns the store, keyring, recorder and replay manager for one data dir.
pub struct Service {
    store: Arc<dyn MetadataStore>,
    keyring: Arc<Keyring>,
    registry: Arc<Registry>,
    recorder: Arc<Recorder>,
    replays: ReplayManager,
    events: mpsc::Sender<UiEvent>,
    capture_input_default: bool,
    encrypt_default: bool,
}

impl Service {
    /// Open the JSON store under `config.data_dir`.
    pub fn open(config: &Config, events: mpsc::Sender<UiEvent>) -> TermrecResult<Self> {
        let store = Arc::new(JsonStore::open(config.store_path())?);
        Ok(Self::with_store(config, store, KdfParams::default(), events))
    }

    pub fn with_store(
        config: &Config,
        store: Arc<dyn MetadataStore>,
        kdf: KdfParams,
        events: mpsc::Sender<UiEvent>,
    ) -> Self {
        let registry = Arc::new(Registry::new());
        let keyring = Arc::new(Keyring::with_params(store.clone(), kdf));
        let recorder = Arc::new(Recorder::new(
            store.clone(),
            keyring.clone(),
            registry.clone(),
            config.recordings_dir(),
        ));
        let replays =
            ReplayManager::new(store.clone(), keyring.clone(), registry.clone(), config.replay);
        Self {
            store,
            keyring,
            registry,
            recorder,
            replays,
            events,
            capture_input_default: config.capture_input,
            encrypt_default: config.encrypt,
        }
    }

    pub fn recorder(&self) -> &Arc<Recorder> {
        &self.recorder
    }

    pub fn replays(&self) -> &ReplayManager {
        &self.replays
    }

    pub fn keyring(&self) -> &Keyring {
        &self.keyring
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn store(&self) -> &Arc<dyn MetadataStore> {
        &self.store
    }

    /// Run a command, reporting failures as an `error` event as well.
    pub async fn handle(&self, cmd: UiCommand) {
        if let Err(e) = self.dispatch(cmd).await {
            error!(error = %e, "command failed");
            self.emit(UiEvent::Error {
                message: e.to_string(),
            })
            .await;
        }
    }

    pub async fn dispatch(&self, cmd: UiCommand) -> TermrecResult<()> {
        debug!(?cmd, "dispatch");
        match cmd {
            UiCommand::Start {
                session_id,
                session_name,
                session_type,
                cols,
                rows,
                capture_input,
                encrypt,
                passphrase,
            } => {
                let mut opts = StartOptions::new(session_id, cols, rows);
                if let Some(name) = session_name {
                    opts.session_name = name;
                }
                if let Some(kind) = session_type {
                    opts.session_type = kind;
                }
                opts.capture_input = capture_input.unwrap_or(self.capture_input_default);
                opts.encrypt = encrypt.unwrap_or(self.encrypt_default);
                opts.passphrase = passphrase;
                let session_id = opts.session_id.clone();

                let outcome = self.start_recording(opts).await?;
                if let StartOutcome::Started { recording, warning } = outcome {
                    self.emit(UiEvent::Started {
                        session_id,
                        recording,
                        warning,
                    })
                    .await;
                }
            }
            UiCommand::Stop { session_id } => {
                if let Some(recording) = self.recorder.stop(&session_id)? {
                    self.emit(UiEvent::Stopped {
                        session_id,
                        recording,
                    })
                    .await;
                    self.emit_list().await?;
                }
            }
            UiCommand::List => self.emit_list().await?,
            UiCommand::Delete { recording_id } => {
                self.delete_recording(&recording_id)?;
                self.emit_list().await?;
            }
            UiCommand::ReplayStart {
                recording_id,
                passphrase,
                use_identity,
                speed,
            } => {
                let source = match (passphrase, use_identity) {
                    (_, true) => Some(KeySource::LocalIdentity),
                    (Some(p), false) => Some(KeySource::Passphrase(p)),
                    (None, false) => None,
                };
                let replay_id = self.start_replay(&recording_id, source, speed).await?;
                self.emit(UiEvent::ReplayStarted {
                    replay_id,
                    recording_id,
                })
                .await;
            }
            UiCommand::ReplayStop { replay_id } => self.replays.stop(&replay_id)?,
            UiCommand::ReplayPause { replay_id } => self.replays.pause(&replay_id)?,
            UiCommand::ReplayResume { replay_id } => self.replays.resume(&replay_id)?,
            UiCommand::ReplayRewind { replay_id } => self.replays.rewind(&replay_id)?,
            UiCommand::ReplaySeek {
                replay_id,
                target_ns,
            } => self.replays.seek(&replay_id, target_ns)?,
            UiCommand::ReplaySetSpeed { replay_id, speed } => {
                self.replays.set_speed(&replay_id, speed)?
            }
        }
        Ok(())
    }

    /// Start a recording on the blocking pool; key derivation can take a while.
    pub async fn start_recording(&self, opts: StartOptions) -> TermrecResult<StartOutcome> {
        let recorder = self.recorder.clone();
        tokio::task::spawn_blocking(move || recorder.start(opts))
            .await
            .map_err(|e| TermrecError::Other(format!("recording start task failed: {e}")))?
    }

    /// Start a replay whose events are forwarded to the UI channel.
    pub async fn start_replay(
        &self,
        recording_id: &str,
        source: Option<KeySource>,
        speed: Option<f64>,
    ) -> TermrecResult<String> {
        let (tx, mut rx) = mpsc::channel::<ReplayUpdate>(REPLAY_EVENT_BUFFER);
        let replay_id = self.replays.start(recording_id, source, speed, tx).await?;

        let events = self.events.clone();
        tokio::spawn(async move {
            while let Some(update) = rx.recv().await {
                let event = UiEvent::Replay {
                    replay_id: update.replay_id,
                    event: update.event,
                };
                if events.send(event).await.is_err() {
                    break;
                }
            }
        });
        Ok(replay_id)
    }

    pub fn list_recordings(&self) -> TermrecResult<Vec<Recording>> {
        self.store.list_recordings()
    }

    /// Look a recording up by id or unique id prefix.
    pub fn find_recording(&self, id_or_prefix: &str) -> TermrecResult<Recording> {
        let all = self.store.list_recordings()?;
        let ids: Vec<&str> = all.iter().map(|r| r.id.as_str()).collect();
        let id = match resolve_prefix(id_or_prefix, &ids) {
            Ok(Some(id)) => id.to_string(),
            Ok(None) => return Err(TermrecError::NotFound(format!("recording {id_or_prefix}"))),
            Err(matches) => {
                return Err(TermrecError::InvalidInput(format!(
                    "recording prefix {id_or_prefix} is ambiguous ({} matches)",
                    matches.len()
                )))
            }
        };
        all.into_iter()
            .find(|r| r.id == id)
            .ok_or_else(|| TermrecError::NotFound(format!("recording {id_or_prefix}")))
    }

    /// Remove a finished recording: its rows and its file.
    pub fn delete_recording(&self, recording_id: &str) -> TermrecResult<Recording> {
        if self.recorder.is_active_recording(recording_id) {
            return Err(TermrecError::InvalidInput(format!(
                "recording {recording_id} is still active"
            )));
        }
        let recording = self
            .store
            .delete_recording(recording_id)?
            .ok_or_else(|| TermrecError::NotFound(format!("recording {recording_id}")))?;
        match std::fs::remove_file(&recording.path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        info!(recording_id, "recording deleted");
        Ok(recording)
    }

    /// Resolve the file key (if any) for `recording`.
    pub fn file_key(
        &self,
        recording: &Recording,
        source: Option<&KeySource>,
    ) -> TermrecResult<Option<SecretKey>> {
        self.keyring.resolve(recording, source)
    }

    /// Decode a recording end to end and summarize it.
    pub fn inspect(
        &self,
        recording: &Recording,
        source: Option<&KeySource>,
    ) -> TermrecResult<RecordingSummary> {
        let key = self.file_key(recording, source)?;
        inspect_recording(&recording.path, key.as_ref())
    }

    /// Stop all recordings and replays.
    pub fn shutdown(&self) {
        let stopped = self.recorder.stop_all();
        self.replays.stop_all();
        info!(recordings = stopped.len(), "service shut down");
    }

    async fn emit_list(&self) -> TermrecResult<()> {
        let recordings = self.store.list_recordings()?;
        self.emit(UiEvent::Recordings { recordings }).await;
        Ok(())
    }

    async fn emit(&self, event: UiEvent) {
        if self.events.send(event).await.is_err() {
            debug!("ui event channel closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commands_parse_from_tagged_json() {
        let json = r#"{"type":"start","sessionId":"s1","cols":80,"rows":24,
            "encrypt":true,"passphrase":"pw"}"#;
        let cmd: UiCommand = serde_json::from_str(json).unwrap();
        match cmd {
            UiCommand::Start {
                session_id,
                encrypt,
                passphrase,
                capture_input,
                ..
            } => {
                assert_eq!(session_id, "s1");
                assert_eq!(encrypt, Some(true));
                assert_eq!(capture_input, None);
                assert_eq!(passphrase.unwrap().as_bytes(), b"pw");
            }
            other => panic!("unexpected {other:?}"),
        }

        let json = r#"{"type":"replay:setSpeed","replayId":"r","speed":2.5}"#;
        let cmd: UiCommand = serde_json::from_str(json).unwrap();
        assert!(matches!(cmd, UiCommand::ReplaySetSpeed { speed, .. } if speed == 2.5));

        let json = r#"{"type":"replay:seek","replayId":"r","targetNs":1000}"#;
        let cmd: UiCommand = serde_json::from_str(json).unwrap();
        assert!(matches!(cmd, UiCommand::ReplaySeek { target_ns: 1000, .. }));
    }

    #[test]
    fn command_debug_hides_passphrase() {
        let json = r#"{"type":"replay:start","recordingId":"x","passphrase":"hunter2"}"#;
        let cmd: UiCommand = serde_json::from_str(json).unwrap();
        assert!(!format!("{cmd:?}").contains("hunter2"));
    }

    #[test]
    fn events_serialize_with_type_tag() {
        let json = serde_json::to_value(UiEvent::ReplayStarted {
            replay_id: "r".into(),
            recording_id: "x".into(),
        })
        .unwrap();
        assert_eq!(
            json,
            serde_json::json!({"type": "replay:started", "replayId": "r", "recordingId": "x"})
        );

        let json = serde_json::to_value(UiEvent::Replay {
            replay_id: "r".into(),
            event: ReplayEvent::Resize { cols: 100, rows: 30 },
        })
        .unwrap();
        assert_eq!(json["event"], serde_json::json!({"type": "resize", "cols": 100, "rows": 30}));
    }
}
