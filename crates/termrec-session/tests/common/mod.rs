#![allow(dead_code)]

use std::fs::File;
use std::io::BufWriter;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use termrec_core::{Encoder, EventKind, Header, KdfParams};
use termrec_session::store::new_id;
use termrec_session::{
    Config, JsonStore, Keyring, MetadataStore, Recording, RecordingFormat, Registry, ReplayEvent,
    ReplayManager, ReplaySettings, ReplayUpdate, Service, UiEvent,
};
use tokio::sync::mpsc;

pub const MS: u64 = 1_000_000;

/// `(delta_ns, kind, payload)` for [`write_recording`].
pub type Ev = (u64, EventKind, Vec<u8>);

pub fn out(delta_ns: u64, data: &[u8]) -> Ev {
    (delta_ns, EventKind::Output, data.to_vec())
}

pub fn inp(delta_ns: u64, data: &[u8]) -> Ev {
    (delta_ns, EventKind::Input, data.to_vec())
}

pub fn resize(delta_ns: u64, cols: u16, rows: u16) -> Ev {
    (delta_ns, EventKind::Resize, termrec_core::codec::encode_resize(cols, rows).to_vec())
}

pub struct Replays {
    pub dir: tempfile::TempDir,
    pub store: Arc<JsonStore>,
    pub registry: Arc<Registry>,
    pub manager: ReplayManager,
}

pub fn replays() -> Replays {
    replays_with(ReplaySettings::default())
}

pub fn replays_with(settings: ReplaySettings) -> Replays {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(JsonStore::in_memory());
    let keyring = Arc::new(Keyring::with_params(store.clone(), KdfParams::insecure_fast()));
    let registry = Arc::new(Registry::new());
    let manager = ReplayManager::new(
        store.clone(),
        keyring,
        registry.clone(),
        settings,
    );
    Replays {
        dir,
        store,
        registry,
        manager,
    }
}

/// Write a plaintext recording with explicit deltas and register its row.
pub fn write_recording(dir: &Path, store: &dyn MetadataStore, events: &[Ev]) -> Recording {
    let id = new_id();
    let path = dir.join(format!("{id}.termrec"));
    let file = BufWriter::new(File::create(&path).unwrap());
    let header = Header::new(1_700_000_000_000_000_000, 80, 24, false);
    let mut enc = Encoder::new(file, &header).unwrap();
    for (delta, kind, payload) in events {
        enc.write_event(*delta, *kind, payload).unwrap();
    }
    enc.flush().unwrap();
    drop(enc);

    let recording = Recording {
        id,
        backend_session_id: "fixture".into(),
        session_name: "fixture".into(),
        session_type: "pty".into(),
        started_at: 1,
        ended_at: Some(2),
        format: RecordingFormat::Termrec,
        size: std::fs::metadata(&path).unwrap().len(),
        path,
        encrypted: false,
        capture_input: false,
    };
    store.create_recording(&recording, None).unwrap();
    recording
}

pub async fn next(rx: &mut mpsc::Receiver<ReplayUpdate>) -> ReplayEvent {
    tokio::time::timeout(Duration::from_secs(10), rx.recv())
        .await
        .expect("timed out waiting for replay event")
        .expect("replay channel closed")
        .event
}

/// Skip progress events.
pub async fn next_significant(rx: &mut mpsc::Receiver<ReplayUpdate>) -> ReplayEvent {
    loop {
        match next(rx).await {
            ReplayEvent::Progress { .. } => continue,
            other => return other,
        }
    }
}

/// Collect everything up to and including `ended`.
pub async fn drain(rx: &mut mpsc::Receiver<ReplayUpdate>) -> Vec<ReplayEvent> {
    let mut out = Vec::new();
    loop {
        let ev = next(rx).await;
        let done = matches!(ev, ReplayEvent::Ended { .. });
        out.push(ev);
        if done {
            return out;
        }
    }
}

pub fn outputs(events: &[ReplayEvent]) -> Vec<u8> {
    events
        .iter()
        .filter_map(|e| match e {
            ReplayEvent::Output { data } => Some(data.as_slice()),
            _ => None,
        })
        .flatten()
        .copied()
        .collect()
}

pub struct Services {
    pub dir: tempfile::TempDir,
    pub service: Service,
    pub events: mpsc::Receiver<UiEvent>,
}

pub fn service() -> Services {
    let dir = tempfile::tempdir().unwrap();
    let config = Config::with_data_dir(dir.path());
    let (tx, events) = mpsc::channel(256);
    let service = Service::with_store(
        &config,
        Arc::new(JsonStore::in_memory()),
        KdfParams::insecure_fast(),
        tx,
    );
    Services { dir, service, events }
}

/// Next UI event for a replay, unwrapped.
pub async fn next_replay_event(rx: &mut mpsc::Receiver<UiEvent>) -> ReplayEvent {
    loop {
        let ev = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("timed out waiting for ui event")
            .expect("ui channel closed");
        if let UiEvent::Replay { event, .. } = ev {
            return event;
        }
    }
}

pub async fn drain_replay(rx: &mut mpsc::Receiver<UiEvent>) -> Vec<ReplayEvent> {
    let mut out = Vec::new();
    loop {
        let ev = next_replay_event(rx).await;
        let done = matches!(ev, ReplayEvent::Ended { .. });
        out.push(ev);
        if done {
            return out;
        }
    }
}
