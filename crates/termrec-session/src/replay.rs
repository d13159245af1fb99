//! Timed replay of recordings.
//!
//! Each replay is one tokio task. A blocking worker decodes (and decrypts)
//! the file into a bounded read-ahead channel; the task paces events by
//! their deltas divided by the current speed. Rewind and seek restart the
//! worker from the top of the file; seek then fast-forwards without delay.
//!
//! State machine: `Starting -> Playing <-> Paused -> Ended`, with
//! `Rewinding`/`Seeking` while the stream is being reopened.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use termrec_core::{
    ChunkReader, Decoder, Event, EventKind, Header, SecretKey, TermrecError, TermrecResult,
};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

use crate::config::ReplaySettings;
use crate::keyring::{KeySource, Keyring};
use crate::registry::Registry;
use crate::store::{new_id, MetadataStore, Recording};

/// How long the final `ended` event may wait on a stalled consumer.
const ENDED_SEND_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ReplayState {
    Starting,
    Playing,
    Paused,
    Rewinding,
    Seeking,
    Ended,
}

/// Control messages accepted by a running replay.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ReplayCommand {
    Pause,
    Resume,
    Rewind,
    /// Jump to this many nanoseconds of recording time.
    Seek(u64),
    SetSpeed(f64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EndReason {
    Finished,
    Stopped,
    Error,
}

/// What a replay emits, in order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ReplayEvent {
    /// Sent at start and again on every rewind/seek; reset the terminal.
    #[serde(rename_all = "camelCase")]
    Header {
        cols: u16,
        rows: u16,
        start_ns: i64,
        capture_input: bool,
    },
    #[serde(rename_all = "camelCase")]
    Meta { recording: Recording, total_ns: u64 },
    #[serde(rename_all = "camelCase")]
    Progress { elapsed_ns: u64, total_ns: u64 },
    Output {
        #[serde(with = "termrec_core::b64")]
        data: Vec<u8>,
    },
    Resize { cols: u16, rows: u16 },
    Ended {
        reason: EndReason,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

/// A [`ReplayEvent`] tagged with the replay that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplayUpdate {
    pub replay_id: String,
    pub event: ReplayEvent,
}

/// Whole-file statistics, gathered in one decoding pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordingSummary {
    pub header: Header,
    pub output_events: u64,
    pub input_events: u64,
    pub resize_events: u64,
    pub payload_bytes: u64,
    /// Sum of all event deltas.
    pub duration_ns: u64,
}

/// Open a recording file for decoding, decrypting if `key` is given.
pub fn open_recording(
    path: &Path,
    key: Option<&SecretKey>,
) -> TermrecResult<Decoder<Box<dyn Read + Send>>> {
    let file = BufReader::new(File::open(path)?);
    let reader: Box<dyn Read + Send> = match key {
        Some(k) => Box::new(ChunkReader::new(file, k)?),
        None => Box::new(file),
    };
    Ok(Decoder::new(reader))
}

/// Decode a whole recording and summarize it.
pub fn inspect_recording(path: &Path, key: Option<&SecretKey>) -> TermrecResult<RecordingSummary> {
    let mut decoder = open_recording(path, key)?;
    let header = decoder.read_header()?;
    let mut summary = RecordingSummary {
        header,
        output_events: 0,
        input_events: 0,
        resize_events: 0,
        payload_bytes: 0,
        duration_ns: 0,
    };
    let mut buf = Vec::new();
    while let Some(event) = decoder.read_event(buf)? {
        summary.duration_ns = summary.duration_ns.saturating_add(event.delta_ns);
        summary.payload_bytes += event.payload.len() as u64;
        match event.kind {
            EventKind::Output => summary.output_events += 1,
            EventKind::Input => summary.input_events += 1,
            EventKind::Resize => summary.resize_events += 1,
        }
        buf = event.payload;
    }
    Ok(summary)
}

/// Registry entry for a running replay.
pub(crate) struct ReplayHandle {
    commands: mpsc::Sender<ReplayCommand>,
    /// Taken on first stop.
    stop: Option<oneshot::Sender<()>>,
    state: watch::Receiver<ReplayState>,
}

pub struct ReplayManager {
    store: Arc<dyn MetadataStore>,
    keyring: Arc<Keyring>,
    registry: Arc<Registry>,
    settings: ReplaySettings,
}

impl ReplayManager {
    pub fn new(
        store: Arc<dyn MetadataStore>,
        keyring: Arc<Keyring>,
        registry: Arc<Registry>,
        settings: ReplaySettings,
    ) -> Self {
        Self {
            store,
            keyring,
            registry,
            settings,
        }
    }

    /// Start replaying `recording_id`, sending everything it emits to
    /// `events`. Unknown recordings and bad keys fail here, before any
    /// replay exists. `speed` defaults to the configured one.
    pub async fn start(
        &self,
        recording_id: &str,
        source: Option<KeySource>,
        speed: Option<f64>,
        events: mpsc::Sender<ReplayUpdate>,
    ) -> TermrecResult<String> {
        let speed = speed.unwrap_or(self.settings.default_speed);
        validate_speed(speed)?;
        let recording = self
            .store
            .get_recording(recording_id)?
            .ok_or_else(|| TermrecError::NotFound(format!("recording {recording_id}")))?;
        if !recording.path.exists() {
            return Err(TermrecError::NotFound(format!(
                "recording file {}",
                recording.path.display()
            )));
        }

        // Argon2 is deliberately slow; keep it off the runtime threads.
        let keyring = self.keyring.clone();
        let row = recording.clone();
        let file_key = tokio::task::spawn_blocking(move || keyring.resolve(&row, source.as_ref()))
            .await
            .map_err(|e| TermrecError::Other(format!("key resolution task failed: {e}")))??;

        let replay_id = new_id();
        let (cmd_tx, cmd_rx) = mpsc::channel(self.settings.command_buffer);
        let (stop_tx, stop_rx) = oneshot::channel();
        let (state_tx, state_rx) = watch::channel(ReplayState::Starting);

        self.registry.replays()?.insert(
            replay_id.clone(),
            ReplayHandle {
                commands: cmd_tx,
                stop: Some(stop_tx),
                state: state_rx,
            },
        );
        info!(replay_id = %replay_id, recording_id = %recording.id, "replay started");

        let playback = Playback {
            replay_id: replay_id.clone(),
            recording,
            file_key,
            settings: self.settings,
            speed,
            paused: false,
            total_ns: 0,
            elapsed_ns: 0,
            last_progress: Instant::now(),
            commands: cmd_rx,
            stop: stop_rx,
            events,
            state: state_tx,
        };
        let registry = self.registry.clone();
        tokio::spawn(playback.run(registry));

        Ok(replay_id)
    }

    pub fn pause(&self, replay_id: &str) -> TermrecResult<()> {
        self.command(replay_id, ReplayCommand::Pause)
    }

    pub fn resume(&self, replay_id: &str) -> TermrecResult<()> {
        self.command(replay_id, ReplayCommand::Resume)
    }

    pub fn rewind(&self, replay_id: &str) -> TermrecResult<()> {
        self.command(replay_id, ReplayCommand::Rewind)
    }

    pub fn seek(&self, replay_id: &str, target_ns: u64) -> TermrecResult<()> {
        self.command(replay_id, ReplayCommand::Seek(target_ns))
    }

    /// Applies to waits that start after the change.
    pub fn set_speed(&self, replay_id: &str, speed: f64) -> TermrecResult<()> {
        validate_speed(speed)?;
        self.command(replay_id, ReplayCommand::SetSpeed(speed))
    }

    /// Queue a command. A full command buffer drops it.
    pub fn command(&self, replay_id: &str, cmd: ReplayCommand) -> TermrecResult<()> {
        let replays = self.registry.replays()?;
        let handle = replays
            .get(replay_id)
            .ok_or_else(|| TermrecError::NotFound(format!("replay {replay_id}")))?;
        match handle.commands.try_send(cmd) {
            Ok(()) => {
                debug!(replay_id, ?cmd, "replay command queued");
                Ok(())
            }
            Err(TrySendError::Full(cmd)) => {
                warn!(replay_id, ?cmd, "replay command buffer full, dropping command");
                Ok(())
            }
            Err(TrySendError::Closed(_)) => {
                Err(TermrecError::NotFound(format!("replay {replay_id}")))
            }
        }
    }

    /// Ask a replay to stop. Idempotent while the replay is winding down.
    pub fn stop(&self, replay_id: &str) -> TermrecResult<()> {
        let mut replays = self.registry.replays()?;
        let handle = replays
            .get_mut(replay_id)
            .ok_or_else(|| TermrecError::NotFound(format!("replay {replay_id}")))?;
        if let Some(tx) = handle.stop.take() {
            let _ = tx.send(());
            debug!(replay_id, "replay stop requested");
        }
        Ok(())
    }

    pub fn stop_all(&self) {
        if let Ok(mut replays) = self.registry.replays() {
            for handle in replays.values_mut() {
                if let Some(tx) = handle.stop.take() {
                    let _ = tx.send(());
                }
            }
        }
    }

    pub fn state(&self, replay_id: &str) -> Option<ReplayState> {
        let replays = self.registry.replays().ok()?;
        replays.get(replay_id).map(|h| *h.state.borrow())
    }
}

pub fn validate_speed(speed: f64) -> TermrecResult<()> {
    if speed.is_finite() && speed > 0.0 {
        Ok(())
    } else {
        Err(TermrecError::InvalidInput(format!(
            "speed must be a positive finite number, got {speed}"
        )))
    }
}

/// Why the current pass over the stream stopped early.
enum Interrupt {
    Stop,
    /// Reopen and fast-forward to this position.
    Restart(u64),
    Fail(TermrecError),
}

impl From<TermrecError> for Interrupt {
    fn from(e: TermrecError) -> Self {
        Interrupt::Fail(e)
    }
}

enum Item {
    Header(Header),
    Event(Event),
}

type ItemRx = mpsc::Receiver<TermrecResult<Item>>;

struct Playback {
    replay_id: String,
    recording: Recording,
    file_key: Option<SecretKey>,
    settings: ReplaySettings,
    speed: f64,
    paused: bool,
    total_ns: u64,
    elapsed_ns: u64,
    last_progress: Instant,
    commands: mpsc::Receiver<ReplayCommand>,
    stop: oneshot::Receiver<()>,
    events: mpsc::Sender<ReplayUpdate>,
    state: watch::Sender<ReplayState>,
}

impl Playback {
    async fn run(mut self, registry: Arc<Registry>) {
        let outcome = match self.prescan().await {
            Ok(total) => {
                self.total_ns = total;
                self.play().await
            }
            Err(e) => Err(Interrupt::Fail(e)),
        };

        let (reason, error) = match outcome {
            Ok(()) => (EndReason::Finished, None),
            Err(Interrupt::Stop) => (EndReason::Stopped, None),
            Err(Interrupt::Fail(e)) => {
                warn!(replay_id = %self.replay_id, error = %e, "replay failed");
                (EndReason::Error, Some(e.to_string()))
            }
            Err(Interrupt::Restart(_)) => {
                (EndReason::Error, Some("restart escaped playback".into()))
            }
        };

        self.set_state(ReplayState::Ended);
        if let Ok(mut replays) = registry.replays() {
            replays.remove(&self.replay_id);
        }
        info!(replay_id = %self.replay_id, ?reason, "replay ended");

        let update = ReplayUpdate {
            replay_id: self.replay_id.clone(),
            event: ReplayEvent::Ended { reason, error },
        };
        let _ = self.events.send_timeout(update, ENDED_SEND_TIMEOUT).await;
    }

    /// Sum every delta once, for progress reporting.
    async fn prescan(&self) -> TermrecResult<u64> {
        let path = self.recording.path.clone();
        let key = self.file_key.clone();
        tokio::task::spawn_blocking(move || inspect_recording(&path, key.as_ref()))
            .await
            .map_err(|e| TermrecError::Other(format!("prescan task failed: {e}")))?
            .map(|s| s.duration_ns)
    }

    async fn play(&mut self) -> Result<(), Interrupt> {
        let mut target = 0;
        let mut first = true;
        loop {
            match self.pass(target, first).await {
                Err(Interrupt::Restart(t)) => {
                    debug!(replay_id = %self.replay_id, target_ns = t, "replay restarting");
                    target = t;
                    first = false;
                }
                other => return other,
            }
        }
    }

    /// One pass over the stream from the top, fast-forwarding to `target`.
    async fn pass(&mut self, target: u64, first: bool) -> Result<(), Interrupt> {
        let mut rx = self.open_stream();
        let header = match self.next_item(&mut rx).await? {
            Some(Item::Header(h)) => h,
            _ => return Err(TermrecError::CorruptStream("missing header".into()).into()),
        };

        self.paused = false;
        self.elapsed_ns = 0;
        self.emit(ReplayEvent::Header {
            cols: header.cols,
            rows: header.rows,
            start_ns: header.start_ns,
            capture_input: header.capture_input(),
        })
        .await?;
        if first {
            self.emit(ReplayEvent::Meta {
                recording: self.recording.clone(),
                total_ns: self.total_ns,
            })
            .await?;
        }

        let mut carried = None;
        while target > 0 {
            let Some(event) = self.next_event(&mut rx).await? else {
                // Seeked past the end.
                self.progress().await?;
                return Ok(());
            };
            let at = self.elapsed_ns.saturating_add(event.delta_ns);
            if at > target {
                carried = Some(Event {
                    delta_ns: at - target,
                    ..event
                });
                self.elapsed_ns = target;
                break;
            }
            self.elapsed_ns = at;
            self.surface(event).await?;
        }

        self.set_state(ReplayState::Playing);
        self.progress().await?;

        loop {
            let event = match carried.take() {
                Some(e) => e,
                None => match self.next_event(&mut rx).await? {
                    Some(e) => e,
                    None => break,
                },
            };
            self.wait(event.delta_ns).await?;
            self.elapsed_ns = self.elapsed_ns.saturating_add(event.delta_ns);
            self.surface(event).await?;
            if self.last_progress.elapsed() >= self.settings.progress_interval {
                self.progress().await?;
            }
        }

        self.progress().await
    }

    /// Spawn a decoder worker feeding the read-ahead channel. Dropping the
    /// receiver stops the worker.
    fn open_stream(&self) -> ItemRx {
        let (tx, rx) = mpsc::channel(self.settings.readahead);
        let path = self.recording.path.clone();
        let key = self.file_key.clone();
        tokio::task::spawn_blocking(move || {
            let mut decoder = match open_recording(&path, key.as_ref()) {
                Ok(d) => d,
                Err(e) => {
                    let _ = tx.blocking_send(Err(e));
                    return;
                }
            };
            let header = decoder.read_header().map(Item::Header);
            let failed = header.is_err();
            if tx.blocking_send(header).is_err() || failed {
                return;
            }
            loop {
                let item = match decoder.read_event(Vec::new()) {
                    Ok(Some(event)) => Ok(Item::Event(event)),
                    Ok(None) => return,
                    Err(e) => Err(e),
                };
                let failed = item.is_err();
                if tx.blocking_send(item).is_err() || failed {
                    return;
                }
            }
        });
        rx
    }

    async fn next_item(&mut self, rx: &mut ItemRx) -> Result<Option<Item>, Interrupt> {
        tokio::select! {
            biased;
            _ = &mut self.stop => Err(Interrupt::Stop),
            item = rx.recv() => match item {
                None => Ok(None),
                Some(Ok(item)) => Ok(Some(item)),
                Some(Err(e)) => Err(Interrupt::Fail(e)),
            },
        }
    }

    async fn next_event(&mut self, rx: &mut ItemRx) -> Result<Option<Event>, Interrupt> {
        match self.next_item(rx).await? {
            Some(Item::Event(e)) => Ok(Some(e)),
            Some(Item::Header(_)) => {
                Err(TermrecError::CorruptStream("duplicate header".into()).into())
            }
            None => Ok(None),
        }
    }

    /// Sleep for `delta_ns` of recording time at the current speed, handling
    /// commands and emitting progress meanwhile. A pause keeps whatever is
    /// left of the wait for when playback resumes.
    async fn wait(&mut self, delta_ns: u64) -> Result<(), Interrupt> {
        let speed = self.speed;
        let mut remaining_ns = delta_ns;

        loop {
            if self.paused {
                tokio::select! {
                    biased;
                    _ = &mut self.stop => return Err(Interrupt::Stop),
                    cmd = self.commands.recv() => self.handle(cmd)?,
                }
                continue;
            }

            let started = Instant::now();
            let deadline = started + scaled(remaining_ns, speed);
            let progress_at = self.last_progress + self.settings.progress_interval;

            tokio::select! {
                biased;
                _ = &mut self.stop => return Err(Interrupt::Stop),
                cmd = self.commands.recv() => {
                    remaining_ns -= consumed_ns(started, speed, remaining_ns);
                    self.handle(cmd)?;
                }
                _ = sleep_until(deadline) => return Ok(()),
                _ = sleep_until(progress_at) => {
                    remaining_ns -= consumed_ns(started, speed, remaining_ns);
                    let at = self.elapsed_ns.saturating_add(delta_ns - remaining_ns);
                    self.emit_progress(at).await?;
                }
            }
        }
    }

    fn handle(&mut self, cmd: Option<ReplayCommand>) -> Result<(), Interrupt> {
        let Some(cmd) = cmd else {
            return Err(Interrupt::Stop);
        };
        debug!(replay_id = %self.replay_id, ?cmd, "replay command");
        match cmd {
            ReplayCommand::Pause => {
                self.paused = true;
                self.set_state(ReplayState::Paused);
            }
            ReplayCommand::Resume => {
                if self.paused {
                    self.paused = false;
                    self.set_state(ReplayState::Playing);
                }
            }
            ReplayCommand::Rewind => {
                self.set_state(ReplayState::Rewinding);
                return Err(Interrupt::Restart(0));
            }
            ReplayCommand::Seek(target) => {
                self.set_state(ReplayState::Seeking);
                return Err(Interrupt::Restart(target));
            }
            ReplayCommand::SetSpeed(speed) => {
                if validate_speed(speed).is_ok() {
                    self.speed = speed;
                }
            }
        }
        Ok(())
    }

    /// Emit output and resize events; input is never surfaced.
    async fn surface(&mut self, event: Event) -> Result<(), Interrupt> {
        let out = match event.kind {
            EventKind::Output => ReplayEvent::Output { data: event.payload },
            EventKind::Resize => match event.resize_dims() {
                Some((cols, rows)) => ReplayEvent::Resize { cols, rows },
                None => return Ok(()),
            },
            EventKind::Input => return Ok(()),
        };
        self.emit(out).await
    }

    async fn progress(&mut self) -> Result<(), Interrupt> {
        self.emit_progress(self.elapsed_ns).await
    }

    async fn emit_progress(&mut self, elapsed_ns: u64) -> Result<(), Interrupt> {
        self.last_progress = Instant::now();
        self.emit(ReplayEvent::Progress {
            elapsed_ns: elapsed_ns.min(self.total_ns),
            total_ns: self.total_ns,
        })
        .await
    }

    /// Send to the consumer, giving up if stopped while it is slow. A
    /// consumer that went away stops the replay.
    async fn emit(&mut self, event: ReplayEvent) -> Result<(), Interrupt> {
        let update = ReplayUpdate {
            replay_id: self.replay_id.clone(),
            event,
        };
        tokio::select! {
            biased;
            _ = &mut self.stop => Err(Interrupt::Stop),
            sent = self.events.send(update) => sent.map_err(|_| Interrupt::Stop),
        }
    }

    fn set_state(&self, state: ReplayState) {
        self.state.send_replace(state);
    }
}

fn scaled(delta_ns: u64, speed: f64) -> Duration {
    Duration::from_nanos((delta_ns as f64 / speed) as u64)
}

/// Recording time covered since `started`, capped at `remaining_ns`.
fn consumed_ns(started: Instant, speed: f64, remaining_ns: u64) -> u64 {
    let ns = started.elapsed().as_nanos() as f64 * speed;
    (ns as u64).min(remaining_ns)
}
