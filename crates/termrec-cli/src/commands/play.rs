//! `termrec play ID`: replay a recording to this terminal.
//!
//! Keys: space pause/resume, `r` rewind, `+`/`-` double/halve speed,
//! left/right seek 5s, `q` (or Esc, Ctrl+C) quit.

use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use termrec_core::TermrecResult;
use termrec_session::{EndReason, ReplayEvent, Service};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::key_source;
use crate::terminal::RawModeGuard;

const SEEK_STEP_NS: u64 = 5_000_000_000;
const MIN_SPEED: f64 = 1.0 / 16.0;
const MAX_SPEED: f64 = 64.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Control {
    TogglePause,
    Rewind,
    Faster,
    Slower,
    Back,
    Forward,
    Quit,
}

fn control_for(key: &KeyEvent) -> Option<Control> {
    if key.modifiers.contains(KeyModifiers::CONTROL) && key.code == KeyCode::Char('c') {
        return Some(Control::Quit);
    }
    match key.code {
        KeyCode::Char(' ') => Some(Control::TogglePause),
        KeyCode::Char('r') => Some(Control::Rewind),
        KeyCode::Char('+') | KeyCode::Char('=') => Some(Control::Faster),
        KeyCode::Char('-') => Some(Control::Slower),
        KeyCode::Left => Some(Control::Back),
        KeyCode::Right => Some(Control::Forward),
        KeyCode::Char('q') | KeyCode::Esc => Some(Control::Quit),
        _ => None,
    }
}

pub async fn run(
    service: &Service,
    id: &str,
    speed: Option<f64>,
    default_speed: f64,
    use_identity: bool,
) -> Result<()> {
    let recording = service.find_recording(id)?;
    let source = key_source(&recording, use_identity)?;

    let (tx, mut rx) = mpsc::channel(64);
    let replays = service.replays();
    let replay_id = replays
        .start(&recording.id, source, speed, tx)
        .await
        .with_context(|| format!("failed to start replay of {}", recording.id))?;

    let guard = RawModeGuard::enter()?;
    let done = Arc::new(AtomicBool::new(false));
    let (key_tx, mut keys) = mpsc::channel::<Control>(16);
    let input = tokio::task::spawn_blocking({
        let done = done.clone();
        move || read_keys(key_tx, done)
    });

    let mut speed = speed.unwrap_or(default_speed);
    let mut paused = false;
    let mut elapsed_ns = 0u64;
    let mut stdout = std::io::stdout();

    let ended: Result<(EndReason, Option<String>)> = async {
        loop {
            tokio::select! {
                update = rx.recv() => {
                    let Some(update) = update else {
                        return Err(anyhow!("replay ended without a final event"));
                    };
                    match update.event {
                        // Every pass starts over from a blank screen.
                        ReplayEvent::Header { .. } => {
                            stdout.write_all(b"\x1b[2J\x1b[H")?;
                            stdout.flush()?;
                        }
                        ReplayEvent::Meta { total_ns, .. } => debug!(total_ns, "replay meta"),
                        ReplayEvent::Progress { elapsed_ns: at, .. } => elapsed_ns = at,
                        ReplayEvent::Output { data } => {
                            stdout.write_all(&data)?;
                            stdout.flush()?;
                        }
                        ReplayEvent::Resize { cols, rows } => debug!(cols, rows, "recorded resize"),
                        ReplayEvent::Ended { reason, error } => return Ok((reason, error)),
                    }
                }
                Some(control) = keys.recv() => {
                    let res = match control {
                        Control::TogglePause => {
                            let res = if paused {
                                replays.resume(&replay_id)
                            } else {
                                replays.pause(&replay_id)
                            };
                            paused = !paused;
                            res
                        }
                        Control::Rewind => {
                            paused = false;
                            replays.rewind(&replay_id)
                        }
                        Control::Faster | Control::Slower => {
                            speed = next_speed(speed, control == Control::Faster);
                            replays.set_speed(&replay_id, speed)
                        }
                        Control::Back => {
                            paused = false;
                            replays.seek(&replay_id, elapsed_ns.saturating_sub(SEEK_STEP_NS))
                        }
                        Control::Forward => {
                            paused = false;
                            replays.seek(&replay_id, elapsed_ns.saturating_add(SEEK_STEP_NS))
                        }
                        Control::Quit => replays.stop(&replay_id),
                    };
                    report(control, res);
                }
            }
        }
    }
    .await;

    done.store(true, Ordering::Relaxed);
    let _ = input.await;
    drop(guard);

    let (reason, error) = ended?;
    println!();
    match reason {
        EndReason::Finished => println!("Replay finished."),
        EndReason::Stopped => println!("Replay stopped."),
        EndReason::Error => {
            anyhow::bail!("replay failed: {}", error.unwrap_or_else(|| "unknown error".into()))
        }
    }
    Ok(())
}

fn next_speed(speed: f64, faster: bool) -> f64 {
    let next = if faster { speed * 2.0 } else { speed / 2.0 };
    next.clamp(MIN_SPEED, MAX_SPEED)
}

/// Controls can race the end of the replay; that is not worth failing over.
fn report(control: Control, res: TermrecResult<()>) {
    if let Err(e) = res {
        warn!(?control, error = %e, "replay control failed");
    }
}

fn read_keys(tx: mpsc::Sender<Control>, done: Arc<AtomicBool>) {
    while !done.load(Ordering::Relaxed) {
        match event::poll(Duration::from_millis(100)) {
            Ok(true) => {}
            Ok(false) => continue,
            Err(e) => {
                warn!("terminal event error: {e}");
                break;
            }
        }
        match event::read() {
            Ok(Event::Key(key)) if key.kind == KeyEventKind::Press => {
                if let Some(control) = control_for(&key) {
                    if tx.blocking_send(control).is_err() {
                        break;
                    }
                }
            }
            Ok(_) => {}
            Err(e) => {
                warn!("terminal event error: {e}");
                break;
            }
        }
    }
}
