//! `termrec record [-- CMD...]`: run a shell in a local PTY and record it.
//!
//! The PTY's output is copied to this terminal and into the recorder; local
//! keystrokes go to the PTY (and into the recording when input capture is
//! on); terminal resizes are applied to the PTY and recorded. Recording ends
//! when the child exits.

use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use crossterm::event::{self, Event, KeyEventKind};
use portable_pty::{native_pty_system, CommandBuilder, PtySize};
use termrec_session::{Recorder, Service, StartOptions, StartOutcome, StartWarning};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{format_size, prompt_passphrase};
use crate::terminal::{self as term, RawModeGuard};

pub struct RecordArgs {
    pub name: Option<String>,
    pub encrypt: bool,
    pub capture_input: bool,
    pub command: Vec<String>,
}

enum Input {
    Bytes(Vec<u8>),
    Resize(u16, u16),
}

pub async fn run(service: &Service, args: RecordArgs) -> Result<()> {
    let passphrase = if args.encrypt {
        Some(prompt_passphrase(
            "Recording passphrase (empty records unencrypted)",
            true,
            true,
        )?)
    } else {
        None
    };

    let (cols, rows) = term::size();
    let session_id = format!("local-{}", std::process::id());
    let mut opts = StartOptions::new(session_id.clone(), cols, rows);
    opts.session_name = args.name.unwrap_or_else(|| default_name(&args.command));
    opts.session_type = "pty".into();
    opts.capture_input = args.capture_input;
    opts.encrypt = args.encrypt;
    opts.passphrase = passphrase;

    let recording = match service.start_recording(opts).await? {
        StartOutcome::Started { recording, warning } => {
            if warning == Some(StartWarning::EncryptionDowngraded) {
                eprintln!("termrec: warning: no passphrase given, recording without encryption");
            }
            recording
        }
        StartOutcome::AlreadyActive { recording_id } => {
            anyhow::bail!("this session is already recording into {recording_id}")
        }
    };
    eprintln!(
        "Recording {} started{}. Exit the shell to finish.",
        recording.id,
        if recording.encrypted { " (encrypted)" } else { "" }
    );

    let recorder = service.recorder().clone();
    let pumped = pump(recorder, &session_id, &args.command, cols, rows).await;
    let finished = service
        .recorder()
        .stop(&session_id)
        .context("failed to finalize recording")?;
    pumped?;

    if let Some(rec) = finished {
        println!("Recording {} saved ({}).", rec.id, format_size(rec.size));
    }
    Ok(())
}

fn default_name(command: &[String]) -> String {
    match command.first() {
        Some(program) => command_basename(program),
        None => std::env::var("SHELL")
            .map(|s| command_basename(&s))
            .unwrap_or_else(|_| "shell".into()),
    }
}

fn command_basename(program: &str) -> String {
    program.rsplit('/').next().unwrap_or(program).to_string()
}

async fn pump(
    recorder: Arc<Recorder>,
    session_id: &str,
    command: &[String],
    cols: u16,
    rows: u16,
) -> Result<()> {
    let pair = native_pty_system()
        .openpty(pty_size(cols, rows))
        .map_err(|e| anyhow!("failed to open PTY: {e}"))?;

    let mut cmd = match command.split_first() {
        Some((program, rest)) => {
            let mut builder = CommandBuilder::new(program);
            builder.args(rest);
            builder
        }
        None => CommandBuilder::new(std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".into())),
    };
    if let Ok(dir) = std::env::current_dir() {
        cmd.cwd(dir);
    }
    cmd.env("TERMREC_SESSION", session_id);

    let mut child: Box<dyn portable_pty::Child + Send> = pair
        .slave
        .spawn_command(cmd)
        .map_err(|e| anyhow!("failed to spawn command: {e}"))?;
    drop(pair.slave);
    info!(session_id, cols, rows, "PTY spawned");

    let mut reader = pair
        .master
        .try_clone_reader()
        .map_err(|e| anyhow!("failed to clone PTY reader: {e}"))?;
    let mut writer = pair
        .master
        .take_writer()
        .map_err(|e| anyhow!("failed to take PTY writer: {e}"))?;
    let master = pair.master;

    let guard = RawModeGuard::enter()?;

    // PTY -> terminal + recording. Ends when the child closes the PTY.
    let out_recorder = recorder.clone();
    let out_session = session_id.to_string();
    let mut output = tokio::task::spawn_blocking(move || -> Result<()> {
        let mut stdout = std::io::stdout();
        let mut buf = [0u8; 8192];
        loop {
            let n = match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                // Linux reports EIO once the slave side is gone.
                Err(e) => {
                    debug!("PTY read ended: {e}");
                    break;
                }
            };
            stdout.write_all(&buf[..n])?;
            stdout.flush()?;
            out_recorder.append_output(&out_session, &buf[..n])?;
        }
        Ok(())
    });

    let done = Arc::new(AtomicBool::new(false));
    let (tx, mut rx) = mpsc::channel::<Input>(64);
    let input = tokio::task::spawn_blocking({
        let done = done.clone();
        move || read_terminal(tx, done)
    });

    let result: Result<()> = async {
        loop {
            tokio::select! {
                res = &mut output => {
                    return res.map_err(|e| anyhow!("output pump failed: {e}"))?;
                }
                Some(msg) = rx.recv() => match msg {
                    Input::Bytes(bytes) => {
                        writer.write_all(&bytes).context("failed to write to PTY")?;
                        writer.flush().context("failed to write to PTY")?;
                        recorder.append_input(session_id, &bytes)?;
                    }
                    Input::Resize(c, r) => {
                        master
                            .resize(pty_size(c, r))
                            .map_err(|e| anyhow!("failed to resize PTY: {e}"))?;
                        recorder.append_resize(session_id, c, r)?;
                    }
                },
            }
        }
    }
    .await;

    done.store(true, Ordering::Relaxed);
    let _ = input.await;
    reap(child.as_mut());
    drop(master);
    drop(guard);
    result
}

fn pty_size(cols: u16, rows: u16) -> PtySize {
    PtySize {
        rows,
        cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}

fn read_terminal(tx: mpsc::Sender<Input>, done: Arc<AtomicBool>) {
    while !done.load(Ordering::Relaxed) {
        match event::poll(Duration::from_millis(100)) {
            Ok(true) => {}
            Ok(false) => continue,
            Err(e) => {
                warn!("terminal event error: {e}");
                break;
            }
        }
        let msg = match event::read() {
            Ok(Event::Key(key)) if key.kind == KeyEventKind::Press => {
                match term::key_event_to_bytes(&key) {
                    Some(bytes) => Input::Bytes(bytes),
                    None => continue,
                }
            }
            Ok(Event::Resize(cols, rows)) => Input::Resize(cols, rows),
            Ok(_) => continue,
            Err(e) => {
                warn!("terminal event error: {e}");
                break;
            }
        };
        if tx.blocking_send(msg).is_err() {
            break;
        }
    }
}

fn reap(child: &mut (dyn portable_pty::Child + Send)) {
    match child.try_wait() {
        Ok(Some(status)) => debug!(?status, "child exited"),
        _ => {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}
