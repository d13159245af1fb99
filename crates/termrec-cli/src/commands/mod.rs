//! CLI subcommand implementations.

pub mod keys;
pub mod play;
pub mod record;
pub mod recordings;
pub mod share;

use anyhow::{Context, Result};
use dialoguer::Password;
use termrec_core::Passphrase;
use termrec_session::{KeySource, Recording};

/// Ask for a passphrase on the terminal. An empty answer is allowed only
/// when `allow_empty` is set.
pub fn prompt_passphrase(prompt: &str, confirm: bool, allow_empty: bool) -> Result<Passphrase> {
    let mut input = Password::new().with_prompt(prompt).allow_empty_password(allow_empty);
    if confirm {
        input = input.with_confirmation("Confirm passphrase", "Passphrases do not match");
    }
    let value = input.interact().context("failed to read passphrase")?;
    Ok(Passphrase::new(value))
}

/// How to open `recording`: nothing for plaintext, the local identity when
/// asked for, otherwise a prompted passphrase.
pub fn key_source(recording: &Recording, use_identity: bool) -> Result<Option<KeySource>> {
    if !recording.encrypted {
        return Ok(None);
    }
    if use_identity {
        return Ok(Some(KeySource::LocalIdentity));
    }
    let passphrase = prompt_passphrase("Passphrase", false, false)?;
    Ok(Some(KeySource::Passphrase(passphrase)))
}

pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

/// `1h02m03s`, `4m05s`, `6.7s`.
pub fn format_duration_ms(ms: u64) -> String {
    let secs = ms / 1000;
    let (h, m, s) = (secs / 3600, (secs / 60) % 60, secs % 60);
    if h > 0 {
        format!("{h}h{m:02}m{s:02}s")
    } else if m > 0 {
        format!("{m}m{s:02}s")
    } else {
        format!("{}.{}s", s, (ms % 1000) / 100)
    }
}

/// Coarse "how long ago" for a unix-millisecond timestamp.
pub fn format_age(then_ms: u64, now_ms: u64) -> String {
    let secs = now_ms.saturating_sub(then_ms) / 1000;
    match secs {
        0..=59 => format!("{secs}s ago"),
        60..=3599 => format!("{}m ago", secs / 60),
        3600..=86_399 => format!("{}h ago", secs / 3600),
        _ => format!("{}d ago", secs / 86_400),
    }
}

/// Table rule, sized to a header cell.
pub fn rule(width: usize) -> String {
    "\u{2500}".repeat(width)
}
