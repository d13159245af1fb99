//! `termrec share`, `revoke`, `recipients`.

use anyhow::{Context, Result};
use termrec_session::store::now_ms;
use termrec_session::Service;

use super::{format_age, prompt_passphrase, rule};

pub fn run_share(service: &Service, id: &str, recipient: &str) -> Result<()> {
    let recording = service.find_recording(id)?;
    if !recording.encrypted {
        anyhow::bail!("recording {} is not encrypted; there is nothing to share", recording.id);
    }
    let passphrase = prompt_passphrase("Passphrase", false, false)?;
    service
        .keyring()
        .share(&recording.id, recipient, &passphrase)
        .with_context(|| format!("failed to share {} with '{recipient}'", recording.id))?;
    println!("Shared {} with '{recipient}'", recording.id);
    Ok(())
}

pub fn run_revoke(service: &Service, id: &str, recipient: &str) -> Result<()> {
    let recording = service.find_recording(id)?;
    service.keyring().revoke(&recording.id, recipient)?;
    println!("Revoked '{recipient}' from {}", recording.id);
    println!("Note: anyone who already holds the file key can still decrypt it.");
    Ok(())
}

pub fn run_recipients(service: &Service, id: &str) -> Result<()> {
    let recording = service.find_recording(id)?;
    let rows = service.keyring().recipients(&recording.id)?;
    if rows.is_empty() {
        println!("Recording {} is not shared.", recording.id);
        return Ok(());
    }

    let now = now_ms();
    println!("{:<16} {}", "RECIPIENT", "SHARED");
    println!("{:<16} {}", rule(9), rule(6));
    for row in &rows {
        println!("{:<16} {}", row.recipient_name, format_age(row.created_at, now));
    }
    Ok(())
}
