//! `termrec keys`, `keygen`, `import`, `export`, `forget`.
//!
//! There is at most one local identity (an RSA key pair); everything else in
//! the keyring is a recipient's public key imported under a name.

use std::path::Path;

use anyhow::{Context, Result};
use termrec_session::Service;
use tracing::info;

use super::rule;

pub fn run_list(service: &Service) -> Result<()> {
    let identities = service.keyring().identities().context("failed to list keys")?;
    if identities.is_empty() {
        println!("No keys. Run `termrec keygen <name>` to create your identity.");
        return Ok(());
    }

    println!("{:<16} {:<18} {}", "NAME", "FINGERPRINT", "KIND");
    println!("{:<16} {:<18} {}", rule(4), rule(11), rule(4));
    for id in &identities {
        println!(
            "{:<16} {:<18} {}",
            id.name,
            id.short_fingerprint,
            if id.is_local { "local" } else { "recipient" }
        );
    }
    println!("\n{} key(s) found.", identities.len());
    Ok(())
}

pub fn run_keygen(service: &Service, name: &str) -> Result<()> {
    let key = service
        .keyring()
        .generate_identity(name)
        .with_context(|| format!("failed to generate identity '{name}'"))?;
    let fingerprint = termrec_core::public_key_fingerprint(&key.public_key)?;
    info!(name, fingerprint = %fingerprint, "identity generated");

    println!("Generated RSA identity '{name}'");
    println!("  Fingerprint: {}", &fingerprint[..fingerprint.len().min(16)]);
    println!("Share your public key with `termrec export`.");
    Ok(())
}

pub fn run_import(service: &Service, name: &str, pem_file: &Path) -> Result<()> {
    let pem = std::fs::read_to_string(pem_file)
        .with_context(|| format!("failed to read {}", pem_file.display()))?;
    let key = service
        .keyring()
        .import_recipient(name, &pem)
        .with_context(|| format!("failed to import '{name}'"))?;
    let fingerprint = termrec_core::public_key_fingerprint(&key.public_key)?;
    println!("Imported recipient '{name}' ({})", &fingerprint[..fingerprint.len().min(16)]);
    Ok(())
}

pub fn run_export(service: &Service, name: Option<&str>) -> Result<()> {
    let pem = service.keyring().export_public(name)?;
    print!("{pem}");
    Ok(())
}

pub fn run_forget(service: &Service, name: &str) -> Result<()> {
    service.keyring().delete_identity(name)?;
    println!("Removed key '{name}'");
    Ok(())
}
