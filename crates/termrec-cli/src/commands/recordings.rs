//! `termrec list`, `termrec info ID`, `termrec delete ID`.

use anyhow::{Context, Result};
use termrec_session::store::now_ms;
use termrec_session::Service;

use super::{format_age, format_duration_ms, format_size, key_source, rule};

pub fn run_list(service: &Service) -> Result<()> {
    let recordings = service.list_recordings().context("failed to list recordings")?;
    if recordings.is_empty() {
        println!("No recordings. Run `termrec record` to make one.");
        return Ok(());
    }

    let now = now_ms();
    println!(
        "{:<12} {:<20} {:<10} {:<10} {:<10} {}",
        "ID", "NAME", "STARTED", "LENGTH", "SIZE", "ENC"
    );
    println!(
        "{:<12} {:<20} {:<10} {:<10} {:<10} {}",
        rule(2),
        rule(4),
        rule(7),
        rule(6),
        rule(4),
        rule(3)
    );
    for rec in &recordings {
        let length = match rec.ended_at {
            Some(end) => format_duration_ms(end.saturating_sub(rec.started_at)),
            None => "recording".to_string(),
        };
        println!(
            "{:<12} {:<20} {:<10} {:<10} {:<10} {}",
            &rec.id[..rec.id.len().min(12)],
            truncate(&rec.session_name, 20),
            format_age(rec.started_at, now),
            length,
            format_size(rec.size),
            if rec.encrypted { "yes" } else { "no" }
        );
    }
    println!("\n{} recording(s).", recordings.len());
    Ok(())
}

pub fn run_info(service: &Service, id: &str, use_identity: bool) -> Result<()> {
    let recording = service.find_recording(id)?;
    let source = key_source(&recording, use_identity)?;
    let summary = service
        .inspect(&recording, source.as_ref())
        .with_context(|| format!("failed to read recording {}", recording.id))?;

    println!("Recording   {}", recording.id);
    println!("  Name:       {}", recording.session_name);
    println!("  Session:    {} ({})", recording.backend_session_id, recording.session_type);
    println!("  Format:     {}", recording.format);
    println!("  Path:       {}", recording.path.display());
    println!("  Size:       {}", format_size(recording.size));
    println!("  Terminal:   {}x{}", summary.header.cols, summary.header.rows);
    println!("  Duration:   {}", format_duration_ms(summary.duration_ns / 1_000_000));
    println!(
        "  Events:     {} output, {} input, {} resize",
        summary.output_events, summary.input_events, summary.resize_events
    );
    println!("  Payload:    {}", format_size(summary.payload_bytes));
    let input = if summary.header.capture_input() {
        "captured"
    } else {
        "not captured"
    };
    println!("  Input:      {input}");
    if recording.encrypted {
        let recipients = service.keyring().recipients(&recording.id)?;
        println!("  Encrypted:  yes, shared with {}", recipients.len());
    }
    if recording.ended_at.is_none() {
        println!("  (still recording)");
    }
    Ok(())
}

pub fn run_delete(service: &Service, id: &str) -> Result<()> {
    let recording = service.find_recording(id)?;
    let removed = service
        .delete_recording(&recording.id)
        .with_context(|| format!("failed to delete recording {}", recording.id))?;
    println!("Deleted recording {} ({})", removed.id, removed.session_name);
    Ok(())
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let mut out: String = s.chars().take(max.saturating_sub(3)).collect();
        out.push_str("...");
        out
    }
}
