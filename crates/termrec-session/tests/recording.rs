mod common;

use std::io::BufReader;

use common::*;
use termrec_core::{Decoder, EventKind, Passphrase, TermrecError, HEADER_LEN};
use termrec_session::{
    EndReason, KeySource, RecordingFormat, ReplayEvent, StartOptions, StartOutcome, StartWarning,
    UiCommand, UiEvent,
};

fn started(outcome: StartOutcome) -> termrec_session::Recording {
    match outcome {
        StartOutcome::Started { recording, .. } => recording,
        other => panic!("expected a new recording, got {other:?}"),
    }
}

#[tokio::test]
async fn plaintext_session_round_trips_through_the_codec() {
    let s = service();
    let recorder = s.service.recorder();
    let rec = started(recorder.start(StartOptions::new("s1", 80, 24)).unwrap());
    assert_eq!(rec.format, RecordingFormat::Termrec);
    assert!(!rec.encrypted);

    recorder.append_output("s1", b"hello\r\n").unwrap();
    recorder.append_input("s1", b"ignored").unwrap();
    recorder.append_resize("s1", 100, 30).unwrap();
    let finished = recorder.stop("s1").unwrap().unwrap();
    assert!(finished.ended_at.is_some());

    let mut dec = Decoder::new(BufReader::new(std::fs::File::open(&finished.path).unwrap()));
    let header = dec.read_header().unwrap();
    assert_eq!((header.cols, header.rows, header.flags), (80, 24, 0));

    let first = dec.read_event(Vec::new()).unwrap().unwrap();
    assert_eq!(first.kind, EventKind::Output);
    assert_eq!(first.payload, b"hello\r\n");
    let second = dec.read_event(Vec::new()).unwrap().unwrap();
    assert_eq!(second.resize_dims(), Some((100, 30)));
    assert!(dec.read_event(Vec::new()).unwrap().is_none());

    let listed = s.service.list_recordings().unwrap();
    assert_eq!(listed.len(), 1);
    assert!(listed[0].size > HEADER_LEN as u64);
    assert_eq!(listed[0].size, std::fs::metadata(&finished.path).unwrap().len());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn encrypted_recording_replays_with_its_passphrase() {
    let mut s = service();
    let mut opts = StartOptions::new("s1", 80, 24);
    opts.encrypt = true;
    opts.passphrase = Some(Passphrase::new("correct horse"));
    let rec = started(s.service.start_recording(opts).await.unwrap());
    assert!(rec.encrypted);
    assert_eq!(rec.format, RecordingFormat::TermrecGcm);

    s.service.recorder().append_output("s1", b"top secret").unwrap();
    s.service.recorder().stop("s1").unwrap();

    let on_disk = std::fs::read(&rec.path).unwrap();
    assert!(!on_disk.windows(10).any(|w| w == b"top secret"));

    let source = KeySource::Passphrase(Passphrase::new("correct horse"));
    s.service.start_replay(&rec.id, Some(source), Some(50.0)).await.unwrap();
    let events = drain_replay(&mut s.events).await;
    assert_eq!(outputs(&events), b"top secret");
    assert_eq!(
        events.last(),
        Some(&ReplayEvent::Ended { reason: EndReason::Finished, error: None })
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn wrong_passphrase_is_rejected_before_replay_starts() {
    let s = service();
    let mut opts = StartOptions::new("s1", 80, 24);
    opts.encrypt = true;
    opts.passphrase = Some(Passphrase::new("right"));
    let rec = started(s.service.start_recording(opts).await.unwrap());
    s.service.recorder().stop("s1").unwrap();

    let source = KeySource::Passphrase(Passphrase::new("wrong"));
    let err = s.service.start_replay(&rec.id, Some(source), None).await.unwrap_err();
    assert!(matches!(err, TermrecError::Crypto(_)), "{err}");

    let err = s.service.start_replay(&rec.id, None, None).await.unwrap_err();
    assert!(matches!(err, TermrecError::InvalidInput(_)), "{err}");
    assert_eq!(s.service.registry().replay_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shared_recording_opens_with_local_identity_until_revoked() {
    let mut s = service();
    let pass = Passphrase::new("pw");
    let mut opts = StartOptions::new("s1", 80, 24);
    opts.encrypt = true;
    opts.passphrase = Some(pass.clone());
    let rec = started(s.service.start_recording(opts).await.unwrap());
    s.service.recorder().append_output("s1", b"shared").unwrap();
    s.service.recorder().stop("s1").unwrap();

    let keyring = s.service.keyring();
    keyring.generate_identity("me").unwrap();
    keyring.share(&rec.id, "me", &pass).unwrap();
    assert_eq!(keyring.recipients(&rec.id).unwrap().len(), 1);

    s.service
        .start_replay(&rec.id, Some(KeySource::LocalIdentity), Some(50.0))
        .await
        .unwrap();
    assert_eq!(outputs(&drain_replay(&mut s.events).await), b"shared");

    s.service.keyring().revoke(&rec.id, "me").unwrap();
    let err = s
        .service
        .start_replay(&rec.id, Some(KeySource::LocalIdentity), None)
        .await
        .unwrap_err();
    assert!(matches!(err, TermrecError::NotFound(_)), "{err}");
}

#[tokio::test]
async fn delete_waits_for_the_recording_to_stop() {
    let s = service();
    let rec = started(s.service.recorder().start(StartOptions::new("s1", 80, 24)).unwrap());

    let err = s.service.delete_recording(&rec.id).unwrap_err();
    assert!(matches!(err, TermrecError::InvalidInput(_)));
    assert!(rec.path.exists());

    s.service.recorder().stop("s1").unwrap();
    s.service.delete_recording(&rec.id).unwrap();
    assert!(!rec.path.exists());
    assert!(s.service.store().get_recording(&rec.id).unwrap().is_none());
    assert!(matches!(
        s.service.delete_recording(&rec.id),
        Err(TermrecError::NotFound(_))
    ));
}

#[tokio::test]
async fn find_recording_accepts_unique_prefixes() {
    let s = service();
    let rec = started(s.service.recorder().start(StartOptions::new("s1", 80, 24)).unwrap());
    s.service.recorder().stop("s1").unwrap();

    assert_eq!(s.service.find_recording(&rec.id[..6]).unwrap().id, rec.id);
    assert!(matches!(
        s.service.find_recording("zzzz"),
        Err(TermrecError::NotFound(_))
    ));
}

#[tokio::test]
async fn inspect_counts_events() {
    let s = service();
    let mut opts = StartOptions::new("s1", 120, 40);
    opts.capture_input = true;
    let rec = started(s.service.recorder().start(opts).unwrap());
    let recorder = s.service.recorder();
    recorder.append_output("s1", b"abc").unwrap();
    recorder.append_input("s1", b"l").unwrap();
    recorder.append_output("s1", b"de").unwrap();
    recorder.append_resize("s1", 100, 30).unwrap();
    let rec = recorder.stop("s1").unwrap().unwrap_or(rec);

    let summary = s.service.inspect(&rec, None).unwrap();
    assert_eq!((summary.header.cols, summary.header.rows), (120, 40));
    assert!(summary.header.capture_input());
    assert_eq!(summary.output_events, 2);
    assert_eq!(summary.input_events, 1);
    assert_eq!(summary.resize_events, 1);
    assert_eq!(summary.payload_bytes, 3 + 1 + 2 + 4);
}

#[tokio::test]
async fn start_command_without_passphrase_downgrades_with_warning() {
    let mut s = service();
    let cmd: UiCommand = serde_json::from_str(
        r#"{"type":"start","sessionId":"s1","cols":80,"rows":24,"encrypt":true}"#,
    )
    .unwrap();
    s.service.dispatch(cmd).await.unwrap();

    match s.events.recv().await.unwrap() {
        UiEvent::Started { session_id, recording, warning } => {
            assert_eq!(session_id, "s1");
            assert!(!recording.encrypted);
            assert_eq!(warning, Some(StartWarning::EncryptionDowngraded));
        }
        other => panic!("expected started, got {other:?}"),
    }

    // A second start for the same session is a no-op.
    let cmd: UiCommand =
        serde_json::from_str(r#"{"type":"start","sessionId":"s1","cols":80,"rows":24}"#).unwrap();
    s.service.dispatch(cmd).await.unwrap();
    assert!(s.events.try_recv().is_err());

    s.service
        .dispatch(UiCommand::Stop { session_id: "s1".into() })
        .await
        .unwrap();
    assert!(matches!(s.events.recv().await.unwrap(), UiEvent::Stopped { .. }));
    match s.events.recv().await.unwrap() {
        UiEvent::Recordings { recordings } => assert_eq!(recordings.len(), 1),
        other => panic!("expected recordings, got {other:?}"),
    }
}

#[tokio::test]
async fn failed_commands_surface_as_error_events() {
    let mut s = service();
    s.service
        .handle(UiCommand::Delete { recording_id: "missing".into() })
        .await;
    match s.events.recv().await.unwrap() {
        UiEvent::Error { message } => assert!(message.contains("missing"), "{message}"),
        other => panic!("expected error, got {other:?}"),
    }
}
