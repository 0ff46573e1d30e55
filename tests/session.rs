//! End-to-end runs against a scripted tapping pad.

use tapsync::{
    Command, ConnectionState, DeviceEvent, DriverError, Experiment, HandshakeConfig,
    HandshakeError, PhaseTag, ProtocolError, RhythmParams, ScriptedLink, SessionEvent,
    ToneEvent, TrialOutcome, TrialSpec,
};

fn frame(tag: u8, ts: u32) -> Vec<u8> {
    let mut v = vec![tag];
    v.extend_from_slice(&ts.to_le_bytes());
    v
}

fn pad() -> ScriptedLink {
    ScriptedLink::new()
        .with_input(b"Ready!\r\n")
        .then_silence()
        .then(*b"I")
}

fn ignore(_: &SessionEvent<'_>) {}

fn tap_counting(target_releases: usize) -> TrialSpec {
    TrialSpec::TapCounting {
        target_releases,
        label: Some("SPR".into()),
    }
}

fn sync_continuation(octave: u8, ioi_ms: u16) -> TrialSpec {
    TrialSpec::SyncContinuation {
        params: RhythmParams::new(octave, ioi_ms).unwrap(),
        label: Some("trial".into()),
    }
}

fn completed(outcome: Option<TrialOutcome>) -> (tapsync::TrialRecord, Option<u32>) {
    match outcome {
        Some(TrialOutcome::Completed { record, score }) => (record, score),
        other => panic!("trial did not complete: {other:?}"),
    }
}

#[test]
fn tap_counting_stops_on_thirtieth_release() {
    let mut stream = Vec::new();
    let mut ts = 1_000;
    for i in 0..30 {
        if i % 6 == 0 {
            stream.extend(frame(b'T', ts));
            ts += 40;
        }
        stream.extend(frame(b'R', ts));
        ts += 300;
    }
    // Sent after the stop command went out; must not be parsed.
    stream.extend(frame(b'T', ts));
    stream.extend(frame(b'R', ts + 5));

    let mut experiment =
        Experiment::connect(pad().then(stream).closed(), HandshakeConfig::immediate()).unwrap();
    let mut releases_seen = 0;
    let mut observer = |event: &SessionEvent<'_>| {
        if let SessionEvent::EventObserved {
            event: DeviceEvent::Release { .. },
            ..
        } = event
        {
            releases_seen += 1;
        }
    };
    let (record, score) = completed(
        experiment
            .execute(Command::BeginTrial(tap_counting(30)), &mut observer)
            .unwrap(),
    );

    assert_eq!(releases_seen, 30);
    assert_eq!(score, None);
    assert_eq!(record.taps.len(), 5);
    assert_eq!(record.releases.len(), 30);
    assert_eq!(record.tap_types().len(), record.tap_times().len());
    assert!(record.taps.iter().all(|t| t.phase == PhaseTag::Active));
    assert_eq!(record.label.as_deref(), Some("SPR"));
    assert_eq!(experiment.link().unwrap().written(), b"HPI");
    assert_eq!(experiment.link().unwrap().pending_len(), 0);
}

#[test]
fn sync_continuation_trace_relabels_once_and_scores() {
    let mut stream = Vec::new();
    stream.extend(frame(b'B', 0));
    stream.extend(frame(b'S', 1_000));
    stream.extend(frame(b'T', 1_010));
    stream.extend(frame(b'S', 1_600));
    stream.extend(frame(b'T', 1_620));
    stream.extend(frame(b'C', 2_200));
    stream.extend(frame(b'T', 2_240));
    stream.extend(frame(b'T', 2_860));
    stream.push(b'I');

    let mut experiment =
        Experiment::connect(pad().then(stream).closed(), HandshakeConfig::immediate()).unwrap();
    let (record, score) = completed(
        experiment
            .execute(Command::BeginTrial(sync_continuation(5, 600)), &mut ignore)
            .unwrap(),
    );

    assert_eq!(experiment.link().unwrap().written(), b"HB5600");
    assert_eq!(record.started_at, Some(0));
    assert_eq!(
        record.tap_types(),
        vec![
            PhaseTag::Sync,
            PhaseTag::Continuation,
            PhaseTag::Continuation,
            PhaseTag::Continuation
        ]
    );
    assert_eq!(
        record.tones,
        vec![
            ToneEvent {
                phase: PhaseTag::Sync,
                timestamp: 1_000
            },
            ToneEvent {
                phase: PhaseTag::Sync,
                timestamp: 1_600
            },
            ToneEvent {
                phase: PhaseTag::Continuation,
                timestamp: 2_200
            },
        ]
    );
    // Intervals 620, 620
    assert_eq!(score, Some(0));
}

#[test]
fn too_few_continuation_taps_gives_no_score() {
    let mut stream = Vec::new();
    stream.extend(frame(b'S', 100));
    stream.extend(frame(b'T', 120));
    stream.extend(frame(b'C', 700));
    stream.push(b'I');

    let mut experiment =
        Experiment::connect(pad().then(stream).closed(), HandshakeConfig::immediate()).unwrap();
    let mut scores = Vec::new();
    let mut observer = |event: &SessionEvent<'_>| {
        if let SessionEvent::ScoreComputed { score, .. } = event {
            scores.push(*score);
        }
    };
    let (record, score) = completed(
        experiment
            .execute(Command::BeginTrial(sync_continuation(2, 400)), &mut observer)
            .unwrap(),
    );
    assert_eq!(record.tap_types(), vec![PhaseTag::Continuation]);
    assert_eq!(score, None);
    assert_eq!(scores, vec![None]);
}

fn second_trial() -> Vec<u8> {
    let mut good = frame(b'S', 10);
    good.extend(frame(b'T', 20));
    good.extend(frame(b'C', 30));
    good.extend(frame(b'T', 40));
    good.extend(frame(b'T', 50));
    good.push(b'I');
    good
}

#[test]
fn unknown_tag_aborts_only_the_current_trial() {
    let mut bad = frame(b'S', 100);
    bad.push(b'Q');
    // The pad keeps playing the abandoned trial.
    let mut tail = frame(b'T', 130);
    tail.extend(frame(b'C', 700));
    tail.extend(frame(b'T', 720));
    tail.push(b'I');

    let link = pad().then(bad).then(tail).then(second_trial()).closed();
    let mut experiment = Experiment::connect(link, HandshakeConfig::immediate()).unwrap();

    let mut aborted = Vec::new();
    let mut observer = |event: &SessionEvent<'_>| {
        if let SessionEvent::TrialAborted { index, error } = event {
            aborted.push((*index, error.to_string()));
        }
    };
    let first = experiment
        .execute(Command::BeginTrial(sync_continuation(4, 500)), &mut observer)
        .unwrap();
    assert!(matches!(
        first,
        Some(TrialOutcome::Aborted(ProtocolError::UnknownTag(b'Q')))
    ));
    assert_eq!(experiment.state(), ConnectionState::Connected);

    let second = experiment
        .execute(Command::BeginTrial(sync_continuation(4, 500)), &mut observer)
        .unwrap();
    let (record, _) = completed(second);
    assert_eq!(record.tap_times(), vec![20, 40, 50]);
    assert_eq!(record.tone_times(), vec![10, 30]);
    assert_eq!(aborted.len(), 1);
    assert_eq!(aborted[0].0, 0);
    assert_eq!(experiment.trials_run(), 2);
    assert_eq!(experiment.link().unwrap().written(), b"HB4500B4500");
}

#[test]
fn desync_in_sync_continuation_does_not_leak_into_next_trial() {
    let mut bad = frame(b'S', 1_000);
    bad.extend(frame(b'T', 1_040));
    bad.extend(frame(b'T', 1_030));
    let mut tail = frame(b'S', 1_600);
    tail.extend(frame(b'T', 1_610));
    tail.extend(frame(b'C', 2_200));
    tail.extend(frame(b'T', 2_250));
    tail.push(b'I');

    let link = pad().then(bad).then(tail).then(second_trial()).closed();
    let mut experiment = Experiment::connect(link, HandshakeConfig::immediate()).unwrap();

    let mut observed = Vec::new();
    let mut observer = |event: &SessionEvent<'_>| {
        if let SessionEvent::EventObserved { index, event } = event {
            observed.push((*index, *event));
        }
    };
    let first = experiment
        .execute(Command::BeginTrial(sync_continuation(5, 600)), &mut observer)
        .unwrap();
    assert!(matches!(
        first,
        Some(TrialOutcome::Aborted(ProtocolError::TimestampDesync {
            previous: 1_040,
            current: 1_030
        }))
    ));

    let (record, score) = completed(
        experiment
            .execute(Command::BeginTrial(sync_continuation(5, 600)), &mut observer)
            .unwrap(),
    );
    assert_eq!(record.tap_times(), vec![20, 40, 50]);
    assert!(record
        .tap_types()
        .iter()
        .all(|phase| *phase == PhaseTag::Continuation));
    // Intervals 20, 10
    assert_eq!(score, Some(5));
    // Only the events before the desync were reported for the first trial.
    assert_eq!(observed.iter().filter(|(index, _)| *index == 0).count(), 2);
    assert_eq!(experiment.state(), ConnectionState::Connected);
}

#[test]
fn timestamp_going_backwards_aborts_trial() {
    let mut stream = frame(b'T', 900);
    stream.extend(frame(b'R', 800));
    let link = pad().then(stream).closed();
    let mut experiment = Experiment::connect(link, HandshakeConfig::immediate()).unwrap();
    let outcome = experiment
        .execute(Command::BeginTrial(tap_counting(5)), &mut ignore)
        .unwrap();
    assert!(matches!(
        outcome,
        Some(TrialOutcome::Aborted(ProtocolError::TimestampDesync {
            previous: 900,
            current: 800
        }))
    ));
    // The pad was told to stop.
    assert_eq!(experiment.link().unwrap().written(), b"HPI");
}

#[test]
fn closed_stream_fails_the_run() {
    let link = pad().then(frame(b'S', 1)).closed();
    let mut experiment = Experiment::connect(link, HandshakeConfig::immediate()).unwrap();
    let err = experiment
        .execute(Command::BeginTrial(sync_continuation(6, 400)), &mut ignore)
        .unwrap_err();
    assert!(matches!(
        err,
        DriverError::Protocol(ProtocolError::StreamClosed)
    ));
    assert_eq!(experiment.state(), ConnectionState::Failed);
    assert!(experiment.link().is_none());
    assert_eq!(experiment.close(), ConnectionState::Failed);
}

#[test]
fn clock_may_restart_between_trials() {
    let mut first = frame(b'S', 50_000);
    first.extend(frame(b'T', 50_010));
    first.push(b'I');
    let mut second = frame(b'S', 3);
    second.extend(frame(b'T', 9));
    second.push(b'I');

    let link = pad().then(first).then(second).closed();
    let mut experiment = Experiment::connect(link, HandshakeConfig::immediate()).unwrap();
    for _ in 0..2 {
        completed(
            experiment
                .execute(Command::BeginTrial(sync_continuation(3, 600)), &mut ignore)
                .unwrap(),
        );
    }
    assert_eq!(experiment.close(), ConnectionState::Closed);
}

#[test]
fn handshake_failures_surface_as_errors() {
    let no_answer = ScriptedLink::new().with_input(b"Ready!\r\n");
    assert!(matches!(
        Experiment::connect(no_answer, HandshakeConfig::immediate()).err(),
        Some(DriverError::Handshake(HandshakeError::NoResponse))
    ));

    let wrong_banner = ScriptedLink::new().with_input(b"NotReady\r\n").then(*b"I");
    match Experiment::connect(wrong_banner, HandshakeConfig::immediate()).err() {
        Some(DriverError::Handshake(HandshakeError::UnexpectedBanner(text))) => {
            assert_eq!(text, "NotReady\r\n")
        }
        other => panic!("unexpected: {other:?}"),
    }
}
