//! Trial state machines for the two tapping tasks.
//!
//! Both sessions are driven entirely by what the peripheral sends. Each one
//! owns its [`TrialRecord`] while the trial runs and gives it up when the
//! trial finishes; `run` consumes the session so a finished instance cannot be
//! reused.
//!
//! The per-event logic lives in `apply`, which never touches the link, so a
//! session can also be stepped by hand with already-decoded events.

use std::io::Write;
use std::mem;

use log::{debug, info, trace, warn};

use crate::errors::ProtocolError;
use crate::link::SerialLink;
use crate::parser::{DeviceEvent, EventStreamParser};
use crate::record::{
    PhaseTag, ReleaseEvent, RhythmParams, TapEvent, TaskKind, ToneEvent, TrialRecord,
};

// Host -> device commands
const CMD_START_TAP_COUNT: u8 = b'P';
const CMD_STOP_TAP_COUNT: u8 = b'I';
const CMD_START_RHYTHM: u8 = b'B';

/// Releases that end a tap-counting trial in the reference protocol.
pub const DEFAULT_TARGET_RELEASES: usize = 30;

/// Whether a session wants more events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    Continue,
    Finished,
}

/// Encode the sync-continuation start command, e.g. `B4600`.
pub fn rhythm_start_command(params: &RhythmParams) -> Vec<u8> {
    let mut cmd = vec![CMD_START_RHYTHM];
    cmd.extend_from_slice(format!("{}{:03}", params.octave(), params.ioi_ms()).as_bytes());
    cmd
}

fn send<L: SerialLink + ?Sized>(link: &mut L, bytes: &[u8]) -> Result<(), ProtocolError> {
    link.write_all(bytes)?;
    link.flush()?;
    Ok(())
}

// ============================================================================
// Tap counting
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TapCountingState {
    Idle,
    Running,
    Complete,
}

/// Records taps and releases until a fixed number of releases has been seen.
#[derive(Debug)]
pub struct TapCountingSession {
    state: TapCountingState,
    target_releases: usize,
    record: TrialRecord,
}

impl TapCountingSession {
    pub fn new(target_releases: usize, label: Option<String>) -> Self {
        Self {
            state: TapCountingState::Idle,
            target_releases,
            record: TrialRecord::new(TaskKind::TapCounting { target_releases }, label),
        }
    }

    pub fn state(&self) -> TapCountingState {
        self.state
    }

    pub fn record(&self) -> &TrialRecord {
        &self.record
    }

    /// Send the start command and begin accepting events.
    pub fn start<L: SerialLink + ?Sized>(&mut self, link: &mut L) -> Result<(), ProtocolError> {
        send(link, &[CMD_START_TAP_COUNT])?;
        self.mark_running();
        info!("tap-counting trial started (target {} releases)", self.target_releases);
        Ok(())
    }

    fn mark_running(&mut self) {
        self.state = if self.record.releases.len() >= self.target_releases {
            TapCountingState::Complete
        } else {
            TapCountingState::Running
        };
    }

    /// Fold one event into the record.
    ///
    /// Once complete, further events are dropped until [`reset`](Self::reset).
    pub fn apply(&mut self, event: DeviceEvent) -> Progress {
        match self.state {
            TapCountingState::Complete => {
                trace!("dropping {} after completion", event);
                return Progress::Finished;
            }
            TapCountingState::Idle => {
                warn!("dropping {} received before the task started", event);
                return Progress::Continue;
            }
            TapCountingState::Running => {}
        }

        match event {
            DeviceEvent::Tap { timestamp } => self.record.taps.push(TapEvent {
                phase: PhaseTag::Active,
                timestamp,
            }),
            DeviceEvent::Release { timestamp } => {
                self.record.releases.push(ReleaseEvent { timestamp });
                if self.record.releases.len() >= self.target_releases {
                    self.state = TapCountingState::Complete;
                    debug!(
                        "target reached: {} releases, {} taps",
                        self.record.releases.len(),
                        self.record.taps.len()
                    );
                    return Progress::Finished;
                }
            }
            other => debug!("ignoring {} during tap counting", other),
        }
        Progress::Continue
    }

    /// Tell the peripheral to stop and throw away anything it sent meanwhile.
    pub fn stop<L: SerialLink + ?Sized>(&mut self, link: &mut L) -> Result<(), ProtocolError> {
        send(link, &[CMD_STOP_TAP_COUNT])?;
        link.clear_input()?;
        Ok(())
    }

    /// Return to `Idle`, handing back the record collected so far.
    pub fn reset(&mut self) -> TrialRecord {
        self.state = TapCountingState::Idle;
        let fresh = TrialRecord::new(self.record.task, self.record.label.clone());
        mem::replace(&mut self.record, fresh)
    }

    /// Run the whole trial: start, read until the target is reached, stop.
    ///
    /// There is no timeout; this blocks until enough releases arrive or the
    /// stream closes. On a protocol error the stop command is still sent.
    pub fn run<L, F>(
        mut self,
        link: &mut L,
        parser: &mut EventStreamParser,
        mut on_event: F,
    ) -> Result<TrialRecord, ProtocolError>
    where
        L: SerialLink + ?Sized,
        F: FnMut(&DeviceEvent),
    {
        self.start(link)?;
        while self.state != TapCountingState::Complete {
            let event = match parser.next_event(link) {
                Ok(event) => event,
                Err(e) => {
                    if e.is_trial_local() {
                        if let Err(stop_err) = self.stop(link) {
                            warn!("failed to stop tap counting after error: {}", stop_err);
                        }
                    }
                    return Err(e);
                }
            };
            on_event(&event);
            self.apply(event);
        }
        self.stop(link)?;
        Ok(self.record)
    }
}

// ============================================================================
// Synchronization-continuation
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RhythmState {
    Idle,
    Begun,
    Sync,
    Continuation,
    /// Terminal.
    Intertrial,
}

/// One synchronization-continuation trial.
///
/// The peripheral plays the tones and decides when each phase starts. The
/// continuation tone is triggered by a tap, so that tap has already been
/// recorded as a sync tap when the tone arrives; the first continuation tone
/// moves it into the continuation phase. That relabel happens once per trial.
#[derive(Debug)]
pub struct SyncContinuationSession {
    state: RhythmState,
    params: RhythmParams,
    record: TrialRecord,
    relabeled: bool,
}

impl SyncContinuationSession {
    pub fn new(params: RhythmParams, label: Option<String>) -> Self {
        Self {
            state: RhythmState::Idle,
            params,
            record: TrialRecord::new(TaskKind::SyncContinuation(params), label),
            relabeled: false,
        }
    }

    pub fn state(&self) -> RhythmState {
        self.state
    }

    pub fn record(&self) -> &TrialRecord {
        &self.record
    }

    /// Phase that a tap arriving now would be tagged with.
    pub fn current_phase(&self) -> PhaseTag {
        match self.state {
            RhythmState::Sync => PhaseTag::Sync,
            RhythmState::Continuation | RhythmState::Intertrial => PhaseTag::Continuation,
            RhythmState::Idle | RhythmState::Begun => PhaseTag::Begin,
        }
    }

    /// Send the start command carrying the trial parameters.
    pub fn begin<L: SerialLink + ?Sized>(&mut self, link: &mut L) -> Result<(), ProtocolError> {
        let cmd = rhythm_start_command(&self.params);
        send(link, &cmd)?;
        self.state = RhythmState::Begun;
        info!(
            "sync-continuation trial started (octave {}, ioi {} ms)",
            self.params.octave(),
            self.params.ioi_ms()
        );
        Ok(())
    }

    pub fn apply(&mut self, event: DeviceEvent) -> Progress {
        match self.state {
            RhythmState::Intertrial => {
                trace!("dropping {} after trial end", event);
                return Progress::Finished;
            }
            RhythmState::Idle => {
                warn!("dropping {} received before the trial began", event);
                return Progress::Continue;
            }
            _ => {}
        }

        match event {
            DeviceEvent::TaskStarted { timestamp } => {
                if self.record.started_at.is_none() {
                    self.record.started_at = Some(timestamp);
                }
            }
            DeviceEvent::SyncTone { timestamp } => {
                self.state = RhythmState::Sync;
                self.record.tones.push(ToneEvent {
                    phase: PhaseTag::Sync,
                    timestamp,
                });
            }
            DeviceEvent::ContinuationTone { timestamp } => {
                if !self.relabeled {
                    self.relabeled = true;
                    if let Some(tap) = self.record.taps.last_mut() {
                        debug!("relabeling tap @{} as continuation", tap.timestamp);
                        tap.phase = PhaseTag::Continuation;
                    }
                }
                self.state = RhythmState::Continuation;
                self.record.tones.push(ToneEvent {
                    phase: PhaseTag::Continuation,
                    timestamp,
                });
            }
            DeviceEvent::Tap { timestamp } => {
                let phase = self.current_phase();
                self.record.taps.push(TapEvent { phase, timestamp });
            }
            DeviceEvent::Release { timestamp } => {
                self.record.releases.push(ReleaseEvent { timestamp });
            }
            DeviceEvent::TrialEnd => {
                self.state = RhythmState::Intertrial;
                debug!(
                    "trial end: {} taps, {} releases, {} tones",
                    self.record.taps.len(),
                    self.record.releases.len(),
                    self.record.tones.len()
                );
                return Progress::Finished;
            }
        }
        Progress::Continue
    }

    /// Take the record out of a finished session.
    pub fn into_record(self) -> TrialRecord {
        self.record
    }

    /// Run the whole trial until the peripheral signals its end.
    ///
    /// There is no timeout. Pending input is cleared when the trial ends. A
    /// trial-local protocol error abandons the trial, but the peripheral has
    /// no stop command for this task and plays on, so the rest of the trial
    /// is read and dropped up to its trial-end tag before the error is
    /// returned.
    pub fn run<L, F>(
        mut self,
        link: &mut L,
        parser: &mut EventStreamParser,
        mut on_event: F,
    ) -> Result<TrialRecord, ProtocolError>
    where
        L: SerialLink + ?Sized,
        F: FnMut(&DeviceEvent),
    {
        self.begin(link)?;
        loop {
            let event = match parser.next_event(link) {
                Ok(event) => event,
                Err(e) if e.is_trial_local() => {
                    warn!("abandoning sync-continuation trial: {}", e);
                    drain_trial(link, parser, &e)?;
                    return Err(e);
                }
                Err(e) => return Err(e),
            };
            on_event(&event);
            if self.apply(event) == Progress::Finished {
                break;
            }
        }
        link.clear_input()?;
        Ok(self.into_record())
    }
}

/// Consume the remainder of an abandoned trial through its trial-end tag,
/// then clear pending input.
///
/// After a timestamp desync the framing is intact, so events are parsed and
/// dropped. After an unknown tag, raw bytes are skipped up to the trial-end
/// byte instead. Errors that leave the link unusable are returned.
fn drain_trial<L: SerialLink + ?Sized>(
    link: &mut L,
    parser: &mut EventStreamParser,
    cause: &ProtocolError,
) -> Result<(), ProtocolError> {
    let mut framed = !matches!(cause, ProtocolError::UnknownTag(_));
    let mut dropped = 0usize;
    loop {
        if !framed {
            let skipped = parser.skip_to_trial_end(link)?;
            debug!("skipped {} unframed bytes", skipped);
            break;
        }
        match parser.next_event(link) {
            Ok(DeviceEvent::TrialEnd) => break,
            Ok(event) => {
                trace!("dropping {} from abandoned trial", event);
                dropped += 1;
            }
            Err(ProtocolError::TimestampDesync { current, .. }) => {
                trace!("dropping out-of-order timestamp {}", current);
                dropped += 1;
            }
            Err(ProtocolError::UnknownTag(byte)) => {
                debug!("lost framing at {:#04X} while draining", byte);
                framed = false;
            }
            Err(e) => return Err(e),
        }
    }
    debug!(
        "abandoned trial drained: {} events dropped, last good timestamp {:?}",
        dropped,
        parser.last_timestamp()
    );
    link.clear_input()?;
    Ok(())
}
