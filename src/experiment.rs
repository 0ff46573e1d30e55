//! Run-level coordination.
//!
//! [`Experiment`] owns the link for the whole run. Once its handshake has
//! succeeded it takes [`Command`]s and reports progress as
//! [`SessionEvent`]s to a [`SessionObserver`]. Display and persistence live
//! in observers; nothing here renders or stores anything.

use log::{error, info, warn};

use crate::errors::{DriverError, ProtocolError, Result};
use crate::handshake::{ConnectionState, Handshake, HandshakeConfig};
use crate::link::SerialLink;
use crate::parser::{DeviceEvent, EventStreamParser};
use crate::record::{RhythmParams, TrialRecord};
use crate::score::feedback_score;
use crate::session::{SyncContinuationSession, TapCountingSession};

/// What to run for one trial.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrialSpec {
    TapCounting {
        target_releases: usize,
        label: Option<String>,
    },
    SyncContinuation {
        params: RhythmParams,
        label: Option<String>,
    },
}

impl TrialSpec {
    pub fn label(&self) -> Option<&str> {
        match self {
            TrialSpec::TapCounting { label, .. } | TrialSpec::SyncContinuation { label, .. } => {
                label.as_deref()
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    BeginTrial(TrialSpec),
    /// Stop the run and release the link.
    Abort,
}

/// Progress notifications. `index` counts trials from zero across the run.
#[derive(Debug)]
pub enum SessionEvent<'a> {
    TrialStarted {
        index: usize,
        spec: &'a TrialSpec,
    },
    EventObserved {
        index: usize,
        event: DeviceEvent,
    },
    TrialEnded {
        index: usize,
        record: &'a TrialRecord,
    },
    /// Only sync-continuation trials are scored. `None` when there were
    /// fewer than two continuation taps.
    ScoreComputed {
        index: usize,
        score: Option<u32>,
    },
    TrialAborted {
        index: usize,
        error: &'a ProtocolError,
    },
}

pub trait SessionObserver {
    fn on_event(&mut self, event: &SessionEvent<'_>);
}

impl<F> SessionObserver for F
where
    F: FnMut(&SessionEvent<'_>),
{
    fn on_event(&mut self, event: &SessionEvent<'_>) {
        self(event)
    }
}

#[derive(Debug)]
pub enum TrialOutcome {
    Completed {
        record: TrialRecord,
        score: Option<u32>,
    },
    /// The trial hit a protocol error; the link is still usable.
    Aborted(ProtocolError),
}

/// A connected peripheral and the trials run on it so far.
///
/// The link is released when the experiment is closed, aborted, dropped, or
/// hits an error that leaves the link unusable.
pub struct Experiment<L: SerialLink> {
    link: Option<L>,
    state: ConnectionState,
    trials_run: usize,
}

impl<L: SerialLink> Experiment<L> {
    /// Wrap a freshly opened link. Nothing is sent until [`handshake`](Self::handshake).
    pub fn new(link: L) -> Self {
        Self {
            link: Some(link),
            state: ConnectionState::Disconnected,
            trials_run: 0,
        }
    }

    /// Open and handshake in one step. On failure the link is closed before
    /// returning.
    pub fn connect(link: L, config: HandshakeConfig) -> Result<Self> {
        let mut experiment = Self::new(link);
        experiment.handshake(config)?;
        Ok(experiment)
    }

    /// Bring the link up. The state is `Handshaking` while this runs and
    /// ends as `Connected` or `Failed`; a failed link is closed.
    pub fn handshake(&mut self, config: HandshakeConfig) -> Result<()> {
        let link = match (self.state, self.link.as_mut()) {
            (ConnectionState::Disconnected, Some(link)) => link,
            (state, _) => return Err(DriverError::NotReady(format!("link is {state}"))),
        };
        self.state = ConnectionState::Handshaking;
        let mut handshake = Handshake::new(config);
        let result = handshake.run(link);
        self.state = handshake.stage().connection_state();
        match result {
            Ok(()) => Ok(()),
            Err(e) => {
                error!("closing link after failed handshake ({:?})", handshake.stage());
                self.close_link();
                Err(e.into())
            }
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn trials_run(&self) -> usize {
        self.trials_run
    }

    /// The underlying link while it is open.
    pub fn link(&self) -> Option<&L> {
        self.link.as_ref()
    }

    /// Handle one command. `BeginTrial` yields the trial's outcome; `Abort`
    /// closes the link and yields nothing.
    pub fn execute(
        &mut self,
        command: Command,
        observer: &mut dyn SessionObserver,
    ) -> Result<Option<TrialOutcome>> {
        match command {
            Command::BeginTrial(spec) => self.run_trial(&spec, observer).map(Some),
            Command::Abort => {
                info!("run aborted after {} trials", self.trials_run);
                self.close_link();
                Ok(None)
            }
        }
    }

    /// Run one trial to completion.
    ///
    /// Unknown tags and timestamp desyncs abort only this trial. A closed
    /// stream or an I/O failure fails the run and closes the link.
    pub fn run_trial(
        &mut self,
        spec: &TrialSpec,
        observer: &mut dyn SessionObserver,
    ) -> Result<TrialOutcome> {
        let link = match (self.state, self.link.as_mut()) {
            (ConnectionState::Connected, Some(link)) => link,
            (state, _) => return Err(DriverError::NotReady(format!("link is {state}"))),
        };
        let index = self.trials_run;
        self.trials_run += 1;

        observer.on_event(&SessionEvent::TrialStarted { index, spec });
        let mut parser = EventStreamParser::new();
        let mut forward = |event: &DeviceEvent| {
            observer.on_event(&SessionEvent::EventObserved {
                index,
                event: *event,
            })
        };
        let result = match spec {
            TrialSpec::TapCounting {
                target_releases,
                label,
            } => TapCountingSession::new(*target_releases, label.clone()).run(
                link,
                &mut parser,
                &mut forward,
            ),
            TrialSpec::SyncContinuation { params, label } => {
                SyncContinuationSession::new(*params, label.clone()).run(
                    link,
                    &mut parser,
                    &mut forward,
                )
            }
        };

        match result {
            Ok(record) => {
                info!(
                    "trial {} done: {} taps, {} releases, {} tones",
                    index,
                    record.taps.len(),
                    record.releases.len(),
                    record.tones.len()
                );
                observer.on_event(&SessionEvent::TrialEnded {
                    index,
                    record: &record,
                });
                let score = match spec {
                    TrialSpec::SyncContinuation { .. } => {
                        let score = feedback_score(&record);
                        observer.on_event(&SessionEvent::ScoreComputed { index, score });
                        score
                    }
                    TrialSpec::TapCounting { .. } => None,
                };
                Ok(TrialOutcome::Completed { record, score })
            }
            Err(e) if e.is_trial_local() => {
                warn!("trial {} aborted: {}", index, e);
                observer.on_event(&SessionEvent::TrialAborted { index, error: &e });
                Ok(TrialOutcome::Aborted(e))
            }
            Err(e) => {
                error!("trial {} failed, closing link: {}", index, e);
                observer.on_event(&SessionEvent::TrialAborted { index, error: &e });
                self.close_link();
                self.state = ConnectionState::Failed;
                Err(e.into())
            }
        }
    }

    /// Release the link and report the final state.
    pub fn close(mut self) -> ConnectionState {
        self.close_link();
        self.state
    }

    fn close_link(&mut self) {
        if let Some(link) = self.link.take() {
            drop(link);
            if self.state == ConnectionState::Connected {
                self.state = ConnectionState::Closed;
            }
            info!("link closed ({} trials run)", self.trials_run);
        }
    }
}

impl<L: SerialLink> Drop for Experiment<L> {
    fn drop(&mut self) {
        self.close_link();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::ScriptedLink;

    fn connected(trial_bytes: Vec<u8>) -> Experiment<ScriptedLink> {
        let link = ScriptedLink::new()
            .with_input(b"Ready!\r\n")
            .then(*b"I")
            .then(trial_bytes)
            .closed();
        Experiment::connect(link, HandshakeConfig::immediate()).unwrap()
    }

    fn frame(tag: u8, ts: u32) -> Vec<u8> {
        let mut v = vec![tag];
        v.extend_from_slice(&ts.to_le_bytes());
        v
    }

    #[test]
    fn failed_handshake_returns_error() {
        let link = ScriptedLink::new().with_input(b"NotReady\r\n");
        let err = Experiment::connect(link, HandshakeConfig::immediate())
            .err()
            .unwrap();
        assert!(matches!(
            err,
            DriverError::Handshake(crate::errors::HandshakeError::UnexpectedBanner(_))
        ));
    }

    #[test]
    fn handshake_moves_through_connection_states() {
        let link = ScriptedLink::new().with_input(b"Ready!\r\n").then(*b"I");
        let mut experiment = Experiment::new(link);
        assert_eq!(experiment.state(), ConnectionState::Disconnected);
        experiment.handshake(HandshakeConfig::immediate()).unwrap();
        assert_eq!(experiment.state(), ConnectionState::Connected);
        assert!(matches!(
            experiment.handshake(HandshakeConfig::immediate()),
            Err(DriverError::NotReady(_))
        ));
    }

    #[test]
    fn failed_handshake_leaves_failed_state_and_no_link() {
        let link = ScriptedLink::new().with_input(b"Ready!\r\n").then(*b"X");
        let mut experiment = Experiment::new(link);
        assert!(matches!(
            experiment.handshake(HandshakeConfig::immediate()),
            Err(DriverError::Handshake(
                crate::errors::HandshakeError::UnexpectedResponse(b'X')
            ))
        ));
        assert_eq!(experiment.state(), ConnectionState::Failed);
        assert!(experiment.link().is_none());
        assert_eq!(experiment.close(), ConnectionState::Failed);
    }

    #[test]
    fn events_are_reported_in_order() {
        let mut bytes = frame(b'S', 10);
        bytes.extend(frame(b'T', 12));
        bytes.extend(frame(b'C', 20));
        bytes.extend(frame(b'T', 32));
        bytes.extend(frame(b'T', 52));
        bytes.push(b'I');
        let mut experiment = connected(bytes);
        let mut log = Vec::new();
        let mut observer = |event: &SessionEvent<'_>| {
            log.push(match event {
                SessionEvent::TrialStarted { .. } => "start".to_string(),
                SessionEvent::EventObserved { event, .. } => event.to_string(),
                SessionEvent::TrialEnded { .. } => "end".to_string(),
                SessionEvent::ScoreComputed { score, .. } => format!("score={score:?}"),
                SessionEvent::TrialAborted { .. } => "aborted".to_string(),
            })
        };
        let spec = TrialSpec::SyncContinuation {
            params: RhythmParams::new(3, 400).unwrap(),
            label: None,
        };
        let outcome = experiment
            .execute(Command::BeginTrial(spec), &mut observer)
            .unwrap();
        assert!(matches!(
            outcome,
            Some(TrialOutcome::Completed { score: Some(0), .. })
        ));
        assert_eq!(
            log,
            ["start", "S@10", "T@12", "C@20", "T@32", "T@52", "I", "end", "score=Some(0)"]
        );
    }

    #[test]
    fn abort_closes_link() {
        let mut experiment = connected(Vec::new());
        let outcome = experiment
            .execute(Command::Abort, &mut |_: &SessionEvent<'_>| {})
            .unwrap();
        assert!(outcome.is_none());
        assert_eq!(experiment.state(), ConnectionState::Closed);
        assert!(experiment.link().is_none());

        let spec = TrialSpec::TapCounting {
            target_releases: 1,
            label: None,
        };
        assert!(matches!(
            experiment.run_trial(&spec, &mut |_: &SessionEvent<'_>| {}),
            Err(DriverError::NotReady(_))
        ));
    }
}
