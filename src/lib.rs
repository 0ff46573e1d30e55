//! Host-side driver for a serial tapping pad used in timing experiments.
//!
//! The pad (an Arduino with a force-sensitive resistor and a speaker) reports
//! taps, releases, and tone onsets as single-byte tags followed by its own
//! microsecond clock. This crate brings the link up, decodes that stream into
//! typed events, and runs the two trial protocols on top of it:
//!
//! - **Tap counting**: record taps until a fixed number of releases.
//! - **Synchronization-continuation**: tap along with tones (sync phase), then
//!   keep the tempo after they stop (continuation phase). The pad decides when
//!   each phase begins.
//!
//! # Timing
//!
//! All timestamps come from the pad, so serial latency does not affect them.
//! They are checked to be non-decreasing within a trial; the pad's clock may
//! restart between trials.

mod codec;
mod config;
mod errors;
mod experiment;
mod handshake;
mod link;
pub mod logging;
mod parser;
mod record;
mod score;
mod session;

pub use codec::{decode, decode_bytes, read_timestamp, ByteOrder, TIMESTAMP_WIDTH};
pub use config::{ExperimentConfig, TrialEntry};
pub use errors::*;
pub use experiment::{
    Command, Experiment, SessionEvent, SessionObserver, TrialOutcome, TrialSpec,
};
pub use handshake::{
    ConnectionState, Handshake, HandshakeConfig, HandshakeStage, READY_BANNER,
};
pub use link::{ByteSource, SerialLink, SerialPortLink, DEFAULT_BAUD_RATE};
// In-memory pad for driving sessions in tests.
#[doc(hidden)]
pub use link::ScriptedLink;
pub use parser::{DeviceEvent, EventStreamParser, Tag};
pub use record::{
    PhaseTag, ReleaseEvent, RhythmParams, TapEvent, TaskKind, ToneEvent, TrialRecord,
};
pub use score::{continuation_variability, feedback_score};
pub use session::{
    rhythm_start_command, Progress, RhythmState, SyncContinuationSession, TapCountingSession,
    TapCountingState, DEFAULT_TARGET_RELEASES,
};
