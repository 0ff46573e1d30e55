//! Per-trial timing data.

use serde::Serialize;

use crate::errors::ConfigError;

/// Which part of a trial was in effect when an event happened.
///
/// Serialized with the single-letter codes used in the data files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PhaseTag {
    /// Tap-counting task.
    #[serde(rename = "P")]
    Active,
    /// Sync-continuation trial started, no tone yet.
    #[serde(rename = "B")]
    Begin,
    #[serde(rename = "S")]
    Sync,
    #[serde(rename = "C")]
    Continuation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TapEvent {
    pub phase: PhaseTag,
    pub timestamp: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ReleaseEvent {
    pub timestamp: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ToneEvent {
    pub phase: PhaseTag,
    pub timestamp: u32,
}

/// Sync-continuation trial parameters as sent to the peripheral.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RhythmParams {
    octave: u8,
    ioi_ms: u16,
}

impl RhythmParams {
    /// The firmware reads the octave as one ASCII digit and the IOI as three.
    pub fn new(octave: u8, ioi_ms: u16) -> Result<Self, ConfigError> {
        if octave > 9 {
            return Err(ConfigError::InvalidParameter(format!(
                "octave {octave} does not fit in one digit"
            )));
        }
        if ioi_ms > 999 {
            return Err(ConfigError::InvalidParameter(format!(
                "inter-onset interval {ioi_ms} ms does not fit in three digits"
            )));
        }
        Ok(Self { octave, ioi_ms })
    }

    pub fn octave(&self) -> u8 {
        self.octave
    }

    pub fn ioi_ms(&self) -> u16 {
        self.ioi_ms
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "task", rename_all = "snake_case")]
pub enum TaskKind {
    TapCounting { target_releases: usize },
    SyncContinuation(RhythmParams),
}

/// Everything observed during one trial.
///
/// Built by a session while the trial runs and handed to the caller when it
/// finishes. Releases are not paired with taps; the counts can differ.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrialRecord {
    pub label: Option<String>,
    pub task: TaskKind,
    /// Timestamp of the peripheral's task-start message, if it sent one.
    pub started_at: Option<u32>,
    pub taps: Vec<TapEvent>,
    pub releases: Vec<ReleaseEvent>,
    pub tones: Vec<ToneEvent>,
}

impl TrialRecord {
    pub fn new(task: TaskKind, label: Option<String>) -> Self {
        Self {
            label,
            task,
            started_at: None,
            taps: Vec::new(),
            releases: Vec::new(),
            tones: Vec::new(),
        }
    }

    pub fn tap_types(&self) -> Vec<PhaseTag> {
        self.taps.iter().map(|t| t.phase).collect()
    }

    pub fn tap_times(&self) -> Vec<u32> {
        self.taps.iter().map(|t| t.timestamp).collect()
    }

    pub fn release_times(&self) -> Vec<u32> {
        self.releases.iter().map(|r| r.timestamp).collect()
    }

    pub fn tone_times(&self) -> Vec<u32> {
        self.tones.iter().map(|t| t.timestamp).collect()
    }

    /// Timestamps of taps made in the given phase, in arrival order.
    pub fn tap_times_in(&self, phase: PhaseTag) -> Vec<u32> {
        self.taps
            .iter()
            .filter(|t| t.phase == phase)
            .map(|t| t.timestamp)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_with_wire_phase_codes() {
        let mut record = TrialRecord::new(
            TaskKind::SyncContinuation(RhythmParams::new(4, 600).unwrap()),
            Some("practice".into()),
        );
        record.taps.push(TapEvent {
            phase: PhaseTag::Continuation,
            timestamp: 12,
        });
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["task"]["task"], "sync_continuation");
        assert_eq!(json["task"]["ioi_ms"], 600);
        assert_eq!(json["taps"][0]["phase"], "C");
        assert_eq!(json["label"], "practice");
    }

    #[test]
    fn params_must_fit_their_digits() {
        assert!(RhythmParams::new(9, 999).is_ok());
        assert!(RhythmParams::new(10, 400).is_err());
        assert!(RhythmParams::new(3, 1000).is_err());
    }

    #[test]
    fn column_views_line_up() {
        let mut record = TrialRecord::new(TaskKind::TapCounting { target_releases: 3 }, None);
        for (i, ts) in [10u32, 20, 30].into_iter().enumerate() {
            let phase = if i == 0 { PhaseTag::Sync } else { PhaseTag::Continuation };
            record.taps.push(TapEvent { phase, timestamp: ts });
        }
        assert_eq!(record.tap_types().len(), record.tap_times().len());
        assert_eq!(record.tap_times_in(PhaseTag::Continuation), vec![20, 30]);
    }
}
