//! Experiment configuration file.
//!
//! A JSON document listing the trials to run, in order, plus timing knobs.
//! Durations are parsed as in [humantime](https://docs.rs/humantime/), e.g.
//! `5s` or `250ms`. Every field is optional:
//!
//! ```json
//! {
//!   "handshake": { "settle_delay": "5s", "poll_interval": "1s", "max_attempts": 5 },
//!   "tap_target": 30,
//!   "pretrial_delay": "2s",
//!   "score_display": "1s 500ms",
//!   "trials": [
//!     { "task": "tap_counting", "label": "SPR" },
//!     { "task": "sync_continuation", "label": "practice", "octave": 4, "ioi_ms": 500 }
//!   ]
//! }
//! ```

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::errors::ConfigError;
use crate::experiment::TrialSpec;
use crate::handshake::HandshakeConfig;
use crate::record::RhythmParams;
use crate::session::DEFAULT_TARGET_RELEASES;

/// Blank screen before each trial.
pub const PRETRIAL_DELAY: Duration = Duration::from_secs(2);

/// How long the score stays up after a trial.
pub const SCORE_DISPLAY: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "task", rename_all = "snake_case")]
pub enum TrialEntry {
    TapCounting {
        #[serde(default)]
        label: Option<String>,
        /// Overrides the top-level `tap_target`.
        #[serde(default)]
        target_releases: Option<usize>,
    },
    SyncContinuation {
        #[serde(default)]
        label: Option<String>,
        octave: u8,
        ioi_ms: u16,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ExperimentConfig {
    pub handshake: HandshakeConfig,
    pub tap_target: usize,
    #[serde(with = "humantime_serde")]
    pub pretrial_delay: Duration,
    #[serde(with = "humantime_serde")]
    pub score_display: Duration,
    pub trials: Vec<TrialEntry>,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            handshake: HandshakeConfig::default(),
            tap_target: DEFAULT_TARGET_RELEASES,
            pretrial_delay: PRETRIAL_DELAY,
            score_display: SCORE_DISPLAY,
            trials: Vec::new(),
        }
    }
}

impl ExperimentConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_json(&text).with_context(|| format!("Invalid config file {}", path.display()))
    }

    /// Parse and validate a config document.
    pub fn from_json(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text)?;
        config.trial_plan()?;
        Ok(config)
    }

    /// The trials to run, validated, in file order.
    pub fn trial_plan(&self) -> std::result::Result<Vec<TrialSpec>, ConfigError> {
        self.trials
            .iter()
            .enumerate()
            .map(|(i, entry)| match entry {
                TrialEntry::TapCounting {
                    label,
                    target_releases,
                } => Ok(TrialSpec::TapCounting {
                    target_releases: target_releases.unwrap_or(self.tap_target),
                    label: label.clone(),
                }),
                TrialEntry::SyncContinuation {
                    label,
                    octave,
                    ioi_ms,
                } => RhythmParams::new(*octave, *ioi_ms)
                    .map(|params| TrialSpec::SyncContinuation {
                        params,
                        label: label.clone(),
                    })
                    .map_err(|ConfigError::InvalidParameter(msg)| {
                        ConfigError::InvalidParameter(format!("trial {}: {msg}", i + 1))
                    }),
            })
            .collect()
    }
}
