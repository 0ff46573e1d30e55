//! Feedback score: how steady the participant's continuation tapping was.

use log::warn;

use crate::errors::ScoreError;
use crate::record::{PhaseTag, TrialRecord};

/// Population standard deviation of the intervals between consecutive
/// continuation taps, truncated to an integer (clock units, i.e. µs).
pub fn continuation_variability(record: &TrialRecord) -> Result<u32, ScoreError> {
    let times = record.tap_times_in(PhaseTag::Continuation);
    if times.len() < 2 {
        return Err(ScoreError::InsufficientData { found: times.len() });
    }

    let intervals: Vec<f64> = times
        .windows(2)
        .map(|w| w[1] as f64 - w[0] as f64)
        .collect();
    Ok(population_std_dev(&intervals) as u32)
}

/// Score for display, or `None` when there is too little data.
pub fn feedback_score(record: &TrialRecord) -> Option<u32> {
    match continuation_variability(record) {
        Ok(score) => Some(score),
        Err(e) => {
            warn!("no feedback score for this trial: {}", e);
            None
        }
    }
}

fn population_std_dev(samples: &[f64]) -> f64 {
    let mean = samples.iter().sum::<f64>() / samples.len() as f64;
    let variance = samples.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / samples.len() as f64;
    variance.sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{TapEvent, TaskKind};

    fn record_with(taps: &[(PhaseTag, u32)]) -> TrialRecord {
        let mut record = TrialRecord::new(TaskKind::TapCounting { target_releases: 0 }, None);
        record.taps = taps
            .iter()
            .map(|&(phase, timestamp)| TapEvent { phase, timestamp })
            .collect();
        record
    }

    #[test]
    fn truncates_population_std_dev() {
        let record = record_with(&[
            (PhaseTag::Continuation, 100),
            (PhaseTag::Continuation, 300),
            (PhaseTag::Continuation, 520),
            (PhaseTag::Continuation, 740),
        ]);
        // Intervals 200, 220, 220: sigma = 9.43
        assert_eq!(continuation_variability(&record), Ok(9));
    }

    #[test]
    fn only_continuation_taps_count() {
        let record = record_with(&[
            (PhaseTag::Sync, 0),
            (PhaseTag::Sync, 10_000),
            (PhaseTag::Continuation, 10_600),
            (PhaseTag::Continuation, 11_200),
            (PhaseTag::Continuation, 11_800),
        ]);
        assert_eq!(continuation_variability(&record), Ok(0));
    }

    #[test]
    fn single_tap_is_insufficient() {
        let record = record_with(&[(PhaseTag::Sync, 5), (PhaseTag::Continuation, 10)]);
        assert_eq!(
            continuation_variability(&record),
            Err(ScoreError::InsufficientData { found: 1 })
        );
        assert_eq!(feedback_score(&record), None);
    }

    #[test]
    fn empty_record_is_insufficient() {
        assert_eq!(
            continuation_variability(&record_with(&[])),
            Err(ScoreError::InsufficientData { found: 0 })
        );
    }

    #[test]
    fn two_taps_give_zero() {
        let record = record_with(&[
            (PhaseTag::Continuation, 1_000),
            (PhaseTag::Continuation, 1_400),
        ]);
        assert_eq!(feedback_score(&record), Some(0));
    }
}
