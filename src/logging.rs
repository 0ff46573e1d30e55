//! Stderr logging for the driver and the CLI.

use std::sync::Once;

use env_logger::Builder;

/// Checked before `RUST_LOG`. Accepts full filter directives, e.g.
/// `info,tapsync::parser=trace`.
pub const LOG_ENV: &str = "TAPSYNC_LOG";

const DEFAULT_FILTER: &str = "info";

static INIT: Once = Once::new();

fn filter_from(lookup: impl Fn(&str) -> Option<String>) -> String {
    [LOG_ENV, "RUST_LOG"]
        .into_iter()
        .filter_map(|key| lookup(key))
        .find(|value| !value.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_FILTER.to_string())
}

/// Install the logger on first call; later calls do nothing.
pub fn init_logging() {
    INIT.call_once(|| {
        let filter = filter_from(|key| std::env::var(key).ok());
        Builder::new()
            .parse_filters(&filter)
            .format_timestamp_millis()
            .format_target(true)
            .init();
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn own_variable_wins_over_rust_log() {
        let filter = filter_from(|key| match key {
            LOG_ENV => Some("tapsync::parser=trace".into()),
            "RUST_LOG" => Some("warn".into()),
            _ => None,
        });
        assert_eq!(filter, "tapsync::parser=trace");
    }

    #[test]
    fn blank_values_fall_through_to_default() {
        let filter = filter_from(|key| (key == LOG_ENV).then(|| "  ".to_string()));
        assert_eq!(filter, DEFAULT_FILTER);
        assert_eq!(filter_from(|_| None), "info");
    }
}
