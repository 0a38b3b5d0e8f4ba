use chrono::Timelike;

use algotrade_core::Signal;

/// Attaches derived fields to a signal before risk evaluation.
///
/// Enrichers are infallible and run in registration order; each consumes the
/// signal and returns the enriched value.
pub trait SignalEnricher: Send + Sync {
    fn name(&self) -> &'static str;

    fn enrich(&self, signal: Signal) -> Signal;
}

/// Tags the signal with the trading session implied by its timestamp.
pub struct SessionEnricher;

impl SignalEnricher for SessionEnricher {
    fn name(&self) -> &'static str {
        "session"
    }

    fn enrich(&self, mut signal: Signal) -> Signal {
        let session = match signal.timestamp.hour() {
            0..=6 => "asia",
            7..=11 => "london",
            12..=16 => "overlap",
            _ => "newyork",
        };
        signal
            .metadata
            .insert("session".to_string(), serde_json::json!(session));
        signal
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use algotrade_core::Side;
    use chrono::{TimeZone, Utc};

    #[test]
    fn session_tag_follows_utc_hour() {
        let mut signal = Signal::new("EURUSD", Side::Buy, "test");
        signal.timestamp = Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap();

        let enriched = SessionEnricher.enrich(signal);
        assert_eq!(
            enriched.metadata.get("session"),
            Some(&serde_json::json!("london"))
        );
    }
}
