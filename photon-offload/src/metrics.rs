//! Per-run counters.

use std::time::{Duration, Instant};

use log::info;
use serde::Serialize;

use crate::backend::PropagateOutcome;
use crate::run::EventSummary;

/// Counters for one run, reset by each `begin_run`.
#[derive(Debug, Clone, Serialize)]
pub struct RunMetrics {
    #[serde(skip)]
    start_time: Instant,
    pub events: u64,
    pub photons_sent: u64,
    pub pe_received: u64,
    pub hits_recorded: u64,
    pub dropped_samples: u64,
    pub failed_events: u64,
    pub deferred_events: u64,
    pub reconnects: u64,
}

impl RunMetrics {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            events: 0,
            photons_sent: 0,
            pe_received: 0,
            hits_recorded: 0,
            dropped_samples: 0,
            failed_events: 0,
            deferred_events: 0,
            reconnects: 0,
        }
    }

    pub fn record_event(&mut self, summary: &EventSummary) {
        self.events += 1;
        self.photons_sent += summary.photons as u64;
        self.pe_received += summary.photoelectrons as u64;
        self.hits_recorded += summary.hits as u64;
        self.dropped_samples += summary.dropped as u64;
        match summary.outcome {
            PropagateOutcome::Complete => {}
            PropagateOutcome::Deferred => self.deferred_events += 1,
            PropagateOutcome::Failed => self.failed_events += 1,
        }
    }

    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Events per second since the run began.
    pub fn event_rate(&self) -> f64 {
        let secs = self.uptime().as_secs_f64();
        if secs > 0.0 {
            self.events as f64 / secs
        } else {
            0.0
        }
    }

    pub fn log_summary(&self) {
        info!(
            "Run summary: events={}, photons={}, pe={}, hits={}, dropped={}, failed={}, deferred={}, reconnects={}, uptime={:.1}s ({:.2} events/s)",
            self.events,
            self.photons_sent,
            self.pe_received,
            self.hits_recorded,
            self.dropped_samples,
            self.failed_events,
            self.deferred_events,
            self.reconnects,
            self.uptime().as_secs_f64(),
            self.event_rate()
        );
    }
}

impl Default for RunMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary(outcome: PropagateOutcome, photoelectrons: usize, dropped: usize) -> EventSummary {
        EventSummary {
            event_id: 0,
            photons: 10,
            photoelectrons,
            hits: photoelectrons - dropped,
            dropped,
            outcome,
        }
    }

    #[test]
    fn test_record_event() {
        let mut metrics = RunMetrics::new();
        metrics.record_event(&summary(PropagateOutcome::Complete, 4, 1));
        metrics.record_event(&summary(PropagateOutcome::Failed, 0, 0));
        metrics.record_event(&summary(PropagateOutcome::Deferred, 0, 0));

        assert_eq!(metrics.events, 3);
        assert_eq!(metrics.photons_sent, 30);
        assert_eq!(metrics.pe_received, 4);
        assert_eq!(metrics.hits_recorded, 3);
        assert_eq!(metrics.dropped_samples, 1);
        assert_eq!(metrics.failed_events, 1);
        assert_eq!(metrics.deferred_events, 1);
    }
}
