//! Period gating for operations driven by the agent loop.

use std::time::Duration;

use tokio::time::Instant;

/// Tracks when an operation last ran and whether its period has elapsed.
#[derive(Debug, Clone)]
pub struct Schedule {
    period: Duration,
    last_run: Option<Instant>,
}

impl Schedule {
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            last_run: None,
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn set_period(&mut self, period: Duration) {
        self.period = period;
    }

    /// The first check is always due.
    pub fn is_due(&self) -> bool {
        self.last_run.map_or(true, |last| last.elapsed() >= self.period)
    }

    pub fn mark_run(&mut self) {
        self.last_run = Some(Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_due_after_period() {
        let mut schedule = Schedule::new(Duration::from_secs(30));
        assert!(schedule.is_due());

        schedule.mark_run();
        assert!(!schedule.is_due());

        tokio::time::advance(Duration::from_secs(29)).await;
        assert!(!schedule.is_due());

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(schedule.is_due());
    }

    #[test]
    fn test_zero_period_is_always_due() {
        let mut schedule = Schedule::new(Duration::ZERO);
        schedule.mark_run();
        assert!(schedule.is_due());
    }
}
