use std::time::{Duration, Instant};

/// Stopwatch for the phase timeouts. A stopped timer never expires.
#[derive(Debug, Default)]
pub struct PhaseTimer {
    started: Option<Instant>,
}

impl PhaseTimer {
    pub fn restart(&mut self) {
        self.started = Some(Instant::now());
    }

    pub fn stop(&mut self) {
        self.started = None;
    }

    pub fn is_running(&self) -> bool {
        self.started.is_some()
    }

    pub fn elapsed(&self) -> Duration {
        self.started.map(|s| s.elapsed()).unwrap_or_default()
    }

    pub fn is_elapsed(&self, timeout: Duration) -> bool {
        self.is_running() && self.elapsed() > timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    #[test]
    fn stopped_timer_never_expires() {
        let mut timer = PhaseTimer::default();
        assert!(!timer.is_elapsed(Duration::ZERO));

        timer.restart();
        sleep(Duration::from_millis(5));
        assert!(timer.is_elapsed(Duration::from_millis(1)));
        assert!(!timer.is_elapsed(Duration::from_secs(60)));

        timer.stop();
        assert!(!timer.is_elapsed(Duration::ZERO));
        assert_eq!(timer.elapsed(), Duration::ZERO);
    }
}
