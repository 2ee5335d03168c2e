//! Per-connection reconnect backoff.

use std::time::Duration;

use tracing::info;

use crate::error::TransportError;

/// Consecutive failures tolerated before a connection gives up.
pub const MAX_RETRIES: u32 = 10;

/// Reconnect delays by failure number. Later failures reuse the last entry.
pub const DEFAULT_SCHEDULE: [Duration; 3] = [
    Duration::from_secs(0),
    Duration::from_secs(1),
    Duration::from_secs(3),
];

/// Failure counter and delay schedule for one connection.
#[derive(Debug, Clone)]
pub struct ReconnectBackoff {
    failures: u32,
    schedule: Vec<Duration>,
    max_retries: u32,
}

impl Default for ReconnectBackoff {
    fn default() -> Self {
        Self::new(DEFAULT_SCHEDULE.to_vec(), MAX_RETRIES)
    }
}

impl ReconnectBackoff {
    /// Create a backoff with a custom schedule.
    ///
    /// The schedule is made non-decreasing; an empty schedule reconnects
    /// immediately.
    pub fn new(mut schedule: Vec<Duration>, max_retries: u32) -> Self {
        if schedule.is_empty() {
            schedule.push(Duration::ZERO);
        }
        for i in 1..schedule.len() {
            if schedule[i] < schedule[i - 1] {
                schedule[i] = schedule[i - 1];
            }
        }

        Self {
            failures: 0,
            schedule,
            max_retries,
        }
    }

    /// Consecutive failures since the last successful connect.
    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Delay that will be used for the given failure number (1-based).
    pub fn delay_for(&self, failure: u32) -> Duration {
        let index = failure.saturating_sub(1) as usize;
        self.schedule
            .get(index)
            .or_else(|| self.schedule.last())
            .copied()
            .unwrap_or_default()
    }

    /// Record a disconnect and return how long to wait before reconnecting.
    ///
    /// The first failure is silent. Past the ceiling this returns
    /// [`TransportError::RetriesExhausted`] and no reconnect should be
    /// scheduled.
    pub fn on_disconnect(&mut self, connection: &str) -> Result<Duration, TransportError> {
        self.failures = self.failures.saturating_add(1);

        if self.failures > self.max_retries {
            return Err(TransportError::RetriesExhausted {
                connection: connection.to_string(),
                attempts: self.failures,
            });
        }

        let delay = self.delay_for(self.failures);
        if self.failures > 1 {
            info!(
                connection,
                attempt = self.failures,
                delay_ms = delay.as_millis() as u64,
                "reconnecting in {:.1}s",
                delay.as_secs_f64()
            );
        }

        Ok(delay)
    }

    /// Record a successful connect.
    pub fn on_connected(&mut self) {
        self.failures = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Captured {
        fn lines(&self) -> usize {
            String::from_utf8_lossy(&self.0.lock().unwrap()).lines().count()
        }
    }

    fn capture<T>(f: impl FnOnce() -> T) -> (T, Captured) {
        let captured = Captured::default();
        let writer = captured.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .with_max_level(tracing::Level::TRACE)
            .finish();
        let result = tracing::subscriber::with_default(subscriber, f);
        (result, captured)
    }

    #[test]
    fn test_first_failure_is_silent() {
        let mut backoff = ReconnectBackoff::default();

        let (delay, logs) = capture(|| backoff.on_disconnect("nats").unwrap());

        assert_eq!(delay, Duration::ZERO);
        assert_eq!(logs.lines(), 0);
    }

    #[test]
    fn test_second_failure_logs_delay() {
        let mut backoff = ReconnectBackoff::default();
        backoff.on_disconnect("nats").unwrap();

        let (delay, logs) = capture(|| backoff.on_disconnect("nats").unwrap());

        assert_eq!(delay, Duration::from_secs(1));
        assert_eq!(logs.lines(), 1);
    }

    #[test]
    fn test_schedule_repeats_last_value() {
        let mut backoff = ReconnectBackoff::default();
        let delays: Vec<u64> = (0..5)
            .map(|_| backoff.on_disconnect("nats").unwrap().as_secs())
            .collect();
        assert_eq!(delays, vec![0, 1, 3, 3, 3]);
    }

    #[test]
    fn test_gives_up_beyond_max_retries() {
        let mut backoff = ReconnectBackoff::default();
        for _ in 0..MAX_RETRIES {
            backoff.on_disconnect("nats").unwrap();
        }

        let err = backoff.on_disconnect("nats").unwrap_err();
        match &err {
            TransportError::RetriesExhausted {
                connection,
                attempts,
            } => {
                assert_eq!(connection, "nats");
                assert_eq!(*attempts, MAX_RETRIES + 1);
            }
            other => panic!("expected RetriesExhausted, got {other:?}"),
        }
        assert!(err.is_fatal());
    }

    #[test]
    fn test_connect_resets_counter() {
        let mut backoff = ReconnectBackoff::default();
        backoff.on_disconnect("nats").unwrap();
        backoff.on_disconnect("nats").unwrap();
        backoff.on_connected();

        assert_eq!(backoff.failures(), 0);
        assert_eq!(backoff.on_disconnect("nats").unwrap(), Duration::ZERO);
    }

    #[test]
    fn test_custom_schedule_is_monotonic() {
        let backoff = ReconnectBackoff::new(
            vec![Duration::from_secs(2), Duration::from_secs(1)],
            MAX_RETRIES,
        );
        assert_eq!(backoff.delay_for(2), Duration::from_secs(2));
        assert_eq!(ReconnectBackoff::new(Vec::new(), 1).delay_for(1), Duration::ZERO);
    }
}
