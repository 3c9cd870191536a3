//! Retry pacing: exponential policy for expensive loads, linear pacing for
//! cheap stream reconnects.

use std::time::Duration;

use rand::Rng;

/// Exponential backoff with jitter. A bounded policy stops handing out
/// delays once its step budget is spent; an unbounded one never does.
#[derive(Debug)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    next: Duration,
    steps_left: Option<u32>,
}

impl Backoff {
    pub fn bounded(base: Duration, cap: Duration, steps: u32) -> Self {
        Self {
            base,
            cap,
            next: base,
            steps_left: Some(steps),
        }
    }

    pub fn unbounded(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap,
            next: base,
            steps_left: None,
        }
    }

    /// Delay before the next attempt, or None once the budget is spent.
    /// Doubles per step, capped, with a ±10% jitter so sessions that fail
    /// together do not retry in lockstep.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if let Some(left) = &mut self.steps_left {
            if *left == 0 {
                return None;
            }
            *left -= 1;
        }
        let current = self.next;
        self.next = (current * 2).min(self.cap);
        Some(jitter(current))
    }

    /// Start pacing from the base again after a success.
    pub fn reset(&mut self) {
        self.next = self.base;
    }
}

fn jitter(d: Duration) -> Duration {
    d.mul_f64(rand::thread_rng().gen_range(0.9..=1.1))
}

/// Pacing between reconnects of an established session. Reconnects are
/// cheap on the server, so growth is linear with a low ceiling.
pub fn reconnect_delay(reconnects: u32, step: Duration, cap: Duration) -> Duration {
    step.saturating_mul(reconnects).min(cap)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_near(actual: Duration, expected: Duration) {
        assert!(
            actual >= expected.mul_f64(0.9) && actual <= expected.mul_f64(1.1),
            "{actual:?} not within 10% of {expected:?}"
        );
    }

    #[test]
    fn doubles_until_the_cap() {
        let mut b = Backoff::unbounded(Duration::from_secs(1), Duration::from_secs(5));
        assert_near(b.next_delay().unwrap(), Duration::from_secs(1));
        assert_near(b.next_delay().unwrap(), Duration::from_secs(2));
        assert_near(b.next_delay().unwrap(), Duration::from_secs(4));
        assert_near(b.next_delay().unwrap(), Duration::from_secs(5));
        assert_near(b.next_delay().unwrap(), Duration::from_secs(5));
    }

    #[test]
    fn bounded_policy_runs_out() {
        let mut b = Backoff::bounded(Duration::from_secs(1), Duration::from_secs(60), 3);
        assert!(b.next_delay().is_some());
        assert!(b.next_delay().is_some());
        assert!(b.next_delay().is_some());
        assert!(b.next_delay().is_none());
        assert!(b.next_delay().is_none());
    }

    #[test]
    fn zero_step_budget_fails_immediately() {
        let mut b = Backoff::bounded(Duration::from_secs(1), Duration::from_secs(60), 0);
        assert!(b.next_delay().is_none());
    }

    #[test]
    fn reset_returns_to_base() {
        let mut b = Backoff::unbounded(Duration::from_secs(1), Duration::from_secs(300));
        b.next_delay();
        b.next_delay();
        b.reset();
        assert_near(b.next_delay().unwrap(), Duration::from_secs(1));
    }

    #[test]
    fn reconnect_delay_is_linear_and_capped() {
        let step = Duration::from_secs(5);
        let cap = Duration::from_secs(30);
        assert_eq!(reconnect_delay(1, step, cap), Duration::from_secs(5));
        assert_eq!(reconnect_delay(3, step, cap), Duration::from_secs(15));
        assert_eq!(reconnect_delay(10, step, cap), Duration::from_secs(30));
    }
}
