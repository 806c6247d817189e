//! Wait strategies applied between attempts of a failing step.

use std::time::Duration;

/// How long the engine sleeps before re-invoking a step that just failed.
#[derive(Debug, Clone)]
pub enum BackoffPolicy {
    /// The same pause before every attempt.
    Fixed(Duration),
    /// Doubles the base pause each attempt, never exceeding `max`.
    Exponential { base: Duration, max: Duration },
    /// Re-invoke immediately.
    None,
}

impl BackoffPolicy {
    /// Pause before attempt number `attempt`, counting from zero.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        match self {
            BackoffPolicy::Fixed(d) => *d,
            BackoffPolicy::Exponential { base, max } => {
                let millis = base.as_millis() as u64 * 2u64.saturating_pow(attempt);
                Duration::from_millis(millis).min(*max)
            }
            BackoffPolicy::None => Duration::ZERO,
        }
    }

    /// A sensible exponential policy for runs against real services.
    pub fn standard() -> Self {
        BackoffPolicy::Exponential {
            base: Duration::from_millis(500),
            max: Duration::from_secs(30),
        }
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffPolicy::None
    }
}
