use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::info;

/// Wait strategy applied between a failed attempt and its re-dispatch.
///
/// `wait` runs inside the retried task's own execution unit, so a long delay
/// only holds up that task.
#[async_trait]
pub trait RetryPolicy: Send + Sync + fmt::Debug {
    /// Delay before the retry numbered `attempt` (0 for the first retry).
    fn delay(&self, attempt: u32) -> Duration;

    async fn wait(&self, task_name: &str, attempt: u32) {
        let delay = self.delay(attempt);
        info!(
            task = task_name,
            attempt,
            delay_ms = delay.as_millis() as u64,
            "waiting before retry"
        );
        sleep(delay).await;
    }
}

/// Waits the same period before every retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConstantDelay {
    pub period: Duration,
}

impl ConstantDelay {
    pub fn new(period: Duration) -> Self {
        Self { period }
    }

    pub fn from_secs(secs: u64) -> Self {
        Self::new(Duration::from_secs(secs))
    }
}

impl RetryPolicy for ConstantDelay {
    fn delay(&self, _attempt: u32) -> Duration {
        self.period
    }
}

/// Waits `base^attempt` units before each retry (one unit is a second by default).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExponentialBackoff {
    pub base: u32,
    pub unit: Duration,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            base: DEFAULT_BASE,
            unit: Duration::from_secs(1),
        }
    }
}

impl ExponentialBackoff {
    pub fn with_unit(unit: Duration) -> Self {
        Self {
            unit,
            ..Default::default()
        }
    }
}

impl RetryPolicy for ExponentialBackoff {
    fn delay(&self, attempt: u32) -> Duration {
        self.base
            .checked_pow(attempt)
            .and_then(|factor| self.unit.checked_mul(factor))
            .unwrap_or(Duration::MAX)
    }
}

const DEFAULT_BASE: u32 = 2;
const DEFAULT_PERIOD: Duration = Duration::from_secs(1);

/// Serializable retry settings, turned into a policy with [`RetryConfig::build`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RetryConfig {
    Constant {
        period_secs: f64,
    },
    Exponential {
        #[serde(default = "default_base")]
        base: u32,
    },
}

fn default_base() -> u32 {
    DEFAULT_BASE
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig::Constant {
            period_secs: DEFAULT_PERIOD.as_secs_f64(),
        }
    }
}

impl RetryConfig {
    /// Builds the policy, replacing unusable values with defaults:
    /// a negative or non-finite period becomes one second, a zero base becomes 2.
    pub fn build(&self) -> Arc<dyn RetryPolicy> {
        match *self {
            RetryConfig::Constant { period_secs } => {
                let period = Duration::try_from_secs_f64(period_secs).unwrap_or(DEFAULT_PERIOD);
                Arc::new(ConstantDelay::new(period))
            }
            RetryConfig::Exponential { base } => {
                let base = if base == 0 { DEFAULT_BASE } else { base };
                Arc::new(ExponentialBackoff {
                    base,
                    ..Default::default()
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn constant_delay_ignores_attempt() {
        let policy = ConstantDelay::from_secs(3);
        assert_eq!(policy.delay(0), Duration::from_secs(3));
        assert_eq!(policy.delay(7), Duration::from_secs(3));
    }

    #[rstest]
    #[case(0, 1)]
    #[case(1, 2)]
    #[case(2, 4)]
    #[case(5, 32)]
    fn exponential_backoff_doubles(#[case] attempt: u32, #[case] secs: u64) {
        let policy = ExponentialBackoff::default();
        assert_eq!(policy.delay(attempt), Duration::from_secs(secs));
    }

    #[rstest]
    #[case(0, 100)]
    #[case(3, 800)]
    fn exponential_backoff_scales_with_unit(#[case] attempt: u32, #[case] millis: u64) {
        let policy = ExponentialBackoff::with_unit(Duration::from_millis(100));
        assert_eq!(policy.delay(attempt), Duration::from_millis(millis));
    }

    #[test]
    fn exponential_backoff_saturates() {
        let policy = ExponentialBackoff::default();
        assert_eq!(policy.delay(200), Duration::MAX);
    }

    #[test]
    fn config_normalizes_bad_values() {
        let constant = RetryConfig::Constant { period_secs: -4.0 }.build();
        assert_eq!(constant.delay(0), DEFAULT_PERIOD);

        let exponential = RetryConfig::Exponential { base: 0 }.build();
        assert_eq!(exponential.delay(3), Duration::from_secs(8));
    }

    #[test]
    fn config_deserializes_tagged() {
        let cfg: RetryConfig = serde_json::from_str(r#"{"kind":"exponential"}"#).unwrap();
        assert_eq!(cfg, RetryConfig::Exponential { base: 2 });

        let cfg: RetryConfig =
            serde_json::from_str(r#"{"kind":"constant","period_secs":0.5}"#).unwrap();
        assert_eq!(cfg.build().delay(0), Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn wait_sleeps_for_the_delay() {
        let policy = ConstantDelay::from_secs(10);
        let start = tokio::time::Instant::now();
        policy.wait("task", 0).await;
        assert!(start.elapsed() >= Duration::from_secs(10));
    }
}
