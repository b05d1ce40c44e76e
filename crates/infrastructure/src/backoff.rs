//! 重连退避策略
//!
//! 第 `n` 次失败（从0开始计数）后的等待时间为 `base + step × n`，并以 `max` 为上限。
//! 默认参数下依次为 5s、6s、7s……

use std::time::Duration;

use tenant_core::MessageQueueConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectBackoff {
    pub base: Duration,
    pub step: Duration,
    pub max: Duration,
}

impl Default for ReconnectBackoff {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(5),
            step: Duration::from_secs(1),
            max: Duration::from_secs(60),
        }
    }
}

impl ReconnectBackoff {
    pub fn from_config(config: &MessageQueueConfig) -> Self {
        Self {
            base: config.reconnect_delay(),
            step: config.reconnect_step(),
            max: config.reconnect_max_delay(),
        }
    }

    /// 第 `retry_count` 次重试前的等待时间
    pub fn delay(&self, retry_count: u32) -> Duration {
        let grown = self
            .step
            .checked_mul(retry_count)
            .and_then(|extra| self.base.checked_add(extra))
            .unwrap_or(self.max);
        grown.min(self.max.max(self.base))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linear_growth() {
        let backoff = ReconnectBackoff::default();
        assert_eq!(backoff.delay(0), Duration::from_secs(5));
        assert_eq!(backoff.delay(1), Duration::from_secs(6));
        assert_eq!(backoff.delay(2), Duration::from_secs(7));
        assert_eq!(backoff.delay(10), Duration::from_secs(15));
    }

    #[test]
    fn test_capped_at_max() {
        let backoff = ReconnectBackoff {
            base: Duration::from_secs(5),
            step: Duration::from_secs(1),
            max: Duration::from_secs(8),
        };
        assert_eq!(backoff.delay(3), Duration::from_secs(8));
        assert_eq!(backoff.delay(1000), Duration::from_secs(8));
        assert_eq!(backoff.delay(u32::MAX), Duration::from_secs(8));
    }

    #[test]
    fn test_zero_step_is_constant() {
        let backoff = ReconnectBackoff {
            base: Duration::from_millis(500),
            step: Duration::ZERO,
            max: Duration::from_secs(30),
        };
        for attempt in 0..10 {
            assert_eq!(backoff.delay(attempt), Duration::from_millis(500));
        }
    }

    #[test]
    fn test_from_config() {
        let config = MessageQueueConfig {
            reconnect_delay_seconds: 2,
            reconnect_step_seconds: 3,
            reconnect_max_delay_seconds: 20,
            ..Default::default()
        };
        let backoff = ReconnectBackoff::from_config(&config);
        assert_eq!(backoff.delay(0), Duration::from_secs(2));
        assert_eq!(backoff.delay(2), Duration::from_secs(8));
        assert_eq!(backoff.delay(9), Duration::from_secs(20));
    }
}
