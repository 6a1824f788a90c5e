use std::time::Duration;

use envconfig::Envconfig;

use crate::{reconciler::Settings, retry::RetryPolicy};

#[derive(Envconfig, Clone, Debug)]
pub struct Config {
    #[envconfig(from = "MODELBOX_NAMESPACE")]
    pub namespace: Option<String>,

    #[envconfig(from = "MODELBOX_CONCURRENCY", default = "4")]
    pub concurrency: u16,

    #[envconfig(from = "MODELBOX_RECONCILE_TIMEOUT_SECS", default = "30")]
    pub reconcile_timeout_secs: u64,

    #[envconfig(from = "MODELBOX_ERROR_REQUEUE_SECS", default = "10")]
    pub error_requeue_secs: u64,

    /// Total write attempts per object when the API server reports a conflict.
    #[envconfig(from = "MODELBOX_CONFLICT_RETRIES", default = "5")]
    pub conflict_retries: u32,

    #[envconfig(from = "MODELBOX_CONFLICT_BACKOFF_MS", default = "10")]
    pub conflict_backoff_ms: u64,

    #[envconfig(from = "MODELBOX_REFRESH_LAST_APPLIED", default = "true")]
    pub refresh_last_applied: bool,
}

impl Config {
    pub fn reconcile_timeout(&self) -> Duration {
        Duration::from_secs(self.reconcile_timeout_secs)
    }

    pub fn error_requeue(&self) -> Duration {
        Duration::from_secs(self.error_requeue_secs)
    }

    pub fn settings(&self) -> Settings {
        Settings {
            retry: RetryPolicy {
                max_attempts: self.conflict_retries,
                backoff: Duration::from_millis(self.conflict_backoff_ms),
            },
            refresh_last_applied: self.refresh_last_applied,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn defaults_apply_when_unset() {
        let config = Config::init_from_hashmap(&HashMap::new()).unwrap();

        assert_eq!(config.namespace, None);
        assert_eq!(config.concurrency, 4);
        assert_eq!(config.reconcile_timeout(), Duration::from_secs(30));
        assert_eq!(config.error_requeue(), Duration::from_secs(10));
        assert_eq!(config.settings(), Settings::default());
    }

    #[test]
    fn overrides_are_read() {
        let vars = HashMap::from([
            ("MODELBOX_NAMESPACE".to_string(), "models".to_string()),
            ("MODELBOX_CONFLICT_RETRIES".to_string(), "2".to_string()),
            ("MODELBOX_CONFLICT_BACKOFF_MS".to_string(), "50".to_string()),
            ("MODELBOX_REFRESH_LAST_APPLIED".to_string(), "false".to_string()),
        ]);

        let config = Config::init_from_hashmap(&vars).unwrap();
        let settings = config.settings();

        assert_eq!(config.namespace.as_deref(), Some("models"));
        assert_eq!(settings.retry.max_attempts, 2);
        assert_eq!(settings.retry.backoff, Duration::from_millis(50));
        assert!(!settings.refresh_last_applied);
    }

    #[test]
    fn malformed_value_is_rejected() {
        let vars = HashMap::from([("MODELBOX_CONCURRENCY".to_string(), "many".to_string())]);
        assert!(Config::init_from_hashmap(&vars).is_err());
    }
}
