//! Engine configuration.

use std::time::Duration;

use tracing::warn;

/// Pause between two lookups of the same consulta.
pub const DEFAULT_ITEM_DELAY: Duration = Duration::from_secs(1);
/// A running consulta untouched for this long is considered orphaned.
pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(120);
/// How often the recovery sweep looks for orphaned consultas.
pub const DEFAULT_RECOVERY_INTERVAL: Duration = Duration::from_secs(30);

/// Reason stored on a consulta aborted through `cancel()`.
pub const CANCELLED_BY_USER: &str = "cancelled by user";

/// Consulta engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Fixed delay between items; respects the provider's implicit rate limit
    pub item_delay: Duration,
    /// Staleness threshold for running consultas
    pub stale_after: Duration,
    /// Period of the recovery sweep
    pub recovery_interval: Duration,
    /// Name for logging
    pub name: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            item_delay: DEFAULT_ITEM_DELAY,
            stale_after: DEFAULT_STALE_AFTER,
            recovery_interval: DEFAULT_RECOVERY_INTERVAL,
            name: "consulta-engine".to_string(),
        }
    }
}

impl EngineConfig {
    /// Defaults, overridden by `CONSULTA_ITEM_DELAY_MS`, `CONSULTA_STALE_AFTER_SECS`
    /// and `CONSULTA_RECOVERY_INTERVAL_SECS` when set.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            item_delay: duration_var(&lookup, "CONSULTA_ITEM_DELAY_MS", Duration::from_millis)
                .unwrap_or(defaults.item_delay),
            stale_after: duration_var(&lookup, "CONSULTA_STALE_AFTER_SECS", Duration::from_secs)
                .unwrap_or(defaults.stale_after),
            recovery_interval: duration_var(
                &lookup,
                "CONSULTA_RECOVERY_INTERVAL_SECS",
                Duration::from_secs,
            )
            .filter(|d| !d.is_zero())
            .unwrap_or(defaults.recovery_interval),
            name: defaults.name,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_item_delay(mut self, delay: Duration) -> Self {
        self.item_delay = delay;
        self
    }

    pub fn with_stale_after(mut self, threshold: Duration) -> Self {
        self.stale_after = threshold;
        self
    }

    pub fn with_recovery_interval(mut self, interval: Duration) -> Self {
        self.recovery_interval = interval;
        self
    }
}

fn duration_var(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    unit: fn(u64) -> Duration,
) -> Option<Duration> {
    let raw = lookup(key)?;
    match raw.trim().parse::<u64>() {
        Ok(v) => Some(unit(v)),
        Err(e) => {
            warn!(var = key, value = %raw, error = %e, "ignoring invalid engine setting");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn from(vars: &[(&str, &str)]) -> EngineConfig {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        EngineConfig::from_lookup(|k| vars.get(k).cloned())
    }

    #[test]
    fn defaults_match_policy_values() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.item_delay, Duration::from_secs(1));
        assert_eq!(cfg.stale_after, Duration::from_secs(120));
        assert_eq!(cfg.recovery_interval, Duration::from_secs(30));
    }

    #[test]
    fn env_overrides_are_applied() {
        let cfg = from(&[
            ("CONSULTA_ITEM_DELAY_MS", "250"),
            ("CONSULTA_STALE_AFTER_SECS", "60"),
            ("CONSULTA_RECOVERY_INTERVAL_SECS", "5"),
        ]);
        assert_eq!(cfg.item_delay, Duration::from_millis(250));
        assert_eq!(cfg.stale_after, Duration::from_secs(60));
        assert_eq!(cfg.recovery_interval, Duration::from_secs(5));
    }

    #[test]
    fn invalid_values_fall_back_to_defaults() {
        let cfg = from(&[
            ("CONSULTA_ITEM_DELAY_MS", "fast"),
            ("CONSULTA_RECOVERY_INTERVAL_SECS", "0"),
        ]);
        assert_eq!(cfg.item_delay, DEFAULT_ITEM_DELAY);
        assert_eq!(cfg.recovery_interval, DEFAULT_RECOVERY_INTERVAL);
    }

    #[test]
    fn builder_methods_override_fields() {
        let cfg = EngineConfig::default()
            .with_name("test")
            .with_item_delay(Duration::ZERO)
            .with_stale_after(Duration::from_secs(1));
        assert_eq!(cfg.name, "test");
        assert!(cfg.item_delay.is_zero());
        assert_eq!(cfg.stale_after, Duration::from_secs(1));
    }
}
