//! Configuration for clusters and the agents they spawn.
//!
//! [`BehaviorParams`] is per agent (clock, random seed, heap limits) and
//! [`ClusterConfig`] is applied once, to the process-wide engine platform.

use crate::runtime::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Clock selection for an agent. Times are milliseconds since the Unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClockConfig {
    /// Starts at `epoch` and advances by `interval` on every query.
    #[serde(rename_all = "camelCase")]
    Deterministic { epoch: i64, interval: i64 },

    /// Frozen for the duration of a task, refreshed when the next task starts.
    #[serde(rename_all = "camelCase")]
    Microtask {
        #[serde(default)]
        epoch: Option<i64>,
    },

    /// Wall-clock progression starting from `epoch`.
    #[serde(rename_all = "camelCase")]
    Realtime { epoch: i64 },

    /// Pass-through system time.
    #[default]
    System,
}

/// Per-agent behavior parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct BehaviorParams {
    pub clock: ClockConfig,

    /// Seed for the first realm's `Math.random`, consumed at most once.
    pub random_seed: Option<f64>,

    /// Maximum heap size in bytes (None = V8 default)
    pub max_heap_size: Option<usize>,

    /// Initial heap size in bytes (None = V8 default)
    pub initial_heap_size: Option<usize>,
}

impl BehaviorParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_clock(mut self, clock: ClockConfig) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_random_seed(mut self, seed: f64) -> Self {
        self.random_seed = Some(seed);
        self
    }

    pub fn with_max_heap_size(mut self, bytes: usize) -> Self {
        self.max_heap_size = Some(bytes);
        self
    }

    pub fn with_initial_heap_size(mut self, bytes: usize) -> Self {
        self.initial_heap_size = Some(bytes);
        self
    }

    /// Reject combinations the isolate cannot be created with.
    pub fn validate(&self) -> Result<()> {
        if self.initial_heap_size.is_some() && self.max_heap_size.is_none() {
            return Err(Error::InvalidConfig(
                "initial_heap_size requires max_heap_size to be set as well".to_string(),
            ));
        }

        if let (Some(initial), Some(max)) = (self.initial_heap_size, self.max_heap_size) {
            if initial > max {
                return Err(Error::InvalidConfig(format!(
                    "initial_heap_size ({}) cannot exceed max_heap_size ({})",
                    initial, max
                )));
            }
        }

        if let ClockConfig::Deterministic { interval, .. } = self.clock {
            if interval < 0 {
                return Err(Error::InvalidConfig(format!(
                    "deterministic clock interval must not be negative (got {})",
                    interval
                )));
            }
        }

        Ok(())
    }
}

/// Process-wide engine settings, applied by the first platform built.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClusterConfig {
    /// Worker threads for the engine's background jobs (0 = engine default).
    pub thread_pool_size: u32,

    /// Flags passed to V8 before initialization.
    pub v8_flags: Option<String>,
}

impl ClusterConfig {
    pub fn with_thread_pool_size(mut self, threads: u32) -> Self {
        self.thread_pool_size = threads;
        self
    }

    pub fn with_v8_flags(mut self, flags: impl Into<String>) -> Self {
        self.v8_flags = Some(flags.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_params() {
        let params = BehaviorParams::default();
        assert_eq!(params.clock, ClockConfig::System);
        assert!(params.random_seed.is_none());
        assert!(params.max_heap_size.is_none());
        assert!(params.initial_heap_size.is_none());
        assert!(params.validate().is_ok());
    }

    #[test]
    fn test_params_builder() {
        let params = BehaviorParams::new()
            .with_clock(ClockConfig::Deterministic {
                epoch: 1_000,
                interval: 10,
            })
            .with_random_seed(7.0)
            .with_max_heap_size(100 * 1024 * 1024)
            .with_initial_heap_size(1024 * 1024);

        assert_eq!(params.random_seed, Some(7.0));
        assert_eq!(params.max_heap_size, Some(100 * 1024 * 1024));
        assert!(params.validate().is_ok());
    }

    #[test]
    fn test_initial_heap_requires_max() {
        let params = BehaviorParams::new().with_initial_heap_size(1024);
        let err = params.validate().unwrap_err();
        assert!(err.to_string().contains("requires max_heap_size"));
    }

    #[test]
    fn test_initial_heap_cannot_exceed_max() {
        let params = BehaviorParams::new()
            .with_max_heap_size(1024)
            .with_initial_heap_size(4096);
        assert!(matches!(params.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_negative_interval_rejected() {
        let params = BehaviorParams::new().with_clock(ClockConfig::Deterministic {
            epoch: 0,
            interval: -1,
        });
        assert!(params.validate().is_err());
    }

    #[test]
    fn test_clock_config_from_json() {
        let clock: ClockConfig =
            serde_json::from_str(r#"{"type":"deterministic","epoch":0,"interval":5}"#).unwrap();
        assert_eq!(
            clock,
            ClockConfig::Deterministic {
                epoch: 0,
                interval: 5
            }
        );

        let clock: ClockConfig = serde_json::from_str(r#"{"type":"microtask"}"#).unwrap();
        assert_eq!(clock, ClockConfig::Microtask { epoch: None });

        let clock: ClockConfig = serde_json::from_str(r#"{"type":"system"}"#).unwrap();
        assert_eq!(clock, ClockConfig::System);
    }

    #[test]
    fn test_params_from_json() {
        let params: BehaviorParams = serde_json::from_str(
            r#"{"clock":{"type":"realtime","epoch":86400000},"randomSeed":42,"maxHeapSize":10485760}"#,
        )
        .unwrap();
        assert_eq!(params.clock, ClockConfig::Realtime { epoch: 86_400_000 });
        assert_eq!(params.random_seed, Some(42.0));
        assert_eq!(params.max_heap_size, Some(10 * 1024 * 1024));
        assert!(params.initial_heap_size.is_none());
    }

    #[test]
    fn test_cluster_config_defaults() {
        let config = ClusterConfig::default();
        assert_eq!(config.thread_pool_size, 0);
        assert_eq!(config.v8_flags, None);

        let config = config.with_thread_pool_size(2).with_v8_flags("--no-opt");
        assert_eq!(config.thread_pool_size, 2);
        assert_eq!(config.v8_flags.as_deref(), Some("--no-opt"));
    }
}
