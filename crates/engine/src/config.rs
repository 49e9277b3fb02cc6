//! Engine tunables
//!
//! Defaults live here; `EngineConfig::from_env` overlays `ZONE_OPT_*`
//! environment variables so deployments can tune without recompiling.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

/// Thresholds shared by all pattern detectors
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectorConfig {
    /// Minimum zone width as a percentage of the zone midpoint
    pub min_zone_pct: Decimal,
    /// Overlap fraction above which a new zone is suppressed
    pub overlap_threshold: Decimal,
    /// Order block: body must exceed this multiple of the average body
    pub ob_strength_multiplier: Decimal,
    pub ob_body_window: usize,
    /// Liquidity sweep: candles each side of a swing point
    pub swing_lookback: usize,
    /// Liquidity sweep: oldest swing (in candles) a sweep may target
    pub sweep_max_age: usize,
    pub atr_period: usize,
    /// Candles scanned for the swing extremes stored in a zone's context
    pub context_lookback: usize,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            min_zone_pct: dec!(0.15),
            overlap_threshold: dec!(0.70),
            ob_strength_multiplier: dec!(1.5),
            ob_body_window: 20,
            swing_lookback: 3,
            sweep_max_age: 50,
            atr_period: 14,
            context_lookback: 20,
        }
    }
}

impl DetectorConfig {
    pub fn with_min_zone_pct(&self, min_zone_pct: Decimal) -> Self {
        Self {
            min_zone_pct,
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub max_workers: usize,
    /// Wall-clock budget per run, 0 disables the timeout
    pub run_timeout_secs: u64,
    /// Run results committed per storage transaction
    pub batch_size: usize,
    /// Closed trades kept in a run record (the most recent are kept)
    pub trade_retention: usize,
    pub min_candles: usize,
    pub min_trades: u32,
    pub entry_window_candles: u32,
    /// Replay finer candles when a candle touches both SL and TP
    pub intrabar_replay: bool,
    pub store_retry_attempts: u32,
    pub store_retry_backoff_ms: u64,
    pub max_runs_per_job: usize,
    pub detector: DetectorConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_workers: 4,
            run_timeout_secs: 120,
            batch_size: 50,
            trade_retention: 100,
            min_candles: 20,
            min_trades: 10,
            entry_window_candles: 100,
            intrabar_replay: true,
            store_retry_attempts: 3,
            store_retry_backoff_ms: 200,
            max_runs_per_job: 20_000,
            detector: DetectorConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Defaults overlaid with any `ZONE_OPT_*` variables present in the environment
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.max_workers = env_or("ZONE_OPT_MAX_WORKERS", config.max_workers).max(1);
        config.run_timeout_secs = env_or("ZONE_OPT_RUN_TIMEOUT_SECS", config.run_timeout_secs);
        config.batch_size = env_or("ZONE_OPT_BATCH_SIZE", config.batch_size).max(1);
        config.trade_retention = env_or("ZONE_OPT_TRADE_RETENTION", config.trade_retention);
        config.min_candles = env_or("ZONE_OPT_MIN_CANDLES", config.min_candles);
        config.min_trades = env_or("ZONE_OPT_MIN_TRADES", config.min_trades);
        config.entry_window_candles =
            env_or("ZONE_OPT_ENTRY_WINDOW", config.entry_window_candles).max(1);
        config.intrabar_replay = env_or("ZONE_OPT_INTRABAR_REPLAY", config.intrabar_replay);
        config.store_retry_attempts =
            env_or("ZONE_OPT_STORE_RETRIES", config.store_retry_attempts).max(1);
        config.store_retry_backoff_ms =
            env_or("ZONE_OPT_STORE_BACKOFF_MS", config.store_retry_backoff_ms);
        config.max_runs_per_job = env_or("ZONE_OPT_MAX_RUNS_PER_JOB", config.max_runs_per_job);
        config.detector.overlap_threshold =
            env_or("ZONE_OPT_OVERLAP_THRESHOLD", config.detector.overlap_threshold);
        config.detector.ob_strength_multiplier = env_or(
            "ZONE_OPT_OB_STRENGTH_MULTIPLIER",
            config.detector.ob_strength_multiplier,
        );
        config
    }

    pub fn run_timeout(&self) -> Option<Duration> {
        (self.run_timeout_secs > 0).then(|| Duration::from_secs(self.run_timeout_secs))
    }

    pub fn store_backoff(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.store_retry_backoff_ms.saturating_mul(1 << attempt.min(10)))
    }
}

fn env_or<T: FromStr + Copy>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!(key, value = %raw, "Ignoring unparseable config value");
            default
        }),
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.batch_size, 50);
        assert_eq!(config.detector.min_zone_pct, dec!(0.15));
        assert_eq!(config.detector.overlap_threshold, dec!(0.70));
        assert_eq!(config.run_timeout(), Some(Duration::from_secs(120)));
    }

    #[test]
    fn test_backoff_doubles() {
        let config = EngineConfig::default();
        assert_eq!(config.store_backoff(0), Duration::from_millis(200));
        assert_eq!(config.store_backoff(2), Duration::from_millis(800));
    }

    #[test]
    fn test_zero_timeout_disables_budget() {
        let config = EngineConfig {
            run_timeout_secs: 0,
            ..Default::default()
        };
        assert!(config.run_timeout().is_none());
    }
}
