//! Configuration module for the reconciliation engine.

use rust_decimal::Decimal;
use std::env;

/// Top-level engine configuration.
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    pub tolerance: ToleranceConfig,
    pub sweep: SweepConfig,
}

/// Tolerance and severity knobs used by the matcher and variance classifier.
///
/// Amount tolerance is `max(|expected| * amount_tolerance_pct, amount_tolerance_floor)`,
/// always computed against the ledger-side amount.
#[derive(Debug, Clone)]
pub struct ToleranceConfig {
    /// Relative amount tolerance (0.01 = 1%).
    pub amount_tolerance_pct: Decimal,
    /// Absolute floor for the amount tolerance, in account currency.
    pub amount_tolerance_floor: Decimal,
    /// Maximum date distance, in days, for amount-and-window matching.
    pub date_window_days: i64,
    /// Relative threshold for per-instrument amount and share comparisons (0.05 = 5%).
    pub instrument_distribution_pct: Decimal,
    /// Absolute variance below this amount is low severity.
    pub severity_low_limit: Decimal,
    /// Absolute variance below this amount is medium severity.
    pub severity_medium_limit: Decimal,
    /// Absolute variance below this amount is high severity; at or beyond
    /// it is critical.
    pub severity_high_limit: Decimal,
}

/// Resolution sweep sizing.
#[derive(Debug, Clone)]
pub struct SweepConfig {
    /// Maximum flagged records examined per side per invocation.
    pub chunk_size: usize,
}

impl Default for ToleranceConfig {
    fn default() -> Self {
        Self {
            amount_tolerance_pct: Decimal::new(1, 2),
            amount_tolerance_floor: Decimal::from(1_000),
            date_window_days: 7,
            instrument_distribution_pct: Decimal::new(5, 2),
            severity_low_limit: Decimal::from(1_000),
            severity_medium_limit: Decimal::from(10_000),
            severity_high_limit: Decimal::from(100_000),
        }
    }
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self { chunk_size: 200 }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        Self {
            tolerance: ToleranceConfig::from_env(),
            sweep: SweepConfig::from_env(),
        }
    }
}

impl ToleranceConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            amount_tolerance_pct: decimal_env("RECON_AMOUNT_TOLERANCE_PCT")
                .unwrap_or(defaults.amount_tolerance_pct),
            amount_tolerance_floor: decimal_env("RECON_AMOUNT_TOLERANCE_FLOOR")
                .unwrap_or(defaults.amount_tolerance_floor),
            date_window_days: env::var("RECON_DATE_WINDOW_DAYS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.date_window_days),
            instrument_distribution_pct: decimal_env("RECON_INSTRUMENT_DISTRIBUTION_PCT")
                .unwrap_or(defaults.instrument_distribution_pct),
            severity_low_limit: decimal_env("RECON_SEVERITY_LOW_LIMIT")
                .unwrap_or(defaults.severity_low_limit),
            severity_medium_limit: decimal_env("RECON_SEVERITY_MEDIUM_LIMIT")
                .unwrap_or(defaults.severity_medium_limit),
            severity_high_limit: decimal_env("RECON_SEVERITY_HIGH_LIMIT")
                .unwrap_or(defaults.severity_high_limit),
        }
    }
}

impl SweepConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            chunk_size: env::var("RECON_SWEEP_CHUNK_SIZE")
                .ok()
                .and_then(|s| s.parse().ok())
                .filter(|&n| n > 0)
                .unwrap_or(defaults.chunk_size),
        }
    }
}

fn decimal_env(name: &str) -> Option<Decimal> {
    env::var(name).ok().and_then(|s| s.parse().ok())
}
