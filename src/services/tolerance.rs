//! Amount tolerance and severity policy.
//!
//! All tolerance checks in the engine run through this policy so that the
//! matcher, the variance classifier and the resolution sweep agree on what
//! "close enough" means.

use rust_decimal::Decimal;

use crate::config::ToleranceConfig;
use crate::models::{DetectedVariance, Severity};

#[derive(Debug, Clone)]
pub struct TolerancePolicy {
    config: ToleranceConfig,
}

impl TolerancePolicy {
    pub fn new(config: ToleranceConfig) -> Self {
        Self { config }
    }

    /// Absolute tolerance band for an expected ledger-side amount:
    /// `max(|expected| * pct, floor)`.
    pub fn tolerance_for(&self, expected: Decimal) -> Decimal {
        let relative = expected.abs() * self.config.amount_tolerance_pct;
        relative.max(self.config.amount_tolerance_floor)
    }

    /// Whether a bank-side amount agrees with a ledger-side amount.
    ///
    /// The band is always scaled to the ledger side, so the check is
    /// deliberately asymmetric: `amounts_match(a, b)` and
    /// `amounts_match(b, a)` can disagree near the boundary.
    pub fn amounts_match(&self, bank_amount: Decimal, ledger_amount: Decimal) -> bool {
        (bank_amount - ledger_amount).abs() <= self.tolerance_for(ledger_amount)
    }

    /// Severity bucket for an absolute variance amount. The limits are
    /// exclusive upper bounds: a difference exactly at a limit falls into
    /// the next bucket up.
    pub fn severity_of(&self, difference: Decimal) -> Severity {
        let magnitude = difference.abs();
        if magnitude < self.config.severity_low_limit {
            Severity::Low
        } else if magnitude < self.config.severity_medium_limit {
            Severity::Medium
        } else if magnitude < self.config.severity_high_limit {
            Severity::High
        } else {
            Severity::Critical
        }
    }

    /// Match quality score: 100 minus a per-variance penalty, floored at zero.
    pub fn match_score(&self, variances: &[DetectedVariance]) -> i32 {
        let penalty: i32 = variances.iter().map(|v| v.severity.penalty()).sum();
        (100 - penalty).max(0)
    }

    pub fn date_window_days(&self) -> i64 {
        self.config.date_window_days
    }

    pub fn instrument_distribution_pct(&self) -> Decimal {
        self.config.instrument_distribution_pct
    }

    pub fn config(&self) -> &ToleranceConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::VarianceKind;

    fn policy() -> TolerancePolicy {
        TolerancePolicy::new(ToleranceConfig::default())
    }

    fn variance_with(severity: Severity) -> DetectedVariance {
        DetectedVariance {
            kind: VarianceKind::TotalAmount,
            severity,
            instrument: None,
            expected: Decimal::ZERO,
            actual: Decimal::ZERO,
            difference: Decimal::ZERO,
            difference_pct: None,
            description: String::new(),
            auto_approved: false,
            approval_reason: None,
        }
    }

    #[test]
    fn test_tolerance_floor_dominates_small_amounts() {
        let p = policy();
        // 1% of 50,000 is 500, below the 1,000 floor.
        assert_eq!(p.tolerance_for(Decimal::from(50_000)), Decimal::from(1_000));
        assert_eq!(
            p.tolerance_for(Decimal::from(-50_000)),
            Decimal::from(1_000)
        );
    }

    #[test]
    fn test_tolerance_scales_with_large_amounts() {
        let p = policy();
        assert_eq!(
            p.tolerance_for(Decimal::from(1_000_000)),
            Decimal::from(10_000)
        );
    }

    #[test]
    fn test_amounts_match_is_scaled_to_ledger_side() {
        let p = policy();
        let bank = Decimal::from(1_010_050);
        let ledger = Decimal::from(1_000_000);
        // Band from the ledger side is 10,000, the gap is 10,050.
        assert!(!p.amounts_match(bank, ledger));
        // Band from the bank side is 10,100.50, so the reversed check passes.
        assert!(p.amounts_match(ledger, bank));
    }

    #[test]
    fn test_amounts_match_within_band() {
        let p = policy();
        assert!(p.amounts_match(Decimal::from(100_400), Decimal::from(100_000)));
        assert!(p.amounts_match(Decimal::from(-100_000), Decimal::from(-100_900)));
        assert!(!p.amounts_match(Decimal::from(103_000), Decimal::from(100_000)));
    }

    #[test]
    fn test_boundary_gap_equal_to_tolerance_matches() {
        let p = policy();
        // Floor dominates: tolerance for 50,000 is exactly 1,000.
        assert!(p.amounts_match(Decimal::from(51_000), Decimal::from(50_000)));
        assert!(!p.amounts_match(Decimal::new(51_000_01, 2), Decimal::from(50_000)));
    }

    #[test]
    fn test_severity_buckets_and_boundaries() {
        let p = policy();
        assert_eq!(p.severity_of(Decimal::from(500)), Severity::Low);
        assert_eq!(p.severity_of(Decimal::new(999_99, 2)), Severity::Low);
        // A difference exactly at a limit falls into the next bucket up.
        assert_eq!(p.severity_of(Decimal::from(1_000)), Severity::Medium);
        assert_eq!(p.severity_of(Decimal::from(9_999)), Severity::Medium);
        assert_eq!(p.severity_of(Decimal::from(10_000)), Severity::High);
        assert_eq!(p.severity_of(Decimal::from(100_000)), Severity::Critical);
        // Bucketing works on magnitude, not sign.
        assert_eq!(p.severity_of(Decimal::from(-100_000)), Severity::Critical);
    }

    #[test]
    fn test_match_score_subtracts_penalties() {
        let p = policy();
        assert_eq!(p.match_score(&[]), 100);
        assert_eq!(p.match_score(&[variance_with(Severity::Low)]), 95);
        assert_eq!(
            p.match_score(&[
                variance_with(Severity::Medium),
                variance_with(Severity::High)
            ]),
            55
        );
    }

    #[test]
    fn test_match_score_floors_at_zero() {
        let p = policy();
        let variances = vec![
            variance_with(Severity::Critical),
            variance_with(Severity::Critical),
            variance_with(Severity::Critical),
        ];
        assert_eq!(p.match_score(&variances), 0);
    }
}
