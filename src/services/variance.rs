//! Variance classification and status resolution for matched pairs.
//!
//! The classifier compares the two sides of a non-manual match and emits one
//! [`DetectedVariance`] per discrepancy. Total-amount disagreement is never
//! auto-approved; small instrument-level noise and in-window date drift are.

use rust_decimal::Decimal;
use std::collections::HashSet;

use crate::models::{
    BankRecord, DetectedVariance, GoalTransactionGroup, InstrumentAmounts, InstrumentCode,
    ReconciliationStatus, Severity, VarianceKind,
};
use crate::services::tolerance::TolerancePolicy;

/// Status decision for the records behind one match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusResolution {
    pub status: ReconciliationStatus,
    pub all_auto_approved: bool,
}

/// Classify the discrepancies between the bank side and ledger side of a
/// match. Both sides must be non-empty.
///
/// Instrument-level checks only run when both sides carry a breakdown; a
/// side without instrument data is treated as unreported, not as zero.
pub fn classify_match(
    bank_records: &[&BankRecord],
    groups: &[&GoalTransactionGroup],
    policy: &TolerancePolicy,
) -> Vec<DetectedVariance> {
    let mut variances = Vec::new();

    let bank_total: Decimal = bank_records.iter().map(|r| r.amount).sum();
    let group_total: Decimal = groups.iter().map(|g| g.net_amount).sum();

    let totals_agree = policy.amounts_match(bank_total, group_total);
    if !totals_agree {
        let difference = bank_total - group_total;
        let difference_pct = if group_total != Decimal::ZERO {
            Some((difference.abs() / group_total.abs()) * Decimal::ONE_HUNDRED)
        } else {
            None
        };
        variances.push(DetectedVariance {
            kind: VarianceKind::TotalAmount,
            severity: policy.severity_of(difference),
            instrument: None,
            expected: group_total,
            actual: bank_total,
            difference,
            difference_pct,
            description: format!(
                "bank total {} differs from ledger total {} by {}",
                bank_total,
                group_total,
                difference.abs()
            ),
            auto_approved: false,
            approval_reason: None,
        });
    }

    let mut bank_instruments = InstrumentAmounts::new();
    for record in bank_records {
        bank_instruments.merge(&record.instrument_amounts);
    }
    let mut group_instruments = InstrumentAmounts::new();
    for group in groups {
        group_instruments.merge(&group.net_instrument_amounts);
    }

    if !bank_instruments.is_empty() && !group_instruments.is_empty() {
        let threshold = policy.instrument_distribution_pct();
        let auto_limit = threshold * Decimal::TWO;
        let mut flagged: HashSet<InstrumentCode> = HashSet::new();

        // Per-instrument amounts, relative to the ledger side. Instruments
        // the ledger does not carry have no baseline here; the share check
        // below picks those up.
        for instrument in InstrumentCode::ALL {
            let bank_amount = bank_instruments.get(instrument);
            let group_amount = group_instruments.get(instrument);
            if group_amount == Decimal::ZERO || bank_amount == group_amount {
                continue;
            }
            let relative = (bank_amount - group_amount).abs() / group_amount.abs();
            if relative <= threshold {
                continue;
            }
            flagged.insert(instrument);
            let severity = policy.severity_of(bank_amount - group_amount);
            let auto_approved = severity == Severity::Low && relative <= auto_limit;
            variances.push(DetectedVariance {
                kind: VarianceKind::InstrumentAmount,
                severity,
                instrument: Some(instrument),
                expected: group_amount,
                actual: bank_amount,
                difference: bank_amount - group_amount,
                difference_pct: Some((relative * Decimal::ONE_HUNDRED).round_dp(4)),
                description: format!(
                    "{} bank amount {} differs from ledger amount {} by {}%",
                    instrument.as_str(),
                    bank_amount,
                    group_amount,
                    (relative * Decimal::ONE_HUNDRED).round_dp(2)
                ),
                auto_approved,
                approval_reason: auto_approved
                    .then(|| "within twice the instrument tolerance".to_string()),
            });
        }

        // Allocation shifts only mean anything when the totals line up;
        // otherwise the total-amount variance already tells the story.
        if totals_agree
            && bank_total != Decimal::ZERO
            && group_total != Decimal::ZERO
        {
            for instrument in InstrumentCode::ALL {
                if flagged.contains(&instrument) {
                    continue;
                }
                let bank_share = bank_instruments.get(instrument).abs() / bank_total.abs();
                let group_share = group_instruments.get(instrument).abs() / group_total.abs();
                if bank_share == group_share {
                    continue;
                }
                let shift = bank_share - group_share;
                if shift.abs() <= threshold {
                    continue;
                }
                let auto_approved = shift.abs() <= auto_limit;
                variances.push(DetectedVariance {
                    kind: VarianceKind::InstrumentDistribution,
                    severity: Severity::Low,
                    instrument: Some(instrument),
                    expected: (group_share * Decimal::ONE_HUNDRED).round_dp(4),
                    actual: (bank_share * Decimal::ONE_HUNDRED).round_dp(4),
                    difference: (shift * Decimal::ONE_HUNDRED).round_dp(4),
                    difference_pct: Some((shift.abs() * Decimal::ONE_HUNDRED).round_dp(4)),
                    description: format!(
                        "{} share moved from {}% to {}% of the transaction",
                        instrument.as_str(),
                        (group_share * Decimal::ONE_HUNDRED).round_dp(2),
                        (bank_share * Decimal::ONE_HUNDRED).round_dp(2)
                    ),
                    auto_approved,
                    approval_reason: auto_approved
                        .then(|| "within twice the instrument tolerance".to_string()),
                });
            }
        }
    }

    let days_apart = (bank_records[0].txn_date - groups[0].txn_date)
        .num_days()
        .abs();
    if days_apart > 0 {
        let in_window = days_apart <= policy.date_window_days();
        let days = Decimal::from(days_apart);
        variances.push(DetectedVariance {
            kind: VarianceKind::DateDifference,
            severity: if in_window {
                Severity::Low
            } else {
                Severity::Medium
            },
            instrument: None,
            expected: Decimal::ZERO,
            actual: days,
            difference: days,
            difference_pct: None,
            description: format!("transaction dates differ by {} days", days_apart),
            auto_approved: in_window,
            approval_reason: in_window.then(|| "within the matching window".to_string()),
        });
    }

    variances
}

/// Critical variance for a bank record no ledger group covers.
pub fn missing_in_ledger_variance(record: &BankRecord) -> DetectedVariance {
    DetectedVariance {
        kind: VarianceKind::MissingInLedger,
        severity: Severity::Critical,
        instrument: None,
        expected: record.amount,
        actual: Decimal::ZERO,
        difference: record.amount,
        difference_pct: None,
        description: format!(
            "no ledger group covers bank {} {} of {} on {}",
            record.kind.as_str(),
            record.source_txn_id,
            record.amount,
            record.txn_date
        ),
        auto_approved: false,
        approval_reason: None,
    }
}

/// Critical variance for a ledger group no bank record covers.
pub fn missing_in_bank_variance(group: &GoalTransactionGroup) -> DetectedVariance {
    DetectedVariance {
        kind: VarianceKind::MissingInBank,
        severity: Severity::Critical,
        instrument: None,
        expected: group.net_amount,
        actual: Decimal::ZERO,
        difference: group.net_amount,
        difference_pct: None,
        description: format!(
            "no bank record covers ledger {} {} of {} on {}",
            group.kind.as_str(),
            group.source_txn_id,
            group.net_amount,
            group.txn_date
        ),
        auto_approved: false,
        approval_reason: None,
    }
}

/// Resolve the record status for a set of variances.
///
/// No variances means a clean match. Any high or critical variance forces
/// manual review; otherwise the match auto-approves only when every variance
/// did.
pub fn resolve_status(variances: &[DetectedVariance]) -> StatusResolution {
    if variances.is_empty() {
        return StatusResolution {
            status: ReconciliationStatus::Matched,
            all_auto_approved: true,
        };
    }
    let worst = variances
        .iter()
        .map(|v| v.severity)
        .max()
        .unwrap_or(Severity::Low);
    if worst >= Severity::High {
        return StatusResolution {
            status: ReconciliationStatus::ManualReview,
            all_auto_approved: false,
        };
    }
    if variances.iter().all(|v| v.auto_approved) {
        StatusResolution {
            status: ReconciliationStatus::AutoApproved,
            all_auto_approved: true,
        }
    } else {
        StatusResolution {
            status: ReconciliationStatus::ManualReview,
            all_auto_approved: false,
        }
    }
}
