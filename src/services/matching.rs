//! Multi-pass matcher pairing bank records with goal transaction groups.
//!
//! Passes run in fixed order and claim records and groups as they go, so no
//! record or group ever takes part in two matches within a run:
//!
//! 0. manual: persisted manual references are honored verbatim
//! 1. exact: same source transaction id and kind
//! 2. amount + window: same kind, amounts within tolerance, dates within the
//!    configured window
//! 3. split: several same-day records covering one group, then several
//!    same-day groups covering one record
//!
//! The matcher is pure: callers load and order the data, the passes only
//! read it. Scan order is input order, which makes runs deterministic for a
//! fixed input ordering.

use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

use crate::models::{BankRecord, GoalTransactionGroup, MatchResult, MatchType};
use crate::services::tolerance::TolerancePolicy;

/// Only this many candidates (largest magnitude first) take part in the
/// exhaustive split search, bounding it at 2^10 subsets.
const SPLIT_SEARCH_LIMIT: usize = 10;

/// Confidence assigned to split matches.
const SPLIT_CONFIDENCE: f64 = 0.7;

/// What the passes produced: claimed matches plus both remainders.
#[derive(Debug, Clone)]
pub struct PassOutput {
    pub matches: Vec<MatchResult>,
    pub unmatched_bank_records: Vec<Uuid>,
    pub unmatched_groups: Vec<String>,
}

pub fn run_matching_passes(
    records: &[BankRecord],
    groups: &[GoalTransactionGroup],
    policy: &TolerancePolicy,
) -> PassOutput {
    let by_code: HashMap<&str, &GoalTransactionGroup> = groups
        .iter()
        .map(|group| (group.group_code.as_str(), group))
        .collect();

    let mut claimed_records: HashSet<Uuid> = HashSet::new();
    let mut claimed_groups: HashSet<String> = HashSet::new();
    let mut matches: Vec<MatchResult> = Vec::new();

    // Pass 0: manual references. Records sharing one reference form a single
    // bundle; the bundle claims every group code it names, loaded or not, so
    // later passes cannot reuse them.
    let mut bundles: Vec<(Vec<String>, Vec<Uuid>, Decimal)> = Vec::new();
    let mut bundle_index: HashMap<String, usize> = HashMap::new();
    for record in records {
        let Some(match_ref) = &record.match_ref else {
            continue;
        };
        if !match_ref.is_manual() {
            continue;
        }
        let key = match_ref.group_codes.join("|");
        let idx = *bundle_index.entry(key).or_insert_with(|| {
            bundles.push((match_ref.group_codes.clone(), Vec::new(), Decimal::ZERO));
            bundles.len() - 1
        });
        bundles[idx].1.push(record.record_id);
        bundles[idx].2 += record.amount;
        claimed_records.insert(record.record_id);
    }

    for (ref_codes, bank_record_ids, bank_total) in bundles {
        let mut group_codes = Vec::new();
        let mut posting_ids = Vec::new();
        let mut group_total = Decimal::ZERO;
        for code in ref_codes {
            if claimed_groups.contains(&code) {
                continue;
            }
            claimed_groups.insert(code.clone());
            if let Some(group) = by_code.get(code.as_str()) {
                posting_ids.extend(group.posting_ids.iter().copied());
                group_total += group.net_amount;
            }
            group_codes.push(code);
        }
        matches.push(MatchResult::unclassified(
            MatchType::Manual,
            bank_record_ids,
            group_codes,
            posting_ids,
            1.0,
            bank_total,
            group_total,
        ));
    }

    // Pass 1: exact source identity. Source id plus kind is authoritative,
    // so the pair is claimed even when the amounts disagree; the variance
    // classifier reports the disagreement afterwards.
    for record in records {
        if claimed_records.contains(&record.record_id) {
            continue;
        }
        let hit = groups.iter().find(|group| {
            !claimed_groups.contains(&group.group_code)
                && group.goal_id == record.goal_id
                && group.kind == record.kind
                && group.source_txn_id == record.source_txn_id
        });
        if let Some(group) = hit {
            claimed_records.insert(record.record_id);
            claimed_groups.insert(group.group_code.clone());
            matches.push(MatchResult::unclassified(
                MatchType::Exact,
                vec![record.record_id],
                vec![group.group_code.clone()],
                group.posting_ids.clone(),
                1.0,
                record.amount,
                group.net_amount,
            ));
        }
    }

    // Pass 2: amount within tolerance, date within the window. Confidence
    // decays linearly from 0.8 to 0.5 across the window.
    let window = policy.date_window_days();
    for record in records {
        if claimed_records.contains(&record.record_id) {
            continue;
        }
        let hit = groups.iter().find_map(|group| {
            if claimed_groups.contains(&group.group_code)
                || group.goal_id != record.goal_id
                || group.kind != record.kind
            {
                return None;
            }
            let days = (record.txn_date - group.txn_date).num_days().abs();
            if days <= window && policy.amounts_match(record.amount, group.net_amount) {
                Some((group, days))
            } else {
                None
            }
        });
        if let Some((group, days)) = hit {
            let decay = if window > 0 {
                days as f64 / window as f64
            } else {
                0.0
            };
            claimed_records.insert(record.record_id);
            claimed_groups.insert(group.group_code.clone());
            matches.push(MatchResult::unclassified(
                MatchType::Amount,
                vec![record.record_id],
                vec![group.group_code.clone()],
                group.posting_ids.clone(),
                0.8 - decay * 0.3,
                record.amount,
                group.net_amount,
            ));
        }
    }

    // Pass 3a: several same-day bank records covering one group.
    for group in groups {
        if claimed_groups.contains(&group.group_code) {
            continue;
        }
        let candidates: Vec<&BankRecord> = records
            .iter()
            .filter(|record| {
                !claimed_records.contains(&record.record_id)
                    && record.goal_id == group.goal_id
                    && record.kind == group.kind
                    && record.txn_date == group.txn_date
            })
            .collect();
        if candidates.len() < 2 {
            continue;
        }
        let amounts: Vec<Decimal> = candidates.iter().map(|r| r.amount).collect();
        let tolerance = policy.tolerance_for(group.net_amount);
        let picked = find_combination_sum(&amounts, group.net_amount, tolerance);
        if picked.len() > 1 {
            let mut bank_record_ids = Vec::with_capacity(picked.len());
            let mut bank_total = Decimal::ZERO;
            for &idx in &picked {
                bank_record_ids.push(candidates[idx].record_id);
                bank_total += candidates[idx].amount;
                claimed_records.insert(candidates[idx].record_id);
            }
            claimed_groups.insert(group.group_code.clone());
            matches.push(MatchResult::unclassified(
                MatchType::SplitBankToGroup,
                bank_record_ids,
                vec![group.group_code.clone()],
                group.posting_ids.clone(),
                SPLIT_CONFIDENCE,
                bank_total,
                group.net_amount,
            ));
        }
    }

    // Pass 3b: several same-day groups covering one bank record.
    for record in records {
        if claimed_records.contains(&record.record_id) {
            continue;
        }
        let candidates: Vec<&GoalTransactionGroup> = groups
            .iter()
            .filter(|group| {
                !claimed_groups.contains(&group.group_code)
                    && group.goal_id == record.goal_id
                    && group.kind == record.kind
                    && group.txn_date == record.txn_date
            })
            .collect();
        if candidates.len() < 2 {
            continue;
        }
        let amounts: Vec<Decimal> = candidates.iter().map(|g| g.net_amount).collect();
        let tolerance = policy.tolerance_for(record.amount);
        let picked = find_combination_sum(&amounts, record.amount, tolerance);
        if picked.len() > 1 {
            let mut group_codes = Vec::with_capacity(picked.len());
            let mut posting_ids = Vec::new();
            let mut group_total = Decimal::ZERO;
            for &idx in &picked {
                group_codes.push(candidates[idx].group_code.clone());
                posting_ids.extend(candidates[idx].posting_ids.iter().copied());
                group_total += candidates[idx].net_amount;
                claimed_groups.insert(candidates[idx].group_code.clone());
            }
            claimed_records.insert(record.record_id);
            matches.push(MatchResult::unclassified(
                MatchType::SplitGroupToBank,
                vec![record.record_id],
                group_codes,
                posting_ids,
                SPLIT_CONFIDENCE,
                record.amount,
                group_total,
            ));
        }
    }

    let unmatched_bank_records = records
        .iter()
        .filter(|record| !claimed_records.contains(&record.record_id))
        .map(|record| record.record_id)
        .collect();
    let unmatched_groups = groups
        .iter()
        .filter(|group| !claimed_groups.contains(&group.group_code))
        .map(|group| group.group_code.clone())
        .collect();

    PassOutput {
        matches,
        unmatched_bank_records,
        unmatched_groups,
    }
}

/// Find indices of amounts summing to `target` within `tolerance`.
///
/// Works on magnitudes so withdrawal (negative) sets behave like deposit
/// sets; callers only hand in same-kind candidates. Greedy over
/// magnitude-descending candidates first; when that misses, exhaustive over
/// subsets of the first [`SPLIT_SEARCH_LIMIT`] candidates, skipping
/// singletons. Greedy can return a single index; claim sites discard those.
fn find_combination_sum(amounts: &[Decimal], target: Decimal, tolerance: Decimal) -> Vec<usize> {
    let target_abs = target.abs();
    let magnitudes: Vec<Decimal> = amounts.iter().map(|a| a.abs()).collect();
    let mut order: Vec<usize> = (0..amounts.len()).collect();
    order.sort_by(|&a, &b| magnitudes[b].cmp(&magnitudes[a]).then(a.cmp(&b)));

    let mut picked = Vec::new();
    let mut sum = Decimal::ZERO;
    for &idx in &order {
        if sum + magnitudes[idx] <= target_abs + tolerance {
            sum += magnitudes[idx];
            picked.push(idx);
            if (sum - target_abs).abs() <= tolerance {
                return picked;
            }
        }
    }

    let limit = order.len().min(SPLIT_SEARCH_LIMIT);
    for mask in 1u32..(1u32 << limit) {
        if mask.count_ones() < 2 {
            continue;
        }
        let mut sum = Decimal::ZERO;
        for (bit, &idx) in order[..limit].iter().enumerate() {
            if mask & (1 << bit) != 0 {
                sum += magnitudes[idx];
            }
        }
        if (sum - target_abs).abs() <= tolerance {
            return order[..limit]
                .iter()
                .enumerate()
                .filter(|(bit, _)| mask & (1 << *bit) != 0)
                .map(|(_, &idx)| idx)
                .collect();
        }
    }

    Vec::new()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ToleranceConfig;
    use crate::models::{InstrumentAmounts, MatchReference, TransactionKind};
    use chrono::NaiveDate;

    fn date(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, d).unwrap()
    }

    fn policy() -> TolerancePolicy {
        TolerancePolicy::new(ToleranceConfig::default())
    }

    fn record(source: &str, amount: i64, day: u32) -> BankRecord {
        BankRecord::new(
            "goal-1",
            source,
            if amount >= 0 {
                TransactionKind::Deposit
            } else {
                TransactionKind::Withdrawal
            },
            date(day),
            Decimal::from(amount),
            InstrumentAmounts::new(),
        )
    }

    fn group(code: &str, source: &str, net: i64, day: u32) -> GoalTransactionGroup {
        GoalTransactionGroup {
            group_code: code.to_string(),
            goal_id: "goal-1".to_string(),
            source_txn_id: source.to_string(),
            kind: if net >= 0 {
                TransactionKind::Deposit
            } else {
                TransactionKind::Withdrawal
            },
            txn_date: date(day),
            net_amount: Decimal::from(net),
            net_instrument_amounts: InstrumentAmounts::new(),
            posting_ids: vec![Uuid::new_v4()],
        }
    }

    #[test]
    fn test_exact_match_claims_on_source_identity() {
        let records = vec![record("srcA", 10_000, 15)];
        let groups = vec![group("g1", "srcA", 8_500, 15)];

        let output = run_matching_passes(&records, &groups, &policy());
        assert_eq!(output.matches.len(), 1);
        let m = &output.matches[0];
        assert_eq!(m.match_type, MatchType::Exact);
        assert_eq!(m.confidence, 1.0);
        assert_eq!(m.bank_total, Decimal::from(10_000));
        assert_eq!(m.group_total, Decimal::from(8_500));
        assert!(output.unmatched_bank_records.is_empty());
        assert!(output.unmatched_groups.is_empty());
    }

    #[test]
    fn test_exact_identity_beats_amount_agreement() {
        let records = vec![record("srcA", 10_000, 15)];
        // Same amount but a different source id, versus same source id with a
        // different amount: identity wins.
        let groups = vec![
            group("g-amount", "srcB", 10_000, 15),
            group("g-identity", "srcA", 9_000, 15),
        ];

        let output = run_matching_passes(&records, &groups, &policy());
        let exact: Vec<_> = output
            .matches
            .iter()
            .filter(|m| m.match_type == MatchType::Exact)
            .collect();
        assert_eq!(exact.len(), 1);
        assert_eq!(exact[0].group_codes, vec!["g-identity".to_string()]);
    }

    #[test]
    fn test_amount_window_confidence_decays_with_distance() {
        let records = vec![record("bank-src", 5_000, 17)];
        let groups = vec![group("g1", "ledger-src", 5_000, 15)];

        let output = run_matching_passes(&records, &groups, &policy());
        assert_eq!(output.matches.len(), 1);
        let m = &output.matches[0];
        assert_eq!(m.match_type, MatchType::Amount);
        let expected = 0.8 - (2.0 / 7.0) * 0.3;
        assert!((m.confidence - expected).abs() < 1e-9);
    }

    #[test]
    fn test_amount_window_rejects_dates_beyond_window() {
        let records = vec![record("bank-src", 5_000, 23)];
        let groups = vec![group("g1", "ledger-src", 5_000, 15)];

        let output = run_matching_passes(&records, &groups, &policy());
        assert!(output.matches.is_empty());
        assert_eq!(output.unmatched_bank_records.len(), 1);
        assert_eq!(output.unmatched_groups, vec!["g1".to_string()]);
    }

    #[test]
    fn test_manual_reference_short_circuits_other_passes() {
        let mut manual = record("srcM", 2_000, 15);
        manual.match_ref = Some(MatchReference::manual(
            vec!["g1".to_string()],
            "ops@example.com",
        ));
        // This record would exact-match g1 by source id if the manual claim
        // did not get there first.
        let competitor = record("srcG1", 7_000, 15);
        let groups = vec![group("g1", "srcG1", 7_000, 15)];

        let output = run_matching_passes(&[manual, competitor], &groups, &policy());
        assert_eq!(output.matches.len(), 1);
        let m = &output.matches[0];
        assert_eq!(m.match_type, MatchType::Manual);
        assert_eq!(m.confidence, 1.0);
        assert_eq!(m.group_codes, vec!["g1".to_string()]);
        assert_eq!(output.unmatched_bank_records.len(), 1);
    }

    #[test]
    fn test_manual_bundle_merges_records_sharing_a_reference() {
        let reference = MatchReference::manual(vec!["g1".to_string()], "ops@example.com");
        let mut a = record("srcA", 2_000, 15);
        let mut b = record("srcB", 3_000, 15);
        a.match_ref = Some(reference.clone());
        b.match_ref = Some(reference);
        let groups = vec![group("g1", "srcL", 5_000, 15)];

        let output = run_matching_passes(&[a, b], &groups, &policy());
        assert_eq!(output.matches.len(), 1);
        let m = &output.matches[0];
        assert_eq!(m.match_type, MatchType::Manual);
        assert_eq!(m.bank_record_ids.len(), 2);
        assert_eq!(m.bank_total, Decimal::from(5_000));
        assert_eq!(m.group_total, Decimal::from(5_000));
    }

    #[test]
    fn test_split_many_records_cover_one_group() {
        let records = vec![
            record("srcA", 60_000, 15),
            record("srcB", 30_000, 15),
            record("srcC", 10_000, 15),
        ];
        let groups = vec![group("g1", "srcL", 100_000, 15)];

        let output = run_matching_passes(&records, &groups, &policy());
        assert_eq!(output.matches.len(), 1);
        let m = &output.matches[0];
        assert_eq!(m.match_type, MatchType::SplitBankToGroup);
        assert_eq!(m.bank_record_ids.len(), 3);
        assert_eq!(m.confidence, SPLIT_CONFIDENCE);
        assert_eq!(m.bank_total, Decimal::from(100_000));
    }

    #[test]
    fn test_split_one_record_covers_many_groups() {
        let records = vec![record("srcA", -9_000, 15)];
        let groups = vec![
            group("g1", "srcL1", -5_000, 15),
            group("g2", "srcL2", -4_000, 15),
        ];

        let output = run_matching_passes(&records, &groups, &policy());
        assert_eq!(output.matches.len(), 1);
        let m = &output.matches[0];
        assert_eq!(m.match_type, MatchType::SplitGroupToBank);
        assert_eq!(m.group_codes.len(), 2);
        assert_eq!(m.group_total, Decimal::from(-9_000));
    }

    #[test]
    fn test_split_requires_same_date_candidates() {
        let records = vec![record("srcA", 6_000, 15), record("srcB", 4_000, 16)];
        let groups = vec![group("g1", "srcL", 10_000, 15)];

        let output = run_matching_passes(&records, &groups, &policy());
        // The day-16 record is not a split candidate, so nothing covers g1.
        assert!(output.matches.is_empty());
        assert_eq!(output.unmatched_groups, vec!["g1".to_string()]);
    }

    #[test]
    fn test_duplicate_source_ids_claim_only_once() {
        let records = vec![record("srcA", 5_000, 15), record("srcA", 5_100, 15)];
        let groups = vec![group("g1", "srcA", 5_000, 15)];

        let output = run_matching_passes(&records, &groups, &policy());
        assert_eq!(output.matches.len(), 1);
        assert_eq!(output.unmatched_bank_records.len(), 1);

        let claimed = &output.matches[0].bank_record_ids;
        let unmatched = &output.unmatched_bank_records;
        assert!(claimed.iter().all(|id| !unmatched.contains(id)));
    }

    #[test]
    fn test_combination_sum_greedy_path() {
        let amounts = vec![
            Decimal::from(600),
            Decimal::from(300),
            Decimal::from(100),
        ];
        let picked = find_combination_sum(&amounts, Decimal::from(1_000), Decimal::ONE);
        let mut sorted = picked.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, vec![0, 1, 2]);
    }

    #[test]
    fn test_combination_sum_exhaustive_path() {
        // Greedy locks onto 4000 and overshoots with everything else; only
        // the exhaustive pass finds 3500 + 2500.
        let amounts = vec![
            Decimal::from(4_000),
            Decimal::from(3_500),
            Decimal::from(2_500),
        ];
        let picked = find_combination_sum(&amounts, Decimal::from(6_000), Decimal::from(60));
        let mut sorted = picked.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, vec![1, 2]);
    }

    #[test]
    fn test_combination_sum_handles_negative_amounts() {
        let amounts = vec![
            Decimal::from(-4_000),
            Decimal::from(-3_500),
            Decimal::from(-2_500),
        ];
        let picked = find_combination_sum(&amounts, Decimal::from(-6_000), Decimal::from(60));
        let mut sorted = picked.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, vec![1, 2]);
    }

    #[test]
    fn test_combination_sum_returns_empty_when_nothing_fits() {
        let amounts = vec![Decimal::from(4_000), Decimal::from(3_500)];
        let picked = find_combination_sum(&amounts, Decimal::from(6_000), Decimal::from(10));
        assert!(picked.is_empty());
    }
}
