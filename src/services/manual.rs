//! Manual override registry.
//!
//! Operators can bind bank records to ledger groups ahead of anything the
//! matcher would derive. Manual references persist on the records and are
//! honored verbatim by pass 0 of the matcher until explicitly removed.

use anyhow::anyhow;
use chrono::Utc;
use rust_decimal::Decimal;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::error::ReconError;
use crate::models::{
    BankRecord, DateRange, GoalTransactionGroup, MatchAnnotations, MatchReference, MatchResult,
    MatchType, ReconciliationStatus,
};
use crate::repository::ReconRepository;
use crate::services::metrics::OPERATION_DURATION;
use crate::services::tolerance::TolerancePolicy;
use crate::services::{grouping, metrics};

/// A group the operator could plausibly match a bank record against.
#[derive(Debug, Clone)]
pub struct MatchCandidate {
    pub group: GoalTransactionGroup,
    pub amount_gap: Decimal,
    pub days_apart: i64,
}

pub struct ManualOverrideRegistry {
    repo: Arc<dyn ReconRepository>,
    policy: TolerancePolicy,
}

impl ManualOverrideRegistry {
    pub fn new(repo: Arc<dyn ReconRepository>, policy: TolerancePolicy) -> Self {
        Self { repo, policy }
    }

    /// Bind one or more bank records to one or more ledger groups.
    ///
    /// Net totals of the two sides must agree within one percent of the
    /// bank total, floored at one currency unit. On any write failure the
    /// records already annotated are restored to their previous state
    /// before the error surfaces.
    #[instrument(skip(self), fields(actor = %actor))]
    pub async fn create(
        &self,
        bank_record_ids: &[Uuid],
        group_codes: &[String],
        actor: &str,
    ) -> Result<MatchResult, ReconError> {
        let timer = OPERATION_DURATION
            .with_label_values(&["create_manual_match"])
            .start_timer();

        if bank_record_ids.is_empty() || group_codes.is_empty() {
            return Err(ReconError::Validation(anyhow!(
                "a manual match needs at least one bank record and one group"
            )));
        }
        if actor.trim().is_empty() {
            return Err(ReconError::Validation(anyhow!(
                "a manual match needs a non-empty actor"
            )));
        }

        let record_ids = dedup_ids(bank_record_ids);
        let codes = dedup_codes(group_codes);

        let records = self.repo.bank_records_by_ids(&record_ids).await?;
        if records.len() != record_ids.len() {
            let found: HashSet<Uuid> = records.iter().map(|r| r.record_id).collect();
            let missing: Vec<String> = record_ids
                .iter()
                .filter(|id| !found.contains(id))
                .map(|id| id.to_string())
                .collect();
            return Err(ReconError::NotFound(anyhow!(
                "bank records not found: {}",
                missing.join(", ")
            )));
        }

        for record in &records {
            if record
                .match_ref
                .as_ref()
                .map(|m| m.is_manual())
                .unwrap_or(false)
            {
                return Err(ReconError::Consistency(anyhow!(
                    "bank record {} already carries a manual match; remove it first",
                    record.record_id
                )));
            }
        }

        let postings = self.repo.postings_by_group_codes(&codes).await?;
        let present: HashSet<&str> = postings.iter().map(|p| p.group_code.as_str()).collect();
        let missing: Vec<&str> = codes
            .iter()
            .map(String::as_str)
            .filter(|code| !present.contains(code))
            .collect();
        if !missing.is_empty() {
            return Err(ReconError::NotFound(anyhow!(
                "ledger groups not found: {}",
                missing.join(", ")
            )));
        }

        let (groups, group_errors) = grouping::build_groups(&postings);
        if !group_errors.is_empty() {
            return Err(ReconError::Consistency(anyhow!(
                "ledger groups have inconsistent postings: {}",
                group_errors
                    .iter()
                    .map(|e| e.message.clone())
                    .collect::<Vec<_>>()
                    .join("; ")
            )));
        }

        let goal_id = &records[0].goal_id;
        if records.iter().any(|r| &r.goal_id != goal_id)
            || groups.iter().any(|g| &g.goal_id != goal_id)
        {
            return Err(ReconError::Consistency(anyhow!(
                "manual match spans more than one goal"
            )));
        }

        let bank_total: Decimal = records.iter().map(|r| r.amount).sum();
        let group_total: Decimal = groups.iter().map(|g| g.net_amount).sum();
        // Manual matches carry their own band, independent of the matcher's
        // policy: 1% of the bank total, floored at one currency unit.
        let band = (bank_total.abs() * Decimal::new(1, 2)).max(Decimal::ONE);
        let gap = (bank_total - group_total).abs();
        if gap > band {
            return Err(ReconError::Consistency(anyhow!(
                "manual match totals differ by {} which exceeds the allowed {}",
                gap,
                band
            )));
        }

        let annotations = MatchAnnotations {
            match_ref: MatchReference::manual(codes.clone(), actor),
            matched_at: Utc::now(),
            match_score: 100,
            status: ReconciliationStatus::Matched,
        };

        let mut written: Vec<&BankRecord> = Vec::new();
        for record in &records {
            if let Err(err) = self
                .repo
                .save_match_annotations(record.record_id, &annotations)
                .await
            {
                self.restore_records(&written).await;
                return Err(err);
            }
            written.push(record);
        }

        timer.observe_duration();
        metrics::record_match(MatchType::Manual.as_str());
        info!(
            goal_id = %goal_id,
            records = record_ids.len(),
            groups = codes.len(),
            bank_total = %bank_total,
            "Manual match created"
        );

        let posting_ids = groups
            .iter()
            .flat_map(|g| g.posting_ids.iter().copied())
            .collect();
        Ok(MatchResult {
            match_type: MatchType::Manual,
            bank_record_ids: record_ids,
            group_codes: codes,
            posting_ids,
            confidence: 1.0,
            bank_total,
            group_total,
            variances: Vec::new(),
            status: ReconciliationStatus::Matched,
            match_score: 100,
        })
    }

    /// Clear manual matches by record id and/or referenced group code.
    ///
    /// Listed records without a manual reference are skipped; listed group
    /// codes pull in every record whose manual reference names them. Returns
    /// how many records were cleared.
    #[instrument(skip(self))]
    pub async fn remove(
        &self,
        bank_record_ids: &[Uuid],
        group_codes: &[String],
    ) -> Result<usize, ReconError> {
        let timer = OPERATION_DURATION
            .with_label_values(&["remove_manual_match"])
            .start_timer();

        if bank_record_ids.is_empty() && group_codes.is_empty() {
            return Err(ReconError::Validation(anyhow!(
                "nothing to remove: no record ids and no group codes given"
            )));
        }

        let record_ids = dedup_ids(bank_record_ids);
        let listed = self.repo.bank_records_by_ids(&record_ids).await?;
        if listed.len() != record_ids.len() {
            let found: HashSet<Uuid> = listed.iter().map(|r| r.record_id).collect();
            let missing: Vec<String> = record_ids
                .iter()
                .filter(|id| !found.contains(id))
                .map(|id| id.to_string())
                .collect();
            return Err(ReconError::NotFound(anyhow!(
                "bank records not found: {}",
                missing.join(", ")
            )));
        }

        let mut targets: Vec<BankRecord> = Vec::new();
        let mut seen: HashSet<Uuid> = HashSet::new();
        for record in listed {
            match &record.match_ref {
                Some(m) if m.is_manual() => {
                    seen.insert(record.record_id);
                    targets.push(record);
                }
                _ => {
                    debug!(record_id = %record.record_id, "Record has no manual match; skipping");
                }
            }
        }
        for code in dedup_codes(group_codes) {
            for record in self.repo.bank_records_referencing_group(&code).await? {
                if seen.insert(record.record_id) {
                    targets.push(record);
                }
            }
        }

        let mut cleared: Vec<&BankRecord> = Vec::new();
        for record in &targets {
            if let Err(err) = self.repo.clear_match_annotations(record.record_id).await {
                self.restore_records(&cleared).await;
                return Err(err);
            }
            cleared.push(record);
        }

        timer.observe_duration();
        info!(cleared = cleared.len(), "Manual matches removed");
        Ok(cleared.len())
    }

    /// Rank unclaimed groups an operator could match a bank record against:
    /// same kind, dates within the window, closest amount first.
    #[instrument(skip(self), fields(bank_record_id = %bank_record_id))]
    pub async fn candidates(
        &self,
        bank_record_id: Uuid,
        window_days: Option<i64>,
    ) -> Result<Vec<MatchCandidate>, ReconError> {
        let timer = OPERATION_DURATION
            .with_label_values(&["match_candidates"])
            .start_timer();

        let window = window_days.unwrap_or_else(|| self.policy.date_window_days());
        if window < 0 {
            return Err(ReconError::Validation(anyhow!(
                "candidate window must not be negative, got {}",
                window
            )));
        }

        let record = self
            .repo
            .bank_record(bank_record_id)
            .await?
            .ok_or_else(|| {
                ReconError::NotFound(anyhow!("bank record {} not found", bank_record_id))
            })?;

        let range = DateRange::around(record.txn_date, window);
        let postings = self.repo.postings_for_goal(&record.goal_id, &range).await?;
        let (groups, _) = grouping::build_groups(&postings);

        let claimed: HashSet<String> = self
            .repo
            .matched_group_codes_for_goal(&record.goal_id)
            .await?
            .into_iter()
            .collect();

        let mut candidates: Vec<MatchCandidate> = groups
            .into_iter()
            .filter(|group| group.kind == record.kind && !claimed.contains(&group.group_code))
            .map(|group| {
                let amount_gap = (group.net_amount - record.amount).abs();
                let days_apart = (record.txn_date - group.txn_date).num_days().abs();
                MatchCandidate {
                    group,
                    amount_gap,
                    days_apart,
                }
            })
            .collect();
        candidates.sort_by(|a, b| {
            a.amount_gap
                .cmp(&b.amount_gap)
                .then(a.days_apart.cmp(&b.days_apart))
                .then(a.group.group_code.cmp(&b.group.group_code))
        });

        timer.observe_duration();
        Ok(candidates)
    }

    /// Put records back the way they were before a failed batch write.
    async fn restore_records(&self, records: &[&BankRecord]) {
        for record in records {
            let outcome = match &record.match_ref {
                Some(match_ref) => {
                    let annotations = MatchAnnotations {
                        match_ref: match_ref.clone(),
                        matched_at: record.matched_at.unwrap_or_else(Utc::now),
                        match_score: record.match_score.unwrap_or(100),
                        status: record.status,
                    };
                    self.repo
                        .save_match_annotations(record.record_id, &annotations)
                        .await
                }
                None => self.repo.clear_match_annotations(record.record_id).await,
            };
            if let Err(err) = outcome {
                metrics::record_error("manual_rollback");
                debug!(record_id = %record.record_id, error = %err, "Rollback write failed");
            }
        }
    }
}

fn dedup_ids(ids: &[Uuid]) -> Vec<Uuid> {
    let mut seen = HashSet::new();
    ids.iter()
        .filter(|id| seen.insert(**id))
        .copied()
        .collect()
}

fn dedup_codes(codes: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    codes
        .iter()
        .filter(|code| seen.insert(code.as_str()))
        .cloned()
        .collect()
}
