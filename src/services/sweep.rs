//! Resolution sweep over flagged records.
//!
//! Records flagged missing-in-ledger, missing-in-bank or timing-difference
//! go stale once late data arrives. The sweep re-examines a bounded chunk of
//! them per invocation and marks the ones whose counterpart has since
//! appeared as resolved. A flagged record that a later matching run claimed
//! counts as covered. Resolution is monotonic and best-effort: one bad
//! record never stops the rest of the chunk.

use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::config::SweepConfig;
use crate::error::ReconError;
use crate::models::{
    BankRecord, DateRange, GoalTransactionGroup, LedgerPosting, ResolutionAnnotations,
    ReviewTag, RunError, SweepOutcome,
};
use crate::repository::ReconRepository;
use crate::services::grouping;
use crate::services::metrics::{self, OPERATION_DURATION};
use crate::services::tolerance::TolerancePolicy;

/// Timing-difference counterparts must land within this many days.
const TIMING_WINDOW_DAYS: i64 = 3;

/// The amount-and-kind fallback looks this many days around the flagged
/// item. Source-identity checks are not date-bounded.
const MISSING_WINDOW_DAYS: i64 = 30;

const BANK_TAGS: [ReviewTag; 2] = [ReviewTag::MissingInLedger, ReviewTag::TimingDifference];
const POSTING_TAGS: [ReviewTag; 2] = [ReviewTag::MissingInBank, ReviewTag::TimingDifference];

pub struct ResolutionSweep {
    repo: Arc<dyn ReconRepository>,
    policy: TolerancePolicy,
    config: SweepConfig,
}

impl ResolutionSweep {
    pub fn new(
        repo: Arc<dyn ReconRepository>,
        policy: TolerancePolicy,
        config: SweepConfig,
    ) -> Self {
        Self {
            repo,
            policy,
            config,
        }
    }

    /// Examine one chunk of flagged bank records and ledger postings,
    /// resolving those whose counterpart now exists. `range` restricts the
    /// sweep by transaction date when given.
    #[instrument(skip(self))]
    pub async fn run(&self, range: Option<&DateRange>) -> Result<SweepOutcome, ReconError> {
        let timer = OPERATION_DURATION
            .with_label_values(&["resolution_sweep"])
            .start_timer();

        let mut outcome = SweepOutcome::default();

        let records = self
            .repo
            .bank_records_by_tags(&BANK_TAGS, range, self.config.chunk_size)
            .await?;
        for record in &records {
            outcome.processed += 1;
            let probe = match record.review_tag {
                Some(ReviewTag::MissingInLedger) => {
                    self.probe_missing_in_ledger(record).await
                }
                Some(ReviewTag::TimingDifference) => self.probe_bank_timing(record).await,
                _ => Ok(None),
            };
            match probe {
                Ok(Some(reason)) => {
                    self.resolve_bank_record(record, reason, &mut outcome).await;
                }
                Ok(None) => {}
                Err(err) => {
                    metrics::record_error("sweep_probe");
                    outcome
                        .errors
                        .push(RunError::new(record.record_id, err.to_string()));
                }
            }
        }

        let postings = self
            .repo
            .postings_by_tags(&POSTING_TAGS, range, self.config.chunk_size)
            .await?;
        for ((group_code, tag), members) in bucket_by_group(postings) {
            outcome.processed += members.len();
            match self.probe_posting_bucket(&group_code, tag, &members).await {
                Ok(Some(reason)) => {
                    for posting_id in members {
                        self.resolve_posting(posting_id, tag, &reason, &mut outcome)
                            .await;
                    }
                }
                Ok(None) => {}
                Err(err) => {
                    metrics::record_error("sweep_probe");
                    for posting_id in members {
                        outcome
                            .errors
                            .push(RunError::new(posting_id, err.to_string()));
                    }
                }
            }
        }

        outcome.remaining = self
            .repo
            .count_bank_records_by_tags(&BANK_TAGS, range)
            .await?
            + self.repo.count_postings_by_tags(&POSTING_TAGS, range).await?;
        outcome.more_pending = outcome.remaining > 0;

        timer.observe_duration();
        info!(
            processed = outcome.processed,
            resolved = outcome.resolved_count,
            remaining = outcome.remaining,
            "Resolution sweep finished"
        );
        Ok(outcome)
    }

    async fn resolve_bank_record(
        &self,
        record: &BankRecord,
        reason: String,
        outcome: &mut SweepOutcome,
    ) {
        let annotations = ResolutionAnnotations {
            resolved_at: Utc::now(),
            reason,
        };
        match self
            .repo
            .save_bank_resolution(record.record_id, &annotations)
            .await
        {
            Ok(()) => {
                outcome.resolved_count += 1;
                if let Some(tag) = record.review_tag {
                    *outcome.by_tag.entry(tag.as_str().to_string()).or_insert(0) += 1;
                    metrics::record_sweep_resolution(tag.as_str());
                }
            }
            Err(err) => {
                metrics::record_error("sweep_persist");
                outcome
                    .errors
                    .push(RunError::new(record.record_id, err.to_string()));
            }
        }
    }

    async fn resolve_posting(
        &self,
        posting_id: Uuid,
        tag: ReviewTag,
        reason: &str,
        outcome: &mut SweepOutcome,
    ) {
        let annotations = ResolutionAnnotations {
            resolved_at: Utc::now(),
            reason: reason.to_string(),
        };
        match self
            .repo
            .save_posting_resolution(posting_id, &annotations)
            .await
        {
            Ok(()) => {
                outcome.resolved_count += 1;
                *outcome.by_tag.entry(tag.as_str().to_string()).or_insert(0) += 1;
                metrics::record_sweep_resolution(tag.as_str());
            }
            Err(err) => {
                metrics::record_error("sweep_persist");
                outcome.errors.push(RunError::new(posting_id, err.to_string()));
            }
        }
    }

    /// A missing-in-ledger flag resolves once the ledger covers the record:
    /// a persisted match claiming it, an unclaimed group with the same
    /// source identity, or an unclaimed group matching by amount and kind
    /// within the wide window.
    async fn probe_missing_in_ledger(
        &self,
        record: &BankRecord,
    ) -> Result<Option<String>, ReconError> {
        if let Some(match_ref) = &record.match_ref {
            return Ok(Some(format!(
                "record is now matched to ledger group {}",
                match_ref.group_codes.join(", ")
            )));
        }

        let groups = self.candidate_groups(record, None).await?;

        if let Some(group) = groups.iter().find(|g| {
            g.source_txn_id == record.source_txn_id
                && g.kind == record.kind
                && self.policy.amounts_match(record.amount, g.net_amount)
        }) {
            return Ok(Some(format!(
                "ledger group {} now covers this record",
                group.group_code
            )));
        }

        if let Some(group) = groups.iter().find(|g| {
            g.kind == record.kind
                && (record.txn_date - g.txn_date).num_days().abs() <= MISSING_WINDOW_DAYS
                && self.policy.amounts_match(record.amount, g.net_amount)
        }) {
            return Ok(Some(format!(
                "ledger group {} matches by amount and kind within {} days",
                group.group_code, MISSING_WINDOW_DAYS
            )));
        }

        Ok(None)
    }

    /// A timing-difference flag resolves once the same source transaction
    /// shows up on the ledger within the narrow window, or a matching run
    /// has claimed the record outright.
    async fn probe_bank_timing(
        &self,
        record: &BankRecord,
    ) -> Result<Option<String>, ReconError> {
        if let Some(match_ref) = &record.match_ref {
            return Ok(Some(format!(
                "record is now matched to ledger group {}",
                match_ref.group_codes.join(", ")
            )));
        }

        let groups = self
            .candidate_groups(record, Some(TIMING_WINDOW_DAYS))
            .await?;

        let hit = groups.iter().find(|g| {
            g.source_txn_id == record.source_txn_id
                && g.kind == record.kind
                && self.policy.amounts_match(record.amount, g.net_amount)
        });
        Ok(hit.map(|group| {
            let gap = (record.txn_date - group.txn_date).num_days().abs();
            format!(
                "ledger group {} posted {} days from the bank date",
                group.group_code, gap
            )
        }))
    }

    /// Groups of the record's goal, excluding groups a persisted match
    /// already claims. `days` restricts by date distance when given.
    async fn candidate_groups(
        &self,
        record: &BankRecord,
        days: Option<i64>,
    ) -> Result<Vec<GoalTransactionGroup>, ReconError> {
        let range = match days {
            Some(days) => DateRange::around(record.txn_date, days),
            None => DateRange::unbounded(),
        };
        let postings = self.repo.postings_for_goal(&record.goal_id, &range).await?;
        let (groups, _) = grouping::build_groups(&postings);
        let claimed = self
            .repo
            .matched_group_codes_for_goal(&record.goal_id)
            .await?;
        Ok(groups
            .into_iter()
            .filter(|g| !claimed.contains(&g.group_code))
            .collect())
    }

    /// Resolve probe for one flagged posting bucket. The bucket's full group
    /// is rebuilt from storage so the net amount reflects every posting, not
    /// just the flagged ones.
    async fn probe_posting_bucket(
        &self,
        group_code: &str,
        tag: ReviewTag,
        members: &[Uuid],
    ) -> Result<Option<String>, ReconError> {
        let all = self
            .repo
            .postings_by_group_codes(&[group_code.to_string()])
            .await?;
        let (groups, errors) = grouping::build_groups(&all);
        let Some(group) = groups.first() else {
            let detail = errors
                .first()
                .map(|e| e.message.clone())
                .unwrap_or_else(|| "group has no postings".to_string());
            return Err(ReconError::Consistency(anyhow::anyhow!(
                "group {} cannot be evaluated: {}",
                group_code,
                detail
            )));
        };
        // Shared groups shouldn't happen, but don't resolve strangers.
        if members.iter().any(|id| !group.posting_ids.contains(id)) {
            return Err(ReconError::Consistency(anyhow::anyhow!(
                "flagged postings are not members of group {}",
                group_code
            )));
        }

        match tag {
            ReviewTag::MissingInBank => self.probe_missing_in_bank(group).await,
            ReviewTag::TimingDifference => self.probe_posting_timing(group).await,
            _ => Ok(None),
        }
    }

    /// A missing-in-bank flag resolves once a bank record covers the group:
    /// a record already matched to it, an unmatched record with the same
    /// source identity, or an unmatched record matching by amount and kind
    /// within the wide window.
    async fn probe_missing_in_bank(
        &self,
        group: &GoalTransactionGroup,
    ) -> Result<Option<String>, ReconError> {
        let records = self.candidate_records(group, None).await?;

        if let Some(record) = records.iter().find(|r| {
            r.match_ref
                .as_ref()
                .map(|m| m.references_group(&group.group_code))
                .unwrap_or(false)
        }) {
            return Ok(Some(format!(
                "bank record {} is matched to this group",
                record.source_txn_id
            )));
        }

        if let Some(record) = records.iter().find(|r| {
            r.match_ref.is_none()
                && r.source_txn_id == group.source_txn_id
                && r.kind == group.kind
                && self.policy.amounts_match(r.amount, group.net_amount)
        }) {
            return Ok(Some(format!(
                "bank record {} now covers this group",
                record.source_txn_id
            )));
        }

        if let Some(record) = records.iter().find(|r| {
            r.match_ref.is_none()
                && r.kind == group.kind
                && (r.txn_date - group.txn_date).num_days().abs() <= MISSING_WINDOW_DAYS
                && self.policy.amounts_match(r.amount, group.net_amount)
        }) {
            return Ok(Some(format!(
                "bank record {} matches by amount and kind within {} days",
                record.source_txn_id, MISSING_WINDOW_DAYS
            )));
        }

        Ok(None)
    }

    async fn probe_posting_timing(
        &self,
        group: &GoalTransactionGroup,
    ) -> Result<Option<String>, ReconError> {
        let records = self
            .candidate_records(group, Some(TIMING_WINDOW_DAYS))
            .await?;

        let hit = records.iter().find(|r| {
            (r.match_ref.is_none()
                || r.match_ref
                    .as_ref()
                    .map(|m| m.references_group(&group.group_code))
                    .unwrap_or(false))
                && r.source_txn_id == group.source_txn_id
                && r.kind == group.kind
                && self.policy.amounts_match(r.amount, group.net_amount)
        });
        Ok(hit.map(|record| {
            let gap = (record.txn_date - group.txn_date).num_days().abs();
            format!(
                "bank record {} landed {} days from the ledger date",
                record.source_txn_id, gap
            )
        }))
    }

    async fn candidate_records(
        &self,
        group: &GoalTransactionGroup,
        days: Option<i64>,
    ) -> Result<Vec<BankRecord>, ReconError> {
        let range = match days {
            Some(days) => DateRange::around(group.txn_date, days),
            None => DateRange::unbounded(),
        };
        self.repo.bank_records_for_goal(&group.goal_id, &range).await
    }
}

/// Bucket flagged postings by `(group_code, tag)` preserving first-seen
/// order, so one probe serves every flagged member of a group.
fn bucket_by_group(postings: Vec<LedgerPosting>) -> Vec<((String, ReviewTag), Vec<Uuid>)> {
    let mut order: Vec<(String, ReviewTag)> = Vec::new();
    let mut buckets: HashMap<(String, ReviewTag), Vec<Uuid>> = HashMap::new();
    for posting in postings {
        let Some(tag) = posting.review_tag else {
            continue;
        };
        let key = (posting.group_code.clone(), tag);
        let entry = buckets.entry(key.clone()).or_default();
        if entry.is_empty() {
            order.push(key);
        }
        entry.push(posting.posting_id);
    }
    order
        .into_iter()
        .map(|key| {
            let members = buckets.remove(&key).unwrap_or_default();
            (key, members)
        })
        .collect()
}
