//! In-memory repository for tests and embedders that bring no database.

use anyhow::anyhow;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::ReconError;
use crate::models::{
    BankRecord, DateRange, LedgerPosting, MatchAnnotations, ReconciliationStatus,
    ResolutionAnnotations, ReviewAnnotations, ReviewTag,
};
use crate::repository::ReconRepository;

#[derive(Default)]
pub struct InMemoryRepository {
    bank_records: RwLock<HashMap<Uuid, BankRecord>>,
    postings: RwLock<HashMap<Uuid, LedgerPosting>>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a bank record.
    pub async fn insert_bank_record(&self, record: BankRecord) {
        self.bank_records
            .write()
            .await
            .insert(record.record_id, record);
    }

    /// Insert or replace a ledger posting.
    pub async fn insert_posting(&self, posting: LedgerPosting) {
        self.postings.write().await.insert(posting.posting_id, posting);
    }

    async fn update_bank<F>(&self, record_id: Uuid, update: F) -> Result<(), ReconError>
    where
        F: FnOnce(&mut BankRecord),
    {
        let mut map = self.bank_records.write().await;
        let record = map.get_mut(&record_id).ok_or_else(|| {
            ReconError::NotFound(anyhow!("bank record {} not found", record_id))
        })?;
        update(record);
        Ok(())
    }

    async fn update_posting<F>(&self, posting_id: Uuid, update: F) -> Result<(), ReconError>
    where
        F: FnOnce(&mut LedgerPosting),
    {
        let mut map = self.postings.write().await;
        let posting = map.get_mut(&posting_id).ok_or_else(|| {
            ReconError::NotFound(anyhow!("ledger posting {} not found", posting_id))
        })?;
        update(posting);
        Ok(())
    }
}

fn sort_records(mut records: Vec<BankRecord>) -> Vec<BankRecord> {
    records.sort_by(|a, b| {
        a.txn_date
            .cmp(&b.txn_date)
            .then(a.record_id.cmp(&b.record_id))
    });
    records
}

fn sort_postings(mut postings: Vec<LedgerPosting>) -> Vec<LedgerPosting> {
    postings.sort_by(|a, b| {
        a.txn_date
            .cmp(&b.txn_date)
            .then(a.posting_id.cmp(&b.posting_id))
    });
    postings
}

fn record_carries_tag(
    record: &BankRecord,
    tags: &[ReviewTag],
    range: Option<&DateRange>,
) -> bool {
    !record.variance_resolved
        && record
            .review_tag
            .map(|tag| tags.contains(&tag))
            .unwrap_or(false)
        && range.map(|r| r.contains(record.txn_date)).unwrap_or(true)
}

fn posting_carries_tag(
    posting: &LedgerPosting,
    tags: &[ReviewTag],
    range: Option<&DateRange>,
) -> bool {
    !posting.variance_resolved
        && posting
            .review_tag
            .map(|tag| tags.contains(&tag))
            .unwrap_or(false)
        && range.map(|r| r.contains(posting.txn_date)).unwrap_or(true)
}

#[async_trait]
impl ReconRepository for InMemoryRepository {
    async fn bank_record(&self, record_id: Uuid) -> Result<Option<BankRecord>, ReconError> {
        Ok(self.bank_records.read().await.get(&record_id).cloned())
    }

    async fn bank_records_by_ids(
        &self,
        record_ids: &[Uuid],
    ) -> Result<Vec<BankRecord>, ReconError> {
        let map = self.bank_records.read().await;
        Ok(record_ids
            .iter()
            .filter_map(|id| map.get(id).cloned())
            .collect())
    }

    async fn bank_records_for_goal(
        &self,
        goal_id: &str,
        range: &DateRange,
    ) -> Result<Vec<BankRecord>, ReconError> {
        let map = self.bank_records.read().await;
        Ok(sort_records(
            map.values()
                .filter(|r| r.goal_id == goal_id && range.contains(r.txn_date))
                .cloned()
                .collect(),
        ))
    }

    async fn unmatched_bank_records_for_goal(
        &self,
        goal_id: &str,
    ) -> Result<Vec<BankRecord>, ReconError> {
        let map = self.bank_records.read().await;
        Ok(sort_records(
            map.values()
                .filter(|r| r.goal_id == goal_id && r.match_ref.is_none())
                .cloned()
                .collect(),
        ))
    }

    async fn bank_records_by_tags(
        &self,
        tags: &[ReviewTag],
        range: Option<&DateRange>,
        limit: usize,
    ) -> Result<Vec<BankRecord>, ReconError> {
        let map = self.bank_records.read().await;
        let mut records = sort_records(
            map.values()
                .filter(|r| record_carries_tag(r, tags, range))
                .cloned()
                .collect(),
        );
        records.truncate(limit);
        Ok(records)
    }

    async fn count_bank_records_by_tags(
        &self,
        tags: &[ReviewTag],
        range: Option<&DateRange>,
    ) -> Result<u64, ReconError> {
        let map = self.bank_records.read().await;
        Ok(map
            .values()
            .filter(|r| record_carries_tag(r, tags, range))
            .count() as u64)
    }

    async fn bank_records_referencing_group(
        &self,
        group_code: &str,
    ) -> Result<Vec<BankRecord>, ReconError> {
        let map = self.bank_records.read().await;
        Ok(sort_records(
            map.values()
                .filter(|r| {
                    r.match_ref
                        .as_ref()
                        .map(|m| m.is_manual() && m.references_group(group_code))
                        .unwrap_or(false)
                })
                .cloned()
                .collect(),
        ))
    }

    async fn matched_group_codes_for_goal(
        &self,
        goal_id: &str,
    ) -> Result<Vec<String>, ReconError> {
        let map = self.bank_records.read().await;
        let codes: HashSet<String> = map
            .values()
            .filter(|r| r.goal_id == goal_id)
            .filter_map(|r| r.match_ref.as_ref())
            .flat_map(|m| m.group_codes.iter().cloned())
            .collect();
        let mut codes: Vec<String> = codes.into_iter().collect();
        codes.sort();
        Ok(codes)
    }

    async fn save_match_annotations(
        &self,
        record_id: Uuid,
        annotations: &MatchAnnotations,
    ) -> Result<(), ReconError> {
        let annotations = annotations.clone();
        self.update_bank(record_id, move |record| {
            record.match_ref = Some(annotations.match_ref);
            record.matched_at = Some(annotations.matched_at);
            record.match_score = Some(annotations.match_score);
            record.status = annotations.status;
        })
        .await
    }

    async fn clear_match_annotations(&self, record_id: Uuid) -> Result<(), ReconError> {
        self.update_bank(record_id, |record| {
            record.match_ref = None;
            record.matched_at = None;
            record.match_score = None;
            record.status = ReconciliationStatus::Unmatched;
        })
        .await
    }

    async fn save_bank_status(
        &self,
        record_id: Uuid,
        status: ReconciliationStatus,
    ) -> Result<(), ReconError> {
        self.update_bank(record_id, move |record| {
            record.status = status;
        })
        .await
    }

    async fn save_bank_review(
        &self,
        record_id: Uuid,
        review: &ReviewAnnotations,
    ) -> Result<(), ReconError> {
        let review = review.clone();
        self.update_bank(record_id, move |record| {
            record.review_tag = Some(review.tag);
            record.review_notes = review.notes;
            record.reviewed_by = review.reviewed_by;
            record.reviewed_at = Some(review.reviewed_at);
        })
        .await
    }

    async fn save_bank_resolution(
        &self,
        record_id: Uuid,
        resolution: &ResolutionAnnotations,
    ) -> Result<(), ReconError> {
        let resolution = resolution.clone();
        self.update_bank(record_id, move |record| {
            record.variance_resolved = true;
            record.resolved_at = Some(resolution.resolved_at);
            record.resolved_reason = Some(resolution.reason);
        })
        .await
    }

    async fn save_reversal_marker(
        &self,
        record_id: Uuid,
        partner_id: Option<Uuid>,
    ) -> Result<(), ReconError> {
        self.update_bank(record_id, move |record| {
            record.reversal_partner_id = partner_id;
        })
        .await
    }

    async fn posting(&self, posting_id: Uuid) -> Result<Option<LedgerPosting>, ReconError> {
        Ok(self.postings.read().await.get(&posting_id).cloned())
    }

    async fn postings_for_goal(
        &self,
        goal_id: &str,
        range: &DateRange,
    ) -> Result<Vec<LedgerPosting>, ReconError> {
        let map = self.postings.read().await;
        Ok(sort_postings(
            map.values()
                .filter(|p| p.goal_id == goal_id && range.contains(p.txn_date))
                .cloned()
                .collect(),
        ))
    }

    async fn postings_by_group_codes(
        &self,
        group_codes: &[String],
    ) -> Result<Vec<LedgerPosting>, ReconError> {
        let map = self.postings.read().await;
        Ok(sort_postings(
            map.values()
                .filter(|p| group_codes.contains(&p.group_code))
                .cloned()
                .collect(),
        ))
    }

    async fn postings_by_tags(
        &self,
        tags: &[ReviewTag],
        range: Option<&DateRange>,
        limit: usize,
    ) -> Result<Vec<LedgerPosting>, ReconError> {
        let map = self.postings.read().await;
        let mut postings = sort_postings(
            map.values()
                .filter(|p| posting_carries_tag(p, tags, range))
                .cloned()
                .collect(),
        );
        postings.truncate(limit);
        Ok(postings)
    }

    async fn count_postings_by_tags(
        &self,
        tags: &[ReviewTag],
        range: Option<&DateRange>,
    ) -> Result<u64, ReconError> {
        let map = self.postings.read().await;
        Ok(map
            .values()
            .filter(|p| posting_carries_tag(p, tags, range))
            .count() as u64)
    }

    async fn save_posting_review(
        &self,
        posting_id: Uuid,
        review: &ReviewAnnotations,
    ) -> Result<(), ReconError> {
        let review = review.clone();
        self.update_posting(posting_id, move |posting| {
            posting.review_tag = Some(review.tag);
            posting.review_notes = review.notes;
            posting.reviewed_by = review.reviewed_by;
            posting.reviewed_at = Some(review.reviewed_at);
        })
        .await
    }

    async fn save_posting_resolution(
        &self,
        posting_id: Uuid,
        resolution: &ResolutionAnnotations,
    ) -> Result<(), ReconError> {
        let resolution = resolution.clone();
        self.update_posting(posting_id, move |posting| {
            posting.variance_resolved = true;
            posting.resolved_at = Some(resolution.resolved_at);
            posting.resolved_reason = Some(resolution.reason);
        })
        .await
    }
}
