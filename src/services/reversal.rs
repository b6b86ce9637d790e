//! Reversal linking for offsetting bank record pairs.
//!
//! A deposit booked in error and its compensating withdrawal both sit
//! unmatched forever; linking them as a reversal pair explains the two
//! records to each other instead of against the ledger. Linked records are
//! excluded from missing-in-ledger flagging and from further reversal
//! candidacy.

use anyhow::anyhow;
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::error::ReconError;
use crate::models::{BankRecord, DateRange};
use crate::repository::ReconRepository;
use crate::services::metrics::OPERATION_DURATION;

pub struct ReversalLinker {
    repo: Arc<dyn ReconRepository>,
}

impl ReversalLinker {
    pub fn new(repo: Arc<dyn ReconRepository>) -> Self {
        Self { repo }
    }

    /// Unmatched records of the same goal that exactly negate the given
    /// record and are not already part of a reversal pair.
    #[instrument(skip(self), fields(bank_record_id = %bank_record_id))]
    pub async fn find_candidates(
        &self,
        bank_record_id: Uuid,
        range: Option<&DateRange>,
    ) -> Result<Vec<BankRecord>, ReconError> {
        let timer = OPERATION_DURATION
            .with_label_values(&["find_reversal_candidates"])
            .start_timer();

        let source = self
            .repo
            .bank_record(bank_record_id)
            .await?
            .ok_or_else(|| {
                ReconError::NotFound(anyhow!("bank record {} not found", bank_record_id))
            })?;

        let Some(opposite) = source.kind.opposite() else {
            debug!(kind = source.kind.as_str(), "Kind has no reversal direction");
            return Ok(Vec::new());
        };

        let unmatched = self
            .repo
            .unmatched_bank_records_for_goal(&source.goal_id)
            .await?;
        let candidates = unmatched
            .into_iter()
            .filter(|record| {
                record.record_id != source.record_id
                    && record.kind == opposite
                    && record.amount == -source.amount
                    && record.reversal_partner_id.is_none()
                    && range.map(|r| r.contains(record.txn_date)).unwrap_or(true)
            })
            .collect();

        timer.observe_duration();
        Ok(candidates)
    }

    /// Link two unmatched records as a reversal pair.
    ///
    /// Both markers are written, or neither: if the second write fails the
    /// first is rolled back before the error surfaces.
    #[instrument(skip(self), fields(actor = %actor))]
    pub async fn link(
        &self,
        record_id_a: Uuid,
        record_id_b: Uuid,
        actor: &str,
    ) -> Result<(), ReconError> {
        let timer = OPERATION_DURATION
            .with_label_values(&["link_reversal"])
            .start_timer();

        if record_id_a == record_id_b {
            return Err(ReconError::Validation(anyhow!(
                "cannot link a record to itself"
            )));
        }
        if actor.trim().is_empty() {
            return Err(ReconError::Validation(anyhow!(
                "a reversal link needs a non-empty actor"
            )));
        }

        let a = self.load(record_id_a).await?;
        let b = self.load(record_id_b).await?;

        if a.goal_id != b.goal_id {
            return Err(ReconError::Consistency(anyhow!(
                "reversal pair spans goals {} and {}",
                a.goal_id,
                b.goal_id
            )));
        }
        for record in [&a, &b] {
            if record.match_ref.is_some() {
                return Err(ReconError::Consistency(anyhow!(
                    "bank record {} is already matched and cannot join a reversal pair",
                    record.record_id
                )));
            }
            if record.reversal_partner_id.is_some() {
                return Err(ReconError::Consistency(anyhow!(
                    "bank record {} is already part of a reversal pair",
                    record.record_id
                )));
            }
        }
        if a.kind.opposite() != Some(b.kind) {
            return Err(ReconError::Consistency(anyhow!(
                "kinds {} and {} do not form a reversal",
                a.kind.as_str(),
                b.kind.as_str()
            )));
        }
        // One cent of slack absorbs rounding on imported statement rows.
        if (a.amount + b.amount).abs() > Decimal::new(1, 2) {
            return Err(ReconError::Consistency(anyhow!(
                "reversal amounts {} and {} do not net to zero",
                a.amount,
                b.amount
            )));
        }

        self.repo
            .save_reversal_marker(record_id_a, Some(record_id_b))
            .await?;
        if let Err(err) = self
            .repo
            .save_reversal_marker(record_id_b, Some(record_id_a))
            .await
        {
            if let Err(rollback) = self.repo.save_reversal_marker(record_id_a, None).await {
                warn!(
                    record_id = %record_id_a,
                    error = %rollback,
                    "Rollback of reversal marker failed"
                );
            }
            return Err(err);
        }

        timer.observe_duration();
        info!(
            record_id_a = %record_id_a,
            record_id_b = %record_id_b,
            goal_id = %a.goal_id,
            "Reversal pair linked"
        );
        Ok(())
    }

    /// Dissolve a reversal pair starting from either of its records.
    /// Returns the partner's id.
    #[instrument(skip(self), fields(bank_record_id = %bank_record_id))]
    pub async fn unlink(&self, bank_record_id: Uuid) -> Result<Uuid, ReconError> {
        let timer = OPERATION_DURATION
            .with_label_values(&["unlink_reversal"])
            .start_timer();

        let record = self.load(bank_record_id).await?;
        let partner_id = record.reversal_partner_id.ok_or_else(|| {
            ReconError::Validation(anyhow!(
                "bank record {} is not part of a reversal pair",
                bank_record_id
            ))
        })?;

        self.repo.save_reversal_marker(bank_record_id, None).await?;

        match self.repo.bank_record(partner_id).await? {
            Some(partner) if partner.reversal_partner_id == Some(bank_record_id) => {
                if let Err(err) = self.repo.save_reversal_marker(partner_id, None).await {
                    // Put the first marker back so the pair stays intact.
                    if let Err(rollback) = self
                        .repo
                        .save_reversal_marker(bank_record_id, Some(partner_id))
                        .await
                    {
                        warn!(
                            record_id = %bank_record_id,
                            error = %rollback,
                            "Rollback of reversal marker failed"
                        );
                    }
                    return Err(err);
                }
            }
            Some(_) => {
                warn!(
                    partner_id = %partner_id,
                    "Partner marker points elsewhere; left untouched"
                );
            }
            None => {
                warn!(partner_id = %partner_id, "Reversal partner record no longer exists");
            }
        }

        timer.observe_duration();
        info!(
            record_id = %bank_record_id,
            partner_id = %partner_id,
            "Reversal pair dissolved"
        );
        Ok(partner_id)
    }

    async fn load(&self, record_id: Uuid) -> Result<BankRecord, ReconError> {
        self.repo.bank_record(record_id).await?.ok_or_else(|| {
            ReconError::NotFound(anyhow!("bank record {} not found", record_id))
        })
    }
}
