//! Final assessment store with compare-and-set commits.
//!
//! `commit` is the only place the at-most-one-complete rule is enforced.
//! The check and the write happen under one lock, so concurrent
//! synthesizers racing on the same key produce exactly one winner.
//!
//! Each record also tracks whether its notification went out. A freshly
//! committed record is in flight with its committer; a failed delivery
//! makes it claimable by whichever invocation touches the key next.

use crate::error::StoreResult;
use crate::models::{AssessmentStatus, BatchKey, FinalAssessment};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;

/// Outcome of a conditional commit.
#[derive(Debug, Clone, PartialEq)]
pub enum CommitOutcome {
    /// The assessment was written. The caller now owns its delivery.
    Committed,
    /// A record already occupies the key; nothing was written.
    Rejected { existing: FinalAssessment },
}

impl CommitOutcome {
    pub fn is_committed(&self) -> bool {
        matches!(self, CommitOutcome::Committed)
    }
}

/// Store of final assessments keyed by `(customer_id, batch_id)`.
#[async_trait]
pub trait AssessmentStore: Send + Sync {
    /// Conditionally write an assessment.
    ///
    /// A `complete` assessment is written unless a `complete` one already
    /// exists for the key (it may replace a `partial`). A `partial`
    /// assessment is written only if the key is empty.
    async fn commit(&self, assessment: FinalAssessment) -> StoreResult<CommitOutcome>;

    async fn get(&self, key: &BatchKey) -> StoreResult<Option<FinalAssessment>>;

    /// The newest assessment of a customer, by batch arrival.
    async fn latest(&self, customer_id: &str) -> StoreResult<Option<FinalAssessment>>;

    /// All assessments of a customer, oldest batch first.
    async fn list_for_customer(&self, customer_id: &str) -> StoreResult<Vec<FinalAssessment>>;

    /// Take over delivery of a record whose last notification failed.
    ///
    /// A claimed record is in flight until settled, so each failure is
    /// handed out at most once.
    async fn claim_undelivered(&self, key: &BatchKey) -> StoreResult<Option<FinalAssessment>>;

    /// Record the outcome of a delivery attempt.
    ///
    /// Ignored when the stored record is no longer the one that was sent.
    async fn settle_delivery(
        &self,
        assessment: &FinalAssessment,
        delivered: bool,
    ) -> StoreResult<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Delivery {
    InFlight,
    Failed,
    Delivered,
}

struct Stored {
    assessment: FinalAssessment,
    delivery: Delivery,
}

impl Stored {
    fn is(&self, assessment: &FinalAssessment) -> bool {
        self.assessment.status == assessment.status
            && self.assessment.synthesized_at == assessment.synthesized_at
    }
}

/// In-memory assessment store.
#[derive(Default)]
pub struct InMemoryAssessmentStore {
    records: Mutex<HashMap<BatchKey, Stored>>,
}

impl InMemoryAssessmentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored `complete` assessments.
    pub fn complete_count(&self) -> usize {
        self.records
            .lock()
            .values()
            .filter(|s| s.assessment.status == AssessmentStatus::Complete)
            .count()
    }

    /// Number of records whose notification has not gone out.
    pub fn undelivered_count(&self) -> usize {
        self.records
            .lock()
            .values()
            .filter(|s| s.delivery != Delivery::Delivered)
            .count()
    }
}

#[async_trait]
impl AssessmentStore for InMemoryAssessmentStore {
    async fn commit(&self, assessment: FinalAssessment) -> StoreResult<CommitOutcome> {
        let key = assessment.key();
        let mut records = self.records.lock();

        if let Some(existing) = records.get(&key) {
            let replaceable = existing.assessment.status == AssessmentStatus::Partial
                && assessment.status == AssessmentStatus::Complete;
            if !replaceable {
                return Ok(CommitOutcome::Rejected {
                    existing: existing.assessment.clone(),
                });
            }
        }

        records.insert(
            key,
            Stored {
                assessment,
                delivery: Delivery::InFlight,
            },
        );
        Ok(CommitOutcome::Committed)
    }

    async fn get(&self, key: &BatchKey) -> StoreResult<Option<FinalAssessment>> {
        Ok(self.records.lock().get(key).map(|s| s.assessment.clone()))
    }

    async fn latest(&self, customer_id: &str) -> StoreResult<Option<FinalAssessment>> {
        Ok(self
            .records
            .lock()
            .values()
            .map(|s| &s.assessment)
            .filter(|a| a.customer_id == customer_id)
            .max_by(|a, b| a.recency(b))
            .cloned())
    }

    async fn list_for_customer(&self, customer_id: &str) -> StoreResult<Vec<FinalAssessment>> {
        let mut list: Vec<FinalAssessment> = self
            .records
            .lock()
            .values()
            .map(|s| &s.assessment)
            .filter(|a| a.customer_id == customer_id)
            .cloned()
            .collect();
        list.sort_by(|a, b| a.recency(b));
        Ok(list)
    }

    async fn claim_undelivered(&self, key: &BatchKey) -> StoreResult<Option<FinalAssessment>> {
        let mut records = self.records.lock();
        match records.get_mut(key) {
            Some(stored) if stored.delivery == Delivery::Failed => {
                stored.delivery = Delivery::InFlight;
                Ok(Some(stored.assessment.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn settle_delivery(
        &self,
        assessment: &FinalAssessment,
        delivered: bool,
    ) -> StoreResult<()> {
        let mut records = self.records.lock();
        if let Some(stored) = records.get_mut(&assessment.key()) {
            if stored.is(assessment) && stored.delivery == Delivery::InFlight {
                stored.delivery = if delivered {
                    Delivery::Delivered
                } else {
                    Delivery::Failed
                };
            }
        }
        Ok(())
    }
}
