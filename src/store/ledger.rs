//! Result ledger: per-(customer, batch, dimension) results.
//!
//! Keys are ordered `(customer_id, batch_id, dimension)` so that reading all
//! results of one batch is a prefix range scan rather than a full scan.

use crate::error::StoreResult;
use crate::models::{BatchKey, DimensionResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::debug;

/// Outcome of an upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// No record existed for the key.
    Inserted,
    /// The stored record was replaced by a newer one.
    Replaced,
    /// The stored record is newer; the write was discarded.
    Stale,
}

/// Keyed store of dimension results.
#[async_trait]
pub trait ResultLedger: Send + Sync {
    /// Last-writer-wins upsert on `(customer_id, dimension, batch_id)`,
    /// ordered by `produced_at`.
    async fn upsert(&self, result: DimensionResult) -> StoreResult<UpsertOutcome>;

    /// Snapshot of all visible results of one batch.
    async fn get_all(&self, key: &BatchKey) -> StoreResult<Vec<DimensionResult>>;
}

type LedgerKey = (String, String, String);

fn ledger_key(result: &DimensionResult) -> LedgerKey {
    (
        result.customer_id.clone(),
        result.batch_id.clone(),
        result.dimension.clone(),
    )
}

/// In-memory result ledger with a visibility window.
pub struct InMemoryResultLedger {
    records: RwLock<BTreeMap<LedgerKey, DimensionResult>>,
    ttl: Option<chrono::Duration>,
}

impl Default for InMemoryResultLedger {
    fn default() -> Self {
        Self {
            records: RwLock::new(BTreeMap::new()),
            ttl: None,
        }
    }
}

impl InMemoryResultLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hide records whose `produced_at` is older than `ttl`.
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            records: RwLock::new(BTreeMap::new()),
            ttl: chrono::Duration::from_std(ttl).ok(),
        }
    }

    fn is_visible(&self, result: &DimensionResult, now: DateTime<Utc>) -> bool {
        match self.ttl {
            // An expiry past the representable range never arrives.
            Some(ttl) => result
                .produced_at
                .checked_add_signed(ttl)
                .map_or(true, |expiry| expiry >= now),
            None => true,
        }
    }

    /// Drop expired records. Returns the number removed.
    pub fn purge_expired(&self, now: DateTime<Utc>) -> usize {
        let mut records = self.records.write();
        let before = records.len();
        records.retain(|_, r| self.is_visible(r, now));
        let removed = before - records.len();
        if removed > 0 {
            debug!("Purged {} expired ledger records", removed);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }
}

#[async_trait]
impl ResultLedger for InMemoryResultLedger {
    async fn upsert(&self, result: DimensionResult) -> StoreResult<UpsertOutcome> {
        let key = ledger_key(&result);
        let mut records = self.records.write();

        let outcome = match records.get(&key) {
            None => UpsertOutcome::Inserted,
            Some(existing) if result.produced_at >= existing.produced_at => UpsertOutcome::Replaced,
            Some(_) => UpsertOutcome::Stale,
        };

        if outcome == UpsertOutcome::Stale {
            debug!(
                "Discarding stale {} result for {}/{}",
                result.dimension, result.customer_id, result.batch_id
            );
        } else {
            records.insert(key, result);
        }

        Ok(outcome)
    }

    async fn get_all(&self, key: &BatchKey) -> StoreResult<Vec<DimensionResult>> {
        let now = Utc::now();
        let start = (key.customer_id.clone(), key.batch_id.clone(), String::new());
        let records = self.records.read();

        Ok(records
            .range(start..)
            .take_while(|((customer, batch, _), _)| {
                *customer == key.customer_id && *batch == key.batch_id
            })
            .map(|(_, r)| r)
            .filter(|r| self.is_visible(r, now))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(customer: &str, batch: &str, dimension: &str, score: f64) -> DimensionResult {
        DimensionResult {
            customer_id: customer.to_string(),
            dimension: dimension.to_string(),
            batch_id: batch.to_string(),
            score,
            confidence: 0.5,
            rationale: "test".to_string(),
            produced_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_upsert_same_key_keeps_latest() {
        let ledger = InMemoryResultLedger::new();
        let first = result("C1", "B1", "behavioral", 0.2);
        let mut second = result("C1", "B1", "behavioral", 0.9);
        second.produced_at = first.produced_at + chrono::Duration::seconds(1);

        assert_eq!(ledger.upsert(first).await.unwrap(), UpsertOutcome::Inserted);
        assert_eq!(ledger.upsert(second.clone()).await.unwrap(), UpsertOutcome::Replaced);

        let all = ledger.get_all(&BatchKey::new("C1", "B1")).await.unwrap();
        assert_eq!(all, vec![second]);
        assert_eq!(ledger.len(), 1);
    }

    #[tokio::test]
    async fn test_upsert_discards_older_attempt() {
        let ledger = InMemoryResultLedger::new();
        let newer = result("C1", "B1", "sentiment", 0.7);
        let mut older = result("C1", "B1", "sentiment", 0.1);
        older.produced_at = newer.produced_at - chrono::Duration::seconds(5);

        ledger.upsert(newer.clone()).await.unwrap();
        assert_eq!(ledger.upsert(older).await.unwrap(), UpsertOutcome::Stale);

        let all = ledger.get_all(&BatchKey::new("C1", "B1")).await.unwrap();
        assert_eq!(all, vec![newer]);
    }

    #[tokio::test]
    async fn test_get_all_is_scoped_to_batch() {
        let ledger = InMemoryResultLedger::new();
        ledger.upsert(result("C1", "B1", "behavioral", 0.1)).await.unwrap();
        ledger.upsert(result("C1", "B1", "sentiment", 0.2)).await.unwrap();
        ledger.upsert(result("C1", "B10", "behavioral", 0.3)).await.unwrap();
        ledger.upsert(result("C10", "B1", "behavioral", 0.4)).await.unwrap();
        ledger.upsert(result("C0", "B1", "behavioral", 0.5)).await.unwrap();

        let all = ledger.get_all(&BatchKey::new("C1", "B1")).await.unwrap();
        let dims: Vec<&str> = all.iter().map(|r| r.dimension.as_str()).collect();
        assert_eq!(dims, vec!["behavioral", "sentiment"]);
    }

    #[test]
    fn test_ttl_hides_and_purges_expired_records() {
        let ledger = InMemoryResultLedger::with_ttl(Duration::from_secs(60));
        let mut old = result("C1", "B1", "behavioral", 0.1);
        old.produced_at = Utc::now() - chrono::Duration::minutes(5);
        let fresh = result("C1", "B1", "sentiment", 0.2);

        tokio_test::block_on(async {
            ledger.upsert(old).await.unwrap();
            ledger.upsert(fresh.clone()).await.unwrap();
            let all = ledger.get_all(&BatchKey::new("C1", "B1")).await.unwrap();
            assert_eq!(all, vec![fresh]);
        });

        assert_eq!(ledger.purge_expired(Utc::now()), 1);
        assert_eq!(ledger.len(), 1);
    }

    #[tokio::test]
    async fn test_ttl_beyond_calendar_keeps_records_visible() {
        let ledger = InMemoryResultLedger::with_ttl(Duration::from_secs(9_000_000_000_000));
        let record = result("C1", "B1", "behavioral", 0.4);
        ledger.upsert(record.clone()).await.unwrap();

        let all = ledger.get_all(&BatchKey::new("C1", "B1")).await.unwrap();
        assert_eq!(all, vec![record]);
        assert_eq!(ledger.purge_expired(Utc::now()), 0);
    }
}
