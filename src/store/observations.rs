//! Append-only storage of raw observation batches.

use crate::error::{StoreError, StoreResult};
use crate::models::{BatchKey, ObservationBatch};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::debug;

/// Outcome of appending a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    /// The batch was stored for the first time.
    Inserted,
    /// An identical batch was already stored (re-delivery).
    Duplicate,
}

/// Durable, append-only store of observation batches.
#[async_trait]
pub trait ObservationStore: Send + Sync {
    /// Append a batch. Re-appending an identical batch is a no-op; a
    /// different batch under an existing key is a conflict.
    async fn append(&self, batch: ObservationBatch) -> StoreResult<AppendOutcome>;

    async fn get(&self, key: &BatchKey) -> StoreResult<Option<ObservationBatch>>;

    /// All batches of a customer, oldest first.
    async fn list_for_customer(&self, customer_id: &str) -> StoreResult<Vec<ObservationBatch>>;

    /// Batches captured in `[after, before)` as `(captured_at, key)`,
    /// oldest first. `None` leaves the window open at the start.
    async fn captured_between(
        &self,
        after: Option<DateTime<Utc>>,
        before: DateTime<Utc>,
    ) -> StoreResult<Vec<(DateTime<Utc>, BatchKey)>>;

    /// Keys of all batches captured strictly before `cutoff`.
    async fn captured_before(&self, cutoff: DateTime<Utc>) -> StoreResult<Vec<BatchKey>> {
        let window = self.captured_between(None, cutoff).await?;
        Ok(window.into_iter().map(|(_, key)| key).collect())
    }
}

#[derive(Default)]
struct Inner {
    batches: HashMap<BatchKey, ObservationBatch>,
    /// (customer, captured_at, batch) ordering for per-customer listing.
    by_arrival: BTreeMap<(String, DateTime<Utc>, String), ()>,
    /// (captured_at, key) ordering for deadline sweeps.
    by_capture: BTreeSet<(DateTime<Utc>, BatchKey)>,
}

/// In-memory observation store.
#[derive(Default)]
pub struct InMemoryObservationStore {
    inner: RwLock<Inner>,
}

impl InMemoryObservationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.inner.read().batches.len()
    }
}

#[async_trait]
impl ObservationStore for InMemoryObservationStore {
    async fn append(&self, batch: ObservationBatch) -> StoreResult<AppendOutcome> {
        let key = batch.key();
        let mut inner = self.inner.write();

        if let Some(existing) = inner.batches.get(&key) {
            if *existing == batch {
                debug!("Batch {} re-delivered, keeping stored copy", key);
                return Ok(AppendOutcome::Duplicate);
            }
            return Err(StoreError::Conflict {
                key,
                reason: "batch already stored with different content".to_string(),
            });
        }

        inner.by_arrival.insert(
            (
                batch.customer_id.clone(),
                batch.captured_at,
                batch.batch_id.clone(),
            ),
            (),
        );
        inner.by_capture.insert((batch.captured_at, key.clone()));
        inner.batches.insert(key, batch);
        Ok(AppendOutcome::Inserted)
    }

    async fn get(&self, key: &BatchKey) -> StoreResult<Option<ObservationBatch>> {
        Ok(self.inner.read().batches.get(key).cloned())
    }

    async fn list_for_customer(&self, customer_id: &str) -> StoreResult<Vec<ObservationBatch>> {
        let inner = self.inner.read();
        let batches = inner
            .by_arrival
            .keys()
            .filter(|(customer, _, _)| customer == customer_id)
            .filter_map(|(customer, _, batch_id)| {
                inner.batches.get(&BatchKey::new(customer, batch_id)).cloned()
            })
            .collect();
        Ok(batches)
    }

    async fn captured_between(
        &self,
        after: Option<DateTime<Utc>>,
        before: DateTime<Utc>,
    ) -> StoreResult<Vec<(DateTime<Utc>, BatchKey)>> {
        let start = after.unwrap_or(DateTime::<Utc>::MIN_UTC);
        if start >= before {
            return Ok(Vec::new());
        }

        let floor = BatchKey::new("", "");
        let inner = self.inner.read();
        Ok(inner
            .by_capture
            .range((start, floor.clone())..(before, floor))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    fn batch(customer: &str, batch_id: &str, captured_at: DateTime<Utc>) -> ObservationBatch {
        ObservationBatch {
            customer_id: customer.to_string(),
            batch_id: batch_id.to_string(),
            captured_at,
            payload: json!({"events": [{"kind": "login"}]}),
        }
    }

    #[tokio::test]
    async fn test_append_is_idempotent_for_redelivery() {
        let store = InMemoryObservationStore::new();
        let b = batch("C1", "B1", Utc::now());

        assert_eq!(store.append(b.clone()).await.unwrap(), AppendOutcome::Inserted);
        assert_eq!(store.append(b.clone()).await.unwrap(), AppendOutcome::Duplicate);
        assert_eq!(store.len(), 1);
        assert_eq!(store.get(&b.key()).await.unwrap(), Some(b));
    }

    #[tokio::test]
    async fn test_append_rejects_conflicting_content() {
        let store = InMemoryObservationStore::new();
        let b = batch("C1", "B1", Utc::now());
        store.append(b.clone()).await.unwrap();

        let mut changed = b;
        changed.payload = json!({"events": []});
        let err = store.append(changed).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict { .. }));
    }

    #[tokio::test]
    async fn test_list_and_cutoff_follow_arrival_order() {
        let store = InMemoryObservationStore::new();
        let now = Utc::now();
        store.append(batch("C1", "B2", now)).await.unwrap();
        store
            .append(batch("C1", "B1", now - Duration::minutes(30)))
            .await
            .unwrap();
        store
            .append(batch("C2", "B9", now - Duration::minutes(20)))
            .await
            .unwrap();

        let listed: Vec<String> = store
            .list_for_customer("C1")
            .await
            .unwrap()
            .into_iter()
            .map(|b| b.batch_id)
            .collect();
        assert_eq!(listed, vec!["B1", "B2"]);

        let old = store
            .captured_before(now - Duration::minutes(10))
            .await
            .unwrap();
        assert_eq!(old.len(), 2);
        assert!(old.contains(&BatchKey::new("C1", "B1")));
        assert!(old.contains(&BatchKey::new("C2", "B9")));
    }

    #[tokio::test]
    async fn test_captured_between_is_half_open() {
        let store = InMemoryObservationStore::new();
        let t0 = Utc::now() - Duration::hours(1);
        store.append(batch("C1", "B1", t0)).await.unwrap();
        store
            .append(batch("C2", "B2", t0 + Duration::minutes(10)))
            .await
            .unwrap();
        store
            .append(batch("C1", "B3", t0 + Duration::minutes(20)))
            .await
            .unwrap();

        let window = store
            .captured_between(Some(t0 + Duration::minutes(10)), t0 + Duration::minutes(20))
            .await
            .unwrap();
        assert_eq!(window, vec![(t0 + Duration::minutes(10), BatchKey::new("C2", "B2"))]);

        let open = store
            .captured_between(None, t0 + Duration::minutes(20))
            .await
            .unwrap();
        let keys: Vec<BatchKey> = open.into_iter().map(|(_, key)| key).collect();
        assert_eq!(keys, vec![BatchKey::new("C1", "B1"), BatchKey::new("C2", "B2")]);

        let empty = store
            .captured_between(Some(t0 + Duration::minutes(20)), t0)
            .await
            .unwrap();
        assert!(empty.is_empty());
    }
}
