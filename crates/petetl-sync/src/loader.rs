//! Idempotent, partial-failure-tolerant bulk load of pet records.

use std::sync::Arc;
use std::time::Duration;

use petetl_core::PetRecord;
use thiserror::Error;
use tracing::warn;

use crate::store::{PetBatch, PetStore, StoreError, UpsertOutcome};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadFailure {
    pub pet_id: i64,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadResult {
    pub inserted: usize,
    pub updated: usize,
    pub failed: usize,
    pub failures: Vec<LoadFailure>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoadError {
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),
}

pub struct Loader {
    store: Arc<dyn PetStore>,
    timeout: Duration,
}

impl Loader {
    pub fn new(store: Arc<dyn PetStore>, timeout: Duration) -> Self {
        Self { store, timeout }
    }

    /// Upsert every record in one transaction. Per-record failures are counted;
    /// a store-level failure or timeout rolls the whole batch back.
    pub async fn load(&self, records: &[PetRecord]) -> Result<LoadResult, LoadError> {
        if records.is_empty() {
            return Ok(LoadResult::default());
        }
        match tokio::time::timeout(self.timeout, self.load_batch(records)).await {
            Ok(result) => result,
            Err(_) => Err(LoadError::StoreUnavailable(format!(
                "load timed out after {}s",
                self.timeout.as_secs_f64()
            ))),
        }
    }

    async fn load_batch(&self, records: &[PetRecord]) -> Result<LoadResult, LoadError> {
        let mut batch = self
            .store
            .begin()
            .await
            .map_err(|err| LoadError::StoreUnavailable(err.to_string()))?;

        let mut result = LoadResult::default();
        for record in records {
            match batch.upsert(record).await {
                Ok(UpsertOutcome::Inserted) => result.inserted += 1,
                Ok(UpsertOutcome::Updated) => result.updated += 1,
                Err(StoreError::Record(reason)) => {
                    warn!(pet_id = record.pet_id, %reason, "record failed to load");
                    result.failed += 1;
                    result.failures.push(LoadFailure {
                        pet_id: record.pet_id,
                        reason,
                    });
                }
                Err(StoreError::Unavailable(reason)) => {
                    abandon(batch).await;
                    return Err(LoadError::StoreUnavailable(reason));
                }
            }
        }

        batch
            .commit()
            .await
            .map_err(|err| LoadError::StoreUnavailable(err.to_string()))?;
        Ok(result)
    }
}

async fn abandon(batch: Box<dyn PetBatch>) {
    if let Err(err) = batch.rollback().await {
        warn!(error = %err, "rollback after store failure did not complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{InMemoryPetStore, RunLease};
    use async_trait::async_trait;
    use chrono::{NaiveDate, Utc};
    use petetl_core::StoredPet;

    /// Store whose batches take `delay` to open.
    struct SlowStore {
        inner: InMemoryPetStore,
        delay: Duration,
    }

    #[async_trait]
    impl PetStore for SlowStore {
        async fn begin(&self) -> Result<Box<dyn PetBatch>, StoreError> {
            tokio::time::sleep(self.delay).await;
            self.inner.begin().await
        }

        async fn list_pets(&self, status: Option<&str>) -> Result<Vec<StoredPet>, StoreError> {
            self.inner.list_pets(status).await
        }

        async fn ping(&self) -> Result<(), StoreError> {
            self.inner.ping().await
        }

        async fn try_lock_run(&self) -> Result<Option<Box<dyn RunLease>>, StoreError> {
            self.inner.try_lock_run().await
        }
    }

    fn record(pet_id: i64, name: &str, age: Option<i32>) -> PetRecord {
        PetRecord {
            pet_id,
            name: Some(name.to_string()),
            breed: Some("Beagle".into()),
            age,
            status: Some("available".into()),
            added_date: NaiveDate::from_ymd_opt(2025, 4, 1),
            extraction_timestamp: Utc::now(),
            processed_timestamp: Utc::now(),
        }
    }

    fn loader(store: &InMemoryPetStore) -> Loader {
        Loader::new(Arc::new(store.clone()), Duration::from_secs(5))
    }

    fn business_state(store: &InMemoryPetStore) -> Vec<(i64, Option<String>, Option<i32>, Option<String>)> {
        store
            .snapshot()
            .into_values()
            .map(|p| (p.pet_id, p.name, p.age, p.status))
            .collect()
    }

    #[tokio::test]
    async fn loading_the_same_batch_twice_is_idempotent() {
        let store = InMemoryPetStore::new();
        let batch = vec![record(1, "Rex", Some(3)), record(2, "Fido", None)];

        let first = loader(&store).load(&batch).await.unwrap();
        assert_eq!((first.inserted, first.updated, first.failed), (2, 0, 0));
        let after_first = business_state(&store);

        let second = loader(&store).load(&batch).await.unwrap();
        assert_eq!((second.inserted, second.updated, second.failed), (0, 2, 0));
        assert_eq!(business_state(&store), after_first);
    }

    #[tokio::test]
    async fn later_values_overwrite_whole_row() {
        let store = InMemoryPetStore::new();
        loader(&store).load(&[record(1, "Rex", Some(3))]).await.unwrap();

        let mut changed = record(1, "Rex II", None);
        changed.breed = None;
        loader(&store).load(&[changed]).await.unwrap();

        let row = store.snapshot().remove(&1).unwrap();
        assert_eq!(row.name.as_deref(), Some("Rex II"));
        assert_eq!(row.age, None);
        assert_eq!(row.breed, None);
    }

    #[tokio::test]
    async fn per_record_failures_do_not_abort_the_batch() {
        let store = InMemoryPetStore::new().reject_pet_ids([2]);
        let result = loader(&store)
            .load(&[record(1, "Rex", None), record(2, "Bad", None), record(3, "Max", None)])
            .await
            .unwrap();

        assert_eq!((result.inserted, result.updated, result.failed), (2, 0, 1));
        assert_eq!(result.failures[0].pet_id, 2);
        assert_eq!(store.snapshot().keys().copied().collect::<Vec<_>>(), vec![1, 3]);
    }

    #[tokio::test]
    async fn store_outage_rolls_back_everything() {
        let store = InMemoryPetStore::new();
        store.set_unavailable(true);
        let err = loader(&store)
            .load(&[record(1, "Rex", None)])
            .await
            .unwrap_err();
        assert!(matches!(err, LoadError::StoreUnavailable(_)));

        store.set_unavailable(false);
        assert!(store.snapshot().is_empty());
    }

    #[tokio::test]
    async fn empty_batch_never_touches_the_store() {
        let store = InMemoryPetStore::new();
        store.set_unavailable(true);
        let result = loader(&store).load(&[]).await.unwrap();
        assert_eq!(result, LoadResult::default());
    }

    #[tokio::test]
    async fn batch_exceeding_the_load_deadline_is_abandoned() {
        let inner = InMemoryPetStore::new();
        let slow = SlowStore {
            inner: inner.clone(),
            delay: Duration::from_secs(5),
        };
        let loader = Loader::new(Arc::new(slow), Duration::from_millis(50));

        let err = loader.load(&[record(1, "Rex", None)]).await.unwrap_err();
        let LoadError::StoreUnavailable(reason) = err;
        assert!(reason.contains("timed out"), "{reason}");
        assert!(inner.snapshot().is_empty());
    }
}
