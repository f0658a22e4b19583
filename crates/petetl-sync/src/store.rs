//! Pet store abstraction: PostgreSQL for real runs, in-memory for tests.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use petetl_core::{PetRecord, PetStats, StoredPet};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{Acquire, PgPool, Postgres, Row, Transaction};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// Connectivity or transaction-level failure; the batch cannot continue.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// The store refused this one record (constraint violation and similar).
    #[error("record rejected by store: {0}")]
    Record(String),
}

#[async_trait]
pub trait PetStore: Send + Sync {
    /// Open one transactional batch. The batch owns its connection until commit or rollback.
    async fn begin(&self) -> Result<Box<dyn PetBatch>, StoreError>;

    async fn list_pets(&self, status: Option<&str>) -> Result<Vec<StoredPet>, StoreError>;

    async fn pet_stats(&self) -> Result<PetStats, StoreError> {
        Ok(PetStats::from_pets(&self.list_pets(None).await?))
    }

    async fn ping(&self) -> Result<(), StoreError>;

    /// Take the store-wide run lock without waiting. `None` means another
    /// process or pipeline holds it.
    async fn try_lock_run(&self) -> Result<Option<Box<dyn RunLease>>, StoreError>;
}

/// Exclusive right to run the ETL against a store. Dropping the lease also releases it.
#[async_trait]
pub trait RunLease: Send {
    async fn release(self: Box<Self>) -> Result<(), StoreError>;
}

#[async_trait]
pub trait PetBatch: Send {
    async fn upsert(&mut self, record: &PetRecord) -> Result<UpsertOutcome, StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;

    async fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}

const UPSERT_PET_SQL: &str = r#"
    INSERT INTO pets (pet_id, name, breed, age, status, added_date, etl_timestamp)
    VALUES ($1, $2, $3, $4, $5, $6, NOW())
    ON CONFLICT (pet_id) DO UPDATE
       SET name = EXCLUDED.name,
           breed = EXCLUDED.breed,
           age = EXCLUDED.age,
           status = EXCLUDED.status,
           added_date = EXCLUDED.added_date,
           etl_timestamp = EXCLUDED.etl_timestamp
    RETURNING (xmax = 0) AS inserted
"#;

/// Advisory lock key shared by every process that loads into the same database.
pub const RUN_LOCK_KEY: i64 = 0x7065_7465_746c;

fn classify_sqlx_error(err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db) => StoreError::Record(db.to_string()),
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
            StoreError::Record(err.to_string())
        }
        other => StoreError::Unavailable(other.to_string()),
    }
}

fn unavailable(err: sqlx::Error) -> StoreError {
    StoreError::Unavailable(err.to_string())
}

#[derive(Debug, Clone)]
pub struct PgPetStore {
    pool: PgPool,
}

impl PgPetStore {
    pub async fn connect(database_url: &str, acquire_timeout: Duration) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(acquire_timeout)
            .connect(database_url)
            .await
            .map_err(unavailable)?;
        Ok(Self { pool })
    }

    /// Pool that connects on first use, so callers can start while the database is down.
    pub fn connect_lazy(database_url: &str, acquire_timeout: Duration) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(acquire_timeout)
            .connect_lazy(database_url)
            .map_err(unavailable)?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }
}

fn stored_pet_from_row(row: &PgRow) -> Result<StoredPet, sqlx::Error> {
    Ok(StoredPet {
        pet_id: row.try_get("pet_id")?,
        name: row.try_get("name")?,
        breed: row.try_get("breed")?,
        age: row.try_get("age")?,
        status: row.try_get("status")?,
        added_date: row.try_get("added_date")?,
        etl_timestamp: row.try_get("etl_timestamp")?,
    })
}

#[async_trait]
impl PetStore for PgPetStore {
    async fn begin(&self) -> Result<Box<dyn PetBatch>, StoreError> {
        let tx = self.pool.begin().await.map_err(unavailable)?;
        Ok(Box::new(PgPetBatch { tx }))
    }

    async fn list_pets(&self, status: Option<&str>) -> Result<Vec<StoredPet>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT pet_id, name, breed, age, status, added_date, etl_timestamp
              FROM pets
             WHERE $1::text IS NULL OR status = $1
             ORDER BY pet_id
            "#,
        )
        .bind(status)
        .fetch_all(&self.pool)
        .await
        .map_err(classify_sqlx_error)?;

        rows.iter()
            .map(stored_pet_from_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(classify_sqlx_error)
    }

    async fn pet_stats(&self) -> Result<PetStats, StoreError> {
        let status_rows = sqlx::query(
            r#"
            SELECT status, COUNT(*) AS count
              FROM pets
             GROUP BY status
             ORDER BY status
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(classify_sqlx_error)?;

        let breed_rows = sqlx::query(
            r#"
            SELECT breed, COUNT(*) AS count
              FROM pets
             GROUP BY breed
             ORDER BY count DESC, breed
             LIMIT $1
            "#,
        )
        .bind(petetl_core::TOP_BREEDS as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(classify_sqlx_error)?;

        let age_rows = sqlx::query(
            r#"
            SELECT CASE
                       WHEN age IS NULL THEN $1
                       WHEN age < 2 THEN $2
                       WHEN age < 5 THEN $3
                       WHEN age < 9 THEN $4
                       ELSE $5
                   END AS age_group,
                   COUNT(*) AS count
              FROM pets
             GROUP BY age_group
             ORDER BY age_group
            "#,
        )
        .bind(petetl_core::AGE_GROUP_UNKNOWN)
        .bind(petetl_core::AGE_GROUP_YOUNGEST)
        .bind(petetl_core::AGE_GROUP_YOUNG)
        .bind(petetl_core::AGE_GROUP_ADULT)
        .bind(petetl_core::AGE_GROUP_SENIOR)
        .fetch_all(&self.pool)
        .await
        .map_err(classify_sqlx_error)?;

        let mut stats = PetStats::default();
        for row in status_rows {
            stats.status_counts.push(petetl_core::StatusCount {
                status: row.try_get("status").map_err(classify_sqlx_error)?,
                count: row.try_get("count").map_err(classify_sqlx_error)?,
            });
        }
        for row in breed_rows {
            stats.breed_counts.push(petetl_core::BreedCount {
                breed: row.try_get("breed").map_err(classify_sqlx_error)?,
                count: row.try_get("count").map_err(classify_sqlx_error)?,
            });
        }
        for row in age_rows {
            stats.age_distribution.push(petetl_core::AgeGroupCount {
                age_group: row.try_get("age_group").map_err(classify_sqlx_error)?,
                count: row.try_get("count").map_err(classify_sqlx_error)?,
            });
        }
        Ok(stats)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(unavailable)?;
        Ok(())
    }

    /// Transaction-scoped advisory lock: it lives exactly as long as the lease's
    /// transaction, so a crashed run frees it when its connection goes away.
    async fn try_lock_run(&self) -> Result<Option<Box<dyn RunLease>>, StoreError> {
        let mut tx = self.pool.begin().await.map_err(unavailable)?;
        let acquired: bool = sqlx::query_scalar("SELECT pg_try_advisory_xact_lock($1)")
            .bind(RUN_LOCK_KEY)
            .fetch_one(&mut *tx)
            .await
            .map_err(unavailable)?;
        if !acquired {
            tx.rollback().await.map_err(unavailable)?;
            return Ok(None);
        }
        Ok(Some(Box::new(PgRunLease { tx })))
    }
}

struct PgRunLease {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl RunLease for PgRunLease {
    async fn release(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.commit().await.map_err(unavailable)
    }
}

struct PgPetBatch {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl PetBatch for PgPetBatch {
    /// Each record runs inside its own savepoint so a rejected row does not poison the batch.
    async fn upsert(&mut self, record: &PetRecord) -> Result<UpsertOutcome, StoreError> {
        let mut savepoint = Acquire::begin(&mut self.tx).await.map_err(unavailable)?;
        let result = sqlx::query(UPSERT_PET_SQL)
            .bind(record.pet_id)
            .bind(record.name.as_deref())
            .bind(record.breed.as_deref())
            .bind(record.age)
            .bind(record.status.as_deref())
            .bind(record.added_date)
            .fetch_one(&mut *savepoint)
            .await
            .and_then(|row| row.try_get::<bool, _>("inserted"));

        match result {
            Ok(inserted) => {
                savepoint.commit().await.map_err(unavailable)?;
                Ok(if inserted {
                    UpsertOutcome::Inserted
                } else {
                    UpsertOutcome::Updated
                })
            }
            Err(err) => {
                let classified = classify_sqlx_error(err);
                if matches!(classified, StoreError::Record(_)) {
                    savepoint.rollback().await.map_err(unavailable)?;
                }
                Err(classified)
            }
        }
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.commit().await.map_err(unavailable)
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.rollback().await.map_err(unavailable)
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    pets: BTreeMap<i64, StoredPet>,
    reject_ids: BTreeSet<i64>,
    unavailable: bool,
    run_locked: bool,
}

/// In-process store with the same batch semantics as the PostgreSQL one.
#[derive(Debug, Clone, Default)]
pub struct InMemoryPetStore {
    state: Arc<Mutex<MemoryState>>,
}

impl InMemoryPetStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records with these ids fail as if they violated a constraint.
    pub fn reject_pet_ids(self, ids: impl IntoIterator<Item = i64>) -> Self {
        self.lock().reject_ids.extend(ids);
        self
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.lock().unavailable = unavailable;
    }

    pub fn snapshot(&self) -> BTreeMap<i64, StoredPet> {
        self.lock().pets.clone()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn acquire_run_lock(&self) -> Result<bool, StoreError> {
        let mut state = self.lock();
        if state.unavailable {
            return Err(StoreError::Unavailable("in-memory store marked unavailable".into()));
        }
        if state.run_locked {
            return Ok(false);
        }
        state.run_locked = true;
        Ok(true)
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.lock().unavailable {
            Err(StoreError::Unavailable("in-memory store marked unavailable".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl PetStore for InMemoryPetStore {
    async fn begin(&self) -> Result<Box<dyn PetBatch>, StoreError> {
        self.check_available()?;
        Ok(Box::new(InMemoryBatch {
            store: self.clone(),
            staged: BTreeMap::new(),
        }))
    }

    async fn list_pets(&self, status: Option<&str>) -> Result<Vec<StoredPet>, StoreError> {
        self.check_available()?;
        Ok(self
            .lock()
            .pets
            .values()
            .filter(|p| status.is_none() || p.status.as_deref() == status)
            .cloned()
            .collect())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.check_available()
    }

    async fn try_lock_run(&self) -> Result<Option<Box<dyn RunLease>>, StoreError> {
        if !self.acquire_run_lock()? {
            return Ok(None);
        }
        Ok(Some(Box::new(InMemoryRunLease {
            store: self.clone(),
        })))
    }
}

struct InMemoryRunLease {
    store: InMemoryPetStore,
}

impl Drop for InMemoryRunLease {
    fn drop(&mut self) {
        self.store.lock().run_locked = false;
    }
}

#[async_trait]
impl RunLease for InMemoryRunLease {
    async fn release(self: Box<Self>) -> Result<(), StoreError> {
        Ok(())
    }
}

struct InMemoryBatch {
    store: InMemoryPetStore,
    staged: BTreeMap<i64, StoredPet>,
}

#[async_trait]
impl PetBatch for InMemoryBatch {
    async fn upsert(&mut self, record: &PetRecord) -> Result<UpsertOutcome, StoreError> {
        let exists = {
            let state = self.store.lock();
            if state.unavailable {
                return Err(StoreError::Unavailable("connection lost".into()));
            }
            if state.reject_ids.contains(&record.pet_id) {
                return Err(StoreError::Record(format!(
                    "constraint violation for pet_id {}",
                    record.pet_id
                )));
            }
            state.pets.contains_key(&record.pet_id)
        };
        let exists = exists || self.staged.contains_key(&record.pet_id);

        self.staged.insert(
            record.pet_id,
            StoredPet {
                pet_id: record.pet_id,
                name: record.name.clone(),
                breed: record.breed.clone(),
                age: record.age,
                status: record.status.clone(),
                added_date: record.added_date,
                etl_timestamp: Utc::now(),
            },
        );
        Ok(if exists {
            UpsertOutcome::Updated
        } else {
            UpsertOutcome::Inserted
        })
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let InMemoryBatch { store, staged } = *self;
        let mut state = store.lock();
        if state.unavailable {
            return Err(StoreError::Unavailable("connection lost before commit".into()));
        }
        state.pets.extend(staged);
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        Ok(())
    }
}
