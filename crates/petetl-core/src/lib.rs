//! Core domain model for the pet adoption ETL.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "petetl-core";

/// Columns the pipeline understands, in their normalized (lowercase, underscored) form.
pub const RECOGNIZED_COLUMNS: [&str; 6] = ["pet_id", "name", "breed", "age", "status", "added_date"];

/// Column-name → raw value mapping exactly as read from one CSV data row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RawRow {
    /// 1-based line number in the source file.
    pub line: u64,
    pub fields: BTreeMap<String, String>,
}

impl RawRow {
    pub fn new(line: u64, fields: BTreeMap<String, String>) -> Self {
        Self { line, fields }
    }

    pub fn from_pairs<K, V>(line: u64, pairs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            line,
            fields: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

/// Validated pet record produced by the normalizer; `pet_id` is the natural key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PetRecord {
    pub pet_id: i64,
    pub name: Option<String>,
    pub breed: Option<String>,
    pub age: Option<i32>,
    pub status: Option<String>,
    pub added_date: Option<NaiveDate>,
    pub extraction_timestamp: DateTime<Utc>,
    pub processed_timestamp: DateTime<Utc>,
}

/// A row as it currently exists in the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredPet {
    pub pet_id: i64,
    pub name: Option<String>,
    pub breed: Option<String>,
    pub age: Option<i32>,
    pub status: Option<String>,
    pub added_date: Option<NaiveDate>,
    pub etl_timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RunStatus {
    Success,
    PartialFailure,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Success => "Success",
            RunStatus::PartialFailure => "PartialFailure",
            RunStatus::Failed => "Failed",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, RunStatus::Success | RunStatus::PartialFailure)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Orchestrator lifecycle. `Completed` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PipelineState {
    Idle,
    Extracting,
    Transforming,
    Loading,
    Completed,
    Failed,
}

impl PipelineState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PipelineState::Completed | PipelineState::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RunCounts {
    pub extracted: usize,
    pub transformed: usize,
    pub rejected: usize,
    pub inserted: usize,
    pub updated: usize,
    pub failed: usize,
}

impl RunCounts {
    pub fn loaded(&self) -> usize {
        self.inserted + self.updated
    }
}

/// Outcome of one pipeline invocation. Appended once to the run-history log, never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub source: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: RunStatus,
    pub counts: RunCounts,
    pub failure_reason: Option<String>,
}

/// Status as reconstructed from run-history text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum MetricsStatus {
    Success,
    PartialFailure,
    Failed,
    #[default]
    Unknown,
}

impl From<RunStatus> for MetricsStatus {
    fn from(value: RunStatus) -> Self {
        match value {
            RunStatus::Success => MetricsStatus::Success,
            RunStatus::PartialFailure => MetricsStatus::PartialFailure,
            RunStatus::Failed => MetricsStatus::Failed,
        }
    }
}

/// Read-side projection rebuilt from the log tail on every request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct MetricsSnapshot {
    pub status: MetricsStatus,
    pub last_run_at: Option<String>,
    pub last_successful_run: Option<String>,
    pub total_records: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCount {
    pub status: Option<String>,
    pub count: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreedCount {
    pub breed: Option<String>,
    pub count: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgeGroupCount {
    pub age_group: String,
    pub count: i64,
}

pub const AGE_GROUP_YOUNGEST: &str = "Puppy/Kitten (0-1)";
pub const AGE_GROUP_YOUNG: &str = "Young (2-4)";
pub const AGE_GROUP_ADULT: &str = "Adult (5-8)";
pub const AGE_GROUP_SENIOR: &str = "Senior (9+)";
pub const AGE_GROUP_UNKNOWN: &str = "Unknown";

pub fn age_group(age: Option<i32>) -> &'static str {
    match age {
        None => AGE_GROUP_UNKNOWN,
        Some(a) if a < 2 => AGE_GROUP_YOUNGEST,
        Some(a) if a < 5 => AGE_GROUP_YOUNG,
        Some(a) if a < 9 => AGE_GROUP_ADULT,
        Some(_) => AGE_GROUP_SENIOR,
    }
}

pub const TOP_BREEDS: usize = 5;

/// Dashboard aggregates over the store: status counts, top breeds, age buckets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct PetStats {
    pub status_counts: Vec<StatusCount>,
    pub breed_counts: Vec<BreedCount>,
    pub age_distribution: Vec<AgeGroupCount>,
}

impl PetStats {
    pub fn from_pets(pets: &[StoredPet]) -> Self {
        let mut statuses: BTreeMap<Option<String>, i64> = BTreeMap::new();
        let mut breeds: BTreeMap<Option<String>, i64> = BTreeMap::new();
        let mut ages: BTreeMap<&'static str, i64> = BTreeMap::new();
        for pet in pets {
            *statuses.entry(pet.status.clone()).or_default() += 1;
            *breeds.entry(pet.breed.clone()).or_default() += 1;
            *ages.entry(age_group(pet.age)).or_default() += 1;
        }

        let mut breed_counts = breeds
            .into_iter()
            .map(|(breed, count)| BreedCount { breed, count })
            .collect::<Vec<_>>();
        breed_counts.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.breed.cmp(&b.breed)));
        breed_counts.truncate(TOP_BREEDS);

        Self {
            status_counts: statuses
                .into_iter()
                .map(|(status, count)| StatusCount { status, count })
                .collect(),
            breed_counts,
            age_distribution: ages
                .into_iter()
                .map(|(group, count)| AgeGroupCount {
                    age_group: group.to_string(),
                    count,
                })
                .collect(),
        }
    }
}
