//! CSV source extraction, row normalization and batch transformation.

use std::collections::BTreeMap;
use std::fmt;
use std::io::ErrorKind;
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use petetl_core::{PetRecord, RawRow, RECOGNIZED_COLUMNS};
use petetl_storage::{FetchError, HttpFetcher};
use serde::Serialize;
use thiserror::Error;
use tracing::warn;

pub const CRATE_NAME: &str = "petetl-adapters";

pub const DEFAULT_DATE_FORMAT: &str = "%Y-%m-%d";
pub const DEFAULT_BREED: &str = "Mixed";

/// Where a CSV batch comes from: a local path or an `http(s)://` URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum SourceLocator {
    Local(PathBuf),
    Remote(String),
}

impl SourceLocator {
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        let lower = trimmed.to_ascii_lowercase();
        if lower.starts_with("http://") || lower.starts_with("https://") {
            SourceLocator::Remote(trimmed.to_string())
        } else {
            SourceLocator::Local(PathBuf::from(trimmed))
        }
    }
}

impl fmt::Display for SourceLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceLocator::Local(path) => write!(f, "{}", path.display()),
            SourceLocator::Remote(url) => f.write_str(url),
        }
    }
}

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("source not found: {0}")]
    SourceNotFound(String),
    #[error("source unreachable: {location}: {reason}")]
    SourceUnreachable { location: String, reason: String },
    #[error("csv parse error{}: {message}", line_label(.line))]
    Parse { line: Option<u64>, message: String },
    #[error("reading {location}: {source}")]
    Io {
        location: String,
        #[source]
        source: std::io::Error,
    },
}

fn line_label(line: &Option<u64>) -> String {
    line.map(|l| format!(" at line {l}")).unwrap_or_default()
}

#[async_trait]
pub trait CsvSource: Send + Sync {
    fn locator(&self) -> &SourceLocator;

    async fn read_bytes(&self) -> Result<Vec<u8>, ExtractError>;
}

pub struct LocalCsvSource {
    locator: SourceLocator,
    path: PathBuf,
}

impl LocalCsvSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self {
            locator: SourceLocator::Local(path.clone()),
            path,
        }
    }
}

#[async_trait]
impl CsvSource for LocalCsvSource {
    fn locator(&self) -> &SourceLocator {
        &self.locator
    }

    async fn read_bytes(&self) -> Result<Vec<u8>, ExtractError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => Ok(bytes),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                Err(ExtractError::SourceNotFound(self.path.display().to_string()))
            }
            Err(source) => Err(ExtractError::Io {
                location: self.path.display().to_string(),
                source,
            }),
        }
    }
}

pub struct RemoteCsvSource {
    locator: SourceLocator,
    url: String,
    http: HttpFetcher,
}

impl RemoteCsvSource {
    pub fn new(url: impl Into<String>, http: HttpFetcher) -> Self {
        let url = url.into();
        Self {
            locator: SourceLocator::Remote(url.clone()),
            url,
            http,
        }
    }
}

#[async_trait]
impl CsvSource for RemoteCsvSource {
    fn locator(&self) -> &SourceLocator {
        &self.locator
    }

    async fn read_bytes(&self) -> Result<Vec<u8>, ExtractError> {
        self.http
            .fetch_bytes(&self.url)
            .await
            .map(|resp| resp.body)
            .map_err(|err| ExtractError::SourceUnreachable {
                location: self.url.clone(),
                reason: match err {
                    FetchError::HttpStatus { status, .. } => format!("http status {status}"),
                    FetchError::Request(err) => err.to_string(),
                },
            })
    }
}

pub fn source_for(locator: &SourceLocator, http: &HttpFetcher) -> Box<dyn CsvSource> {
    match locator {
        SourceLocator::Local(path) => Box::new(LocalCsvSource::new(path.clone())),
        SourceLocator::Remote(url) => Box::new(RemoteCsvSource::new(url.clone(), http.clone())),
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ExtractionMeta {
    pub source: String,
    pub row_count: usize,
    pub headers: Vec<String>,
    pub missing_columns: Vec<String>,
    pub extracted_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct Extraction {
    pub rows: Vec<RawRow>,
    pub meta: ExtractionMeta,
}

/// Reads a whole CSV source into raw rows. Any malformed line fails the extraction.
#[derive(Debug, Clone)]
pub struct Extractor {
    expected_columns: Vec<String>,
}

impl Default for Extractor {
    fn default() -> Self {
        Self::new(RECOGNIZED_COLUMNS)
    }
}

impl Extractor {
    pub fn new<S: Into<String>>(expected_columns: impl IntoIterator<Item = S>) -> Self {
        Self {
            expected_columns: expected_columns
                .into_iter()
                .map(|c| {
                    let column: String = c.into();
                    normalize_key(&column)
                })
                .collect(),
        }
    }

    pub async fn extract(&self, source: &dyn CsvSource) -> Result<Extraction, ExtractError> {
        let location = source.locator().to_string();
        let bytes = source.read_bytes().await?;
        let (headers, rows) = parse_csv_bytes(&bytes)?;

        let normalized = headers.iter().map(|h| normalize_key(h)).collect::<Vec<_>>();
        let missing_columns = self
            .expected_columns
            .iter()
            .filter(|c| !normalized.contains(*c))
            .cloned()
            .collect::<Vec<_>>();
        if !missing_columns.is_empty() {
            warn!(source = %location, missing = ?missing_columns, "source header lacks expected columns");
        }

        tracing::info!(source = %location, rows = rows.len(), "extracted csv rows");
        Ok(Extraction {
            meta: ExtractionMeta {
                source: location,
                row_count: rows.len(),
                headers,
                missing_columns,
                extracted_at: Utc::now(),
            },
            rows,
        })
    }
}

fn parse_error(err: csv::Error) -> ExtractError {
    ExtractError::Parse {
        line: err.position().map(|p| p.line()),
        message: err.to_string(),
    }
}

fn clean_header(raw: &str) -> String {
    raw.trim_start_matches('\u{feff}').to_string()
}

/// Strict parse: ragged rows and invalid UTF-8 are errors carrying the source line.
pub fn parse_csv_bytes(bytes: &[u8]) -> Result<(Vec<String>, Vec<RawRow>), ExtractError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(false)
        .from_reader(bytes);
    let headers = reader
        .headers()
        .map_err(parse_error)?
        .iter()
        .map(clean_header)
        .collect::<Vec<_>>();

    let mut rows = Vec::new();
    for result in reader.records() {
        let record = result.map_err(parse_error)?;
        let line = record.position().map(|p| p.line()).unwrap_or_default();
        let fields = headers
            .iter()
            .cloned()
            .zip(record.iter().map(ToString::to_string))
            .collect::<BTreeMap<_, _>>();
        rows.push(RawRow::new(line, fields));
    }
    Ok((headers, rows))
}

#[derive(Debug, Clone, Serialize)]
pub struct CsvPreview {
    pub columns: Vec<String>,
    pub data: Vec<BTreeMap<String, String>>,
}

/// Header plus the first `limit` rows, tolerant of ragged rows past the header.
pub fn preview_csv(bytes: &[u8], limit: usize) -> Result<CsvPreview, ExtractError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(bytes);
    let columns = reader
        .headers()
        .map_err(parse_error)?
        .iter()
        .map(clean_header)
        .collect::<Vec<_>>();

    let mut data = Vec::new();
    for result in reader.records().take(limit) {
        let record = result.map_err(parse_error)?;
        data.push(
            columns
                .iter()
                .cloned()
                .zip(record.iter().map(ToString::to_string))
                .collect(),
        );
    }
    Ok(CsvPreview { columns, data })
}

/// Header normalization: trimmed, lowercased, spaces become underscores.
pub fn normalize_key(key: &str) -> String {
    key.trim_start_matches('\u{feff}')
        .trim()
        .to_lowercase()
        .replace(' ', "_")
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RowRejection {
    #[error("invalid pet_id")]
    InvalidPetId,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransformError {
    #[error("invalid normalizer configuration: {0}")]
    InvalidConfig(String),
}

#[derive(Debug, Clone)]
pub struct NormalizerConfig {
    pub date_format: String,
    /// When set, rows without a breed get this value instead of null.
    pub default_breed: Option<String>,
}

impl Default for NormalizerConfig {
    fn default() -> Self {
        Self {
            date_format: DEFAULT_DATE_FORMAT.to_string(),
            default_breed: None,
        }
    }
}

impl NormalizerConfig {
    pub fn validate(&self) -> Result<(), TransformError> {
        if self.date_format.trim().is_empty() {
            return Err(TransformError::InvalidConfig("date format is empty".into()));
        }
        if let Some(breed) = &self.default_breed {
            if breed.trim().is_empty() {
                return Err(TransformError::InvalidConfig(
                    "default breed is blank".into(),
                ));
            }
        }
        Ok(())
    }
}

/// RawRow → PetRecord. Strict on `pet_id`, lenient on everything else.
#[derive(Debug, Clone)]
pub struct Normalizer {
    config: NormalizerConfig,
}

impl Normalizer {
    pub fn new(config: NormalizerConfig) -> Result<Self, TransformError> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn normalize(
        &self,
        row: &RawRow,
        extraction_timestamp: DateTime<Utc>,
        processed_timestamp: DateTime<Utc>,
    ) -> Result<PetRecord, RowRejection> {
        let fields = row
            .fields
            .iter()
            .filter_map(|(k, v)| {
                let value = v.trim();
                (!value.is_empty()).then(|| (normalize_key(k), value.to_string()))
            })
            .collect::<BTreeMap<_, _>>();
        let text = |key: &str| fields.get(key).cloned();

        let pet_id = fields
            .get("pet_id")
            .and_then(|v| v.parse::<i64>().ok())
            .ok_or(RowRejection::InvalidPetId)?;
        let age = fields
            .get("age")
            .and_then(|v| v.parse::<i32>().ok())
            .filter(|a| *a >= 0);
        let added_date = fields
            .get("added_date")
            .and_then(|v| NaiveDate::parse_from_str(v, &self.config.date_format).ok());
        let breed = text("breed").or_else(|| self.config.default_breed.clone());

        Ok(PetRecord {
            pet_id,
            name: text("name"),
            breed,
            age,
            status: text("status"),
            added_date,
            extraction_timestamp,
            processed_timestamp,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedRow {
    pub row: RawRow,
    pub reason: RowRejection,
}

#[derive(Debug, Clone, Default)]
pub struct Transformed {
    pub valid: Vec<PetRecord>,
    pub rejected: Vec<RejectedRow>,
}

#[derive(Debug, Clone)]
pub struct Transformer {
    normalizer: Normalizer,
}

impl Transformer {
    pub fn new(config: NormalizerConfig) -> Result<Self, TransformError> {
        Ok(Self {
            normalizer: Normalizer::new(config)?,
        })
    }

    /// Partition rows into valid records (source order kept) and rejections.
    pub fn transform(&self, rows: Vec<RawRow>, extracted_at: DateTime<Utc>) -> Transformed {
        let processed_at = Utc::now();
        let mut out = Transformed::default();
        for row in rows {
            match self.normalizer.normalize(&row, extracted_at, processed_at) {
                Ok(record) => out.valid.push(record),
                Err(reason) => {
                    warn!(line = row.line, %reason, "row rejected");
                    out.rejected.push(RejectedRow { row, reason });
                }
            }
        }
        tracing::info!(
            valid = out.valid.len(),
            rejected = out.rejected.len(),
            "transformed rows"
        );
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn now() -> DateTime<Utc> {
        Utc::now()
    }

    fn normalizer() -> Normalizer {
        Normalizer::new(NormalizerConfig::default()).expect("default config")
    }

    #[test]
    fn header_keys_are_case_and_space_insensitive() {
        assert_eq!(normalize_key("  Pet ID "), "pet_id");
        assert_eq!(normalize_key("Added Date"), "added_date");
        assert_eq!(normalize_key("\u{feff}pet_id"), "pet_id");

        let row = RawRow::from_pairs(2, [("Pet ID", " 7 "), ("NAME", "Rex"), ("Breed", "")]);
        let rec = normalizer().normalize(&row, now(), now()).expect("valid");
        assert_eq!(rec.pet_id, 7);
        assert_eq!(rec.name.as_deref(), Some("Rex"));
        assert_eq!(rec.breed, None);
    }

    #[test]
    fn missing_or_garbage_pet_id_is_always_rejected() {
        let n = normalizer();
        for raw in [None, Some(""), Some("   "), Some("abc"), Some("1.5"), Some("12x")] {
            let mut pairs = vec![("name", "Bad".to_string())];
            if let Some(id) = raw {
                pairs.push(("pet_id", id.to_string()));
            }
            let row = RawRow::from_pairs(3, pairs);
            assert_eq!(
                n.normalize(&row, now(), now()),
                Err(RowRejection::InvalidPetId),
                "pet_id {raw:?}"
            );
        }
    }

    #[test]
    fn unparseable_age_becomes_null_not_rejection() {
        let n = normalizer();
        for age in ["oops", "3.5", "-2", ""] {
            let row = RawRow::from_pairs(2, [("pet_id", "2"), ("age", age)]);
            let rec = n.normalize(&row, now(), now()).expect("age never rejects");
            assert_eq!(rec.age, None, "age {age:?}");
        }
    }

    #[test]
    fn dates_parse_against_configured_format() {
        let n = normalizer();
        let good = RawRow::from_pairs(2, [("pet_id", "1"), ("added_date", "2025-04-01")]);
        let bad = RawRow::from_pairs(3, [("pet_id", "2"), ("added_date", "04/01/2025")]);
        assert_eq!(
            n.normalize(&good, now(), now()).unwrap().added_date,
            NaiveDate::from_ymd_opt(2025, 4, 1)
        );
        assert_eq!(n.normalize(&bad, now(), now()).unwrap().added_date, None);
    }

    #[test]
    fn default_breed_applies_only_when_configured() {
        let row = RawRow::from_pairs(2, [("pet_id", "1"), ("status", " available ")]);
        let plain = normalizer().normalize(&row, now(), now()).unwrap();
        assert_eq!(plain.breed, None);
        assert_eq!(plain.status.as_deref(), Some("available"));

        let with_default = Normalizer::new(NormalizerConfig {
            default_breed: Some(DEFAULT_BREED.to_string()),
            ..Default::default()
        })
        .unwrap();
        let rec = with_default.normalize(&row, now(), now()).unwrap();
        assert_eq!(rec.breed.as_deref(), Some("Mixed"));
    }

    #[test]
    fn invalid_config_is_a_transformer_error() {
        let err = Transformer::new(NormalizerConfig {
            date_format: " ".into(),
            default_breed: None,
        })
        .unwrap_err();
        assert!(matches!(err, TransformError::InvalidConfig(_)));

        let err = Transformer::new(NormalizerConfig {
            default_breed: Some(String::new()),
            ..Default::default()
        })
        .unwrap_err();
        assert!(matches!(err, TransformError::InvalidConfig(_)));
    }

    #[test]
    fn transform_partitions_and_keeps_order() {
        let (_, rows) = parse_csv_bytes(b"pet_id,name,age\n1,Rex,3\n,Bad,\n2,,oops\n").unwrap();
        let out = Transformer::new(NormalizerConfig::default())
            .unwrap()
            .transform(rows, now());

        assert_eq!(out.valid.len(), 2);
        assert_eq!(out.valid[0].pet_id, 1);
        assert_eq!(out.valid[0].name.as_deref(), Some("Rex"));
        assert_eq!(out.valid[0].age, Some(3));
        assert_eq!(out.valid[1].pet_id, 2);
        assert_eq!(out.valid[1].name, None);
        assert_eq!(out.valid[1].age, None);

        assert_eq!(out.rejected.len(), 1);
        assert_eq!(out.rejected[0].row.line, 3);
        assert_eq!(out.rejected[0].row.fields.get("name").map(String::as_str), Some("Bad"));
        assert_eq!(out.rejected[0].reason.to_string(), "invalid pet_id");
    }

    #[test]
    fn ragged_rows_fail_with_line_number() {
        let err = parse_csv_bytes(b"pet_id,name\n1,Rex\n2,Fido,extra\n").unwrap_err();
        match err {
            ExtractError::Parse { line, .. } => assert_eq!(line, Some(3)),
            other => panic!("expected parse error, got {other:?}"),
        }
    }

    #[test]
    fn invalid_utf8_is_a_parse_error() {
        let err = parse_csv_bytes(b"pet_id,name\n1,\xff\xfe\n").unwrap_err();
        assert!(matches!(err, ExtractError::Parse { .. }));
    }

    #[test]
    fn locator_distinguishes_urls_from_paths() {
        assert_eq!(
            SourceLocator::parse("https://example.org/pets.csv"),
            SourceLocator::Remote("https://example.org/pets.csv".into())
        );
        assert_eq!(
            SourceLocator::parse("data/pets.csv"),
            SourceLocator::Local(PathBuf::from("data/pets.csv"))
        );
    }

    #[test]
    fn preview_takes_first_rows_only() {
        let mut csv = String::from("pet_id,name\n");
        for i in 0..25 {
            csv.push_str(&format!("{i},pet{i}\n"));
        }
        csv.push_str("99,ragged,row\n");
        let preview = preview_csv(csv.as_bytes(), 10).unwrap();
        assert_eq!(preview.columns, vec!["pet_id", "name"]);
        assert_eq!(preview.data.len(), 10);
        assert_eq!(preview.data[9].get("name").map(String::as_str), Some("pet9"));
    }

    #[tokio::test]
    async fn missing_local_source_is_source_not_found() {
        let dir = tempdir().unwrap();
        let source = LocalCsvSource::new(dir.path().join("nope.csv"));
        let err = Extractor::default().extract(&source).await.unwrap_err();
        assert!(matches!(err, ExtractError::SourceNotFound(_)));
    }

    #[tokio::test]
    async fn refused_remote_source_is_source_unreachable() {
        let url = "http://127.0.0.1:1/pets.csv";
        let http = HttpFetcher::new(petetl_storage::HttpClientConfig::default()).unwrap();
        let locator = SourceLocator::parse(url);
        assert_eq!(locator, SourceLocator::Remote(url.to_string()));

        let source = source_for(&locator, &http);
        let err = Extractor::default().extract(source.as_ref()).await.unwrap_err();
        match err {
            ExtractError::SourceUnreachable { location, .. } => assert_eq!(location, url),
            other => panic!("expected SourceUnreachable, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn extraction_reports_missing_columns_and_is_replay_safe() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pets.csv");
        std::fs::write(&path, "Pet ID,Name,Extra\n1,Rex,x\n2,Fido,y\n").unwrap();
        let source = LocalCsvSource::new(&path);
        let extractor = Extractor::default();

        let first = extractor.extract(&source).await.unwrap();
        let second = extractor.extract(&source).await.unwrap();
        assert_eq!(first.meta.row_count, 2);
        assert_eq!(first.rows, second.rows);
        assert_eq!(
            first.meta.missing_columns,
            vec!["breed", "age", "status", "added_date"]
        );
    }
}
