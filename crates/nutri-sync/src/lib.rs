//! Batch pipeline orchestration: snapshot intake, cleaning, feature
//! derivation, Feature Table export and three-table persistence.

use std::collections::BTreeSet;
use std::fmt;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use arrow_array::{ArrayRef, Float64Array, RecordBatch, StringArray};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use chrono::{DateTime, Utc};
use nutri_core::{FeatureRow, MappedRow, RawRecord, RowIssue, RECOGNIZED_NUTRIENTS};
use nutri_storage::{CatalogWriter, WriteSummary, DEFAULT_BATCH_SIZE};
use nutri_transform::{
    clean, derive_all, intake, map_all, CleanerConfig, ColumnKind, DroppedColumn, Imputation,
    DEFAULT_NULL_THRESHOLD_PERCENT,
};
use parquet::arrow::ArrowWriter;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::AnyPool;
use tokio::fs;
use tracing::{info, info_span, warn, Instrument};
use url::Url;
use uuid::Uuid;

pub const CRATE_NAME: &str = "nutri-sync";

pub const FEATURES_FILE: &str = "features.parquet";
pub const RUN_SUMMARY_FILE: &str = "run_summary.json";

/// Connection parameters for the relational store. `DATABASE_URL`, when set,
/// wins over the individual fields.
#[derive(Clone)]
pub struct StoreConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
    pub url_override: Option<String>,
}

impl StoreConfig {
    pub fn from_env() -> Self {
        Self {
            host: env_or("NUTRI_DB_HOST", "localhost"),
            port: std::env::var("NUTRI_DB_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(5432),
            user: env_or("NUTRI_DB_USER", "nutri"),
            password: env_or("NUTRI_DB_PASSWORD", ""),
            database: env_or("NUTRI_DB_NAME", "food_db"),
            url_override: std::env::var("DATABASE_URL").ok(),
        }
    }

    /// Connection URL; user and password are percent-encoded into the userinfo.
    pub fn database_url(&self) -> Result<String> {
        if let Some(url) = &self.url_override {
            return Ok(url.clone());
        }
        let mut url = Url::parse(&format!(
            "postgres://{}:{}/{}",
            self.host, self.port, self.database
        ))
        .with_context(|| format!("building database url for {}", self.target()))?;
        url.set_username(&self.user)
            .map_err(|_| anyhow!("cannot set user on database url for {}", self.target()))?;
        if !self.password.is_empty() {
            url.set_password(Some(&self.password)).map_err(|_| {
                anyhow!("cannot set password on database url for {}", self.target())
            })?;
        }
        Ok(url.into())
    }

    /// Credential-free description of the store, safe for logs.
    pub fn target(&self) -> String {
        match &self.url_override {
            Some(url) => redact_url(url),
            None => format!("{}:{}/{}", self.host, self.port, self.database),
        }
    }
}

impl fmt::Debug for StoreConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("database", &self.database)
            .field("url_override", &self.url_override.as_deref().map(redact_url))
            .finish()
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Query keys that carry a secret in libpq-style URLs.
const SECRET_QUERY_KEYS: [&str; 2] = ["password", "sslpassword"];

/// Drops the userinfo and any secret query pair. Unparseable input keeps only
/// its scheme so nothing after it can leak.
fn redact_url(raw: &str) -> String {
    let Ok(mut url) = Url::parse(raw.trim()) else {
        return match raw.split_once(':') {
            Some((scheme, _)) => format!("{scheme}://<unparseable>"),
            None => "<unparseable>".to_string(),
        };
    };
    let _ = url.set_password(None);
    let _ = url.set_username("");

    let kept = url
        .query_pairs()
        .filter(|(key, _)| !SECRET_QUERY_KEYS.contains(&key.to_ascii_lowercase().as_str()))
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect::<Vec<_>>();
    if kept.is_empty() {
        url.set_query(None);
    } else {
        url.query_pairs_mut().clear().extend_pairs(kept);
    }
    url.into()
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub store: StoreConfig,
    pub snapshot_path: PathBuf,
    pub workspace_root: PathBuf,
    pub batch_size: usize,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            store: StoreConfig::from_env(),
            snapshot_path: std::env::var("NUTRI_SNAPSHOT_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data/raw_snapshot.json")),
            workspace_root: std::env::var("NUTRI_WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(".")),
            batch_size: std::env::var("NUTRI_BATCH_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_BATCH_SIZE),
        }
    }
}

/// Tunables read from `pipeline.yaml` in the workspace root.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    pub null_threshold_percent: f64,
    pub recognized_nutrients: Vec<String>,
    pub export_features: bool,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            null_threshold_percent: DEFAULT_NULL_THRESHOLD_PERCENT,
            recognized_nutrients: RECOGNIZED_NUTRIENTS.iter().map(|s| s.to_string()).collect(),
            export_features: true,
        }
    }
}

impl PipelineSettings {
    pub fn load(workspace_root: &Path) -> Result<Self> {
        let path = workspace_root.join("pipeline.yaml");
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    fn recognized(&self) -> BTreeSet<String> {
        self.recognized_nutrients.iter().cloned().collect()
    }

    fn cleaner(&self) -> CleanerConfig {
        CleanerConfig {
            null_threshold_percent: self.null_threshold_percent,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SnapshotFile {
    Records(Vec<RawRecord>),
    Page { products: Vec<RawRecord> },
}

/// Loads the ingester's cached snapshot: either a bare JSON array of records
/// or a search-page object with a `products` array.
pub async fn load_snapshot(path: &Path) -> Result<Vec<RawRecord>> {
    let text = fs::read_to_string(path)
        .await
        .with_context(|| format!("reading snapshot {}", path.display()))?;
    let parsed: SnapshotFile = serde_json::from_str(&text)
        .with_context(|| format!("parsing snapshot {}", path.display()))?;
    Ok(match parsed {
        SnapshotFile::Records(records) => records,
        SnapshotFile::Page { products } => products,
    })
}

/// Output of the in-memory stages, before anything touches the store.
#[derive(Debug, Clone)]
pub struct Transformed {
    pub raw_records: usize,
    pub schema: Vec<(String, ColumnKind)>,
    pub features: Vec<FeatureRow>,
    pub mapped: Vec<MappedRow>,
    pub dropped: Vec<DroppedColumn>,
    pub imputations: Vec<Imputation>,
    pub issues: Vec<RowIssue>,
}

impl Transformed {
    pub fn skipped_rows(&self) -> usize {
        self.issues.iter().filter(|i| i.is_schema_violation()).count()
    }

    pub fn arithmetic_anomalies(&self) -> usize {
        self.issues.iter().filter(|i| i.is_arithmetic_anomaly()).count()
    }

    pub fn nulled_values(&self) -> usize {
        self.issues.iter().filter(|i| i.is_non_numeric_nutrient()).count()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub raw_records: usize,
    pub skipped_rows: usize,
    pub feature_rows: usize,
    pub arithmetic_anomalies: usize,
    /// Non-numeric nutrient values nulled at intake and imputed.
    pub nulled_values: usize,
    pub persisted: bool,
    pub rows_written: usize,
    pub batches_committed: usize,
    pub dropped_columns: Vec<DroppedColumn>,
    pub imputations: Vec<Imputation>,
    pub issues: Vec<RowIssue>,
    pub reports_dir: String,
    pub features_export: Option<ExportManifestFile>,
}

/// Whole-snapshot batch pipeline.
///
/// Runs are single-writer: nothing here coordinates two runs upserting into
/// the same tables, so callers must serialize runs themselves.
pub struct Pipeline {
    settings: PipelineSettings,
    workspace_root: PathBuf,
    batch_size: usize,
}

impl Pipeline {
    pub fn new(settings: PipelineSettings, workspace_root: impl Into<PathBuf>) -> Self {
        Self {
            settings,
            workspace_root: workspace_root.into(),
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    /// Intake, clean, derive and map. Dataset-level failures abort; row-level
    /// ones are collected in `issues`.
    pub fn transform(&self, records: &[RawRecord]) -> Result<Transformed> {
        let intake = intake(records, &self.settings.recognized());
        let mut issues = intake.issues;
        info!(
            raw = records.len(),
            kept = intake.table.len(),
            ignored_keys = intake.ignored_keys.len(),
            "snapshot flattened"
        );

        let cleaned = clean(intake.table, &self.settings.cleaner()).context("cleaning snapshot")?;
        info!(
            rows = cleaned.table.len(),
            dropped = cleaned.dropped.len(),
            imputed = cleaned.imputations.len(),
            "snapshot cleaned"
        );

        let derived = derive_all(cleaned.table).context("deriving features")?;
        issues.extend(derived.issues);
        let (mapped, map_issues) = map_all(&derived.rows);
        issues.extend(map_issues);

        Ok(Transformed {
            raw_records: records.len(),
            schema: cleaned.schema,
            features: derived.rows,
            mapped,
            dropped: cleaned.dropped,
            imputations: cleaned.imputations,
            issues,
        })
    }

    /// Runs every stage. With `pool` set the mapped rows are upserted;
    /// without it the run stops after the export (dry run).
    pub async fn run_once(&self, records: &[RawRecord], pool: Option<&AnyPool>) -> Result<RunSummary> {
        let run_id = Uuid::new_v4();
        let span = info_span!("pipeline_run", %run_id);
        self.run_inner(run_id, records, pool).instrument(span).await
    }

    async fn run_inner(
        &self,
        run_id: Uuid,
        records: &[RawRecord],
        pool: Option<&AnyPool>,
    ) -> Result<RunSummary> {
        let started_at = Utc::now();
        let transformed = self.transform(records)?;

        let reports_dir = self.workspace_root.join("reports").join(run_id.to_string());
        fs::create_dir_all(&reports_dir)
            .await
            .with_context(|| format!("creating {}", reports_dir.display()))?;

        let features_export = if self.settings.export_features {
            let path = reports_dir.join(FEATURES_FILE);
            write_feature_table(&path, &transformed.schema, &transformed.features)?;
            Some(manifest_entry("features", &reports_dir, &path)?)
        } else {
            None
        };

        let written = match pool {
            Some(pool) => {
                let writer = CatalogWriter::new(pool.clone()).with_batch_size(self.batch_size);
                Some(
                    writer
                        .write_all(&transformed.mapped)
                        .await
                        .context("persisting catalog tables; the run is safe to repeat")?,
                )
            }
            None => {
                warn!("no store session supplied; skipping persistence");
                None
            }
        };
        let WriteSummary {
            rows_written,
            batches_committed,
        } = written.unwrap_or_default();

        let summary = RunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            raw_records: transformed.raw_records,
            skipped_rows: transformed.skipped_rows(),
            feature_rows: transformed.features.len(),
            arithmetic_anomalies: transformed.arithmetic_anomalies(),
            nulled_values: transformed.nulled_values(),
            persisted: written.is_some(),
            rows_written,
            batches_committed,
            dropped_columns: transformed.dropped,
            imputations: transformed.imputations,
            issues: transformed.issues,
            reports_dir: reports_dir.display().to_string(),
            features_export,
        };

        let bytes = serde_json::to_vec_pretty(&summary).context("serializing run summary")?;
        fs::write(reports_dir.join(RUN_SUMMARY_FILE), bytes)
            .await
            .with_context(|| format!("writing {RUN_SUMMARY_FILE}"))?;

        info!(
            skipped = summary.skipped_rows,
            anomalies = summary.arithmetic_anomalies,
            nulled = summary.nulled_values,
            written = summary.rows_written,
            "pipeline run complete"
        );
        Ok(summary)
    }
}

/// Loads the configured snapshot and runs the pipeline once. `dry_run`
/// skips connecting to the store.
pub async fn run_sync_once(config: &SyncConfig, dry_run: bool) -> Result<RunSummary> {
    let settings = PipelineSettings::load(&config.workspace_root)?;
    let records = load_snapshot(&config.snapshot_path).await?;
    let pipeline =
        Pipeline::new(settings, config.workspace_root.clone()).with_batch_size(config.batch_size);

    if dry_run {
        return pipeline.run_once(&records, None).await;
    }

    let pool = nutri_storage::connect(&config.store.database_url()?, &config.store.target(), 2)
        .await
        .context("opening store session")?;
    let result = pipeline.run_once(&records, Some(&pool)).await;
    pool.close().await;
    result
}

pub async fn run_sync_once_from_env(dry_run: bool) -> Result<RunSummary> {
    run_sync_once(&SyncConfig::from_env(), dry_run).await
}

/// Creates the three tables if absent.
pub async fn migrate(config: &SyncConfig) -> Result<()> {
    let pool = nutri_storage::connect(&config.store.database_url()?, &config.store.target(), 1)
        .await
        .context("opening store session")?;
    let result = CatalogWriter::new(pool.clone())
        .ensure_schema()
        .await
        .context("creating catalog tables");
    pool.close().await;
    result
}

pub fn report_markdown(runs: usize, workspace_root: &Path) -> Result<String> {
    let reports_root = workspace_root.join("reports");
    let mut dirs = std::fs::read_dir(&reports_root)
        .with_context(|| format!("reading {}", reports_root.display()))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().join(RUN_SUMMARY_FILE).exists())
        .collect::<Vec<_>>();
    dirs.sort_by_key(|e| e.metadata().and_then(|m| m.modified()).ok());
    dirs.reverse();

    let mut lines = vec!["# Catalog Pipeline Runs".to_string(), String::new()];
    for dir in dirs.into_iter().take(runs.max(1)) {
        let summary_path = dir.path().join(RUN_SUMMARY_FILE);
        let summary: serde_json::Value = serde_json::from_str(
            &std::fs::read_to_string(&summary_path)
                .with_context(|| format!("reading {}", summary_path.display()))?,
        )
        .with_context(|| format!("parsing {}", summary_path.display()))?;
        let count = |key: &str| summary.get(key).and_then(|v| v.as_u64()).unwrap_or(0);

        lines.push(format!("## Run `{}`", dir.file_name().to_string_lossy()));
        lines.push(format!("- raw records: {}", count("raw_records")));
        lines.push(format!("- skipped rows: {}", count("skipped_rows")));
        lines.push(format!("- feature rows: {}", count("feature_rows")));
        lines.push(format!("- arithmetic anomalies: {}", count("arithmetic_anomalies")));
        lines.push(format!("- nulled nutrient values: {}", count("nulled_values")));
        lines.push(format!("- rows written: {}", count("rows_written")));
        if let Some(dropped) = summary.get("dropped_columns").and_then(|v| v.as_array()) {
            let names = dropped
                .iter()
                .filter_map(|d| d.get("column").and_then(|c| c.as_str()))
                .collect::<Vec<_>>();
            if !names.is_empty() {
                lines.push(format!("- dropped columns: {}", names.join(", ")));
            }
        }
        lines.push(String::new());
    }

    Ok(lines.join("\n"))
}

fn write_parquet(path: &Path, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

/// Writes the Feature Table: cleaned columns in table order, then the
/// derived fields.
pub fn write_feature_table(
    path: &Path,
    schema: &[(String, ColumnKind)],
    features: &[FeatureRow],
) -> Result<()> {
    let mut fields = Vec::with_capacity(schema.len() + 4);
    let mut columns: Vec<ArrayRef> = Vec::with_capacity(schema.len() + 4);

    for (name, kind) in schema {
        match kind {
            ColumnKind::Numeric => {
                fields.push(ArrowField::new(name, DataType::Float64, true));
                columns.push(Arc::new(Float64Array::from(
                    features
                        .iter()
                        .map(|f| f.cleaned.number(name))
                        .collect::<Vec<_>>(),
                )));
            }
            ColumnKind::Text => {
                fields.push(ArrowField::new(name, DataType::Utf8, true));
                columns.push(Arc::new(StringArray::from(
                    features
                        .iter()
                        .map(|f| f.cleaned.get(name).render())
                        .collect::<Vec<_>>(),
                )));
            }
        }
    }

    fields.push(ArrowField::new("sugar_to_carb_ratio", DataType::Float64, true));
    columns.push(Arc::new(Float64Array::from(
        features
            .iter()
            .map(|f| f.sugar_to_carb_ratio)
            .collect::<Vec<_>>(),
    )));
    fields.push(ArrowField::new("calorie_category", DataType::Utf8, false));
    columns.push(Arc::new(StringArray::from(
        features
            .iter()
            .map(|f| f.calorie_category.as_str())
            .collect::<Vec<_>>(),
    )));
    fields.push(ArrowField::new("sugar_category", DataType::Utf8, false));
    columns.push(Arc::new(StringArray::from(
        features
            .iter()
            .map(|f| f.sugar_category.as_str())
            .collect::<Vec<_>>(),
    )));
    fields.push(ArrowField::new("is_ultra_processed", DataType::Utf8, false));
    columns.push(Arc::new(StringArray::from(
        features
            .iter()
            .map(|f| f.is_ultra_processed.as_str())
            .collect::<Vec<_>>(),
    )));

    let batch = RecordBatch::try_new(Arc::new(Schema::new(fields)), columns)
        .context("building feature table record batch")?;
    write_parquet(path, batch)
}

fn manifest_entry(name: &str, reports_dir: &Path, path: &Path) -> Result<ExportManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let sha256 = hex::encode(hasher.finalize());
    let rel = path
        .strip_prefix(reports_dir)
        .unwrap_or(path)
        .display()
        .to_string();
    Ok(ExportManifestFile {
        name: name.to_string(),
        path: rel,
        sha256,
        bytes: bytes.len() as u64,
    })
}
