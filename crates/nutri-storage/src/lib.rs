//! Relational persistence for `product_info`, `nutrient_info` and
//! `derived_metrics`: idempotent schema creation and full-replace upserts
//! keyed by product code.
//!
//! Statements are plain SQL run through `sqlx::Any`, so the same writer
//! targets PostgreSQL in production and SQLite in tests.

use std::fmt;

use nutri_core::{DerivedMetrics, MappedRow, NutrientInfo, ProductInfo};
use sqlx::any::AnyPoolOptions;
use sqlx::{Any, AnyPool, Row, Transaction};
use thiserror::Error;
use tracing::{debug, info, info_span, Instrument};

pub const CRATE_NAME: &str = "nutri-storage";

pub const DEFAULT_BATCH_SIZE: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TargetTable {
    ProductInfo,
    NutrientInfo,
    DerivedMetrics,
}

impl TargetTable {
    pub const ALL: [TargetTable; 3] = [
        TargetTable::ProductInfo,
        TargetTable::NutrientInfo,
        TargetTable::DerivedMetrics,
    ];

    pub fn name(self) -> &'static str {
        match self {
            TargetTable::ProductInfo => "product_info",
            TargetTable::NutrientInfo => "nutrient_info",
            TargetTable::DerivedMetrics => "derived_metrics",
        }
    }

    fn create_statement(self) -> &'static str {
        match self {
            TargetTable::ProductInfo => {
                r#"
                CREATE TABLE IF NOT EXISTS product_info (
                    product_code VARCHAR(50) PRIMARY KEY,
                    product_name TEXT,
                    brand TEXT
                )
                "#
            }
            TargetTable::NutrientInfo => {
                r#"
                CREATE TABLE IF NOT EXISTS nutrient_info (
                    product_code VARCHAR(50) PRIMARY KEY,
                    energy_kcal DOUBLE PRECISION,
                    carbohydrates DOUBLE PRECISION,
                    sugars DOUBLE PRECISION,
                    proteins DOUBLE PRECISION,
                    fat DOUBLE PRECISION,
                    fiber DOUBLE PRECISION,
                    salt DOUBLE PRECISION
                )
                "#
            }
            TargetTable::DerivedMetrics => {
                r#"
                CREATE TABLE IF NOT EXISTS derived_metrics (
                    product_code VARCHAR(50) PRIMARY KEY,
                    sugar_to_carb_ratio DOUBLE PRECISION,
                    calorie_category VARCHAR(20),
                    sugar_category VARCHAR(20),
                    is_ultra_processed VARCHAR(5)
                )
                "#
            }
        }
    }
}

impl fmt::Display for TargetTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

const UPSERT_PRODUCT_INFO: &str = r#"
    INSERT INTO product_info (product_code, product_name, brand)
    VALUES ($1, $2, $3)
    ON CONFLICT (product_code) DO UPDATE SET
        product_name = EXCLUDED.product_name,
        brand = EXCLUDED.brand
"#;

const UPSERT_NUTRIENT_INFO: &str = r#"
    INSERT INTO nutrient_info
        (product_code, energy_kcal, carbohydrates, sugars, proteins, fat, fiber, salt)
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
    ON CONFLICT (product_code) DO UPDATE SET
        energy_kcal = EXCLUDED.energy_kcal,
        carbohydrates = EXCLUDED.carbohydrates,
        sugars = EXCLUDED.sugars,
        proteins = EXCLUDED.proteins,
        fat = EXCLUDED.fat,
        fiber = EXCLUDED.fiber,
        salt = EXCLUDED.salt
"#;

const UPSERT_DERIVED_METRICS: &str = r#"
    INSERT INTO derived_metrics
        (product_code, sugar_to_carb_ratio, calorie_category, sugar_category, is_ultra_processed)
    VALUES ($1, $2, $3, $4, $5)
    ON CONFLICT (product_code) DO UPDATE SET
        sugar_to_carb_ratio = EXCLUDED.sugar_to_carb_ratio,
        calorie_category = EXCLUDED.calorie_category,
        sugar_category = EXCLUDED.sugar_category,
        is_ultra_processed = EXCLUDED.is_ultra_processed
"#;

const SELECT_JOINED: &str = r#"
    SELECT p.product_code, p.product_name, p.brand,
           n.energy_kcal, n.carbohydrates, n.sugars, n.proteins, n.fat, n.fiber, n.salt,
           d.sugar_to_carb_ratio, d.calorie_category, d.sugar_category, d.is_ultra_processed
      FROM product_info p
      JOIN nutrient_info n ON n.product_code = p.product_code
      JOIN derived_metrics d ON d.product_code = p.product_code
     ORDER BY p.product_code
"#;

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("connecting to {target}")]
    Connect {
        target: String,
        #[source]
        source: sqlx::Error,
    },
    #[error("creating table {table}")]
    Schema {
        table: TargetTable,
        #[source]
        source: sqlx::Error,
    },
    #[error("opening write transaction for batch starting at {first_product_code}")]
    Begin {
        first_product_code: String,
        #[source]
        source: sqlx::Error,
    },
    #[error("upserting {product_code} into {table}; its batch was rolled back")]
    PersistenceFailure {
        product_code: String,
        table: TargetTable,
        #[source]
        source: sqlx::Error,
    },
    #[error("committing batch ending at {last_product_code}")]
    Commit {
        last_product_code: String,
        #[source]
        source: sqlx::Error,
    },
    #[error("reading {table}")]
    Read {
        table: TargetTable,
        #[source]
        source: sqlx::Error,
    },
    #[error("stored value `{value}` in {table}.{column} is not a known category")]
    Decode {
        table: TargetTable,
        column: &'static str,
        value: String,
    },
}

/// Opens a pool for `url` (`postgres://...` or `sqlite://...`). `target` is
/// the credential-free label used in errors and logs.
pub async fn connect(url: &str, target: &str, max_connections: u32) -> Result<AnyPool, PersistError> {
    sqlx::any::install_default_drivers();
    AnyPoolOptions::new()
        .max_connections(max_connections.max(1))
        .connect(url)
        .await
        .map_err(|source| PersistError::Connect {
            target: target.to_string(),
            source,
        })
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteSummary {
    pub rows_written: usize,
    pub batches_committed: usize,
}

/// Upserts mapped rows into the three product tables.
///
/// A row's three statements always share one transaction, and each batch of
/// `batch_size` rows commits together. A failed statement drops the
/// transaction, rolling the whole batch back, so no product is ever left
/// present in one table and stale in another. Earlier batches stay committed;
/// re-running from the start is safe because every write is keyed.
///
/// The writer assumes it is the only one touching these tables.
#[derive(Debug, Clone)]
pub struct CatalogWriter {
    pool: AnyPool,
    batch_size: usize,
}

impl CatalogWriter {
    pub fn new(pool: AnyPool) -> Self {
        Self {
            pool,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn pool(&self) -> &AnyPool {
        &self.pool
    }

    pub async fn ensure_schema(&self) -> Result<(), PersistError> {
        for table in TargetTable::ALL {
            sqlx::query(table.create_statement())
                .execute(&self.pool)
                .await
                .map_err(|source| PersistError::Schema { table, source })?;
        }
        Ok(())
    }

    pub async fn write_all(&self, rows: &[MappedRow]) -> Result<WriteSummary, PersistError> {
        self.ensure_schema().await?;

        let mut summary = WriteSummary::default();
        for (batch_no, batch) in rows.chunks(self.batch_size).enumerate() {
            let span = info_span!("write_batch", batch_no, rows = batch.len());
            self.write_batch(batch).instrument(span).await?;
            summary.rows_written += batch.len();
            summary.batches_committed += 1;
        }

        info!(
            rows = summary.rows_written,
            batches = summary.batches_committed,
            "catalog tables upserted"
        );
        Ok(summary)
    }

    async fn write_batch(&self, batch: &[MappedRow]) -> Result<(), PersistError> {
        let (Some(first), Some(last)) = (batch.first(), batch.last()) else {
            return Ok(());
        };

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|source| PersistError::Begin {
                first_product_code: first.product_code().to_string(),
                source,
            })?;

        for row in batch {
            upsert_product_info(&mut tx, &row.product).await?;
            upsert_nutrient_info(&mut tx, &row.nutrients).await?;
            upsert_derived_metrics(&mut tx, &row.derived).await?;
        }

        tx.commit().await.map_err(|source| PersistError::Commit {
            last_product_code: last.product_code().to_string(),
            source,
        })?;
        debug!(last = last.product_code(), "batch committed");
        Ok(())
    }
}

async fn upsert_product_info(
    tx: &mut Transaction<'_, Any>,
    product: &ProductInfo,
) -> Result<(), PersistError> {
    sqlx::query(UPSERT_PRODUCT_INFO)
        .bind(product.product_code.as_str())
        .bind(product.product_name.as_deref())
        .bind(product.brand.as_deref())
        .execute(&mut **tx)
        .await
        .map_err(|source| PersistError::PersistenceFailure {
            product_code: product.product_code.clone(),
            table: TargetTable::ProductInfo,
            source,
        })?;
    Ok(())
}

async fn upsert_nutrient_info(
    tx: &mut Transaction<'_, Any>,
    nutrients: &NutrientInfo,
) -> Result<(), PersistError> {
    sqlx::query(UPSERT_NUTRIENT_INFO)
        .bind(nutrients.product_code.as_str())
        .bind(nutrients.energy_kcal)
        .bind(nutrients.carbohydrates)
        .bind(nutrients.sugars)
        .bind(nutrients.proteins)
        .bind(nutrients.fat)
        .bind(nutrients.fiber)
        .bind(nutrients.salt)
        .execute(&mut **tx)
        .await
        .map_err(|source| PersistError::PersistenceFailure {
            product_code: nutrients.product_code.clone(),
            table: TargetTable::NutrientInfo,
            source,
        })?;
    Ok(())
}

async fn upsert_derived_metrics(
    tx: &mut Transaction<'_, Any>,
    derived: &DerivedMetrics,
) -> Result<(), PersistError> {
    sqlx::query(UPSERT_DERIVED_METRICS)
        .bind(derived.product_code.as_str())
        .bind(derived.sugar_to_carb_ratio)
        .bind(derived.calorie_category.as_str())
        .bind(derived.sugar_category.as_str())
        .bind(derived.is_ultra_processed.as_str())
        .execute(&mut **tx)
        .await
        .map_err(|source| PersistError::PersistenceFailure {
            product_code: derived.product_code.clone(),
            table: TargetTable::DerivedMetrics,
            source,
        })?;
    Ok(())
}

pub async fn count_rows(pool: &AnyPool, table: TargetTable) -> Result<i64, PersistError> {
    let row = sqlx::query(&format!("SELECT COUNT(*) AS n FROM {}", table.name()))
        .fetch_one(pool)
        .await
        .map_err(|source| PersistError::Read { table, source })?;
    row.try_get::<i64, _>("n")
        .map_err(|source| PersistError::Read { table, source })
}

fn parse_category<T: std::str::FromStr>(
    value: String,
    column: &'static str,
) -> Result<T, PersistError> {
    value.parse().map_err(|_| PersistError::Decode {
        table: TargetTable::DerivedMetrics,
        column,
        value,
    })
}

/// Reads the three tables back, joined on `product_code`.
pub async fn load_joined(pool: &AnyPool) -> Result<Vec<MappedRow>, PersistError> {
    let read_err = |source: sqlx::Error| PersistError::Read {
        table: TargetTable::ProductInfo,
        source,
    };
    let rows = sqlx::query(SELECT_JOINED)
        .fetch_all(pool)
        .await
        .map_err(read_err)?;

    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        let product_code: String = row.try_get("product_code").map_err(read_err)?;
        out.push(MappedRow {
            product: ProductInfo {
                product_code: product_code.clone(),
                product_name: row.try_get("product_name").map_err(read_err)?,
                brand: row.try_get("brand").map_err(read_err)?,
            },
            nutrients: NutrientInfo {
                product_code: product_code.clone(),
                energy_kcal: row.try_get("energy_kcal").map_err(read_err)?,
                carbohydrates: row.try_get("carbohydrates").map_err(read_err)?,
                sugars: row.try_get("sugars").map_err(read_err)?,
                proteins: row.try_get("proteins").map_err(read_err)?,
                fat: row.try_get("fat").map_err(read_err)?,
                fiber: row.try_get("fiber").map_err(read_err)?,
                salt: row.try_get("salt").map_err(read_err)?,
            },
            derived: DerivedMetrics {
                product_code,
                sugar_to_carb_ratio: row.try_get("sugar_to_carb_ratio").map_err(read_err)?,
                calorie_category: parse_category(
                    row.try_get("calorie_category").map_err(read_err)?,
                    "calorie_category",
                )?,
                sugar_category: parse_category(
                    row.try_get("sugar_category").map_err(read_err)?,
                    "sugar_category",
                )?,
                is_ultra_processed: parse_category(
                    row.try_get("is_ultra_processed").map_err(read_err)?,
                    "is_ultra_processed",
                )?,
            },
        });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nutri_core::{CalorieCategory, SugarCategory, UltraProcessed};
    use tempfile::{tempdir, TempDir};

    async fn sqlite_pool() -> (TempDir, AnyPool) {
        let dir = tempdir().expect("tempdir");
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("catalog.db").display());
        let pool = connect(&url, "test sqlite", 1).await.expect("connect");
        (dir, pool)
    }

    fn mapped(code: &str, sugars: f64, ratio: Option<f64>) -> MappedRow {
        MappedRow {
            product: ProductInfo {
                product_code: code.to_string(),
                product_name: Some(format!("Bar {code}")),
                brand: Some("Unknown".to_string()),
            },
            nutrients: NutrientInfo {
                product_code: code.to_string(),
                energy_kcal: Some(530.0),
                carbohydrates: Some(50.0),
                sugars: Some(sugars),
                proteins: Some(7.5),
                fat: Some(31.0),
                fiber: None,
                salt: Some(0.1),
            },
            derived: DerivedMetrics {
                product_code: code.to_string(),
                sugar_to_carb_ratio: ratio,
                calorie_category: CalorieCategory::High,
                sugar_category: SugarCategory::High,
                is_ultra_processed: UltraProcessed::Yes,
            },
        }
    }

    #[tokio::test]
    async fn schema_creation_is_idempotent() {
        let (_dir, pool) = sqlite_pool().await;
        let writer = CatalogWriter::new(pool.clone());
        writer.ensure_schema().await.expect("first");
        writer.ensure_schema().await.expect("second");
        for table in TargetTable::ALL {
            assert_eq!(count_rows(&pool, table).await.expect("count"), 0);
        }
    }

    #[tokio::test]
    async fn writing_twice_leaves_identical_contents() {
        let (_dir, pool) = sqlite_pool().await;
        let writer = CatalogWriter::new(pool.clone()).with_batch_size(2);
        let rows = vec![
            mapped("001", 40.0, Some(0.8)),
            mapped("002", 25.0, Some(0.5)),
            mapped("003", 0.0, None),
        ];

        let first = writer.write_all(&rows).await.expect("first write");
        assert_eq!(first.rows_written, 3);
        assert_eq!(first.batches_committed, 2);
        let after_first = load_joined(&pool).await.expect("load");

        writer.write_all(&rows).await.expect("second write");
        let after_second = load_joined(&pool).await.expect("load");

        assert_eq!(after_first, after_second);
        assert_eq!(after_second, rows);
        for table in TargetTable::ALL {
            assert_eq!(count_rows(&pool, table).await.expect("count"), 3);
        }
    }

    #[tokio::test]
    async fn upsert_replaces_every_column() {
        let (_dir, pool) = sqlite_pool().await;
        let writer = CatalogWriter::new(pool.clone());
        writer
            .write_all(&[mapped("001", 40.0, Some(0.8))])
            .await
            .expect("write");

        let mut replacement = mapped("001", 5.0, None);
        replacement.product.brand = None;
        replacement.nutrients.salt = None;
        replacement.derived.sugar_category = SugarCategory::Low;
        replacement.derived.is_ultra_processed = UltraProcessed::No;
        writer
            .write_all(std::slice::from_ref(&replacement))
            .await
            .expect("rewrite");

        let stored = load_joined(&pool).await.expect("load");
        assert_eq!(stored, vec![replacement]);
    }

    #[tokio::test]
    async fn undefined_ratio_is_stored_as_null() {
        let (_dir, pool) = sqlite_pool().await;
        CatalogWriter::new(pool.clone())
            .write_all(&[mapped("zero-carb", 0.0, None)])
            .await
            .expect("write");
        let row = sqlx::query("SELECT sugar_to_carb_ratio FROM derived_metrics")
            .fetch_one(&pool)
            .await
            .expect("select");
        let ratio: Option<f64> = row.try_get("sugar_to_carb_ratio").expect("decode");
        assert_eq!(ratio, None);
    }

    #[tokio::test]
    async fn failed_statement_rolls_back_its_batch() {
        let (_dir, pool) = sqlite_pool().await;
        let writer = CatalogWriter::new(pool.clone());
        writer.ensure_schema().await.expect("schema");
        sqlx::query("DROP TABLE derived_metrics")
            .execute(&pool)
            .await
            .expect("drop");

        let rows = [mapped("001", 40.0, Some(0.8))];
        let mut tx = pool.begin().await.expect("begin");
        let err = upsert_derived_metrics(&mut tx, &rows[0].derived)
            .await
            .expect_err("table is gone");
        drop(tx);
        assert!(matches!(
            err,
            PersistError::PersistenceFailure { table: TargetTable::DerivedMetrics, ref product_code, .. }
                if product_code == "001"
        ));

        // product_info and nutrient_info writes of the same batch must not survive
        let err = writer.write_batch(&rows).await.expect_err("batch fails");
        assert!(matches!(err, PersistError::PersistenceFailure { .. }));
        assert_eq!(count_rows(&pool, TargetTable::ProductInfo).await.expect("count"), 0);
        assert_eq!(count_rows(&pool, TargetTable::NutrientInfo).await.expect("count"), 0);
    }
}
