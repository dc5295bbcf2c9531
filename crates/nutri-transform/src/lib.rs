//! Snapshot intake, dataset-wide cleaning, feature derivation and the
//! three-table schema mapping.

use std::collections::BTreeSet;

use nutri_core::{
    CalorieCategory, Cell, DerivedMetrics, FeatureRow, MappedRow, NutrientInfo, ProductInfo,
    RawRecord, Row, RowIssue, SugarCategory, Table, UltraProcessed, ViolationStage, BRAND,
    CARBOHYDRATES, ENERGY_KCAL, FAT, FIBER, NOVA_GROUP, PRODUCT_CODE, PRODUCT_NAME, PROTEINS, SALT,
    SUGARS, UNKNOWN,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "nutri-transform";

pub const DEFAULT_NULL_THRESHOLD_PERCENT: f64 = 50.0;

pub const LOW_CALORIE_LIMIT: f64 = 250.0;
pub const MODERATE_CALORIE_LIMIT: f64 = 400.0;
pub const LOW_SUGAR_LIMIT: f64 = 10.0;
pub const MODERATE_SUGAR_LIMIT: f64 = 20.0;
pub const ULTRA_PROCESSED_NOVA_GROUP: f64 = 4.0;

/// Columns the feature stage reads; all must survive cleaning.
pub const FEATURE_INPUTS: [&str; 3] = [SUGARS, CARBOHYDRATES, ENERGY_KCAL];

#[derive(Debug, Clone, Default)]
pub struct Intake {
    pub table: Table,
    pub issues: Vec<RowIssue>,
    pub ignored_keys: BTreeSet<String>,
}

/// Flattens raw records into a table. Records without a usable product code
/// are dropped here so they never feed the cleaner's column statistics;
/// nutrient keys outside `recognized` are discarded.
pub fn intake(records: &[RawRecord], recognized: &BTreeSet<String>) -> Intake {
    let mut rows = Vec::with_capacity(records.len());
    let mut issues = Vec::new();
    let mut ignored_keys = BTreeSet::new();

    for (index, record) in records.iter().enumerate() {
        let Some(code) = record.usable_product_code() else {
            warn!(index, "skipping record without a product_code");
            issues.push(RowIssue::SchemaViolation {
                stage: ViolationStage::Intake,
                index,
                reason: "missing or blank product_code".to_string(),
            });
            continue;
        };

        let mut row = Row::new()
            .with(PRODUCT_CODE, Cell::Text(code.to_string()))
            .with(PRODUCT_NAME, Cell::from_optional_text(record.product_name.as_deref()))
            .with(BRAND, Cell::from_optional_text(record.brand.as_deref()));

        for (key, value) in &record.nutrient_profile {
            if !recognized.contains(key) {
                ignored_keys.insert(key.clone());
                continue;
            }
            match Cell::from_json(value) {
                Some(Cell::Text(text)) => match parse_number(&text) {
                    Some(number) => row.insert(key.clone(), Cell::Number(number)),
                    None => {
                        warn!(
                            product_code = code,
                            column = %key,
                            value = %text,
                            "nulling non-numeric nutrient value"
                        );
                        issues.push(RowIssue::NonNumericNutrient {
                            product_code: code.to_string(),
                            column: key.clone(),
                            value: text,
                        });
                        row.insert(key.clone(), Cell::Null);
                    }
                },
                Some(cell) => row.insert(key.clone(), cell),
                None => {}
            }
        }
        rows.push(row);
    }

    if !ignored_keys.is_empty() {
        debug!(count = ignored_keys.len(), "ignored unrecognized nutrient keys");
    }

    Intake {
        table: Table::from_rows(rows),
        issues,
        ignored_keys,
    }
}

/// Numeric text such as `"12.5"` is accepted; anything else (`"<0.5"`, `"n/a"`,
/// `"true"`, `"NaN"`) is not.
fn parse_number(text: &str) -> Option<f64> {
    text.trim().parse::<f64>().ok().filter(|n| n.is_finite())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnKind {
    Numeric,
    Text,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ColumnStats {
    pub name: String,
    pub kind: ColumnKind,
    pub null_count: usize,
    pub row_count: usize,
    /// Median of the non-null values; only numeric columns with at least one value have one.
    pub median: Option<f64>,
}

impl ColumnStats {
    pub fn null_percent(&self) -> f64 {
        if self.row_count == 0 {
            return 0.0;
        }
        self.null_count as f64 / self.row_count as f64 * 100.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CleanerConfig {
    pub null_threshold_percent: f64,
}

impl Default for CleanerConfig {
    fn default() -> Self {
        Self {
            null_threshold_percent: DEFAULT_NULL_THRESHOLD_PERCENT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DroppedColumn {
    pub column: String,
    pub null_percent: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Imputation {
    pub column: String,
    pub kind: ColumnKind,
    pub fill: Cell,
    pub filled: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CleanReport {
    pub table: Table,
    /// Retained columns and their kinds, in table order.
    pub schema: Vec<(String, ColumnKind)>,
    pub dropped: Vec<DroppedColumn>,
    pub imputations: Vec<Imputation>,
}

#[derive(Debug, Error, PartialEq)]
pub enum CleanError {
    #[error("cannot impute numeric column `{column}`: it has no non-null values to take a median from")]
    ImputationFailure { column: String },
}

/// Kind of a column from its non-null cells. Any text makes it text; a column
/// with no values at all counts as numeric.
pub fn column_kind<'a>(cells: impl IntoIterator<Item = &'a Cell>) -> ColumnKind {
    if cells.into_iter().any(|cell| matches!(cell, Cell::Text(_))) {
        ColumnKind::Text
    } else {
        ColumnKind::Numeric
    }
}

pub fn median(values: &mut [f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    values.sort_by(f64::total_cmp);
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        Some((values[mid - 1] + values[mid]) / 2.0)
    } else {
        Some(values[mid])
    }
}

/// First pass: null counts, kinds and medians for every column.
pub fn column_stats(table: &Table) -> Vec<ColumnStats> {
    table
        .columns()
        .iter()
        .map(|name| {
            let kind = column_kind(table.column_cells(name));
            let null_count = table.column_cells(name).filter(|c| c.is_null()).count();
            let median = match kind {
                ColumnKind::Numeric => {
                    let mut values: Vec<f64> =
                        table.column_cells(name).filter_map(Cell::as_number).collect();
                    median(&mut values)
                }
                ColumnKind::Text => None,
            };
            ColumnStats {
                name: name.clone(),
                kind,
                null_count,
                row_count: table.len(),
                median,
            }
        })
        .collect()
}

/// Removes sparse columns and fills the remaining nulls: text with
/// [`UNKNOWN`], numbers with the column median.
pub fn clean(table: Table, config: &CleanerConfig) -> Result<CleanReport, CleanError> {
    if table.is_empty() {
        return Ok(CleanReport {
            table,
            schema: Vec::new(),
            dropped: Vec::new(),
            imputations: Vec::new(),
        });
    }

    let stats = column_stats(&table);
    let mut dropped = Vec::new();
    let mut schema = Vec::new();
    let mut plan = Vec::new();

    for stat in stats {
        let null_percent = stat.null_percent();
        if null_percent > config.null_threshold_percent {
            debug!(column = %stat.name, null_percent, "dropping sparse column");
            dropped.push(DroppedColumn {
                column: stat.name,
                null_percent,
            });
            continue;
        }

        schema.push((stat.name.clone(), stat.kind));
        if stat.null_count == 0 {
            continue;
        }

        let fill = match stat.kind {
            ColumnKind::Text => Cell::Text(UNKNOWN.to_string()),
            ColumnKind::Numeric => match stat.median {
                Some(median) => Cell::Number(median),
                None => {
                    return Err(CleanError::ImputationFailure { column: stat.name });
                }
            },
        };
        plan.push(Imputation {
            column: stat.name,
            kind: stat.kind,
            fill,
            filled: 0,
        });
    }

    Ok(apply(table, schema, dropped, plan))
}

/// Second pass: applies the drop/fill decisions computed from the stats.
fn apply(
    mut table: Table,
    schema: Vec<(String, ColumnKind)>,
    dropped: Vec<DroppedColumn>,
    mut plan: Vec<Imputation>,
) -> CleanReport {
    for column in &dropped {
        table.drop_column(&column.column);
    }
    for imputation in &mut plan {
        imputation.filled = table.fill_nulls(&imputation.column, &imputation.fill);
    }
    CleanReport {
        table,
        schema,
        dropped,
        imputations: plan,
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum FeatureError {
    #[error("feature input `{column}` is missing or non-numeric (product_code: {product_code:?})")]
    MissingInput {
        column: String,
        product_code: Option<String>,
    },
}

pub fn calorie_category(energy_kcal: f64) -> CalorieCategory {
    if energy_kcal < LOW_CALORIE_LIMIT {
        CalorieCategory::Low
    } else if energy_kcal < MODERATE_CALORIE_LIMIT {
        CalorieCategory::Moderate
    } else {
        CalorieCategory::High
    }
}

pub fn sugar_category(sugars: f64) -> SugarCategory {
    if sugars < LOW_SUGAR_LIMIT {
        SugarCategory::Low
    } else if sugars < MODERATE_SUGAR_LIMIT {
        SugarCategory::Moderate
    } else {
        SugarCategory::High
    }
}

/// Only a numeric nova group of exactly 4 counts as ultra-processed.
pub fn ultra_processed(nova_group: &Cell) -> UltraProcessed {
    match nova_group.as_number() {
        Some(group) if group == ULTRA_PROCESSED_NOVA_GROUP => UltraProcessed::Yes,
        _ => UltraProcessed::No,
    }
}

/// `None` when the quotient is undefined (zero divisor or non-finite result).
pub fn sugar_to_carb_ratio(sugars: f64, carbohydrates: f64) -> Option<f64> {
    if carbohydrates == 0.0 {
        return None;
    }
    Some(sugars / carbohydrates).filter(|ratio| ratio.is_finite())
}

fn required_number(row: &Row, column: &str) -> Result<f64, FeatureError> {
    row.number(column).ok_or_else(|| FeatureError::MissingInput {
        column: column.to_string(),
        product_code: row.product_code().map(ToString::to_string),
    })
}

/// Derives the four feature fields for one cleaned row. The second element
/// is set when the ratio had to be left undefined.
pub fn derive(row: Row) -> Result<(FeatureRow, Option<RowIssue>), FeatureError> {
    let sugars = required_number(&row, SUGARS)?;
    let carbohydrates = required_number(&row, CARBOHYDRATES)?;
    let energy_kcal = required_number(&row, ENERGY_KCAL)?;

    let ratio = sugar_to_carb_ratio(sugars, carbohydrates);
    let issue = match ratio {
        Some(_) => None,
        None => Some(RowIssue::ArithmeticAnomaly {
            product_code: row.product_code().unwrap_or_default().to_string(),
            detail: format!(
                "sugar_to_carb_ratio undefined: sugars={sugars}, carbohydrates={carbohydrates}"
            ),
        }),
    };

    let feature = FeatureRow {
        sugar_to_carb_ratio: ratio,
        calorie_category: calorie_category(energy_kcal),
        sugar_category: sugar_category(sugars),
        is_ultra_processed: ultra_processed(row.get(NOVA_GROUP)),
        cleaned: row,
    };
    Ok((feature, issue))
}

#[derive(Debug, Clone, Default)]
pub struct Derived {
    pub rows: Vec<FeatureRow>,
    pub issues: Vec<RowIssue>,
}

pub fn derive_all(table: Table) -> Result<Derived, FeatureError> {
    if !table.is_empty() {
        if let Some(column) = FEATURE_INPUTS.iter().find(|c| !table.has_column(c)) {
            return Err(FeatureError::MissingInput {
                column: column.to_string(),
                product_code: None,
            });
        }
    }

    let mut derived = Derived::default();
    for row in table.into_rows() {
        let (feature, issue) = derive(row)?;
        if let Some(issue) = issue {
            warn!(product_code = feature.product_code().unwrap_or_default(), "undefined sugar_to_carb_ratio");
            derived.issues.push(issue);
        }
        derived.rows.push(feature);
    }
    Ok(derived)
}

#[derive(Debug, Error, PartialEq)]
pub enum MapError {
    #[error("feature row has no product_code; it cannot key product_info, nutrient_info or derived_metrics")]
    MissingKey,
}

/// Projects a feature row onto the three destination tables.
pub fn map_row(row: &FeatureRow) -> Result<MappedRow, MapError> {
    let product_code = row.product_code().ok_or(MapError::MissingKey)?.to_string();
    let cells = &row.cleaned;

    Ok(MappedRow {
        product: ProductInfo {
            product_code: product_code.clone(),
            product_name: cells.get(PRODUCT_NAME).render(),
            brand: cells.get(BRAND).render(),
        },
        nutrients: NutrientInfo {
            product_code: product_code.clone(),
            energy_kcal: cells.number(ENERGY_KCAL),
            carbohydrates: cells.number(CARBOHYDRATES),
            sugars: cells.number(SUGARS),
            proteins: cells.number(PROTEINS),
            fat: cells.number(FAT),
            fiber: cells.number(FIBER),
            salt: cells.number(SALT),
        },
        derived: DerivedMetrics {
            product_code,
            sugar_to_carb_ratio: row.sugar_to_carb_ratio,
            calorie_category: row.calorie_category,
            sugar_category: row.sugar_category,
            is_ultra_processed: row.is_ultra_processed,
        },
    })
}

/// Maps every row, turning key-less rows into schema violations. Their index
/// is the position in `rows`, not in the raw snapshot.
pub fn map_all(rows: &[FeatureRow]) -> (Vec<MappedRow>, Vec<RowIssue>) {
    let mut mapped = Vec::with_capacity(rows.len());
    let mut issues = Vec::new();
    for (index, row) in rows.iter().enumerate() {
        match map_row(row) {
            Ok(m) => mapped.push(m),
            Err(err) => {
                warn!(index, %err, "skipping unmappable feature row");
                issues.push(RowIssue::SchemaViolation {
                    stage: ViolationStage::Mapping,
                    index,
                    reason: err.to_string(),
                });
            }
        }
    }
    (mapped, issues)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nutri_core::RECOGNIZED_NUTRIENTS;
    use serde_json::json;

    fn recognized() -> BTreeSet<String> {
        RECOGNIZED_NUTRIENTS.iter().map(|s| s.to_string()).collect()
    }

    fn record(code: Option<&str>, nutrients: serde_json::Value) -> RawRecord {
        RawRecord {
            product_code: code.map(ToString::to_string),
            product_name: Some(format!("Bar {}", code.unwrap_or("?"))),
            brand: None,
            nutrient_profile: serde_json::from_value(nutrients).expect("profile"),
        }
    }

    fn feature_row(sugars: f64, carbs: f64, kcal: f64, nova: Cell) -> Row {
        Row::new()
            .with(PRODUCT_CODE, Cell::Text("abc123".into()))
            .with(SUGARS, Cell::Number(sugars))
            .with(CARBOHYDRATES, Cell::Number(carbs))
            .with(ENERGY_KCAL, Cell::Number(kcal))
            .with(NOVA_GROUP, nova)
    }

    #[test]
    fn intake_skips_records_without_code_and_unknown_keys() {
        let records = vec![
            record(Some("a"), json!({"sugars_value": 1.0, "sugars_unit": "g"})),
            record(None, json!({"sugars_value": 2.0})),
            record(Some(""), json!({})),
        ];
        let intake = intake(&records, &recognized());

        assert_eq!(intake.table.len(), 1);
        assert_eq!(intake.issues.len(), 2);
        assert!(intake.issues.iter().all(RowIssue::is_schema_violation));
        assert!(matches!(
            intake.issues[0],
            RowIssue::SchemaViolation { stage: ViolationStage::Intake, index: 1, .. }
        ));
        assert!(intake.ignored_keys.contains("sugars_unit"));
        assert!(!intake.table.has_column("sugars_unit"));
    }

    #[test]
    fn non_numeric_nutrients_are_nulled_and_imputed() {
        let records = vec![
            record(
                Some("a"),
                json!({"sugars_value": "<0.5", "carbohydrates_value": 10, "energy-kcal_value": 100}),
            ),
            record(
                Some("b"),
                json!({"sugars_value": "12.5", "carbohydrates_value": 50, "energy-kcal_value": 300}),
            ),
            record(
                Some("c"),
                json!({"sugars_value": 7.5, "carbohydrates_value": 30, "energy-kcal_value": true}),
            ),
        ];
        let intake = intake(&records, &recognized());
        let nulled: Vec<_> = intake
            .issues
            .iter()
            .filter_map(|issue| match issue {
                RowIssue::NonNumericNutrient { product_code, column, value } => {
                    Some((product_code.as_str(), column.as_str(), value.as_str()))
                }
                _ => None,
            })
            .collect();
        assert_eq!(nulled, vec![("a", SUGARS, "<0.5"), ("c", ENERGY_KCAL, "true")]);
        assert_eq!(intake.table.rows()[1].number(SUGARS), Some(12.5));

        let report = clean(intake.table, &CleanerConfig::default()).expect("clean");
        let sugars_kind = report.schema.iter().find(|(c, _)| c == SUGARS).map(|(_, k)| *k);
        assert_eq!(sugars_kind, Some(ColumnKind::Numeric));
        assert_eq!(report.table.rows()[0].number(SUGARS), Some(10.0));
        assert_eq!(report.table.rows()[2].number(ENERGY_KCAL), Some(200.0));

        let derived = derive_all(report.table).expect("derive");
        let (mapped, issues) = map_all(&derived.rows);
        assert_eq!(mapped.len(), 3);
        assert!(issues.is_empty());
    }

    #[test]
    fn sparse_columns_are_dropped_and_nulls_filled() {
        let records = vec![
            record(Some("a"), json!({"sugars_value": 1.0, "fiber_value": 3.0, "salt_value": null})),
            record(Some("b"), json!({"sugars_value": null, "salt_value": null})),
            record(Some("c"), json!({"sugars_value": 5.0, "salt_value": 0.4})),
            record(Some("d"), json!({"sugars_value": 9.0})),
        ];
        let mut table = intake(&records, &recognized()).table;
        table.drop_column(BRAND);
        let report = clean(table, &CleanerConfig::default()).expect("clean");

        // fiber: 3/4 null, salt: 3/4 null
        let dropped: Vec<_> = report.dropped.iter().map(|d| d.column.as_str()).collect();
        assert_eq!(dropped, vec![FIBER, SALT]);
        assert!(!report.table.has_column(FIBER));

        for column in report.table.columns() {
            assert!(report.table.column_cells(column).all(|c| !c.is_null()), "{column} has nulls");
        }
        assert_eq!(report.table.rows()[1].number(SUGARS), Some(5.0));
    }

    #[test]
    fn exactly_half_null_survives() {
        let table = Table::from_rows(vec![
            Row::new().with(FAT, Cell::Number(2.0)),
            Row::new().with(FAT, Cell::Null),
        ]);
        let report = clean(table, &CleanerConfig::default()).expect("clean");
        assert!(report.dropped.is_empty());
        assert_eq!(report.imputations[0].fill, Cell::Number(2.0));
        assert_eq!(report.imputations[0].filled, 1);
    }

    #[test]
    fn even_count_median_averages_middle_values() {
        let table = Table::from_rows(vec![
            Row::new().with(PROTEINS, Cell::Number(8.0)),
            Row::new().with(PROTEINS, Cell::Number(2.0)),
            Row::new().with(PROTEINS, Cell::Null),
            Row::new().with(PROTEINS, Cell::Number(4.0)),
            Row::new().with(PROTEINS, Cell::Number(6.0)),
        ]);
        let report = clean(table, &CleanerConfig::default()).expect("clean");
        assert_eq!(report.table.rows()[2].number(PROTEINS), Some(5.0));
    }

    #[test]
    fn text_columns_fill_with_unknown() {
        let table = Table::from_rows(vec![
            Row::new().with(BRAND, Cell::Text("Lindt".into())),
            Row::new().with(BRAND, Cell::Null),
            Row::new().with(BRAND, Cell::Text("Milka".into())),
        ]);
        let report = clean(table, &CleanerConfig::default()).expect("clean");
        assert_eq!(report.table.rows()[1].text(BRAND), Some(UNKNOWN));
        assert_eq!(report.schema, vec![(BRAND.to_string(), ColumnKind::Text)]);
    }

    #[test]
    fn all_null_column_fails_imputation_when_kept() {
        let table = Table::from_rows(vec![
            Row::new().with(SALT, Cell::Null),
            Row::new().with(SALT, Cell::Null),
        ]);
        let dropped = clean(table.clone(), &CleanerConfig::default()).expect("clean");
        assert_eq!(dropped.dropped[0].null_percent, 100.0);

        let err = clean(
            table,
            &CleanerConfig {
                null_threshold_percent: 100.0,
            },
        )
        .expect_err("no median available");
        assert_eq!(
            err,
            CleanError::ImputationFailure {
                column: SALT.to_string()
            }
        );
    }

    #[test]
    fn empty_dataset_cleans_to_empty_table() {
        let report = clean(Table::default(), &CleanerConfig::default()).expect("clean");
        assert!(report.table.is_empty());
        assert!(report.dropped.is_empty());
    }

    #[test]
    fn scenario_abc123_derives_expected_fields() {
        let (feature, issue) = derive(feature_row(25.0, 50.0, 300.0, Cell::Number(4.0))).expect("derive");
        assert!(issue.is_none());
        assert_eq!(feature.sugar_to_carb_ratio, Some(0.5));
        assert_eq!(feature.calorie_category, CalorieCategory::Moderate);
        assert_eq!(feature.sugar_category, SugarCategory::High);
        assert_eq!(feature.is_ultra_processed, UltraProcessed::Yes);
    }

    #[test]
    fn category_boundaries_belong_to_upper_bucket() {
        assert_eq!(calorie_category(250.0), CalorieCategory::Moderate);
        assert_eq!(calorie_category(249.999), CalorieCategory::Low);
        assert_eq!(calorie_category(400.0), CalorieCategory::High);
        assert_eq!(sugar_category(10.0), SugarCategory::Moderate);
        assert_eq!(sugar_category(9.999), SugarCategory::Low);
        assert_eq!(sugar_category(20.0), SugarCategory::High);
    }

    #[test]
    fn nova_group_must_equal_four() {
        assert_eq!(ultra_processed(&Cell::Number(4.0)), UltraProcessed::Yes);
        assert_eq!(ultra_processed(&Cell::Number(3.0)), UltraProcessed::No);
        assert_eq!(ultra_processed(&Cell::Text("4".into())), UltraProcessed::No);
        assert_eq!(ultra_processed(&Cell::Null), UltraProcessed::No);
    }

    #[test]
    fn zero_carbohydrates_leave_ratio_undefined() {
        let (feature, issue) = derive(feature_row(0.0, 0.0, 120.0, Cell::Null)).expect("derive");
        assert_eq!(feature.sugar_to_carb_ratio, None);
        assert!(matches!(
            issue,
            Some(RowIssue::ArithmeticAnomaly { ref product_code, .. }) if product_code == "abc123"
        ));
    }

    #[test]
    fn dropped_feature_input_is_reported() {
        let table = Table::from_rows(vec![Row::new()
            .with(PRODUCT_CODE, Cell::Text("x".into()))
            .with(SUGARS, Cell::Number(1.0))]);
        let err = derive_all(table).expect_err("carbohydrates missing");
        assert_eq!(
            err,
            FeatureError::MissingInput {
                column: CARBOHYDRATES.to_string(),
                product_code: None
            }
        );
    }

    #[test]
    fn mapper_splits_into_three_projections() {
        let row = feature_row(25.0, 50.0, 300.0, Cell::Number(4.0))
            .with(PRODUCT_NAME, Cell::Text("Dark 70%".into()))
            .with(FAT, Cell::Number(42.0));
        let (feature, _) = derive(row).expect("derive");
        let mapped = map_row(&feature).expect("map");

        assert_eq!(mapped.product_code(), "abc123");
        assert_eq!(mapped.product.product_name.as_deref(), Some("Dark 70%"));
        assert_eq!(mapped.product.brand, None);
        assert_eq!(mapped.nutrients.fat, Some(42.0));
        assert_eq!(mapped.nutrients.salt, None);
        assert_eq!(mapped.derived.sugar_to_carb_ratio, Some(0.5));
        assert_eq!(mapped.nutrients.product_code, mapped.derived.product_code);
    }

    #[test]
    fn mapper_rejects_rows_without_key() {
        let mut row = feature_row(1.0, 2.0, 3.0, Cell::Null);
        row.insert(PRODUCT_CODE, Cell::Text(" ".into()));
        let (feature, _) = derive(row).expect("derive");
        assert_eq!(map_row(&feature), Err(MapError::MissingKey));

        let (mapped, issues) = map_all(&[feature]);
        assert!(mapped.is_empty());
        assert!(matches!(
            issues[0],
            RowIssue::SchemaViolation { stage: ViolationStage::Mapping, index: 0, .. }
        ));
    }
}
