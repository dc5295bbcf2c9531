//! Core catalog data model: raw records, table cells, feature rows and the
//! three persisted projections keyed by product code.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value as JsonValue;

pub const CRATE_NAME: &str = "nutri-core";

pub const PRODUCT_CODE: &str = "product_code";
pub const PRODUCT_NAME: &str = "product_name";
pub const BRAND: &str = "brand";

pub const ENERGY_KCAL: &str = "energy-kcal_value";
pub const CARBOHYDRATES: &str = "carbohydrates_value";
pub const SUGARS: &str = "sugars_value";
pub const PROTEINS: &str = "proteins_value";
pub const FAT: &str = "fat_value";
pub const FIBER: &str = "fiber_value";
pub const SALT: &str = "salt_value";
pub const NOVA_GROUP: &str = "nova-group";

/// Nutrient-profile keys carried into the working column set by default.
pub const RECOGNIZED_NUTRIENTS: [&str; 8] = [
    ENERGY_KCAL,
    CARBOHYDRATES,
    SUGARS,
    PROTEINS,
    FAT,
    FIBER,
    SALT,
    NOVA_GROUP,
];

/// Sentinel written into text columns whose cells were null.
pub const UNKNOWN: &str = "Unknown";

/// Ingested catalog item, before any validation or cleaning.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RawRecord {
    #[serde(alias = "code", default, deserialize_with = "de_product_code")]
    pub product_code: Option<String>,
    #[serde(default)]
    pub product_name: Option<String>,
    #[serde(alias = "brands", default)]
    pub brand: Option<String>,
    #[serde(alias = "nutriments", default, deserialize_with = "de_nutrient_profile")]
    pub nutrient_profile: BTreeMap<String, JsonValue>,
}

impl RawRecord {
    /// Trimmed product code, or `None` when absent or blank.
    pub fn usable_product_code(&self) -> Option<&str> {
        self.product_code
            .as_deref()
            .map(str::trim)
            .filter(|code| !code.is_empty())
    }
}

fn de_product_code<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<JsonValue>::deserialize(deserializer)? {
        Some(JsonValue::String(code)) => Some(code),
        Some(JsonValue::Number(code)) => Some(code.to_string()),
        _ => None,
    })
}

fn de_nutrient_profile<'de, D>(deserializer: D) -> Result<BTreeMap<String, JsonValue>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<BTreeMap<String, JsonValue>>::deserialize(deserializer)?.unwrap_or_default())
}

/// A single table cell. Nutrient values arrive as JSON, so numbers and text
/// can share a column; the cleaner decides a column's kind from its cells.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Cell {
    Number(f64),
    Text(String),
    Null,
}

static NULL_CELL: Cell = Cell::Null;

impl Cell {
    /// Converts a nutrient-profile value. Nested objects and arrays have no
    /// tabular form and yield `None`.
    pub fn from_json(value: &JsonValue) -> Option<Self> {
        match value {
            JsonValue::Null => Some(Cell::Null),
            JsonValue::Number(n) => Some(n.as_f64().map(Cell::Number).unwrap_or(Cell::Null)),
            JsonValue::String(s) => Some(Cell::Text(s.clone())),
            JsonValue::Bool(b) => Some(Cell::Text(b.to_string())),
            JsonValue::Array(_) | JsonValue::Object(_) => None,
        }
    }

    pub fn from_optional_text(value: Option<&str>) -> Self {
        value.map_or(Cell::Null, |s| Cell::Text(s.to_string()))
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Cell::Null)
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Cell::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Cell::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Text rendering used for text-kind exports of mixed columns.
    pub fn render(&self) -> Option<String> {
        match self {
            Cell::Number(n) => Some(n.to_string()),
            Cell::Text(s) => Some(s.clone()),
            Cell::Null => None,
        }
    }
}

/// One row of the working dataset: column name to cell.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Row {
    cells: BTreeMap<String, Cell>,
}

impl Row {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, column: impl Into<String>, cell: Cell) -> Self {
        self.insert(column, cell);
        self
    }

    pub fn insert(&mut self, column: impl Into<String>, cell: Cell) {
        self.cells.insert(column.into(), cell);
    }

    pub fn remove(&mut self, column: &str) -> Option<Cell> {
        self.cells.remove(column)
    }

    /// Cell for `column`; an absent column reads as null.
    pub fn get(&self, column: &str) -> &Cell {
        self.cells.get(column).unwrap_or(&NULL_CELL)
    }

    pub fn get_mut(&mut self, column: &str) -> Option<&mut Cell> {
        self.cells.get_mut(column)
    }

    pub fn number(&self, column: &str) -> Option<f64> {
        self.get(column).as_number()
    }

    pub fn text(&self, column: &str) -> Option<&str> {
        self.get(column).as_text()
    }

    pub fn product_code(&self) -> Option<&str> {
        self.text(PRODUCT_CODE).filter(|code| !code.trim().is_empty())
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.cells.keys().map(String::as_str)
    }

    pub fn contains(&self, column: &str) -> bool {
        self.cells.contains_key(column)
    }
}

/// Table-shaped dataset. Every row carries every column; missing cells are
/// materialized as [`Cell::Null`] when the table is built.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Table {
    columns: Vec<String>,
    rows: Vec<Row>,
}

impl Table {
    /// Builds a table whose column set is the union of the rows' columns.
    /// `product_code` leads; the rest are ordered by name.
    pub fn from_rows(mut rows: Vec<Row>) -> Self {
        let union: BTreeSet<String> = rows
            .iter()
            .flat_map(|row| row.columns().map(ToString::to_string))
            .collect();
        for row in &mut rows {
            for column in &union {
                if !row.contains(column) {
                    row.insert(column.clone(), Cell::Null);
                }
            }
        }

        let mut columns: Vec<String> = union.into_iter().collect();
        if let Some(pos) = columns.iter().position(|c| c == PRODUCT_CODE) {
            let key = columns.remove(pos);
            columns.insert(0, key);
        }
        Self { columns, rows }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn has_column(&self, column: &str) -> bool {
        self.columns.iter().any(|c| c == column)
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn into_rows(self) -> Vec<Row> {
        self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_cells<'a>(&'a self, column: &'a str) -> impl Iterator<Item = &'a Cell> + 'a {
        self.rows.iter().map(move |row| row.get(column))
    }

    pub fn drop_column(&mut self, column: &str) {
        self.columns.retain(|c| c != column);
        for row in &mut self.rows {
            row.remove(column);
        }
    }

    /// Replaces null cells of `column` with `fill`; returns how many changed.
    pub fn fill_nulls(&mut self, column: &str, fill: &Cell) -> usize {
        let mut filled = 0;
        for row in &mut self.rows {
            if let Some(cell) = row.get_mut(column) {
                if cell.is_null() {
                    *cell = fill.clone();
                    filled += 1;
                }
            }
        }
        filled
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CalorieCategory {
    Low,
    Moderate,
    High,
}

impl CalorieCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            CalorieCategory::Low => "Low",
            CalorieCategory::Moderate => "Moderate",
            CalorieCategory::High => "High",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SugarCategory {
    #[serde(rename = "Low Sugar")]
    Low,
    #[serde(rename = "Moderate Sugar")]
    Moderate,
    #[serde(rename = "High Sugar")]
    High,
}

impl SugarCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            SugarCategory::Low => "Low Sugar",
            SugarCategory::Moderate => "Moderate Sugar",
            SugarCategory::High => "High Sugar",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UltraProcessed {
    Yes,
    No,
}

impl UltraProcessed {
    pub fn as_str(self) -> &'static str {
        match self {
            UltraProcessed::Yes => "Yes",
            UltraProcessed::No => "No",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseCategoryError {
    pub kind: &'static str,
    pub value: String,
}

impl fmt::Display for ParseCategoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unrecognized {} value `{}`", self.kind, self.value)
    }
}

impl std::error::Error for ParseCategoryError {}

macro_rules! category_text {
    ($ty:ident, $kind:literal, [$($variant:ident),+]) => {
        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = ParseCategoryError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                $(
                    if s == $ty::$variant.as_str() {
                        return Ok($ty::$variant);
                    }
                )+
                Err(ParseCategoryError {
                    kind: $kind,
                    value: s.to_string(),
                })
            }
        }
    };
}

category_text!(CalorieCategory, "calorie_category", [Low, Moderate, High]);
category_text!(SugarCategory, "sugar_category", [Low, Moderate, High]);
category_text!(UltraProcessed, "is_ultra_processed", [Yes, No]);

/// A cleaned row extended with the derived analytical fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureRow {
    pub cleaned: Row,
    /// `None` when the carbohydrate divisor was zero and the ratio is undefined.
    pub sugar_to_carb_ratio: Option<f64>,
    pub calorie_category: CalorieCategory,
    pub sugar_category: SugarCategory,
    pub is_ultra_processed: UltraProcessed,
}

impl FeatureRow {
    pub fn product_code(&self) -> Option<&str> {
        self.cleaned.product_code()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductInfo {
    pub product_code: String,
    pub product_name: Option<String>,
    pub brand: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NutrientInfo {
    pub product_code: String,
    pub energy_kcal: Option<f64>,
    pub carbohydrates: Option<f64>,
    pub sugars: Option<f64>,
    pub proteins: Option<f64>,
    pub fat: Option<f64>,
    pub fiber: Option<f64>,
    pub salt: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DerivedMetrics {
    pub product_code: String,
    pub sugar_to_carb_ratio: Option<f64>,
    pub calorie_category: CalorieCategory,
    pub sugar_category: SugarCategory,
    pub is_ultra_processed: UltraProcessed,
}

/// The three co-keyed projections of one feature row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MappedRow {
    pub product: ProductInfo,
    pub nutrients: NutrientInfo,
    pub derived: DerivedMetrics,
}

impl MappedRow {
    pub fn product_code(&self) -> &str {
        &self.product.product_code
    }
}

/// Where a schema violation was caught, which also fixes what its index counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationStage {
    /// `index` is the record's position in the raw snapshot.
    Intake,
    /// `index` is the row's position in the feature table.
    Mapping,
}

/// Row-level problems that are recovered locally and reported at run end.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RowIssue {
    /// Row without a usable product code; excluded from every table.
    SchemaViolation {
        stage: ViolationStage,
        index: usize,
        reason: String,
    },
    /// A recognized nutrient held a value that is not a number. The cell is
    /// nulled at intake and imputed like any other missing value.
    NonNumericNutrient {
        product_code: String,
        column: String,
        value: String,
    },
    /// Derived ratio left undefined for this product.
    ArithmeticAnomaly { product_code: String, detail: String },
}

impl RowIssue {
    pub fn is_schema_violation(&self) -> bool {
        matches!(self, RowIssue::SchemaViolation { .. })
    }

    pub fn is_non_numeric_nutrient(&self) -> bool {
        matches!(self, RowIssue::NonNumericNutrient { .. })
    }

    pub fn is_arithmetic_anomaly(&self) -> bool {
        matches!(self, RowIssue::ArithmeticAnomaly { .. })
    }
}
