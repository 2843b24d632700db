//! Result tables and schema-tolerant row/column selection.
//!
//! Result schemas are owned by the query-execution service and drift between
//! markets and over time (columns renamed, segments added). Every selector
//! here is total: an empty table, a missing column, or a missing row resolves
//! to an empty table or `None`, never an error. Callers declare *which*
//! candidate columns and criteria apply; degrading gracefully when they are
//! absent is centralized in this module.

use chrono::{Datelike, NaiveDate};
use serde_json::Value;

/// Column names that may hold the vehicle-type dimension, in priority order.
/// Different markets' result tables use different names for the same thing.
pub const VEHICLE_TYPE_COLUMNS: &[&str] = &["vehicle_type", "w_type", "wheel_group", "vehicle"];

/// Column names that may hold the time bucket of a row, in priority order.
pub const DATE_COLUMNS: &[&str] = &["month", "month_start", "date"];

/// A rectangular query result: named columns and zero or more rows.
///
/// Zero rows is a valid "no data available" outcome, not a fault.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultTable {
    columns: Vec<String>,
    rows: Vec<Vec<Value>>,
}

impl ResultTable {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn new(columns: Vec<String>, rows: Vec<Vec<Value>>) -> Self {
        Self { columns, rows }
    }

    /// Parse a delimited-text result set as downloaded from the service.
    /// Empty cells become null; cells that parse as finite numbers become
    /// numbers; everything else stays a string.
    pub fn from_csv(text: &str) -> anyhow::Result<Self> {
        let mut reader = csv::ReaderBuilder::new()
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(text.as_bytes());

        let columns: Vec<String> = match reader.headers() {
            Ok(headers) => headers.iter().map(|h| h.to_string()).collect(),
            Err(_) => return Ok(Self::empty()),
        };

        let mut rows = Vec::new();
        for record in reader.records() {
            let record = record?;
            let row = (0..columns.len())
                .map(|i| infer_cell(record.get(i).unwrap_or("")))
                .collect();
            rows.push(row);
        }

        Ok(Self { columns, rows })
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn has_column(&self, column: &str) -> bool {
        self.column_index(column).is_some()
    }

    fn column_index(&self, column: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == column)
    }

    /// First-row value of `column`, if the table is non-empty, the column
    /// exists and the value is not null.
    pub fn scalar(&self, column: &str) -> Option<Value> {
        let idx = self.column_index(column)?;
        let cell = self.rows.first()?.get(idx)?;
        match cell {
            Value::Null => None,
            other => Some(other.clone()),
        }
    }

    /// `scalar` with a caller-supplied fallback.
    pub fn scalar_or(&self, column: &str, default: Value) -> Value {
        self.scalar(column).unwrap_or(default)
    }

    /// First non-null first-row value among `candidates`, tried in order.
    /// Used where the same logical quantity is named differently across
    /// markets or over time.
    pub fn first_present(&self, candidates: &[&str]) -> Option<Value> {
        candidates.iter().find_map(|c| self.scalar(c))
    }

    /// First-row value of `column` coerced to a float, accepting both
    /// numeric cells and numeric strings.
    pub fn number(&self, column: &str) -> Option<f64> {
        self.scalar(column).as_ref().and_then(to_f64)
    }

    /// Like `number`, over a candidate-column priority list.
    pub fn number_in(&self, candidates: &[&str]) -> Option<f64> {
        candidates.iter().find_map(|c| self.number(c))
    }

    /// First row matching every criterion, as a one-row table; empty table
    /// when nothing matches. Values compare as case-insensitive strings.
    /// A criterion naming a column this table does not have is ignored, so
    /// callers may pass a superset of possible dimensions.
    pub fn filter_first(&self, criteria: &[(&str, &str)]) -> ResultTable {
        match self.matching_rows(criteria).next() {
            Some(row) => Self::new(self.columns.clone(), vec![row.clone()]),
            None => Self::empty(),
        }
    }

    /// Every row matching the criteria. Same matching rules as
    /// `filter_first`.
    pub fn filter_all(&self, criteria: &[(&str, &str)]) -> ResultTable {
        let rows: Vec<Vec<Value>> = self.matching_rows(criteria).cloned().collect();
        if rows.is_empty() {
            Self::empty()
        } else {
            Self::new(self.columns.clone(), rows)
        }
    }

    fn matching_rows<'a>(
        &'a self,
        criteria: &'a [(&'a str, &'a str)],
    ) -> impl Iterator<Item = &'a Vec<Value>> + 'a {
        let indexed: Vec<(Option<usize>, &str)> = criteria
            .iter()
            .map(|(col, want)| (self.column_index(col), *want))
            .collect();
        self.rows.iter().filter(move |row| {
            indexed.iter().all(|(idx, want)| match idx {
                // Absent column: criterion does not apply to this schema.
                None => true,
                Some(i) => row
                    .get(*i)
                    .and_then(cell_str)
                    .map(|s| s.eq_ignore_ascii_case(want))
                    .unwrap_or(false),
            })
        })
    }

    /// Filter to one row for a vehicle-type segment, resolving which column
    /// holds the vehicle type from `VEHICLE_TYPE_COLUMNS`. A city criterion
    /// is added only when a city is given and the table has a `city` column.
    pub fn vehicle_type(&self, vehicle_type: &str, city: Option<&str>) -> ResultTable {
        let mut criteria: Vec<(&str, &str)> = Vec::new();
        if let Some(col) = VEHICLE_TYPE_COLUMNS.iter().copied().find(|c| self.has_column(c)) {
            criteria.push((col, vehicle_type));
        }
        if let Some(city) = city {
            if self.has_column("city") {
                criteria.push(("city", city));
            }
        }
        self.filter_first(&criteria)
    }

    /// Pick the row for the report month out of a table that may span a
    /// wider window (e.g. a trailing month pulled in for churn). The date
    /// column is resolved from `DATE_COLUMNS`; per column the match is
    /// exact date first, then `YYYY-MM` prefix; the final fallback is the
    /// table's first row.
    pub fn month_row(&self, month_start: NaiveDate) -> ResultTable {
        if self.is_empty() {
            return Self::empty();
        }

        let prefix = format!("{:04}-{:02}", month_start.year(), month_start.month());

        for candidate in DATE_COLUMNS {
            let Some(idx) = self.column_index(candidate) else {
                continue;
            };

            let exact = self
                .rows
                .iter()
                .find(|row| row.get(idx).and_then(|v| cell_date(v)) == Some(month_start));
            if let Some(row) = exact {
                return Self::new(self.columns.clone(), vec![row.clone()]);
            }

            let same_month = self.rows.iter().find(|row| {
                row.get(idx)
                    .and_then(cell_str)
                    .map(|s| s.starts_with(&prefix))
                    .unwrap_or(false)
            });
            if let Some(row) = same_month {
                return Self::new(self.columns.clone(), vec![row.clone()]);
            }
        }

        Self::new(self.columns.clone(), vec![self.rows[0].clone()])
    }
}

/// `numerator / denominator`, or `None` when either operand is missing, the
/// denominator is zero, or the result would not be finite.
pub fn safe_div(numerator: Option<f64>, denominator: Option<f64>) -> Option<f64> {
    let (num, den) = (numerator?, denominator?);
    if den == 0.0 {
        return None;
    }
    let ratio = num / den;
    ratio.is_finite().then_some(ratio)
}

/// Coerce a cell to a float: numbers directly, strings if they parse.
pub fn to_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

fn infer_cell(raw: &str) -> Value {
    let raw = raw.trim();
    if raw.is_empty() {
        return Value::Null;
    }
    if let Ok(n) = raw.parse::<i64>() {
        return Value::Number(n.into());
    }
    match raw.parse::<f64>() {
        Ok(n) if n.is_finite() => serde_json::Number::from_f64(n)
            .map(Value::Number)
            .unwrap_or_else(|| Value::String(raw.to_string())),
        _ => Value::String(raw.to_string()),
    }
}

fn cell_str(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn cell_date(value: &Value) -> Option<NaiveDate> {
    let s = cell_str(value)?;
    let s = s.trim();
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        // Date-time cells like "2024-03-01 00:00:00".
        .or_else(|| s.get(..10).and_then(|p| NaiveDate::parse_from_str(p, "%Y-%m-%d").ok()))
}
