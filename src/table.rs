use chrono::{DateTime, NaiveDate, Utc};
use lazy_static::lazy_static;
use log::{debug, warn};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::io::Read;

use crate::error::{DashboardError, Result};

lazy_static! {
    static ref NUMBER_REGEX: Regex = Regex::new(r"^(\d+(\.\d*)?|\.\d+)([eE][+-]?\d+)?$").unwrap();
}

/// Currency markers stripped in front of numeric cells, longest first
const CURRENCY_PREFIXES: [&str; 5] = ["US$", "R$", "$", "€", "£"];

/// Always tried after the schema's own date formats
pub const ISO_DATE_FORMAT: &str = "%Y-%m-%d";

/// Semantic type of a declared column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnKind {
    /// Free text, kept verbatim (trimmed)
    Text,

    /// Numeric value, parsed with the schema's decimal convention
    Number,

    /// Calendar date without time
    Date,
}

impl fmt::Display for ColumnKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ColumnKind::Text => "text",
            ColumnKind::Number => "number",
            ColumnKind::Date => "date",
        };
        f.write_str(name)
    }
}

/// One declared column of the sheet
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnSpec {
    /// Header text as it appears in the sheet (matched trimmed, case-insensitive)
    pub name: String,

    /// Type the cells are coerced to
    pub kind: ColumnKind,

    /// Optional display label used by the dashboard
    #[serde(default)]
    pub label: Option<String>,

    /// Whether a sheet without this column is rejected
    #[serde(default = "default_required")]
    pub required: bool,
}

fn default_required() -> bool {
    true
}

impl ColumnSpec {
    pub fn new(name: &str, kind: ColumnKind) -> Self {
        Self {
            name: name.to_string(),
            kind,
            label: None,
            required: true,
        }
    }

    /// Marks the column as optional
    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    pub fn with_label(mut self, label: &str) -> Self {
        self.label = Some(label.to_string());
        self
    }

    pub fn display_label(&self) -> &str {
        self.label.as_deref().unwrap_or(&self.name)
    }
}

/// Declared row schema of the sheet
///
/// Besides the column list, the schema names the three columns the dashboard
/// aggregates over: the date axis, the grouping category and the summed value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Schema {
    /// Columns in display order
    pub columns: Vec<ColumnSpec>,

    /// Date column driving range filters, monthly series and calendars
    pub date_column: String,

    /// Text column used for grouping
    pub category_column: String,

    /// Numeric column summed by every aggregation
    pub value_column: String,

    /// chrono formats tried in order when parsing dates
    #[serde(default = "default_date_formats")]
    pub date_formats: Vec<String>,

    /// `1.234,56` instead of `1,234.56`
    #[serde(default)]
    pub decimal_comma: bool,
}

/// Two-digit year formats come first: `%Y` would happily read `24` as year 24.
fn default_date_formats() -> Vec<String> {
    ["%d/%m/%y", "%d/%m/%Y", "%Y-%m-%d", "%d-%m-%Y", "%Y/%m/%d"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

impl Default for Schema {
    fn default() -> Self {
        Self {
            columns: vec![
                ColumnSpec::new("date", ColumnKind::Date).with_label("Date"),
                ColumnSpec::new("category", ColumnKind::Text).with_label("Category"),
                ColumnSpec::new("description", ColumnKind::Text)
                    .with_label("Description")
                    .optional(),
                ColumnSpec::new("amount", ColumnKind::Number).with_label("Amount"),
            ],
            date_column: "date".to_string(),
            category_column: "category".to_string(),
            value_column: "amount".to_string(),
            date_formats: default_date_formats(),
            decimal_comma: false,
        }
    }
}

impl Schema {
    /// Checks column names and role assignments
    ///
    /// # Errors
    /// * `Schema` if no columns are declared or a column name is blank
    /// * `DuplicateColumn` if two columns share a name (case-insensitive)
    /// * `ColumnNotFound` if a role names an undeclared column
    /// * `Schema` if a role column has the wrong kind
    pub fn validate(&self) -> Result<()> {
        if self.columns.is_empty() {
            return Err(DashboardError::Schema("schema declares no columns".into()));
        }

        let mut seen = BTreeSet::new();
        for column in &self.columns {
            let key = normalize_header(&column.name);
            if key.is_empty() {
                return Err(DashboardError::Schema("column with an empty name".into()));
            }
            if !seen.insert(key) {
                return Err(DashboardError::DuplicateColumn {
                    name: column.name.clone(),
                });
            }
        }

        self.check_role("date_column", &self.date_column, ColumnKind::Date)?;
        self.check_role("category_column", &self.category_column, ColumnKind::Text)?;
        self.check_role("value_column", &self.value_column, ColumnKind::Number)?;
        Ok(())
    }

    fn check_role(&self, role: &str, name: &str, kind: ColumnKind) -> Result<()> {
        let spec = self
            .column(name)
            .ok_or_else(|| DashboardError::ColumnNotFound {
                name: name.to_string(),
            })?;
        if spec.kind != kind {
            return Err(DashboardError::Schema(format!(
                "{} '{}' must be a {} column, found {}",
                role, name, kind, spec.kind
            )));
        }
        Ok(())
    }

    pub fn column(&self, name: &str) -> Option<&ColumnSpec> {
        self.index_of(name).map(|i| &self.columns[i])
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        let key = normalize_header(name);
        self.columns
            .iter()
            .position(|c| normalize_header(&c.name) == key)
    }
}

/// A typed cell after coercion
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum CellValue {
    Empty,
    Text(String),
    Number(f64),
    Date(NaiveDate),
}

impl CellValue {
    pub fn is_empty(&self) -> bool {
        matches!(self, CellValue::Empty)
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            CellValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_date(&self) -> Option<NaiveDate> {
        match self {
            CellValue::Date(d) => Some(*d),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            CellValue::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Lossless textual form: parsing it back with the same schema yields the same cell.
    ///
    /// Numbers use the shortest round-trip representation with no thousands
    /// separator; dates are ISO formatted.
    pub fn to_plain_string(&self, decimal_comma: bool) -> String {
        match self {
            CellValue::Empty => String::new(),
            CellValue::Text(s) => s.clone(),
            CellValue::Number(n) => {
                let text = n.to_string();
                if decimal_comma {
                    text.replace('.', ",")
                } else {
                    text
                }
            }
            CellValue::Date(d) => d.format(ISO_DATE_FORMAT).to_string(),
        }
    }
}

impl fmt::Display for CellValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_plain_string(false))
    }
}

/// Parse a spreadsheet number
///
/// Accepts currency prefixes, a trailing percent sign, accounting-style
/// negatives `(12)` and either decimal convention.
///
/// # Arguments
/// * `text` - Cell text as exported by the spreadsheet
/// * `decimal_comma` - Whether `,` is the decimal separator and `.` groups thousands
///
/// # Returns
/// * `Option<f64>` - The value, or None for blank or non-numeric text
pub fn parse_number(text: &str, decimal_comma: bool) -> Option<f64> {
    let compact: String = text.chars().filter(|c| !c.is_whitespace()).collect();
    if compact.is_empty() {
        return None;
    }

    let mut negative = false;
    let mut body = compact.as_str();

    if body.len() >= 2 && body.starts_with('(') && body.ends_with(')') {
        negative = true;
        body = &body[1..body.len() - 1];
    }
    if let Some(rest) = body.strip_prefix('-') {
        negative = !negative;
        body = rest;
    } else if let Some(rest) = body.strip_prefix('+') {
        body = rest;
    }
    for prefix in CURRENCY_PREFIXES {
        if let Some(rest) = body.strip_prefix(prefix) {
            body = rest;
            break;
        }
    }
    if let Some(rest) = body.strip_prefix('-') {
        negative = !negative;
        body = rest;
    }
    let body = body.strip_suffix('%').unwrap_or(body);

    let normalized = if decimal_comma {
        body.replace('.', "").replace(',', ".")
    } else {
        body.replace(',', "")
    };
    if !NUMBER_REGEX.is_match(&normalized) {
        return None;
    }

    let value: f64 = normalized.parse().ok()?;
    Some(if negative { -value } else { value })
}

/// Parse a spreadsheet date
///
/// The configured formats are tried in order, then ISO. A trailing time
/// component (`05/03/2024 10:30:00`, `2024-03-05T10:30`) is ignored.
pub fn parse_date(text: &str, formats: &[String]) -> Option<NaiveDate> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }
    let date_part = trimmed
        .split([' ', 'T'])
        .next()
        .unwrap_or(trimmed);

    for candidate in [trimmed, date_part] {
        let mut all_formats = formats
            .iter()
            .map(String::as_str)
            .chain(std::iter::once(ISO_DATE_FORMAT));
        if let Some(date) =
            all_formats.find_map(|format| NaiveDate::parse_from_str(candidate, format).ok())
        {
            return Some(date);
        }
    }
    None
}

fn normalize_header(name: &str) -> String {
    name.trim_start_matches('\u{feff}').trim().to_lowercase()
}

fn find_header(record: &[String], name: &str) -> Option<usize> {
    let key = normalize_header(name);
    record.iter().position(|h| normalize_header(h) == key)
}

fn is_blank(record: &[String]) -> bool {
    record.iter().all(|c| c.trim().is_empty())
}

/// Untyped rows exactly as the spreadsheet returned them
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawTable {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl RawTable {
    /// Read CSV text; the first non-blank record becomes the header
    ///
    /// Records may have differing lengths (Google trims trailing empty cells).
    pub fn from_csv_reader<R: Read>(reader: R) -> Result<Self> {
        let mut csv_reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_reader(reader);

        let mut records = Vec::new();
        for record in csv_reader.records() {
            let record = record?;
            records.push(record.iter().map(|field| field.to_string()).collect::<Vec<_>>());
        }

        let mut remaining = records.into_iter().skip_while(|r| is_blank(r));
        let headers = remaining.next().unwrap_or_default();
        Ok(Self {
            headers,
            rows: remaining.collect(),
        })
    }

    pub fn from_csv_str(content: &str) -> Result<Self> {
        Self::from_csv_reader(content.as_bytes())
    }
}

/// One typed row, cells aligned with `Schema::columns`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Row {
    pub cells: Vec<CellValue>,
}

/// The typed result of one fetch from the spreadsheet
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub schema: Schema,
    pub rows: Vec<Row>,
    pub fetched_at: DateTime<Utc>,

    /// Non-blank cells that did not parse as their declared kind
    pub coercion_failures: usize,

    /// Rows dropped during coercion: blank records and records none of whose
    /// cells could be read
    pub skipped_rows: usize,

    date_index: usize,
    category_index: usize,
    value_index: usize,
}

impl Snapshot {
    /// Coerce a raw table into the declared schema
    ///
    /// # Arguments
    /// * `schema` - Declared columns and roles
    /// * `raw` - Rows as fetched
    /// * `fetched_at` - Fetch time recorded on the snapshot
    ///
    /// # Errors
    /// * Any schema validation error
    /// * `ColumnNotFound` if no record in the table carries every required column
    ///
    /// # Notes
    /// * Cells that fail to parse become `CellValue::Empty` and are counted
    /// * Rows left with no readable cell are dropped, so the snapshot never holds an
    ///   all-empty row that a CSV export could not reproduce
    pub fn from_raw(schema: Schema, raw: &RawTable, fetched_at: DateTime<Utc>) -> Result<Self> {
        schema.validate()?;
        let (header, data) = locate_header(&schema, raw)?;

        let positions: Vec<Option<usize>> = schema
            .columns
            .iter()
            .map(|spec| find_header(header, &spec.name))
            .collect();

        let mut rows = Vec::with_capacity(data.len());
        let mut coercion_failures = 0;
        let mut skipped_rows = 0;

        for record in data {
            if is_blank(record) {
                skipped_rows += 1;
                continue;
            }

            let mut cells = Vec::with_capacity(schema.columns.len());
            for (spec, position) in schema.columns.iter().zip(positions.iter().copied()) {
                let text = position
                    .and_then(|i| record.get(i))
                    .map(|s| s.trim())
                    .unwrap_or("");
                match coerce(spec.kind, text, &schema) {
                    Some(cell) => cells.push(cell),
                    None => {
                        debug!("Could not read '{}' as {} in column {}", text, spec.kind, spec.name);
                        coercion_failures += 1;
                        cells.push(CellValue::Empty);
                    }
                }
            }
            if cells.iter().all(CellValue::is_empty) {
                debug!("Dropping a row without any readable cell");
                skipped_rows += 1;
                continue;
            }
            rows.push(Row { cells });
        }

        if coercion_failures > 0 {
            warn!(
                "{} cell(s) did not match their declared column type and were left empty",
                coercion_failures
            );
        }

        let role_index = |name: &str| {
            schema
                .index_of(name)
                .ok_or_else(|| DashboardError::ColumnNotFound {
                    name: name.to_string(),
                })
        };
        let date_index = role_index(&schema.date_column)?;
        let category_index = role_index(&schema.category_column)?;
        let value_index = role_index(&schema.value_column)?;

        Ok(Self {
            schema,
            rows,
            fetched_at,
            coercion_failures,
            skipped_rows,
            date_index,
            category_index,
            value_index,
        })
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn date_of(&self, row: &Row) -> Option<NaiveDate> {
        row.cells.get(self.date_index).and_then(CellValue::as_date)
    }

    /// Category text, empty when the cell is blank
    pub fn category_of<'a>(&self, row: &'a Row) -> &'a str {
        row.cells
            .get(self.category_index)
            .and_then(CellValue::as_text)
            .unwrap_or("")
    }

    pub fn value_of(&self, row: &Row) -> Option<f64> {
        row.cells.get(self.value_index).and_then(CellValue::as_number)
    }

    /// Smallest and largest date present, None when no row is dated
    pub fn date_bounds(&self) -> Option<(NaiveDate, NaiveDate)> {
        let mut dates = self.rows.iter().filter_map(|row| self.date_of(row));
        let first = dates.next()?;
        Some(dates.fold((first, first), |(min, max), d| (min.min(d), max.max(d))))
    }

    /// Distinct non-empty categories, sorted
    pub fn categories(&self) -> Vec<String> {
        self.rows
            .iter()
            .map(|row| self.category_of(row))
            .filter(|c| !c.is_empty())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .map(str::to_string)
            .collect()
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.schema.columns.iter().map(|c| c.name.as_str()).collect()
    }
}

fn locate_header<'a>(
    schema: &Schema,
    raw: &'a RawTable,
) -> Result<(&'a [String], &'a [Vec<String>])> {
    let has_required = |record: &[String]| {
        schema
            .columns
            .iter()
            .filter(|c| c.required)
            .all(|c| find_header(record, &c.name).is_some())
    };

    if has_required(raw.headers.as_slice()) {
        return Ok((raw.headers.as_slice(), raw.rows.as_slice()));
    }

    // Sheets often carry a title block above the actual table
    for (i, record) in raw.rows.iter().enumerate() {
        if has_required(record.as_slice()) {
            return Ok((record.as_slice(), &raw.rows[i + 1..]));
        }
    }

    let missing = schema
        .columns
        .iter()
        .find(|c| c.required && find_header(&raw.headers, &c.name).is_none())
        .map(|c| c.name.clone())
        .unwrap_or_default();
    Err(DashboardError::ColumnNotFound { name: missing })
}

fn coerce(kind: ColumnKind, text: &str, schema: &Schema) -> Option<CellValue> {
    if text.is_empty() {
        return Some(CellValue::Empty);
    }
    match kind {
        ColumnKind::Text => Some(CellValue::Text(text.to_string())),
        ColumnKind::Number => parse_number(text, schema.decimal_comma).map(CellValue::Number),
        ColumnKind::Date => parse_date(text, &schema.date_formats).map(CellValue::Date),
    }
}
