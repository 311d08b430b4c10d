#![cfg(not(tarpaulin_include))]
#![cfg(feature = "web")]

use chrono::{NaiveDate, NaiveDateTime};
use rust_xlsxwriter::{Format, Workbook, Worksheet};
use std::str::FromStr;

use crate::error::{DashboardError, Result};
use crate::table::{CellValue, Row, Snapshot};

/// Excel's day zero for serial dates (1900 date system, leap-year bug included)
const EXCEL_EPOCH: (i32, u32, u32) = (1899, 12, 30);

/// Longest worksheet name Excel accepts
const MAX_SHEET_NAME: usize = 31;

/// Downloadable file formats
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Csv,
    Xlsx,
}

impl ExportFormat {
    pub fn extension(self) -> &'static str {
        match self {
            ExportFormat::Csv => "csv",
            ExportFormat::Xlsx => "xlsx",
        }
    }

    pub fn content_type(self) -> &'static str {
        match self {
            ExportFormat::Csv => "text/csv; charset=utf-8",
            ExportFormat::Xlsx => {
                "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet"
            }
        }
    }
}

impl FromStr for ExportFormat {
    type Err = DashboardError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "csv" => Ok(ExportFormat::Csv),
            "xlsx" => Ok(ExportFormat::Xlsx),
            other => Err(DashboardError::Parse(format!("unknown export format '{}'", other))),
        }
    }
}

/// Convert rows to CSV format
///
/// This function exports the given rows of a snapshot as CSV:
/// - The header row carries the schema's column names
/// - Cells use their plain lossless form, so re-reading the file with the same
///   schema reproduces the rows
/// - Quoting of commas, quotes and newlines is handled by the csv writer
///
/// # Arguments
/// * `snapshot` - Snapshot the rows belong to
/// * `rows` - Rows to export, in order
///
/// # Returns
/// * `Result<Vec<u8>>` - UTF-8 CSV bytes or an error
pub fn to_csv(snapshot: &Snapshot, rows: &[&Row]) -> Result<Vec<u8>> {
    let decimal_comma = snapshot.schema.decimal_comma;
    let mut writer = csv::Writer::from_writer(Vec::new());

    writer.write_record(snapshot.column_names())?;
    for row in rows {
        writer.write_record(row.cells.iter().map(|cell| cell.to_plain_string(decimal_comma)))?;
    }

    writer
        .into_inner()
        .map_err(|e| DashboardError::Export(e.to_string()))
}

/// Convert rows to XLSX format
///
/// This function exports the given rows to an Excel workbook using the
/// rust_xlsxwriter library. Numbers stay numeric and dates are written as
/// date-formatted serials so spreadsheet applications can sort and sum them.
///
/// # Arguments
/// * `snapshot` - Snapshot the rows belong to
/// * `rows` - Rows to export, in order
/// * `sheet_name` - Worksheet name, sanitized to Excel's rules
///
/// # Returns
/// * `Result<Vec<u8>>` - XLSX file content as bytes or an error
pub fn to_xlsx(snapshot: &Snapshot, rows: &[&Row], sheet_name: &str) -> Result<Vec<u8>> {
    let mut workbook = Workbook::new();
    let mut worksheet = Worksheet::new();
    worksheet
        .set_name(sanitize_sheet_name(sheet_name))
        .map_err(xlsx_error)?;

    let header_format = Format::new().set_bold();
    let date_format = Format::new().set_num_format("yyyy-mm-dd");

    for (c, column) in snapshot.schema.columns.iter().enumerate() {
        worksheet
            .write_string_with_format(0, c as u16, column.display_label(), &header_format)
            .map_err(xlsx_error)?;
    }

    for (r, row) in rows.iter().enumerate() {
        let excel_row = (r + 1) as u32;
        for (c, cell) in row.cells.iter().enumerate() {
            let col = c as u16;
            match cell {
                CellValue::Empty => {}
                CellValue::Text(text) => {
                    worksheet
                        .write_string(excel_row, col, text.as_str())
                        .map_err(xlsx_error)?;
                }
                CellValue::Number(n) => {
                    worksheet
                        .write_number(excel_row, col, *n)
                        .map_err(xlsx_error)?;
                }
                CellValue::Date(d) => {
                    worksheet
                        .write_number_with_format(excel_row, col, excel_serial(*d), &date_format)
                        .map_err(xlsx_error)?;
                }
            }
        }
    }

    workbook.push_worksheet(worksheet);
    workbook.save_to_buffer().map_err(xlsx_error)
}

fn xlsx_error(e: rust_xlsxwriter::XlsxError) -> DashboardError {
    DashboardError::Export(e.to_string())
}

/// Days since Excel's epoch
pub(crate) fn excel_serial(date: NaiveDate) -> f64 {
    let (y, m, d) = EXCEL_EPOCH;
    match NaiveDate::from_ymd_opt(y, m, d) {
        Some(epoch) => (date - epoch).num_days() as f64,
        None => 0.0,
    }
}

/// Worksheet names: at most 31 characters, none of `[]:*?/\`
pub(crate) fn sanitize_sheet_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| match c {
            '[' | ']' | ':' | '*' | '?' | '/' | '\\' => '_',
            other => other,
        })
        .take(MAX_SHEET_NAME)
        .collect();
    let cleaned = cleaned.trim().trim_matches('\'').to_string();
    if cleaned.is_empty() {
        "Sheet1".to_string()
    } else {
        cleaned
    }
}

/// Download file name: `<slug>_<YYYYmmdd_HHMM>.<ext>`
///
/// # Examples
/// ```
/// use chrono::NaiveDate;
/// use sheetboard::export::{export_filename, ExportFormat};
///
/// let at = NaiveDate::from_ymd_opt(2024, 3, 5).unwrap().and_hms_opt(14, 7, 0).unwrap();
/// assert_eq!(
///     export_filename("Sales Report (Q1)", ExportFormat::Xlsx, at),
///     "sales_report_q1_20240305_1407.xlsx"
/// );
/// ```
pub fn export_filename(title: &str, format: ExportFormat, timestamp: NaiveDateTime) -> String {
    let mut slug = String::new();
    for c in title.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.is_empty() && !slug.ends_with('_') {
            slug.push('_');
        }
    }
    let slug = slug.trim_end_matches('_');
    let slug = if slug.is_empty() { "export" } else { slug };

    format!(
        "{}_{}.{}",
        slug,
        timestamp.format("%Y%m%d_%H%M"),
        format.extension()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::{RawTable, Schema};
    use chrono::Utc;

    fn snapshot() -> Snapshot {
        let csv = "date,category,description,amount\n\
                   2024-01-10,Food,\"Bread, butter\",12.5\n\
                   2024-02-01,Travel,\"He said \"\"hi\"\"\",-3\n";
        let raw = RawTable::from_csv_str(csv).unwrap();
        Snapshot::from_raw(Schema::default(), &raw, Utc::now()).unwrap()
    }

    #[test]
    fn test_csv_round_trip() {
        let snapshot = snapshot();
        let rows: Vec<&Row> = snapshot.rows.iter().collect();
        let bytes = to_csv(&snapshot, &rows).unwrap();

        let raw = RawTable::from_csv_reader(bytes.as_slice()).unwrap();
        let reparsed = Snapshot::from_raw(snapshot.schema.clone(), &raw, Utc::now()).unwrap();
        assert_eq!(reparsed.rows, snapshot.rows);
        assert_eq!(reparsed.coercion_failures, 0);
    }

    #[test]
    fn test_csv_round_trip_with_unreadable_row() {
        let csv = "date,category,amount
                   not-a-date,,oops
                   2024-01-10,Food,12.5
                   2024-01-11,,bad
";
        let raw = RawTable::from_csv_str(csv).unwrap();
        let snapshot = Snapshot::from_raw(Schema::default(), &raw, Utc::now()).unwrap();
        let rows: Vec<&Row> = snapshot.rows.iter().collect();
        assert_eq!(rows.len(), 2);

        let bytes = to_csv(&snapshot, &rows).unwrap();
        let raw = RawTable::from_csv_reader(bytes.as_slice()).unwrap();
        let reparsed = Snapshot::from_raw(snapshot.schema.clone(), &raw, Utc::now()).unwrap();
        assert_eq!(reparsed.rows, snapshot.rows);
    }

    #[test]
    fn test_csv_round_trip_with_decimal_comma() {
        let schema = Schema {
            decimal_comma: true,
            ..Schema::default()
        };
        let raw = RawTable::from_csv_str("date,category,amount\n05/03/2024,A,\"1.234,5\"\n").unwrap();
        let snapshot = Snapshot::from_raw(schema, &raw, Utc::now()).unwrap();
        let rows: Vec<&Row> = snapshot.rows.iter().collect();

        let bytes = to_csv(&snapshot, &rows).unwrap();
        let text = String::from_utf8(bytes.clone()).unwrap();
        assert!(text.contains("\"1234,5\""));

        let raw = RawTable::from_csv_reader(bytes.as_slice()).unwrap();
        let reparsed = Snapshot::from_raw(snapshot.schema.clone(), &raw, Utc::now()).unwrap();
        assert_eq!(reparsed.rows, snapshot.rows);
    }

    #[test]
    fn test_xlsx_is_a_zip_archive() {
        let snapshot = snapshot();
        let rows: Vec<&Row> = snapshot.rows.iter().collect();
        let bytes = to_xlsx(&snapshot, &rows, "Report: 2024/Q1").unwrap();
        assert!(bytes.len() > 100);
        assert_eq!(&bytes[..2], b"PK");
    }

    #[test]
    fn test_format_parsing() {
        assert_eq!("CSV".parse::<ExportFormat>().unwrap(), ExportFormat::Csv);
        assert_eq!("xlsx".parse::<ExportFormat>().unwrap(), ExportFormat::Xlsx);
        assert!("pdf".parse::<ExportFormat>().is_err());
        assert!(ExportFormat::Csv.content_type().starts_with("text/csv"));
    }

    #[test]
    fn test_sanitize_sheet_name() {
        assert_eq!(sanitize_sheet_name("Report: 2024/Q1"), "Report_ 2024_Q1");
        assert_eq!(sanitize_sheet_name(""), "Sheet1");
        assert_eq!(sanitize_sheet_name(&"x".repeat(40)).len(), 31);
    }

    #[test]
    fn test_excel_serial() {
        assert_eq!(excel_serial(NaiveDate::from_ymd_opt(1900, 3, 1).unwrap()), 61.0);
        assert_eq!(excel_serial(NaiveDate::from_ymd_opt(2024, 1, 1).unwrap()), 45292.0);
    }

    #[test]
    fn test_export_filename_fallback() {
        let at = NaiveDate::from_ymd_opt(2024, 12, 31)
            .unwrap()
            .and_hms_opt(23, 59, 0)
            .unwrap();
        assert_eq!(
            export_filename("***", ExportFormat::Csv, at),
            "export_20241231_2359.csv"
        );
    }
}
