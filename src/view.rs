#![cfg(feature = "web")]

use chrono::{NaiveDate, Weekday};
use handlebars::Handlebars;
use serde::Serialize;

use crate::calendar::{self, MonthCalendar};
use crate::config::DashboardConfig;
use crate::error::{DashboardError, Result};
use crate::table::{CellValue, Snapshot};
use crate::transform::{self, FilterState};

const DASHBOARD_TEMPLATE: &str = include_str!("./templates/dashboard.hbs");
const ERROR_TEMPLATE: &str = include_str!("./templates/error.hbs");

/// Current filter as shown in the filter form
#[derive(Debug, Clone, Serialize)]
pub struct FilterForm {
    pub from: String,
    pub to: String,

    /// Earliest and latest selectable dates
    pub min: String,
    pub max: String,
    pub search: String,
    pub options: Vec<CategoryOption>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CategoryOption {
    pub name: String,
    pub selected: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct SummaryCard {
    pub label: String,
    pub value: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CategoryRow {
    pub name: String,
    pub count: usize,
    pub total: String,
    pub share: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct MonthlyRow {
    pub label: String,
    pub count: usize,
    pub total: String,
}

/// First rows of the filtered table, already formatted
#[derive(Debug, Clone, Serialize)]
pub struct TablePreview {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
    pub shown: usize,
    pub total: usize,
    pub truncated: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChartLink {
    pub title: String,
    pub png: String,
    pub svg: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExportLink {
    pub label: String,
    pub url: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct DayView {
    pub day: u32,
    pub intensity: u8,
    pub total: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CalendarView {
    pub title: String,
    pub total: String,
    pub active_days: usize,
    pub weeks: Vec<Vec<Option<DayView>>>,
}

/// Everything the dashboard page shows
///
/// Built from a snapshot and a filter only; the same inputs always produce
/// the same view.
#[derive(Debug, Clone, Serialize)]
pub struct DashboardView {
    pub title: String,
    pub variant: &'static str,
    pub is_staging: bool,
    pub fetched_at: String,
    pub has_data: bool,
    pub filter: FilterForm,
    pub cards: Vec<SummaryCard>,
    pub categories: Vec<CategoryRow>,
    pub monthly: Vec<MonthlyRow>,
    pub table: TablePreview,
    pub charts: Vec<ChartLink>,
    pub exports: Vec<ExportLink>,
    pub weekdays: Vec<&'static str>,
    pub calendars: Vec<CalendarView>,
    pub notices: Vec<String>,

    /// Build time, staging only; filled in by the request handler
    pub elapsed: Option<String>,
}

impl DashboardView {
    /// Build the view model
    ///
    /// # Arguments
    /// * `config` - Dashboard configuration (title, variant, sizes)
    /// * `snapshot` - Current snapshot
    /// * `filter` - Filter requested by the browser; clamped to the snapshot first
    pub fn build(config: &DashboardConfig, snapshot: &Snapshot, filter: &FilterState) -> Self {
        let decimal_comma = snapshot.schema.decimal_comma;
        let filter = transform::clamp(filter, snapshot);
        let rows = transform::apply_filter(snapshot, &filter);

        let summary = transform::summarize(snapshot, &rows);
        let groups = transform::group_by_category(snapshot, &rows);
        let monthly = transform::monthly_series(snapshot, &rows);
        let query = filter_query(&filter);

        let number = |v: f64| format_number(v, decimal_comma);
        let date = |d: Option<NaiveDate>| {
            d.map(|d| format_date(d, decimal_comma))
                .unwrap_or_else(|| "-".to_string())
        };

        let cards = vec![
            SummaryCard {
                label: "Rows".into(),
                value: summary.rows.to_string(),
            },
            SummaryCard {
                label: "Total".into(),
                value: number(summary.total),
            },
            SummaryCard {
                label: "Average".into(),
                value: summary.mean.map(number).unwrap_or_else(|| "-".into()),
            },
            SummaryCard {
                label: "Largest".into(),
                value: summary.max.map(number).unwrap_or_else(|| "-".into()),
            },
            SummaryCard {
                label: "Categories".into(),
                value: summary.categories.to_string(),
            },
            SummaryCard {
                label: "Period".into(),
                value: format!("{} – {}", date(summary.first_date), date(summary.last_date)),
            },
        ];

        let (min, max) = snapshot
            .date_bounds()
            .map(|(min, max)| (iso(min), iso(max)))
            .unwrap_or_default();
        let mut category_names = snapshot.categories();
        if snapshot.rows.iter().any(|row| snapshot.category_of(row).is_empty()) {
            category_names.push(transform::BLANK_CATEGORY.to_string());
        }
        let filter_form = FilterForm {
            from: filter.from.map(iso).unwrap_or_default(),
            to: filter.to.map(iso).unwrap_or_default(),
            min,
            max,
            search: filter.search.clone().unwrap_or_default(),
            options: category_names
                .into_iter()
                .map(|name| CategoryOption {
                    selected: filter.categories.contains(&name),
                    name,
                })
                .collect(),
        };

        let categories = transform::top_n(&groups, config.top_categories)
            .into_iter()
            .map(|g| CategoryRow {
                name: g.category,
                count: g.count,
                total: number(g.total),
                share: format!("{:.1}%", g.share * 100.0),
            })
            .collect();

        let monthly_rows = monthly
            .iter()
            .map(|p| MonthlyRow {
                label: p.label.clone(),
                count: p.count,
                total: number(p.total),
            })
            .collect();

        let shown: Vec<Vec<String>> = rows
            .iter()
            .take(config.table_rows)
            .map(|row| {
                row.cells
                    .iter()
                    .map(|cell| format_cell(cell, decimal_comma))
                    .collect()
            })
            .collect();
        let table = TablePreview {
            headers: snapshot
                .schema
                .columns
                .iter()
                .map(|c| c.display_label().to_string())
                .collect(),
            shown: shown.len(),
            total: rows.len(),
            truncated: shown.len() < rows.len(),
            rows: shown,
        };

        let charts = if rows.is_empty() {
            Vec::new()
        } else {
            vec![
                ChartLink {
                    title: "Monthly total".into(),
                    png: with_query("/chart/monthly.png", &query),
                    svg: with_query("/chart/monthly.svg", &query),
                },
                ChartLink {
                    title: "Total by category".into(),
                    png: with_query("/chart/categories.png", &query),
                    svg: with_query("/chart/categories.svg", &query),
                },
            ]
        };

        let variant = config.variant;
        let exports = if variant.exports_enabled() {
            vec![
                ExportLink {
                    label: "Download CSV".into(),
                    url: with_query("/export/csv", &query),
                },
                ExportLink {
                    label: "Download Excel".into(),
                    url: with_query("/export/xlsx", &query),
                },
            ]
        } else {
            Vec::new()
        };

        let calendars = match (variant.calendar_enabled(), filter.from, filter.to) {
            (true, Some(from), Some(to)) => {
                let totals = transform::daily_totals(snapshot, &rows);
                calendar::calendars_for_range(from, to, &totals, config.calendar_months)
                    .iter()
                    .map(|month| calendar_view(month, decimal_comma))
                    .collect()
            }
            _ => Vec::new(),
        };

        let mut notices = Vec::new();
        if snapshot.coercion_failures > 0 {
            notices.push(format!(
                "{} cell(s) in the sheet did not match their column type and are shown empty.",
                snapshot.coercion_failures
            ));
        }
        if !snapshot.is_empty() && rows.is_empty() {
            notices.push("No rows match the current filter.".to_string());
        }

        Self {
            title: config.title.clone(),
            variant: variant.label(),
            is_staging: variant.is_staging(),
            fetched_at: snapshot.fetched_at.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
            has_data: !rows.is_empty(),
            filter: filter_form,
            cards,
            categories,
            monthly: monthly_rows,
            table,
            charts,
            exports,
            weekdays: calendar::weekday_headers(Weekday::Sun),
            calendars,
            notices,
            elapsed: None,
        }
    }
}

fn calendar_view(month: &MonthCalendar, decimal_comma: bool) -> CalendarView {
    CalendarView {
        title: month.title.clone(),
        total: format_number(month.total, decimal_comma),
        active_days: month.active_days,
        weeks: month
            .weeks
            .iter()
            .map(|week| {
                week.iter()
                    .map(|slot| {
                        slot.as_ref().map(|day| DayView {
                            day: day.day,
                            intensity: day.intensity,
                            total: day
                                .total
                                .map(|t| format_number(t, decimal_comma))
                                .unwrap_or_default(),
                        })
                    })
                    .collect()
            })
            .collect(),
    }
}

fn iso(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

fn with_query(path: &str, query: &str) -> String {
    if query.is_empty() {
        path.to_string()
    } else {
        format!("{}?{}", path, query)
    }
}

/// Query string carrying a filter, as understood by every dashboard route
pub fn filter_query(filter: &FilterState) -> String {
    let mut parts = Vec::new();
    if let Some(from) = filter.from {
        parts.push(format!("from={}", iso(from)));
    }
    if let Some(to) = filter.to {
        parts.push(format!("to={}", iso(to)));
    }
    for category in &filter.categories {
        parts.push(format!("category={}", urlencoding::encode(category)));
    }
    if let Some(search) = &filter.search {
        parts.push(format!("q={}", urlencoding::encode(search)));
    }
    parts.join("&")
}

/// Two decimals with thousands grouping
///
/// # Examples
/// ```
/// use sheetboard::view::format_number;
///
/// assert_eq!(format_number(1234567.891, false), "1,234,567.89");
/// assert_eq!(format_number(-1234.5, true), "-1.234,50");
/// ```
pub fn format_number(value: f64, decimal_comma: bool) -> String {
    let (thousands, decimal) = if decimal_comma { ('.', ',') } else { (',', '.') };
    let text = format!("{:.2}", value.abs());
    let (whole, fraction) = text.split_once('.').unwrap_or((text.as_str(), "00"));

    let mut grouped = String::with_capacity(whole.len() + whole.len() / 3);
    for (i, digit) in whole.chars().enumerate() {
        if i > 0 && (whole.len() - i) % 3 == 0 {
            grouped.push(thousands);
        }
        grouped.push(digit);
    }

    let is_zero = text.chars().all(|c| c == '0' || c == '.');
    let sign = if value < 0.0 && !is_zero { "-" } else { "" };
    format!("{}{}{}{}", sign, grouped, decimal, fraction)
}

pub fn format_date(date: NaiveDate, decimal_comma: bool) -> String {
    if decimal_comma {
        date.format("%d/%m/%Y").to_string()
    } else {
        iso(date)
    }
}

fn format_cell(cell: &CellValue, decimal_comma: bool) -> String {
    match cell {
        CellValue::Empty => String::new(),
        CellValue::Text(text) => text.clone(),
        CellValue::Number(n) => format_number(*n, decimal_comma),
        CellValue::Date(d) => format_date(*d, decimal_comma),
    }
}

/// Renders pages from the embedded handlebars templates
///
/// HTML escaping stays on: every value interpolated with `{{ }}` is escaped,
/// so sheet contents cannot inject markup.
pub struct Renderer {
    registry: Handlebars<'static>,
}

impl Renderer {
    pub fn new() -> Result<Self> {
        let mut registry = Handlebars::new();
        registry
            .register_template_string("dashboard", DASHBOARD_TEMPLATE)
            .map_err(|e| DashboardError::Render(e.to_string()))?;
        registry
            .register_template_string("error", ERROR_TEMPLATE)
            .map_err(|e| DashboardError::Render(e.to_string()))?;
        Ok(Self { registry })
    }

    pub fn render_dashboard(&self, view: &DashboardView) -> Result<String> {
        self.registry
            .render("dashboard", view)
            .map_err(|e| DashboardError::Render(e.to_string()))
    }

    pub fn render_error(&self, title: &str, message: &str) -> Result<String> {
        let context = serde_json::json!({
            "title": title,
            "message": message,
        });
        self.registry
            .render("error", &context)
            .map_err(|e| DashboardError::Render(e.to_string()))
    }
}
