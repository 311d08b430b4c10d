use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::error::{DashboardError, Result};
use crate::table::{CellValue, Row, Snapshot};

/// Label used for rows whose category cell is blank
pub const BLANK_CATEGORY: &str = "(blank)";

/// Label of the bucket `top_n` folds the tail into
pub const OTHER_CATEGORY: &str = "Other";

/// Widget state of the dashboard: date range, category selection and free-text search
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterState {
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,

    /// Selected categories; empty selects everything
    #[serde(default)]
    pub categories: Vec<String>,

    /// Case-insensitive substring matched against text cells
    #[serde(default)]
    pub search: Option<String>,
}

impl FilterState {
    /// Build a filter from raw request parameters
    ///
    /// # Arguments
    /// * `from`, `to` - `YYYY-MM-DD` strings; blank means unset
    /// * `categories` - Selected categories, trimmed and de-duplicated
    /// * `search` - Search text; blank means none
    ///
    /// # Errors
    /// * `Parse` if a date is not `YYYY-MM-DD`
    pub fn from_params(
        from: Option<&str>,
        to: Option<&str>,
        categories: &[String],
        search: Option<&str>,
    ) -> Result<Self> {
        let mut seen = BTreeSet::new();
        let categories = categories
            .iter()
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty() && seen.insert(c.clone()))
            .collect();

        Ok(Self {
            from: parse_param_date("from", from)?,
            to: parse_param_date("to", to)?,
            categories,
            search: search
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string),
        })
    }

    pub fn is_default(&self) -> bool {
        *self == Self::default()
    }
}

fn parse_param_date(name: &str, value: Option<&str>) -> Result<Option<NaiveDate>> {
    match value.map(str::trim).filter(|v| !v.is_empty()) {
        None => Ok(None),
        Some(text) => NaiveDate::parse_from_str(text, "%Y-%m-%d")
            .map(Some)
            .map_err(|_| DashboardError::Parse(format!("'{}' is not a valid {} date", text, name))),
    }
}

/// Clamp the filter's date range to the snapshot's observed dates
///
/// Unset bounds default to the snapshot's first and last date, bounds outside
/// the observed range are pulled in, and an inverted range is swapped. A
/// snapshot without dates leaves the bounds unset.
pub fn clamp(filter: &FilterState, snapshot: &Snapshot) -> FilterState {
    let mut clamped = filter.clone();
    match snapshot.date_bounds() {
        Some((min, max)) => {
            let from = filter.from.unwrap_or(min).clamp(min, max);
            let to = filter.to.unwrap_or(max).clamp(min, max);
            let (from, to) = if from <= to { (from, to) } else { (to, from) };
            clamped.from = Some(from);
            clamped.to = Some(to);
        }
        None => {
            clamped.from = None;
            clamped.to = None;
        }
    }
    clamped
}

/// Rows matching the filter, in sheet order
///
/// Rows without a date are excluded whenever a date bound is set.
pub fn apply_filter<'a>(snapshot: &'a Snapshot, filter: &FilterState) -> Vec<&'a Row> {
    let needle = filter.search.as_ref().map(|s| s.to_lowercase());

    snapshot
        .rows
        .iter()
        .filter(|row| {
            if filter.from.is_some() || filter.to.is_some() {
                match snapshot.date_of(row) {
                    Some(date) => {
                        if filter.from.is_some_and(|from| date < from)
                            || filter.to.is_some_and(|to| date > to)
                        {
                            return false;
                        }
                    }
                    None => return false,
                }
            }

            if !filter.categories.is_empty() {
                let category = match snapshot.category_of(row) {
                    "" => BLANK_CATEGORY,
                    name => name,
                };
                if !filter.categories.iter().any(|c| c == category) {
                    return false;
                }
            }

            match &needle {
                Some(needle) => row.cells.iter().any(|cell| match cell {
                    CellValue::Text(text) => text.to_lowercase().contains(needle.as_str()),
                    _ => false,
                }),
                None => true,
            }
        })
        .collect()
}

/// Headline figures for a set of rows
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Summary {
    pub rows: usize,

    /// Sum of the value column over rows that have a value
    pub total: f64,

    /// Mean over rows that have a value
    pub mean: Option<f64>,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub first_date: Option<NaiveDate>,
    pub last_date: Option<NaiveDate>,

    /// Distinct categories present, blank included
    pub categories: usize,
}

pub fn summarize(snapshot: &Snapshot, rows: &[&Row]) -> Summary {
    let values: Vec<f64> = rows.iter().filter_map(|row| snapshot.value_of(row)).collect();
    let total: f64 = values.iter().sum();
    let dates: Vec<NaiveDate> = rows.iter().filter_map(|row| snapshot.date_of(row)).collect();
    let categories: BTreeSet<&str> = rows.iter().map(|row| snapshot.category_of(row)).collect();

    Summary {
        rows: rows.len(),
        total,
        mean: if values.is_empty() {
            None
        } else {
            Some(total / values.len() as f64)
        },
        min: values.iter().copied().reduce(f64::min),
        max: values.iter().copied().reduce(f64::max),
        first_date: dates.iter().min().copied(),
        last_date: dates.iter().max().copied(),
        categories: categories.len(),
    }
}

/// Aggregate of one category
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CategoryTotal {
    pub category: String,
    pub count: usize,
    pub total: f64,

    /// Fraction of the overall absolute total, 0 when everything sums to 0
    pub share: f64,
}

/// Totals per category, largest first, ties broken by name
pub fn group_by_category(snapshot: &Snapshot, rows: &[&Row]) -> Vec<CategoryTotal> {
    let mut groups: HashMap<&str, (usize, f64)> = HashMap::new();
    for row in rows {
        let category = match snapshot.category_of(row) {
            "" => BLANK_CATEGORY,
            name => name,
        };
        let entry = groups.entry(category).or_insert((0, 0.0));
        entry.0 += 1;
        entry.1 += snapshot.value_of(row).unwrap_or(0.0);
    }

    let mut totals: Vec<CategoryTotal> = groups
        .into_iter()
        .map(|(category, (count, total))| CategoryTotal {
            category: category.to_string(),
            count,
            total,
            share: 0.0,
        })
        .collect();
    sort_by_total(&mut totals);
    update_shares(&mut totals);
    totals
}

/// Keep the `n` largest groups and fold the remainder into a single "Other" row
pub fn top_n(groups: &[CategoryTotal], n: usize) -> Vec<CategoryTotal> {
    if groups.len() <= n {
        return groups.to_vec();
    }

    let keep = n.saturating_sub(1);
    let mut result: Vec<CategoryTotal> = groups[..keep].to_vec();
    let rest = &groups[keep..];
    result.push(CategoryTotal {
        category: OTHER_CATEGORY.to_string(),
        count: rest.iter().map(|g| g.count).sum(),
        total: rest.iter().map(|g| g.total).sum(),
        share: rest.iter().map(|g| g.share).sum(),
    });
    result
}

fn sort_by_total(totals: &mut [CategoryTotal]) {
    totals.sort_by(|a, b| {
        b.total
            .total_cmp(&a.total)
            .then_with(|| a.category.cmp(&b.category))
    });
}

fn update_shares(totals: &mut [CategoryTotal]) {
    let absolute: f64 = totals.iter().map(|t| t.total.abs()).sum();
    for total in totals.iter_mut() {
        total.share = if absolute > 0.0 {
            total.total.abs() / absolute
        } else {
            0.0
        };
    }
}

/// One month of the monthly series
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MonthlyPoint {
    pub year: i32,
    pub month: u32,

    /// `YYYY-MM`
    pub label: String,
    pub count: usize,
    pub total: f64,
}

/// Totals per calendar month between the first and last dated row
///
/// Months without rows are present with zero totals, so the series has no gaps.
pub fn monthly_series(snapshot: &Snapshot, rows: &[&Row]) -> Vec<MonthlyPoint> {
    let mut buckets: BTreeMap<(i32, u32), (usize, f64)> = BTreeMap::new();
    for row in rows {
        if let Some(date) = snapshot.date_of(row) {
            let entry = buckets.entry((date.year(), date.month())).or_insert((0, 0.0));
            entry.0 += 1;
            entry.1 += snapshot.value_of(row).unwrap_or(0.0);
        }
    }

    let (Some(first), Some(last)) = (
        buckets.keys().next().copied(),
        buckets.keys().next_back().copied(),
    ) else {
        return Vec::new();
    };

    let mut series = Vec::new();
    let (mut year, mut month) = first;
    while (year, month) <= last {
        let (count, total) = buckets.get(&(year, month)).copied().unwrap_or((0, 0.0));
        series.push(MonthlyPoint {
            year,
            month,
            label: format!("{:04}-{:02}", year, month),
            count,
            total,
        });
        (year, month) = next_month(year, month);
    }
    series
}

pub(crate) fn next_month(year: i32, month: u32) -> (i32, u32) {
    if month >= 12 { (year + 1, 1) } else { (year, month + 1) }
}

/// Sum of the value column per day
pub fn daily_totals(snapshot: &Snapshot, rows: &[&Row]) -> BTreeMap<NaiveDate, f64> {
    let mut totals = BTreeMap::new();
    for row in rows {
        if let Some(date) = snapshot.date_of(row) {
            *totals.entry(date).or_insert(0.0) += snapshot.value_of(row).unwrap_or(0.0);
        }
    }
    totals
}
