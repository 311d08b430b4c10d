use chrono::{Datelike, NaiveDate, Weekday};
use serde::Serialize;
use std::collections::BTreeMap;

use crate::transform::next_month;

/// One day cell of a month calendar
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CalendarDay {
    pub date: NaiveDate,

    /// Day of month, 1-based
    pub day: u32,

    /// Sum of the value column on this day, None when no row falls on it
    pub total: Option<f64>,

    /// Heat level 0-4 relative to the busiest day in view
    pub intensity: u8,
}

/// A month laid out as calendar weeks
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MonthCalendar {
    pub year: i32,
    pub month: u32,

    /// e.g. "March 2024"
    pub title: String,

    /// Rows of seven slots; `None` pads days outside the month
    pub weeks: Vec<Vec<Option<CalendarDay>>>,

    pub total: f64,

    /// Days with at least one row
    pub active_days: usize,
}

pub fn month_name(month: u32) -> &'static str {
    match month {
        1 => "January",
        2 => "February",
        3 => "March",
        4 => "April",
        5 => "May",
        6 => "June",
        7 => "July",
        8 => "August",
        9 => "September",
        10 => "October",
        11 => "November",
        12 => "December",
        _ => "",
    }
}

/// Short weekday headers starting at `first_weekday`
pub fn weekday_headers(first_weekday: Weekday) -> Vec<&'static str> {
    let mut day = first_weekday;
    let mut headers = Vec::with_capacity(7);
    for _ in 0..7 {
        headers.push(match day {
            Weekday::Mon => "Mon",
            Weekday::Tue => "Tue",
            Weekday::Wed => "Wed",
            Weekday::Thu => "Thu",
            Weekday::Fri => "Fri",
            Weekday::Sat => "Sat",
            Weekday::Sun => "Sun",
        });
        day = day.succ();
    }
    headers
}

fn days_in_month(year: i32, month: u32) -> Option<u32> {
    let (next_year, next) = next_month(year, month);
    let first_of_next = NaiveDate::from_ymd_opt(next_year, next, 1)?;
    first_of_next.pred_opt().map(|d| d.day())
}

fn intensity(total: f64, scale: f64) -> u8 {
    if scale <= 0.0 || total == 0.0 {
        return 0;
    }
    let level = (total.abs() / scale * 4.0).ceil();
    level.clamp(1.0, 4.0) as u8
}

/// Lay out one month
///
/// # Arguments
/// * `year`, `month` - The month to lay out
/// * `totals` - Daily totals; days missing from the map are empty
/// * `first_weekday` - Weekday of the first column
/// * `scale` - Absolute total mapped to the highest intensity
///
/// # Returns
/// * `Option<MonthCalendar>` - None for an invalid month
pub fn month_grid(
    year: i32,
    month: u32,
    totals: &BTreeMap<NaiveDate, f64>,
    first_weekday: Weekday,
    scale: f64,
) -> Option<MonthCalendar> {
    let first = NaiveDate::from_ymd_opt(year, month, 1)?;
    let length = days_in_month(year, month)?;

    let offset = (first.weekday().num_days_from_monday() + 7
        - first_weekday.num_days_from_monday())
        % 7;

    let mut slots: Vec<Option<CalendarDay>> = vec![None; offset as usize];
    let mut month_total = 0.0;
    let mut active_days = 0;

    for day in 1..=length {
        let date = NaiveDate::from_ymd_opt(year, month, day)?;
        let total = totals.get(&date).copied();
        if let Some(value) = total {
            month_total += value;
            active_days += 1;
        }
        slots.push(Some(CalendarDay {
            date,
            day,
            total,
            intensity: total.map(|v| intensity(v, scale)).unwrap_or(0),
        }));
    }
    while slots.len() % 7 != 0 {
        slots.push(None);
    }

    Some(MonthCalendar {
        year,
        month,
        title: format!("{} {}", month_name(month), year),
        weeks: slots.chunks(7).map(|week| week.to_vec()).collect(),
        total: month_total,
        active_days,
    })
}

/// Every (year, month) from `from` to `to`, inclusive; empty when inverted
pub fn months_between(from: NaiveDate, to: NaiveDate) -> Vec<(i32, u32)> {
    let mut months = Vec::new();
    let last = (to.year(), to.month());
    let mut current = (from.year(), from.month());
    while current <= last {
        months.push(current);
        current = next_month(current.0, current.1);
    }
    months
}

/// Calendars for the most recent `max_months` months of a date range
///
/// Intensities share one scale: the largest absolute daily total in the range.
pub fn calendars_for_range(
    from: NaiveDate,
    to: NaiveDate,
    totals: &BTreeMap<NaiveDate, f64>,
    max_months: usize,
) -> Vec<MonthCalendar> {
    if from > to {
        return Vec::new();
    }
    let scale = totals
        .range(from..=to)
        .map(|(_, v)| v.abs())
        .fold(0.0, f64::max);

    let months = months_between(from, to);
    let skip = months.len().saturating_sub(max_months);
    months
        .into_iter()
        .skip(skip)
        .filter_map(|(year, month)| month_grid(year, month, totals, Weekday::Sun, scale))
        .collect()
}
