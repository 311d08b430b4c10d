/*!
# Sheetboard

A browser dashboard over a remote spreadsheet, built in Rust.

## Overview

The dashboard reads a worksheet (a Google Sheets document, any CSV URL or a
local CSV file), coerces it into typed rows following a declared schema and
renders summary cards, category and monthly tables, charts and a row preview.
Each browser keeps its own filter (date range, categories, search text) in a
server-side session.

Two binaries share the library:

- `app` serves the production dashboard
- `app_homolog` serves the staging (homologation) copy, which also offers CSV and
  Excel downloads of the filtered rows, a per-month calendar view and a render timer

## Architecture

### Data Layer
- **table**: Column schema, cell coercion and the immutable `Snapshot`
- **source**: Sheet fetching over HTTP or from disk, plus the TTL snapshot cache

### Transformation Layer
- **transform**: Filtering, summaries, category grouping and monthly series
- **calendar**: Month grids with per-day totals

### Presentation Layer
- **chart**: PNG and SVG charts with plotters
- **export**: CSV and XLSX downloads
- **view**: View model and handlebars rendering
- **session**: Per-browser filter state
- **app**: axum routes

## REST API Endpoints

- `GET /` - Dashboard page
- `GET /api/snapshot` - Typed rows as JSON
- `GET /api/summary` - Aggregates for a filter
- `GET /chart/{name}` - `monthly` or `categories` chart, `.png` or `.svg`
- `GET /export/{format}` - `csv` or `xlsx` download (staging only)
- `POST /refresh` - Refetch the sheet
- `GET /health` - Cache and session status
*/

pub mod calendar;
pub mod config;
pub mod error;
pub mod table;
pub mod transform;

#[cfg(feature = "web")]
pub mod app;
#[cfg(feature = "web")]
pub mod chart;
#[cfg(feature = "web")]
pub mod export;
#[cfg(feature = "web")]
pub mod logging;
#[cfg(feature = "web")]
pub mod session;
#[cfg(feature = "web")]
pub mod source;
#[cfg(feature = "web")]
pub mod view;

pub use config::{DashboardConfig, Variant};
pub use error::{DashboardError, Result};
pub use table::{CellValue, ColumnKind, ColumnSpec, RawTable, Row, Schema, Snapshot};
pub use transform::FilterState;
