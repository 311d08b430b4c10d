#![cfg(feature = "web")]

use axum::{
    Json, Router,
    extract::{Path, State},
    http::{StatusCode, header},
    response::{Html, IntoResponse, Redirect, Response},
    routing::{get, post},
};
use axum_extra::extract::Query;
use axum_extra::extract::cookie::{Cookie, CookieJar};
use chrono::Local;
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tower_http::services::ServeDir;

use crate::chart::{self, GraphOptions, GraphType};
use crate::config::DashboardConfig;
use crate::error::{DashboardError, Result};
use crate::export::{self, ExportFormat};
use crate::session::{SESSION_COOKIE, SessionStore};
use crate::source::{self, SheetSource, SnapshotCache};
use crate::transform::{self, FilterState};
use crate::view::{DashboardView, Renderer};

/// Shared state of the dashboard server
pub struct AppState {
    pub config: DashboardConfig,
    pub cache: SnapshotCache,
    pub sessions: SessionStore,
    pub renderer: Renderer,
}

impl AppState {
    /// Assemble the state around an already built source
    pub fn new(config: DashboardConfig, source: Box<dyn SheetSource>) -> Result<Self> {
        let cache = SnapshotCache::new(
            source,
            config.schema.clone(),
            Duration::from_secs(config.fetch.cache_ttl_secs),
        );
        let sessions = SessionStore::new(Duration::from_secs(config.session_ttl_secs));
        Ok(Self {
            cache,
            sessions,
            renderer: Renderer::new()?,
            config,
        })
    }

    /// Assemble the state with the source the configuration names
    pub fn from_config(config: DashboardConfig) -> Result<Self> {
        let source = source::build_source(&config)?;
        Self::new(config, source)
    }
}

/// Query parameters shared by the dashboard, API, chart and export routes
#[derive(Debug, Default, Deserialize)]
pub struct FilterQuery {
    from: Option<String>,
    to: Option<String>,

    /// Repeated once per selected category
    #[serde(default)]
    category: Vec<String>,
    q: Option<String>,
    reset: Option<String>,

    /// Chart type override
    #[serde(rename = "type")]
    graph_type: Option<String>,
}

impl FilterQuery {
    fn has_filter(&self) -> bool {
        self.from.is_some() || self.to.is_some() || self.q.is_some() || !self.category.is_empty()
    }

    fn to_filter(&self) -> Result<FilterState> {
        FilterState::from_params(
            self.from.as_deref(),
            self.to.as_deref(),
            &self.category,
            self.q.as_deref(),
        )
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    status: String,
    message: String,
}

fn status_of(error: &DashboardError) -> StatusCode {
    match error {
        DashboardError::NotAvailable(_) => StatusCode::NOT_FOUND,
        DashboardError::Parse(_) | DashboardError::InvalidSpreadsheet(_) => StatusCode::BAD_REQUEST,
        DashboardError::Fetch(_)
        | DashboardError::UpstreamStatus { .. }
        | DashboardError::UnexpectedContent(_) => StatusCode::BAD_GATEWAY,
        DashboardError::ColumnNotFound { .. }
        | DashboardError::DuplicateColumn { .. }
        | DashboardError::Schema(_) => StatusCode::UNPROCESSABLE_ENTITY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for DashboardError {
    fn into_response(self) -> Response {
        let status = status_of(&self);
        if status.is_server_error() {
            error!("Request failed: {}", self);
        } else {
            warn!("Request rejected: {}", self);
        }
        let body = ErrorResponse {
            status: "error".to_string(),
            message: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

/// HTML error page with the same status mapping as the JSON errors
fn error_page(state: &AppState, error: DashboardError) -> Response {
    let status = status_of(&error);
    let title = match status {
        StatusCode::BAD_GATEWAY => "Spreadsheet unavailable",
        StatusCode::NOT_FOUND => "Not found",
        StatusCode::BAD_REQUEST => "Invalid request",
        _ => "Something went wrong",
    };
    match state.renderer.render_error(title, &error.to_string()) {
        Ok(html) => {
            warn!("Serving error page: {}", error);
            (status, Html(html)).into_response()
        }
        Err(_) => error.into_response(),
    }
}

fn session_cookie(id: &str) -> Cookie<'static> {
    let mut cookie = Cookie::new(SESSION_COOKIE, id.to_string());
    cookie.set_path("/");
    cookie.set_http_only(true);
    cookie
}

/// The filter a non-dashboard route works on
///
/// Explicit query parameters win; otherwise the browser's session filter is used.
fn effective_filter(state: &AppState, jar: &CookieJar, query: &FilterQuery) -> Result<FilterState> {
    if query.has_filter() {
        return query.to_filter();
    }
    Ok(jar
        .get(SESSION_COOKIE)
        .and_then(|cookie| state.sessions.get(cookie.value()))
        .map(|session| session.filter)
        .unwrap_or_default())
}

/// Build the dashboard router
///
/// # Arguments
/// * `state` - Shared application state
///
/// # Returns
/// * `Router` - All dashboard routes plus the static file service
pub fn router(state: Arc<AppState>) -> Router {
    let static_dir = state.config.static_dir.clone();
    Router::new()
        .route("/", get(dashboard))
        .route("/api/snapshot", get(api_snapshot))
        .route("/api/summary", get(api_summary))
        .route("/chart/:name", get(chart_image))
        .route("/export/:format", get(export_rows))
        .route("/refresh", post(refresh))
        .route("/health", get(health))
        .nest_service("/static", ServeDir::new(static_dir))
        .with_state(state)
}

/// Serve the dashboard until ctrl-c
pub async fn run(config: DashboardConfig) -> std::result::Result<(), Box<dyn std::error::Error>> {
    let addr = config.bind_addr()?;
    let state = Arc::new(AppState::from_config(config)?);
    info!(
        "Starting {} dashboard '{}' over {}",
        state.config.variant.label(),
        state.config.title,
        state.cache.describe()
    );

    // A failing first fetch is not fatal; requests retry it
    if let Err(e) = state.cache.snapshot().await {
        warn!("Initial fetch failed: {}", e);
    }

    let app = router(state);
    let listener = TcpListener::bind(addr).await?;
    info!("Listening on http://{}", addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for ctrl-c: {}", e);
    }
}

async fn dashboard(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    Query(query): Query<FilterQuery>,
) -> Response {
    let started = Instant::now();
    let session = state
        .sessions
        .resolve(jar.get(SESSION_COOKIE).map(|cookie| cookie.value()));
    let jar = jar.add(session_cookie(&session.id));

    let filter = if query.reset.is_some() {
        FilterState::default()
    } else if query.has_filter() {
        match query.to_filter() {
            Ok(filter) => filter,
            Err(e) => return (jar, error_page(&state, e)).into_response(),
        }
    } else {
        session.filter.clone()
    };
    state.sessions.update_filter(&session.id, filter.clone());

    let snapshot = match state.cache.snapshot().await {
        Ok(snapshot) => snapshot,
        Err(e) => return (jar, error_page(&state, e)).into_response(),
    };

    let mut view = DashboardView::build(&state.config, &snapshot, &filter);
    if let Some(reason) = state.cache.refresh_error().await {
        view.notices.insert(
            0,
            format!(
                "The latest refresh failed ({}); showing data fetched at {}.",
                reason, view.fetched_at
            ),
        );
    }
    if state.config.variant.timing_enabled() {
        view.elapsed = Some(format!("{:.1} ms", started.elapsed().as_secs_f64() * 1000.0));
    }

    match state.renderer.render_dashboard(&view) {
        Ok(html) => (jar, Html(html)).into_response(),
        Err(e) => (jar, error_page(&state, e)).into_response(),
    }
}

async fn api_snapshot(State(state): State<Arc<AppState>>) -> Result<Json<serde_json::Value>> {
    let snapshot = state.cache.snapshot().await?;
    let rows: Vec<_> = snapshot.rows.iter().map(|row| &row.cells).collect();
    Ok(Json(serde_json::json!({
        "columns": snapshot.schema.columns,
        "rows": rows,
        "fetched_at": snapshot.fetched_at,
        "coercion_failures": snapshot.coercion_failures,
        "skipped_rows": snapshot.skipped_rows,
    })))
}

async fn api_summary(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    Query(query): Query<FilterQuery>,
) -> Result<Json<serde_json::Value>> {
    let filter = effective_filter(&state, &jar, &query)?;
    let snapshot = state.cache.snapshot().await?;
    let filter = transform::clamp(&filter, &snapshot);
    let rows = transform::apply_filter(&snapshot, &filter);

    Ok(Json(serde_json::json!({
        "filter": filter,
        "summary": transform::summarize(&snapshot, &rows),
        "categories": transform::group_by_category(&snapshot, &rows),
        "monthly": transform::monthly_series(&snapshot, &rows),
    })))
}

async fn chart_image(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    jar: CookieJar,
    Query(query): Query<FilterQuery>,
) -> Result<Response> {
    let (kind, extension) = name
        .split_once('.')
        .ok_or_else(|| DashboardError::NotAvailable(format!("chart '{}'", name)))?;

    let filter = effective_filter(&state, &jar, &query)?;
    let snapshot = state.cache.snapshot().await?;
    let filter = transform::clamp(&filter, &snapshot);
    let rows = transform::apply_filter(&snapshot, &filter);
    let value_label = snapshot
        .schema
        .column(&snapshot.schema.value_column)
        .map(|c| c.display_label().to_string())
        .unwrap_or_default();

    let (series, mut options) = match kind {
        "monthly" => (
            chart::monthly_chart_series(&transform::monthly_series(&snapshot, &rows)),
            GraphOptions {
                title: format!("{} by month", value_label),
                x_label: "Month".to_string(),
                y_label: value_label,
                graph_type: GraphType::Line,
                ..GraphOptions::default()
            },
        ),
        "categories" => {
            let groups = transform::group_by_category(&snapshot, &rows);
            (
                chart::category_chart_series(&transform::top_n(
                    &groups,
                    state.config.top_categories,
                )),
                GraphOptions {
                    title: format!("{} by category", value_label),
                    x_label: "Category".to_string(),
                    y_label: value_label,
                    graph_type: GraphType::Bar,
                    ..GraphOptions::default()
                },
            )
        }
        _ => return Err(DashboardError::NotAvailable(format!("chart '{}'", name))),
    };
    if let Some(graph_type) = &query.graph_type {
        options.graph_type = graph_type.parse()?;
    }
    if series.is_empty() {
        return Err(DashboardError::NotAvailable(
            "no rows match the current filter".into(),
        ));
    }

    match extension {
        "png" => {
            let png = chart::render_png(&series, &options)?;
            Ok(([(header::CONTENT_TYPE, "image/png")], png).into_response())
        }
        "svg" => {
            let svg = chart::render_svg(&series, &options)?;
            Ok(([(header::CONTENT_TYPE, "image/svg+xml")], svg).into_response())
        }
        _ => Err(DashboardError::NotAvailable(format!("chart '{}'", name))),
    }
}

async fn export_rows(
    State(state): State<Arc<AppState>>,
    Path(format): Path<String>,
    jar: CookieJar,
    Query(query): Query<FilterQuery>,
) -> Result<Response> {
    if !state.config.variant.exports_enabled() {
        return Err(DashboardError::NotAvailable("exports".into()));
    }
    let format: ExportFormat = format.parse()?;

    let filter = effective_filter(&state, &jar, &query)?;
    let snapshot = state.cache.snapshot().await?;
    let filter = transform::clamp(&filter, &snapshot);
    let rows = transform::apply_filter(&snapshot, &filter);

    let bytes = match format {
        ExportFormat::Csv => export::to_csv(&snapshot, &rows)?,
        ExportFormat::Xlsx => export::to_xlsx(&snapshot, &rows, &state.config.title)?,
    };
    let filename = export::export_filename(&state.config.title, format, Local::now().naive_local());
    info!("Exporting {} rows as {}", rows.len(), filename);

    Ok((
        [
            (header::CONTENT_TYPE, format.content_type().to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", filename),
            ),
        ],
        bytes,
    )
        .into_response())
}

async fn refresh(State(state): State<Arc<AppState>>) -> Response {
    match state.cache.refresh().await {
        Ok(outcome) => {
            match &outcome.stale_reason {
                Some(reason) => warn!(
                    "Manual refresh failed, keeping {} cached rows: {}",
                    outcome.snapshot.len(),
                    reason
                ),
                None => info!("Manual refresh loaded {} rows", outcome.snapshot.len()),
            }
            Redirect::to("/").into_response()
        }
        Err(e) => error_page(&state, e),
    }
}

async fn health(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let rows = state.cache.cached().await.map(|snapshot| snapshot.len());
    let age = state.cache.age().await.map(|age| age.as_secs());
    Json(serde_json::json!({
        "status": "ok",
        "variant": state.config.variant.label(),
        "source": state.cache.describe(),
        "rows": rows,
        "snapshot_age_secs": age,
        "sessions": state.sessions.len(),
    }))
}
