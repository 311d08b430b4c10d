//! Router tests: requests go through the full axum stack without a socket.

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use sheetboard::app::{AppState, router};
use sheetboard::config::{DashboardConfig, Variant};
use sheetboard::source::CsvFileSource;
use std::io::Write;
use std::sync::Arc;
use tempfile::NamedTempFile;
use tower::ServiceExt;

const CSV: &str = "date,category,description,amount\n\
                   2024-01-05,Food,Groceries,100\n\
                   2024-01-20,Travel,Train,40\n\
                   2024-02-03,Food,Bakery,12.5\n\
                   2024-03-11,Rent,March,900\n";

struct TestApp {
    router: Router,
    file: NamedTempFile,
}

fn test_app(variant: Variant, csv: &str) -> TestApp {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(csv.as_bytes()).unwrap();

    let config = DashboardConfig {
        title: "Team Expenses".to_string(),
        variant,
        ..DashboardConfig::default()
    };
    let source = CsvFileSource::new(file.path());
    let state = AppState::new(config, Box::new(source)).unwrap();

    TestApp {
        router: router(Arc::new(state)),
        file,
    }
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn get_with_cookie(uri: &str, cookie: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .header(header::COOKIE, cookie)
        .body(Body::empty())
        .unwrap()
}

async fn send(app: &TestApp, request: Request<Body>) -> (StatusCode, axum::http::HeaderMap, String) {
    let response = app.router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, headers, String::from_utf8_lossy(&bytes).into_owned())
}

fn session_cookie(headers: &axum::http::HeaderMap) -> String {
    let set_cookie = headers
        .get(header::SET_COOKIE)
        .expect("session cookie is set")
        .to_str()
        .unwrap();
    set_cookie.split(';').next().unwrap().to_string()
}

#[tokio::test]
async fn test_dashboard_renders_production_page() {
    let app = test_app(Variant::Production, CSV);
    let (status, headers, body) = send(&app, get("/")).await;

    assert_eq!(status, StatusCode::OK);
    assert!(session_cookie(&headers).starts_with("sheetboard_session="));
    assert!(body.contains("Team Expenses"));
    assert!(body.contains("1,052.50"));
    assert!(body.contains("/chart/monthly.png"));
    assert!(!body.contains("/export/csv"));
    assert!(!body.contains("Rendered in"));
}

#[tokio::test]
async fn test_dashboard_renders_staging_extras() {
    let app = test_app(Variant::Staging, CSV);
    let (status, _, body) = send(&app, get("/")).await;

    assert_eq!(status, StatusCode::OK);
    assert!(body.contains("/export/csv"));
    assert!(body.contains("/export/xlsx"));
    assert!(body.contains("January 2024"));
    assert!(body.contains("Rendered in"));
}

#[tokio::test]
async fn test_session_keeps_filter_between_requests() {
    let app = test_app(Variant::Production, CSV);

    let (status, headers, body) = send(&app, get("/?category=Food")).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.contains("<option value=\"Food\" selected>"));
    let cookie = session_cookie(&headers);

    let (_, _, body) = send(&app, get_with_cookie("/", &cookie)).await;
    assert!(body.contains("<option value=\"Food\" selected>"));
    assert!(body.contains("112.50"));

    let (_, _, body) = send(&app, get_with_cookie("/?reset=1", &cookie)).await;
    assert!(!body.contains("<option value=\"Food\" selected>"));

    // Another browser starts from the default filter
    let (_, _, body) = send(&app, get("/")).await;
    assert!(!body.contains("<option value=\"Food\" selected>"));
}

#[tokio::test]
async fn test_invalid_date_is_a_bad_request() {
    let app = test_app(Variant::Production, CSV);
    let (status, _, body) = send(&app, get("/?from=05/01/2024")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body.contains("05/01/2024"));
}

#[tokio::test]
async fn test_sheet_markup_is_escaped() {
    let csv = "date,category,description,amount\n\
               2024-01-05,<script>alert('x')</script>,<img src=x onerror=alert(1)>,1\n";
    let app = test_app(Variant::Staging, csv);
    let (status, _, body) = send(&app, get("/")).await;

    assert_eq!(status, StatusCode::OK);
    assert!(!body.contains("<script>alert"));
    assert!(!body.contains("<img src=x"));
    assert!(body.contains("&lt;script&gt;"));
}

#[tokio::test]
async fn test_api_summary_applies_query_filter() {
    let app = test_app(Variant::Production, CSV);
    let (status, _, body) = send(&app, get("/api/summary?category=Food")).await;
    assert_eq!(status, StatusCode::OK);

    let json: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(json["summary"]["rows"], 2);
    assert_eq!(json["summary"]["total"], 112.5);
    assert_eq!(json["categories"][0]["category"], "Food");
    assert_eq!(json["monthly"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn test_api_snapshot_returns_typed_rows() {
    let app = test_app(Variant::Production, CSV);
    let (status, _, body) = send(&app, get("/api/snapshot")).await;
    assert_eq!(status, StatusCode::OK);

    let json: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(json["rows"].as_array().unwrap().len(), 4);
    assert_eq!(json["rows"][0][0], "2024-01-05");
    assert_eq!(json["rows"][0][3], 100.0);
    assert_eq!(json["columns"][1]["name"], "category");
}

#[tokio::test]
async fn test_export_is_not_available_in_production() {
    let app = test_app(Variant::Production, CSV);
    let (status, _, body) = send(&app, get("/export/csv")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body.contains("\"status\":\"error\""));
}

#[tokio::test]
async fn test_export_csv_in_staging() {
    let app = test_app(Variant::Staging, CSV);
    let (status, headers, body) = send(&app, get("/export/csv?category=Travel")).await;

    assert_eq!(status, StatusCode::OK);
    assert!(headers[header::CONTENT_TYPE].to_str().unwrap().starts_with("text/csv"));
    let disposition = headers[header::CONTENT_DISPOSITION].to_str().unwrap();
    assert!(disposition.starts_with("attachment; filename=\"team_expenses_"));
    assert!(disposition.ends_with(".csv\""));

    let lines: Vec<&str> = body.lines().collect();
    assert_eq!(lines, vec!["date,category,description,amount", "2024-01-20,Travel,Train,40"]);
}

#[tokio::test]
async fn test_export_xlsx_in_staging() {
    let app = test_app(Variant::Staging, CSV);
    let response = app.router.clone().oneshot(get("/export/xlsx")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    assert_eq!(&bytes[..2], b"PK");
}

#[tokio::test]
async fn test_unknown_export_format_is_rejected() {
    let app = test_app(Variant::Staging, CSV);
    let (status, _, _) = send(&app, get("/export/pdf")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_unknown_chart_is_not_found() {
    let app = test_app(Variant::Production, CSV);
    let (status, _, _) = send(&app, get("/chart/pie.png")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _, _) = send(&app, get("/chart/monthly.gif")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _, _) = send(&app, get("/chart/monthly.png?q=no-such-row")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _, _) = send(&app, get("/chart/monthly.png?type=pie")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_refresh_redirects_to_dashboard() {
    let app = test_app(Variant::Production, CSV);
    let request = Request::builder()
        .method("POST")
        .uri("/refresh")
        .body(Body::empty())
        .unwrap();
    let (status, headers, _) = send(&app, request).await;

    assert_eq!(status, StatusCode::SEE_OTHER);
    assert_eq!(headers[header::LOCATION], "/");
}

#[tokio::test]
async fn test_failed_refresh_is_shown_on_dashboard() {
    let app = test_app(Variant::Production, CSV);
    let (status, _, body) = send(&app, get("/")).await;
    assert_eq!(status, StatusCode::OK);
    assert!(!body.contains("latest refresh failed"));

    std::fs::remove_file(app.file.path()).unwrap();
    let request = Request::builder()
        .method("POST")
        .uri("/refresh")
        .body(Body::empty())
        .unwrap();
    let (status, _, _) = send(&app, request).await;
    assert_eq!(status, StatusCode::SEE_OTHER);

    let (status, _, body) = send(&app, get("/")).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.contains("The latest refresh failed"));
    assert!(body.contains("Groceries"));
}

#[tokio::test]
async fn test_health_reports_cache_state() {
    let app = test_app(Variant::Staging, CSV);

    let (_, _, body) = send(&app, get("/health")).await;
    let json: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(json["status"], "ok");
    assert_eq!(json["variant"], "homolog");
    assert!(json["rows"].is_null());

    send(&app, get("/")).await;
    let (_, _, body) = send(&app, get("/health")).await;
    let json: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(json["rows"], 4);
    assert_eq!(json["sessions"], 1);
}

#[tokio::test]
async fn test_missing_source_renders_error_page() {
    let config = DashboardConfig::default();
    let source = CsvFileSource::new("/nonexistent/sheetboard/data.csv");
    let state = AppState::new(config, Box::new(source)).unwrap();
    let app = router(Arc::new(state));

    let response = app.oneshot(get("/")).await.unwrap();
    assert!(response.status().is_server_error());
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body = String::from_utf8_lossy(&bytes);
    assert!(body.contains("Back to the dashboard"));
}
