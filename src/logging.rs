#![cfg(feature = "web")]

use log::{debug, info};

use crate::config::{DashboardConfig, SourceConfig};

/// Initialize the logger
///
/// Logs at `info` unless `RUST_LOG` says otherwise. Calling it twice is harmless,
/// which keeps tests that start a server free to call it.
pub fn init_logger() {
    let result = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_module_path(false)
        .format_target(false)
        .try_init();

    if result.is_ok() {
        debug!("Logger initialized");
    }
}

/// Log the settings a dashboard starts with
pub fn log_config_info(config: &DashboardConfig) {
    let source = match &config.source {
        SourceConfig::GoogleSheet { spreadsheet, worksheet, gid } => format!(
            "google sheet {} (worksheet={}, gid={})",
            spreadsheet,
            worksheet.as_deref().unwrap_or("-"),
            gid.map(|g| g.to_string()).unwrap_or_else(|| "-".into())
        ),
        SourceConfig::CsvUrl { url } => format!("csv url {}", url),
        SourceConfig::CsvFile { path } => format!("csv file {}", path.display()),
    };
    let fetch = &config.fetch;

    info!("Variant: {}, title: '{}'", config.variant.label(), config.title);
    info!("Source: {}", source);
    info!(
        "Fetch: timeout={}s, retries={}, delay={}ms, cache_ttl={}s, token={}",
        fetch.timeout_secs,
        fetch.retry_attempts,
        fetch.retry_delay_ms,
        fetch.cache_ttl_secs,
        if fetch.access_token.is_some() { "set" } else { "none" }
    );
    debug!(
        "Schema: {} columns, date={}, category={}, value={}",
        config.schema.columns.len(),
        config.schema.date_column,
        config.schema.category_column,
        config.schema.value_column
    );
}
