use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use crate::error::{DashboardError, Result};
use crate::table::Schema;

/// Default configuration file name, looked up in the working directory
pub const CONFIG_FILE: &str = "sheetboard.toml";

/// Which flavour of the dashboard is served
///
/// The staging (homologation) variant is a pre-production copy that also offers
/// file exports, the per-month calendar and a render timer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Variant {
    #[default]
    Production,
    Staging,
}

impl Variant {
    pub fn is_staging(self) -> bool {
        self == Variant::Staging
    }

    pub fn exports_enabled(self) -> bool {
        self.is_staging()
    }

    pub fn calendar_enabled(self) -> bool {
        self.is_staging()
    }

    pub fn timing_enabled(self) -> bool {
        self.is_staging()
    }

    pub fn label(self) -> &'static str {
        match self {
            Variant::Production => "production",
            Variant::Staging => "homolog",
        }
    }
}

/// Where the rows come from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceConfig {
    /// A Google Sheets document, fetched through its CSV export
    GoogleSheet {
        /// Full document URL or bare spreadsheet id
        spreadsheet: String,

        /// Worksheet (tab) name
        #[serde(default)]
        worksheet: Option<String>,

        /// Worksheet id, used when no name is given
        #[serde(default)]
        gid: Option<u64>,
    },

    /// Any URL that answers with CSV
    CsvUrl { url: String },

    /// A local CSV file
    CsvFile { path: PathBuf },
}

/// Network and caching knobs for the spreadsheet fetch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    /// Timeout in seconds for one HTTP request
    pub timeout_secs: u64,

    /// Extra attempts after a retryable failure
    pub retry_attempts: u8,

    /// Base delay between attempts in milliseconds (multiplied by the attempt number)
    pub retry_delay_ms: u64,

    /// How long a snapshot is reused before refetching; 0 disables caching
    pub cache_ttl_secs: u64,

    /// Bearer token sent to the spreadsheet service, for sheets that are not public
    pub access_token: Option<String>,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            retry_attempts: 2,
            retry_delay_ms: 500,
            cache_ttl_secs: 600,
            access_token: None,
        }
    }
}

/// Complete dashboard configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DashboardConfig {
    /// Page title
    pub title: String,

    pub variant: Variant,

    /// Socket address the server listens on
    pub bind: String,

    pub source: SourceConfig,

    pub fetch: FetchConfig,

    pub schema: Schema,

    /// Rows shown in the table preview
    pub table_rows: usize,

    /// Categories shown before the rest is folded into "Other"
    pub top_categories: usize,

    /// Most recent months laid out as calendars
    pub calendar_months: usize,

    /// Directory served under /static
    pub static_dir: PathBuf,

    /// Idle lifetime of a dashboard session in seconds
    pub session_ttl_secs: u64,
}

impl Default for DashboardConfig {
    fn default() -> Self {
        Self {
            title: "Dashboard".to_string(),
            variant: Variant::Production,
            bind: "127.0.0.1:3000".to_string(),
            source: SourceConfig::CsvFile {
                path: PathBuf::from("data.csv"),
            },
            fetch: FetchConfig::default(),
            schema: Schema::default(),
            table_rows: 50,
            top_categories: 8,
            calendar_months: 12,
            static_dir: PathBuf::from("static"),
            session_ttl_secs: 8 * 60 * 60,
        }
    }
}

impl DashboardConfig {
    /// Load configuration from a TOML file
    ///
    /// Missing keys take their default values.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())?;
        let config: DashboardConfig = toml::from_str(&content)?;
        debug!("Loaded configuration from {}", path.as_ref().display());
        Ok(config)
    }

    /// Load the configuration used at startup
    ///
    /// An explicit path must exist. Without one, `sheetboard.toml` is looked up in
    /// the working directory and up to three parents, falling back to defaults.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load_from_file(path);
        }

        for depth in 0..=3 {
            let path = PathBuf::from(format!("{}{}", "../".repeat(depth), CONFIG_FILE));
            if path.is_file() {
                info!("Using configuration file {}", path.display());
                return Self::load_from_file(&path);
            }
        }

        info!("No {} found, using defaults", CONFIG_FILE);
        Ok(Self::default())
    }

    /// Apply overrides from the process environment
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    /// Apply `SHEETBOARD_*` overrides from an arbitrary lookup
    ///
    /// A spreadsheet, CSV URL or CSV path override replaces the whole source;
    /// when several are set the spreadsheet wins.
    pub fn apply_overrides_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(title) = get("SHEETBOARD_TITLE") {
            self.title = title;
        }
        if let Some(bind) = get("SHEETBOARD_BIND") {
            self.bind = bind;
        }

        if let Some(path) = get("SHEETBOARD_CSV_PATH") {
            self.source = SourceConfig::CsvFile {
                path: PathBuf::from(path),
            };
        }
        if let Some(url) = get("SHEETBOARD_CSV_URL") {
            self.source = SourceConfig::CsvUrl { url };
        }
        if let Some(spreadsheet) = get("SHEETBOARD_SPREADSHEET") {
            let (worksheet, gid) = match &self.source {
                SourceConfig::GoogleSheet { worksheet, gid, .. } => (worksheet.clone(), *gid),
                _ => (None, None),
            };
            self.source = SourceConfig::GoogleSheet {
                spreadsheet,
                worksheet,
                gid,
            };
        }
        if let Some(name) = get("SHEETBOARD_WORKSHEET") {
            if let SourceConfig::GoogleSheet { worksheet, .. } = &mut self.source {
                *worksheet = Some(name);
            }
        }

        if let Some(ttl) = get("SHEETBOARD_CACHE_TTL").and_then(|v| v.trim().parse().ok()) {
            self.fetch.cache_ttl_secs = ttl;
        }
        if let Some(token) = get("SHEETBOARD_ACCESS_TOKEN") {
            self.fetch.access_token = Some(token);
        }
    }

    /// Check the configuration before serving
    pub fn validate(&self) -> Result<()> {
        self.bind_addr()?;

        if self.table_rows == 0 {
            return Err(DashboardError::Config("table_rows must be positive".into()));
        }
        if self.top_categories == 0 {
            return Err(DashboardError::Config("top_categories must be positive".into()));
        }

        match &self.source {
            SourceConfig::GoogleSheet { spreadsheet, .. } if spreadsheet.trim().is_empty() => {
                return Err(DashboardError::Config("source.spreadsheet is empty".into()));
            }
            SourceConfig::CsvUrl { url } if url.trim().is_empty() => {
                return Err(DashboardError::Config("source.url is empty".into()));
            }
            SourceConfig::CsvFile { path } if path.as_os_str().is_empty() => {
                return Err(DashboardError::Config("source.path is empty".into()));
            }
            _ => {}
        }

        self.schema.validate()
    }

    pub fn bind_addr(&self) -> Result<SocketAddr> {
        self.bind
            .parse()
            .map_err(|_| DashboardError::Config(format!("invalid bind address '{}'", self.bind)))
    }
}
