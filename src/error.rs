use thiserror::Error;

/// Errors that can occur while loading, transforming or rendering dashboard data
#[derive(Error, Debug)]
pub enum DashboardError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid spreadsheet reference: {0}")]
    InvalidSpreadsheet(String),

    #[error("Fetch failed: {0}")]
    Fetch(String),

    /// The service answered successfully but not with spreadsheet data
    #[error("Unexpected response from the spreadsheet service: {0}")]
    UnexpectedContent(String),

    #[error("Spreadsheet service returned HTTP {status} for {url}")]
    UpstreamStatus { status: u16, url: String },

    #[error("Column not found: {name}")]
    ColumnNotFound { name: String },

    #[error("Duplicate column name: {name}")]
    DuplicateColumn { name: String },

    #[error("Schema error: {0}")]
    Schema(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Chart error: {0}")]
    Chart(String),

    #[error("Export error: {0}")]
    Export(String),

    #[error("Render error: {0}")]
    Render(String),

    #[error("Not available: {0}")]
    NotAvailable(String),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl DashboardError {
    /// Whether retrying the same fetch could succeed.
    ///
    /// Transport failures, rate limiting and server-side errors are retryable;
    /// anything about the content of a response is not.
    pub fn is_retryable(&self) -> bool {
        match self {
            DashboardError::Fetch(_) => true,
            DashboardError::UpstreamStatus { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

/// Result type for dashboard operations
pub type Result<T> = std::result::Result<T, DashboardError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(DashboardError::Fetch("connection reset".into()).is_retryable());
        assert!(
            DashboardError::UpstreamStatus {
                status: 503,
                url: "http://x".into()
            }
            .is_retryable()
        );
        assert!(
            DashboardError::UpstreamStatus {
                status: 429,
                url: "http://x".into()
            }
            .is_retryable()
        );
        assert!(
            !DashboardError::UpstreamStatus {
                status: 404,
                url: "http://x".into()
            }
            .is_retryable()
        );
        assert!(!DashboardError::Parse("bad".into()).is_retryable());
        assert!(!DashboardError::UnexpectedContent("sign-in page".into()).is_retryable());
    }

    #[test]
    fn test_error_messages() {
        let err = DashboardError::ColumnNotFound {
            name: "amount".into(),
        };
        assert_eq!(err.to_string(), "Column not found: amount");

        let err = DashboardError::UpstreamStatus {
            status: 403,
            url: "https://docs.google.com".into(),
        };
        assert_eq!(
            err.to_string(),
            "Spreadsheet service returned HTTP 403 for https://docs.google.com"
        );
    }
}
