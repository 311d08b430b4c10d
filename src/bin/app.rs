use sheetboard::config::{DashboardConfig, Variant};
use sheetboard::{app, logging};
use std::env;
use std::path::PathBuf;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    logging::init_logger();

    // Optional configuration file as the first argument
    let path = env::args().nth(1).map(PathBuf::from);

    let mut config = DashboardConfig::load(path.as_deref())?;
    config.apply_env_overrides();
    config.variant = Variant::Production;
    config.validate()?;

    logging::log_config_info(&config);
    app::run(config).await
}
