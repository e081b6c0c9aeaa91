#![cfg(not(tarpaulin_include))]

use dashboard::app;
use dashboard::config::Config;

/// Main entry point for the dashboard web service
///
/// Reads its configuration from the environment (see [`Config::from_env`]),
/// initializes logging from `RUST_LOG` and serves until the process is
/// stopped.
///
/// # Returns
/// * `Result<(), Box<dyn std::error::Error>>` - Success or error object
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = Config::from_env();
    log::info!(
        "data dir {}, uploads dir {}",
        config.data_dir.display(),
        config.uploads_dir.display()
    );

    app::run(config).await
}
