/// Mechaflow: durable automation flow engine
///
/// Main entry point for the engine daemon. Loads configuration from MECHAFLOW_*
/// environment variables, reconciles state left by a previous process and runs
/// the scheduler until Ctrl-C.

use mechaflow::{app::start, config::Config};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::default();
    start(config).await?;
    Ok(())
}
