/// Strandway: workflow execution engine for no-code automations
///
/// Main entry point. Loads configuration from the environment and starts
/// the HTTP server with workflow management, webhook triggers, and the
/// scheduler poll endpoint.

use strandway::{config::Config, start_server};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::default();
    start_server(config).await?;
    Ok(())
}
