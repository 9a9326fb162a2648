// Health check command

use crate::client::Client;
use crate::output::{print_field, OutputFormat};
use anyhow::Result;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub source: String,
}

pub async fn run(client: &Client, output: OutputFormat) -> Result<()> {
    let health: HealthResponse = client.get("/health").await?;

    if output.is_text() {
        print_field("Server", client.base_url());
        print_field("Status", &health.status);
        print_field("Version", &health.version);
        print_field("Source", &health.source);
    } else {
        output.print_value(&health)?;
    }

    Ok(())
}
