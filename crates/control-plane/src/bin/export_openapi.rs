// Export OpenAPI specification as JSON
//
// Usage: cargo run --bin export-openapi > docs/api/openapi.json
//
// This binary generates the OpenAPI spec without starting the relay server.

use anyhow::{Context, Result};
use depot_control_plane::openapi::ApiDoc;

fn main() -> Result<()> {
    let json = ApiDoc::to_json().context("Failed to serialize OpenAPI spec")?;
    println!("{}", json);
    Ok(())
}
