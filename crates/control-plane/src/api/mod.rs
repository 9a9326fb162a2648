// HTTP API routes
//
// Each submodule handles one route group with its own AppState.

pub mod changes;
pub mod common;
pub mod events;
pub mod health;

// Re-export common types
pub use common::{ApiError, ErrorResponse};
