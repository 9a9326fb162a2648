// Depot Control Plane Library
// Decision: Shared library for binaries (relay server, export-openapi) and router tests

// API routes and types (shared for OpenAPI generation)
pub mod api;

// Router assembly
pub mod app;
pub use app::build_app;

// Environment configuration
pub mod config;
pub use config::ServerConfig;

// Change sources (in-memory, Postgres)
pub mod source;

// OpenAPI spec generation
pub mod openapi;
