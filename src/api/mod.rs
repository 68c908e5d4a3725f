//! HTTP API for the research pipeline.
//!
//! ## Endpoints
//!
//! - `GET /health` - Health check
//! - `GET /api/budget` - Current budget status
//! - `GET /api/budget/usage` - Recent usage records
//! - `GET /api/models` - Model cost registry
//! - `POST /api/pipeline/run` - Start a run in the background
//! - `GET /api/pipeline/runs/:id` - State and result of a run
//! - `GET /api/pipeline/status` - State of the most recent run

mod routes;
mod runs;

pub use routes::{router, serve, AppState};
pub use runs::{RunEntry, RunRegistry};
