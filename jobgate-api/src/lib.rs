//! HTTP API for a jobgate deployment.
//!
//! The API process opens the shared store through the schema gate, then
//! serves read and enqueue endpoints over it. It never applies revisions.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use jobgate::{gate, Role, Settings, SqliteWorkStore};
//! use jobgate_api::{run_server, ApiState};
//!
//! let settings = Settings::from_env()?;
//! let pool = gate::open(Role::Api, &settings).await?;
//! let state = ApiState::new(SqliteWorkStore::new(pool));
//!
//! run_server(&settings.api, state, shutdown).await?;
//! ```
//!
//! # Endpoints
//!
//! - `GET /health` - store reachability and schema revision
//! - `GET /v1/stats` - unit counts per state
//! - `POST /v1/units`, `GET /v1/units` - enqueue and list units
//! - `GET /v1/units/{id}`, `GET /v1/units/{id}/attempts` - inspect a unit
//! - `POST /v1/units/{id}/requeue` - retry a terminally failed unit

mod error;
mod routes;
mod server;

pub use error::{ApiError, ApiResult};
pub use routes::CreateUnit;
pub use server::{create_router, run_server, ApiState};
