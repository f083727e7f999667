//! Gantry API - the executor's HTTP control plane
//!
//! Translates HTTP requests into executor operations and domain errors
//! into status codes. Mutating endpoints are refused while the node is
//! draining.

pub mod error;
pub mod handlers;
pub mod router;
pub mod server;

pub use error::{ApiError, ErrorResponse};
pub use handlers::ApiState;
pub use router::build_router;
pub use server::ApiServer;
