//! HTTP surface of the controller manager: liveness and Prometheus metrics

mod handlers;
mod server;

pub use handlers::HealthResponse;
pub use server::{router, run_server, ApiState};
