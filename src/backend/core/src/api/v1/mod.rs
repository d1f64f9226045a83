//! V1 API: service info, task catalogue and job endpoints.

pub mod routes;

pub use routes::{v1_router, V1_PREFIX};
