pub mod health;
pub mod identities;
pub mod members;
pub mod roles;
pub mod whitelist;

pub use health::{health_check, metrics_endpoint, readiness_check};
