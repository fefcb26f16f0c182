//! Ambient stack shared across the networking core: logging initialization,
//! the bounded queue used by IP egress and socket receive buffers, and
//! startup configuration.

pub mod config;
pub mod host_routes;
pub mod logging;
pub mod queue;

pub use config::StackConfig;
pub use queue::BoundedQueue;
