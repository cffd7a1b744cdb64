//! Shared basic library for the platform screen door services
//!
//! Provides the functions every service binary needs at startup:
//! - logging initialization (console + daily rolling file)
//! - graceful shutdown and reload signal handling
//! - configuration path helpers
//! - service metadata and startup banner

pub mod config_loader;
pub mod logging;
pub mod service_bootstrap;
pub mod shutdown;

pub use logging::{LogConfig, LogGuard, LoggingError};
pub use service_bootstrap::ServiceInfo;

// Re-export common dependencies
pub use tokio;
