pub mod app_config;
pub mod transport;
pub mod worker_observability;

// Re-export main types for easier imports
pub use app_config::{AppConfig, DEFAULT_CONFIG_PATHS, ENV_PREFIX};
pub use transport::{RuntimeEnvironment, TransportConfig};
pub use worker_observability::{DirectoryConfig, ObservabilityConfig, WorkerConfig};
