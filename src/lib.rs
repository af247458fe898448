// Infrastructure layer (shared components)
pub mod infrastructure;

// Re-export infrastructure modules for shorter paths
pub use infrastructure::clock;
pub use infrastructure::config;
pub use infrastructure::error;
pub use infrastructure::metrics;
pub use infrastructure::redis;

// Domain layer
pub mod queue;

// Application layer
pub mod transport;

// Supporting modules
pub mod telemetry;
