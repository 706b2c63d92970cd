//! Configuration models for the broker scheduler and workers.

pub mod broker;
pub(crate) mod loader;
pub mod worker;

pub use broker::BrokerConfig;
pub use loader::ConfigError;
pub use worker::WorkerConfig;
