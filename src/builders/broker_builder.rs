//! Builders to construct a broker from configuration.

use crate::broker::Broker;
use crate::config::{BrokerConfig, ConfigError};
use crate::core::TaskPropertiesResolver;

/// Validate `cfg` and build a broker whose heap classifies tasks with `resolver`.
pub fn build_broker<R>(cfg: BrokerConfig, resolver: R) -> Result<Broker, ConfigError>
where
    R: TaskPropertiesResolver + 'static,
{
    cfg.validate().map_err(ConfigError::Validation)?;
    tracing::info!(
        max_fragmentation = cfg.max_fragmentation,
        initial_heap_capacity = cfg.initial_heap_capacity,
        "building broker"
    );
    Ok(Broker::new(cfg, resolver))
}
