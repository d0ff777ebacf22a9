//! Configuration system
//!
//! Loads ~/.config/followgraph/config.yaml with sections for:
//! - Cache TTLs, sweep interval and storage key
//! - Persistence backend selection
//! - Remote follow backend connection

mod followgraph_config;
pub mod validation;

pub use followgraph_config::{
    default_data_dir, CacheConfig, FollowGraphConfig, PersistenceBackend, PersistenceConfig,
    RemoteConfig,
};
pub use validation::{validate_config, validate_config_result, ValidationError};
