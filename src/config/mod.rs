mod error;
pub mod properties;
pub mod topology;

pub use error::ConfigError;
pub use topology::{ClusterTopology, NodeDescriptor};
