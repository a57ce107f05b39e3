pub mod cluster;
pub mod config;

pub use cluster::context::ClusterContext;
pub use cluster::store_info::StoreInfo;
pub use config::{ClusterTopology, NodeDescriptor};
