pub mod context;
mod error;
pub mod runtime;
pub mod store;
pub mod store_info;

pub use error::{BootstrapError, StartupError, StoreError};
