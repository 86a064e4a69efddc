pub mod defaults;
pub mod error;
pub mod model;
pub mod snapshot;
pub mod store;
pub mod validate;

pub use error::{ConfigError, ValidationError, ValidationErrors};
pub use snapshot::*;
pub use store::ConfigStore;
