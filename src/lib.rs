pub mod config;
pub mod streaming;

pub use config::{ConfigError, StreamConfig};
pub use streaming::*;
