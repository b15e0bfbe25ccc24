pub mod config;
pub mod types;

pub use config::SkeinConfig;
pub use types::*;
