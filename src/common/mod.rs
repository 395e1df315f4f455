pub mod config;
pub mod error;
pub mod paths;

pub use config::{Config, EnrollConfig, MatchStrategy, MatcherConfig, SensorConfig};
pub use error::{Result, RidgelineError};
pub use paths::{system_config_file, system_data_dir};
