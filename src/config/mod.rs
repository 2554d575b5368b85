mod config;

pub use config::{AggregationConfig, Config, ConfigError, StatsKind, Transport};
