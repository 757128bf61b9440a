pub mod config;
pub mod proxy;
pub mod service;

pub use config::{Config, ConfigError, ConfigSource};
pub use proxy::{PatternRouter, Route, SessionError};
pub use service::{Service, ServiceError};
