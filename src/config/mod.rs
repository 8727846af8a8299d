//! Configuration management for key-mapper
//!
//! This module provides:
//! - **settings**: the application config file (log level, injection timing)
//! - **autoload**: which preset gets applied to which device on startup,
//!   stored inside the same config file

pub mod autoload;
pub mod settings;

pub use settings::Config;
