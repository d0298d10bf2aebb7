pub mod config;
pub mod logging;
mod macros;

pub use config::{Environment, LogLevel};
pub use logging::setup_logging;
