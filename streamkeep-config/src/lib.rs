//! Configuration loading for streamkeep.
//!
//! Values are layered in a fixed order: an optional `.env` file is read into
//! the process environment, then an optional TOML file, then individual
//! environment variables. Later layers win. The result is the core
//! [`RecorderConfig`](streamkeep_core::RecorderConfig) plus a list of soft
//! warnings the binary logs at startup.

pub mod loader;
pub mod sources;
pub mod util;
pub mod validation;

pub use loader::{
    ConfigLoad, ConfigLoadError, ConfigLoader, ConfigLoaderOptions,
    DEFAULT_CONFIG_LOCATIONS,
};
pub use sources::{EnvConfig, FileConfig};
pub use validation::{ConfigGuardRailError, ConfigWarning, ConfigWarnings};
