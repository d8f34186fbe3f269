//! Tree-level configuration: the reserved config file holding the
//! wrapped master key, KDF parameters and feature flags.

pub mod config;

pub use config::{ConfFile, ConfigError, FeatureFlag, ScryptKdf, CONFIG_CURRENT_VERSION};
