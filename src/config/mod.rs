//! Gateway configuration.
//!
//! Sources, later ones winning:
//! 1. built-in defaults (`Settings::default`)
//! 2. `config/default.{toml,yaml,json}` relative to the working directory, if present
//! 3. environment variables such as `GATEWAY__BROKER__URL` or
//!    `GATEWAY__GATEWAY__MAILBOX_CAPACITY`

mod settings;

use config::{Config, ConfigError, Environment, File};

pub use settings::{
    BrokerSettings, GatewaySettings, PartialSettings, ServerSettings, Settings,
};

/// Loads the configuration from the default file and environment variables
/// and merges it over the built-in defaults.
pub fn load_config() -> Result<Settings, ConfigError> {
    load_config_from("config/default")
}

/// Like `load_config`, reading the optional file at `path` (extension may be omitted).
pub fn load_config_from(path: &str) -> Result<Settings, ConfigError> {
    let config = Config::builder()
        .add_source(File::with_name(path).required(false))
        .add_source(
            Environment::with_prefix("GATEWAY")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        )
        .build()?;

    // Try to deserialize what is available
    let partial: PartialSettings = config.try_deserialize()?;

    Ok(Settings::merged(partial))
}

#[cfg(test)]
mod tests;
