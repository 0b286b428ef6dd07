//! The `config` module loads [`Settings`] from an optional configuration file
//! and from `WSBROADCAST_*` environment variables, layered over built-in
//! defaults.

mod settings;

use config::{Config, ConfigError, Environment, File};

use settings::PartialSettings;

pub use settings::{ConnectionSettings, LogSettings, ServerSettings, Settings};

/// Prefix of every environment variable read by [`load_config`].
pub const ENV_PREFIX: &str = "WSBROADCAST";

/// Loads the configuration from the default file and environment variables.
///
/// `config/default.*` is optional; nested keys in the environment use `__`,
/// e.g. `WSBROADCAST_SERVER__PORT=9000`.
pub fn load_config() -> Result<Settings, ConfigError> {
    load_config_from("config/default")
}

/// Same as [`load_config`] with an explicit file name (extension optional).
pub fn load_config_from(file: &str) -> Result<Settings, ConfigError> {
    let builder = Config::builder()
        .add_source(File::with_name(file).required(false))
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

    let config = builder.build()?;

    // Try to deserialize what is available
    let partial: PartialSettings = config.try_deserialize()?;

    Ok(partial.merge_over(Settings::default()))
}
