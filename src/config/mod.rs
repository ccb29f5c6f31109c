//! The `config` module loads `popcast` settings.
//!
//! Sources, later ones winning: built-in defaults, an optional
//! `config/default.{toml,yaml,json}` file (or an explicit file), then
//! environment variables such as `POPCAST__BROADCAST__PATH=/events`.

mod settings;

use std::path::Path;

use config::{Config, Environment, File};

use crate::utils::Result;

pub use settings::{
    BroadcastSettings, LogSettings, PartialSettings, RedisSettings, ServerSettings, Settings,
};

const ENV_PREFIX: &str = "POPCAST";

/// Loads the configuration from the default file and environment variables.
///
/// Missing values fall back to defaults; the result is validated.
pub fn load_config() -> Result<Settings> {
    load(File::with_name("config/default").required(false))
}

/// Same as [`load_config`] but reads `path`, which must exist.
pub fn load_config_from(path: impl AsRef<Path>) -> Result<Settings> {
    load(File::from(path.as_ref()).required(true))
}

fn load<S>(file: S) -> Result<Settings>
where
    S: config::Source + Send + Sync + 'static,
{
    let config = Config::builder()
        .add_source(file)
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        )
        .build()?;

    // Try to deserialize what is available
    let partial: PartialSettings = config.try_deserialize()?;

    let settings = Settings::merge(partial);
    settings.validate()?;
    Ok(settings)
}
