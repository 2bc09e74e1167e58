use keel_common::settings::{get_config, Settings, CONFIG_INSTANCE};

use crate::{
    error::{KeelCliError, KeelCliResult},
    Cli,
};

/// Loads the control-plane settings once for the whole process.
pub fn init_config(cli: &Cli) -> KeelCliResult<&'static Settings> {
    let root = cli.settings.clone().or_else(|| cli.root.clone());
    let settings = Settings::from_root(root)?;
    CONFIG_INSTANCE
        .set(settings)
        .map_err(|_| KeelCliError::InitConfig("config already initialized".to_string()))?;
    Ok(get_config()?)
}
