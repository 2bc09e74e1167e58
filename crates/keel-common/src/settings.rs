//! Control-plane settings, loaded once at startup.
use std::{env, path::PathBuf, str::FromStr, sync::OnceLock};

use anyhow::Context;
use config::{Environment, File};
use serde::{Deserialize, Serialize};
use std::fs::canonicalize;
use tracing::level_filters::LevelFilter;

use crate::error::{KeelError, KeelResult};

pub static CONFIG_INSTANCE: OnceLock<Settings> = OnceLock::new();

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct ServerArgs {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerArgs {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum DataStoreType {
    #[default]
    Memory,
    Postgres,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq, Default)]
pub struct DataStoreArgs {
    #[serde(default, rename = "type")]
    pub r#type: DataStoreType,
    /// Connection url, used by the postgres store.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct Settings {
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Root of the local file store holding live-state snapshots and stage logs.
    #[serde(default = "default_filestore_dir")]
    pub filestore_dir: PathBuf,

    #[serde(default)]
    pub web_base_url: String,

    #[serde(default)]
    pub server: ServerArgs,

    #[serde(default)]
    pub datastore: DataStoreArgs,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            filestore_dir: default_filestore_dir(),
            web_base_url: String::new(),
            server: ServerArgs::default(),
            datastore: DataStoreArgs::default(),
        }
    }
}

pub fn get_config() -> KeelResult<&'static Settings> {
    CONFIG_INSTANCE
        .get()
        .ok_or_else(|| KeelError::Cli("config is not initialized".into()))
}

impl Settings {
    /// Loads settings from `root` (a file or a directory holding `config.*`),
    /// `config/default`, `config.{RUN_MODE}` and `KEEL_*` variables, later
    /// sources winning.
    pub fn from_root(root: Option<PathBuf>) -> KeelResult<Self> {
        let curr_dir = env::current_dir().context("unable to get working directory")?;
        let root = root.unwrap_or(curr_dir);
        let root = canonicalize(root).context("unable to canonicalize root directory")?;

        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".to_string());

        let mut s = config::Config::builder()
            .add_source(File::with_name("config").required(false))
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config.{}", run_mode)).required(false));
        if root.is_file() {
            s = s.add_source(File::from(root.as_path()));
        } else {
            s = s.add_source(File::from(root.join("config")).required(false));
        }
        let cfg = s
            .add_source(Environment::with_prefix("KEEL").separator("__"))
            .build()?
            .try_deserialize()?;
        Ok(cfg)
    }

    pub fn level(&self) -> LevelFilter {
        LevelFilter::from_str(&self.log_level).unwrap_or(LevelFilter::INFO)
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_filestore_dir() -> PathBuf {
    env::temp_dir().join("keel-filestore")
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    9080
}

fn default_max_connections() -> u32 {
    10
}
