use crate::api::ContractAddress;
use anyhow::{Context, Result};
use config::{Config, Environment, File};
use log::LevelFilter;
use serde::Deserialize;

const DEFAULT_CONFIG: &str = "mercado";

/// Server settings: built-in defaults, then `mercado.toml` (or the file
/// given on the command line), then `MERCADO_*` variables.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub port: u16,
    /// sqlx connection string, in-memory when unset.
    pub db: Option<String>,
    /// Market identity. A fresh database stores this one, or a random one
    /// when unset, and keeps it across restarts.
    pub contract: Option<ContractAddress>,
    pub log_level: String,
}
impl Settings {
    pub fn load(path: Option<&str>) -> Result<Self> {
        let file = match path {
            Some(path) => File::with_name(path).required(true),
            None => File::with_name(DEFAULT_CONFIG).required(false),
        };
        Config::builder()
            .set_default("port", 8081)?
            .set_default("log_level", "debug")?
            .add_source(file)
            .add_source(Environment::with_prefix("MERCADO"))
            .build()
            .context("couldn't read settings")?
            .try_deserialize()
            .context("invalid settings")
    }
    pub fn level(&self) -> LevelFilter {
        self.log_level.parse().unwrap_or(LevelFilter::Debug)
    }
}
