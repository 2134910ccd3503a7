use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use config::{Config, Environment, File};
use regex::Regex;
use serde::Deserialize;
use thiserror::Error;

use crate::registry;

const FILE_STEM: &str = "hh_etl";
const ENV_PREFIX: &str = "HH_ETL";

/// HH rejects larger pages.
const MAX_PER_PAGE: u32 = 100;
const MAX_RETRIES: u32 = 10;

static IDENT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap());

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to load settings: {0}")]
    Load(#[from] config::ConfigError),
    #[error("invalid OKVED prefix {0:?} (expected e.g. 61 or 61.10)")]
    InvalidPrefix(String),
    #[error("invalid table name {0:?}")]
    InvalidTable(String),
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    #[error("{0} must be at most {1}")]
    TooLarge(&'static str, u32),
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub db_path: PathBuf,
    pub okved_file: PathBuf,
    pub registry_source: PathBuf,
    pub okved_prefix: String,
    pub companies_table: String,
    pub api_url: String,
    pub search_text: String,
    pub search_field: String,
    pub per_page: u32,
    pub total_vacancies: u32,
    pub concurrency: usize,
    pub max_retries: u32,
    pub backoff_ms: u64,
    pub user_agent: String,
    pub top_skills: usize,
}

impl Settings {
    /// Defaults, then `hh_etl.toml` (or `file` if given), then `HH_ETL_*` env vars.
    pub fn load(file: Option<&Path>) -> Result<Self, SettingsError> {
        Self::load_with_env(file, ENV_PREFIX)
    }

    fn load_with_env(file: Option<&Path>, env_prefix: &str) -> Result<Self, SettingsError> {
        let file_source = match file {
            Some(path) => File::from(path).required(true),
            None => File::with_name(FILE_STEM).required(false),
        };

        let settings: Settings = defaults()?
            .add_source(file_source)
            .add_source(Environment::with_prefix(env_prefix).try_parsing(true))
            .build()?
            .try_deserialize()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        if !registry::is_okved_code(&self.okved_prefix) {
            return Err(SettingsError::InvalidPrefix(self.okved_prefix.clone()));
        }
        if !IDENT_RE.is_match(&self.companies_table) {
            return Err(SettingsError::InvalidTable(self.companies_table.clone()));
        }
        if self.per_page == 0 {
            return Err(SettingsError::Zero("per_page"));
        }
        if self.per_page > MAX_PER_PAGE {
            return Err(SettingsError::TooLarge("per_page", MAX_PER_PAGE));
        }
        if self.concurrency == 0 {
            return Err(SettingsError::Zero("concurrency"));
        }
        if self.top_skills == 0 {
            return Err(SettingsError::Zero("top_skills"));
        }
        if self.max_retries > MAX_RETRIES {
            return Err(SettingsError::TooLarge("max_retries", MAX_RETRIES));
        }
        Ok(())
    }
}

fn defaults() -> Result<config::builder::ConfigBuilder<config::builder::DefaultState>, SettingsError>
{
    let builder = Config::builder()
        .set_default("db_path", "data/hh_etl.sqlite")?
        .set_default("okved_file", "data/okved.json")?
        .set_default("registry_source", "data/egrul.json.zip")?
        .set_default("okved_prefix", "61")?
        .set_default("companies_table", "telecom_companies")?
        .set_default("api_url", "https://api.hh.ru")?
        .set_default("search_text", "middle python")?
        .set_default("search_field", "name")?
        .set_default("per_page", 20_i64)?
        .set_default("total_vacancies", 100_i64)?
        .set_default("concurrency", 10_i64)?
        .set_default("max_retries", 3_i64)?
        .set_default("backoff_ms", 1000_i64)?
        .set_default("user_agent", concat!("hh_etl/", env!("CARGO_PKG_VERSION")))?
        .set_default("top_skills", 10_i64)?;
    Ok(builder)
}
