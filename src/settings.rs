//! Environment-derived database settings
//!
//! The resolver never reads process state directly. Everything it may fall
//! back to is captured here first, either from the real environment (with an
//! optional `.env` file and TOML settings file layered underneath) or from an
//! arbitrary lookup function in tests.

use serde::Deserialize;
use std::ffi::OsString;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use tracing::{debug, warn};

use crate::error::{Error, Result};

pub const DB_USER: &str = "DB_USER";
pub const DB_PASSWD: &str = "DB_PASSWD";
pub const DB_PORT: &str = "DB_PORT";
pub const DB_HOST: &str = "DB_HOST";
pub const DB_DATABASE: &str = "DB_DATABASE";
pub const DB_DEBUG_FALLBACK: &str = "DB_DEBUG_FALLBACK";

/// Deployment whose tagged host/database variables should be read
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DbEnvironment {
    Acc,
    Prod,
}

impl DbEnvironment {
    pub fn as_str(&self) -> &'static str {
        match self {
            DbEnvironment::Acc => "ACC",
            DbEnvironment::Prod => "PROD",
        }
    }

    pub fn host_key(&self) -> &'static str {
        match self {
            DbEnvironment::Acc => "DB_HOST_ACC",
            DbEnvironment::Prod => "DB_HOST_PROD",
        }
    }

    pub fn database_key(&self) -> &'static str {
        match self {
            DbEnvironment::Acc => "DB_DATABASE_ACC",
            DbEnvironment::Prod => "DB_DATABASE_PROD",
        }
    }
}

impl FromStr for DbEnvironment {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "ACC" => Ok(DbEnvironment::Acc),
            "PROD" => Ok(DbEnvironment::Prod),
            other => Err(Error::InvalidEnvironment(other.to_string())),
        }
    }
}

impl fmt::Display for DbEnvironment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of every setting the connection resolver can fall back to
#[derive(Clone, PartialEq, Eq)]
pub struct DatabaseSettings {
    pub user: Option<String>,
    pub password: Option<String>,
    pub port: Option<String>,
    pub host: Option<String>,
    pub database: Option<String>,
    pub host_acc: Option<String>,
    pub database_acc: Option<String>,
    pub host_prod: Option<String>,
    pub database_prod: Option<String>,

    /// Fall back to the debug SQLite database when no user is configured
    pub debug_fallback: bool,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            user: None,
            password: None,
            port: None,
            host: None,
            database: None,
            host_acc: None,
            database_acc: None,
            host_prod: None,
            database_prod: None,
            debug_fallback: true,
        }
    }
}

// Passwords stay out of logs and panic messages.
impl fmt::Debug for DatabaseSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseSettings")
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("port", &self.port)
            .field("host", &self.host)
            .field("database", &self.database)
            .field("host_acc", &self.host_acc)
            .field("database_acc", &self.database_acc)
            .field("host_prod", &self.host_prod)
            .field("database_prod", &self.database_prod)
            .field("debug_fallback", &self.debug_fallback)
            .finish()
    }
}

impl DatabaseSettings {
    /// Load settings from `.env`, the process environment and no settings file
    pub fn load() -> Result<Self> {
        Self::builder().build()
    }

    pub fn builder() -> SettingsBuilder {
        SettingsBuilder::new()
    }

    /// Build settings from a key lookup, e.g. `|key| std::env::var(key).ok()`
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| non_empty(lookup(key));

        Self {
            user: get(DB_USER),
            password: get(DB_PASSWD),
            port: get(DB_PORT),
            host: get(DB_HOST),
            database: get(DB_DATABASE),
            host_acc: get(DbEnvironment::Acc.host_key()),
            database_acc: get(DbEnvironment::Acc.database_key()),
            host_prod: get(DbEnvironment::Prod.host_key()),
            database_prod: get(DbEnvironment::Prod.database_key()),
            debug_fallback: get(DB_DEBUG_FALLBACK)
                .map(|value| parse_flag(DB_DEBUG_FALLBACK, &value))
                .unwrap_or(true),
        }
    }

    /// Host for the given deployment, or the generic host when untagged
    pub fn host_for(&self, environment: Option<DbEnvironment>) -> Option<&str> {
        match environment {
            None => self.host.as_deref(),
            Some(DbEnvironment::Acc) => self.host_acc.as_deref(),
            Some(DbEnvironment::Prod) => self.host_prod.as_deref(),
        }
    }

    /// Database name for the given deployment, or the generic one when untagged
    pub fn database_for(&self, environment: Option<DbEnvironment>) -> Option<&str> {
        match environment {
            None => self.database.as_deref(),
            Some(DbEnvironment::Acc) => self.database_acc.as_deref(),
            Some(DbEnvironment::Prod) => self.database_prod.as_deref(),
        }
    }
}

/// Builder for loading [`DatabaseSettings`] from layered sources
pub struct SettingsBuilder {
    config_path: Option<PathBuf>,
    dotenv: bool,
    dotenv_path: Option<PathBuf>,
}

impl SettingsBuilder {
    pub fn new() -> Self {
        Self {
            config_path: None,
            dotenv: true,
            dotenv_path: None,
        }
    }

    /// TOML file with lowercase variable names as keys (`db_host_acc = "..."`)
    pub fn config_path(mut self, path: Option<PathBuf>) -> Self {
        self.config_path = path;
        self
    }

    /// Whether to load a `.env` file from the working directory first
    pub fn dotenv(mut self, enabled: bool) -> Self {
        self.dotenv = enabled;
        self
    }

    /// Load this file instead of searching for `.env`; it must exist
    pub fn dotenv_path(mut self, path: Option<PathBuf>) -> Self {
        self.dotenv_path = path;
        self
    }

    /// Load settings; the process environment overrides the settings file
    pub fn build(self) -> Result<DatabaseSettings> {
        if let Some(path) = &self.dotenv_path {
            dotenvy::from_path(path)?;
        } else if self.dotenv {
            match dotenvy::dotenv() {
                Ok(path) => debug!(path = %path.display(), "Loaded .env file"),
                // A missing .env file is the normal case outside development
                Err(e) if e.not_found() => {}
                Err(e) => return Err(e.into()),
            }
        }

        let mut builder = config::Config::builder();
        if let Some(path) = &self.config_path {
            builder = builder.add_source(config::File::from(path.as_path()));
        }
        let environment = db_variables(std::env::vars_os());
        builder = builder.add_source(config::Environment::default().source(Some(environment)));

        let raw: RawSettings = builder.build()?.try_deserialize()?;
        Ok(raw.into())
    }
}

impl Default for SettingsBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Flat view of the layered sources; keys are lowercased by `config`
#[derive(Debug, Default, Deserialize)]
struct RawSettings {
    db_user: Option<String>,
    db_passwd: Option<String>,
    db_port: Option<String>,
    db_host: Option<String>,
    db_database: Option<String>,
    db_host_acc: Option<String>,
    db_database_acc: Option<String>,
    db_host_prod: Option<String>,
    db_database_prod: Option<String>,
    db_debug_fallback: Option<String>,
}

impl From<RawSettings> for DatabaseSettings {
    fn from(raw: RawSettings) -> Self {
        Self {
            user: non_empty(raw.db_user),
            password: non_empty(raw.db_passwd),
            port: non_empty(raw.db_port),
            host: non_empty(raw.db_host),
            database: non_empty(raw.db_database),
            host_acc: non_empty(raw.db_host_acc),
            database_acc: non_empty(raw.db_database_acc),
            host_prod: non_empty(raw.db_host_prod),
            database_prod: non_empty(raw.db_database_prod),
            debug_fallback: non_empty(raw.db_debug_fallback)
                .map(|value| parse_flag(DB_DEBUG_FALLBACK, &value))
                .unwrap_or(true),
        }
    }
}

/// `DB_*` variables only; unrelated variables may not even be valid Unicode
fn db_variables<I>(vars: I) -> config::Map<String, String>
where
    I: IntoIterator<Item = (OsString, OsString)>,
{
    let mut selected = config::Map::new();
    for (key, value) in vars {
        let Some(key) = key.to_str().filter(|key| key.starts_with("DB_")) else {
            continue;
        };
        match value.into_string() {
            Ok(value) => {
                selected.insert(key.to_string(), value);
            }
            Err(_) => warn!(key, "Ignoring non-Unicode value"),
        }
    }
    selected
}

pub(crate) fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}

fn parse_flag(key: &str, value: &str) -> bool {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => true,
        "0" | "false" | "no" | "off" => false,
        _ => {
            warn!(key, value, "Unrecognised boolean setting, using default (true)");
            true
        }
    }
}
