//! Connection string resolution
//!
//! Each field is taken from the explicit request first, then from
//! [`DatabaseSettings`], then left unset. A request with no user resolves to
//! the local debug SQLite database; anything else becomes a SQL Server URL.

use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use std::collections::BTreeMap;
use std::fmt;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::settings::{
    non_empty, DatabaseSettings, DbEnvironment, DB_DATABASE, DB_HOST, DB_PASSWD, DB_PORT, DB_USER,
};

/// Local file-backed database used when no credentials are configured
pub const DEBUG_CONNECTION_STRING: &str = "sqlite:///./sql_app.db";

/// Prefix shared by every file-backed SQLite connection string
pub const SQLITE_URL_PREFIX: &str = "sqlite:///";

/// Driver identifier of production connection strings
pub const SQL_SERVER_DRIVER: &str = "mssql+pymssql";

/// Characters escaped in the user and password of a connection URL
const USERINFO: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'/')
    .add(b':')
    .add(b';')
    .add(b'<')
    .add(b'=')
    .add(b'>')
    .add(b'?')
    .add(b'@')
    .add(b'[')
    .add(b'\\')
    .add(b']')
    .add(b'^')
    .add(b'`')
    .add(b'{')
    .add(b'|')
    .add(b'}');

#[cfg(test)]
mod tests;

/// Explicit connection values; empty strings count as unset
#[derive(Clone, Default, PartialEq, Eq)]
pub struct ConnectionParams {
    pub user: Option<String>,
    pub password: Option<String>,
    pub host: Option<String>,
    pub port: Option<String>,
    pub database: Option<String>,
}

impl fmt::Debug for ConnectionParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionParams")
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .finish()
    }
}

/// Everything a caller can say about which database to connect to
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionRequest {
    /// Skip resolution and use the debug SQLite database
    pub use_debug: bool,

    /// Deployment tag ("ACC" or "PROD"); unset reads the generic variables
    pub environment: Option<String>,

    pub params: ConnectionParams,

    /// Schema whose qualification is removed on the debug database
    pub schema_name: Option<String>,
}

impl ConnectionRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn use_debug(mut self, use_debug: bool) -> Self {
        self.use_debug = use_debug;
        self
    }

    pub fn environment(mut self, environment: impl Into<String>) -> Self {
        self.environment = Some(environment.into());
        self
    }

    pub fn schema_name(mut self, schema_name: impl Into<String>) -> Self {
        self.schema_name = Some(schema_name.into());
        self
    }

    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.params.user = Some(user.into());
        self
    }

    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.params.password = Some(password.into());
        self
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.params.host = Some(host.into());
        self
    }

    pub fn port(mut self, port: impl Into<String>) -> Self {
        self.params.port = Some(port.into());
        self
    }

    pub fn database(mut self, database: impl Into<String>) -> Self {
        self.params.database = Some(database.into());
        self
    }
}

/// Engine-level overrides applied to every statement
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionOptions {
    /// Schema name → replacement; a `None` replacement drops the qualification
    pub schema_translate_map: BTreeMap<Option<String>, Option<String>>,
}

impl ExecutionOptions {
    /// Options that strip qualification for a single schema
    pub fn remove_schema(schema_name: Option<String>) -> Self {
        let mut schema_translate_map = BTreeMap::new();
        schema_translate_map.insert(schema_name, None);
        Self {
            schema_translate_map,
        }
    }

    /// Apply the translation map; unmapped schemas pass through unchanged
    pub fn translate_schema<'a>(&'a self, schema: Option<&'a str>) -> Option<&'a str> {
        match self
            .schema_translate_map
            .get(&schema.map(|s| s.to_string()))
        {
            Some(replacement) => replacement.as_deref(),
            None => schema,
        }
    }
}

/// Outcome of a single resolution
#[derive(Clone, PartialEq, Eq)]
pub struct ResolvedConnection {
    pub connection_string: String,
    pub execution_options: Option<ExecutionOptions>,
}

impl ResolvedConnection {
    /// The debug SQLite database with `schema_name` translated away
    pub fn debug(schema_name: Option<String>) -> Self {
        Self {
            connection_string: DEBUG_CONNECTION_STRING.to_string(),
            execution_options: Some(ExecutionOptions::remove_schema(schema_name)),
        }
    }

    /// An explicit connection string, used verbatim
    pub fn explicit(connection_string: impl Into<String>) -> Self {
        Self {
            connection_string: connection_string.into(),
            execution_options: None,
        }
    }

    /// Whether this is the local debug database
    pub fn is_debug(&self) -> bool {
        self.connection_string == DEBUG_CONNECTION_STRING
    }

    /// Connection string safe to print
    pub fn redacted(&self) -> String {
        redact(&self.connection_string)
    }
}

impl fmt::Debug for ResolvedConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedConnection")
            .field("connection_string", &self.redacted())
            .field("execution_options", &self.execution_options)
            .finish()
    }
}

/// Replace the password of a connection URL with `***`
pub fn redact(connection_string: &str) -> String {
    let Some((scheme, rest)) = connection_string.split_once("://") else {
        return "<unparseable connection string>".to_string();
    };
    let authority_end = rest.find(|c: char| c == '/' || c == '?').unwrap_or(rest.len());

    match rest[..authority_end].rfind('@') {
        Some(at) => match rest[..at].split_once(':') {
            Some((user, _)) => format!("{scheme}://{user}:***{}", &rest[at..]),
            None => connection_string.to_string(),
        },
        None => connection_string.to_string(),
    }
}

/// Resolve a request against the current environment
///
/// Loads `.env` and the process environment into [`DatabaseSettings`] and
/// delegates to [`resolve`].
pub fn get_connection_string(request: &ConnectionRequest) -> Result<ResolvedConnection> {
    let settings = DatabaseSettings::load()?;
    resolve(request, &settings)
}

/// Resolve a request against an explicit settings snapshot
pub fn resolve(request: &ConnectionRequest, settings: &DatabaseSettings) -> Result<ResolvedConnection> {
    if request.use_debug {
        return Ok(ResolvedConnection::debug(request.schema_name.clone()));
    }

    let params = &request.params;
    let user = pick(&params.user, settings.user.as_deref());
    let password = pick(&params.password, settings.password.as_deref());
    let port = pick(&params.port, settings.port.as_deref());

    let environment = request
        .environment
        .as_deref()
        .map(str::parse::<DbEnvironment>)
        .transpose()?;
    let host = pick(&params.host, settings.host_for(environment));
    let database = pick(&params.database, settings.database_for(environment));

    let host_key = environment.map_or(DB_HOST, |env| env.host_key());
    let database_key = environment.map_or(DB_DATABASE, |env| env.database_key());

    let missing = [
        (DB_USER, user.is_none()),
        (DB_PASSWD, password.is_none()),
        (host_key, host.is_none()),
        (DB_PORT, port.is_none()),
        (database_key, database.is_none()),
    ];

    let Some(user) = user else {
        if settings.debug_fallback {
            warn!(schema = ?request.schema_name, "Using debug SQLite database...");
            return Ok(ResolvedConnection::debug(request.schema_name.clone()));
        }
        return Err(missing_parameters(&missing));
    };

    let (Some(password), Some(host), Some(port), Some(database)) = (password, host, port, database)
    else {
        return Err(missing_parameters(&missing));
    };

    info!(%host, %database, "Connecting to {host} and database {database}");

    Ok(ResolvedConnection {
        connection_string: sql_server_url(&user, &password, &host, &port, &database),
        execution_options: None,
    })
}

fn pick(explicit: &Option<String>, fallback: Option<&str>) -> Option<String> {
    non_empty(explicit.clone()).or_else(|| non_empty(fallback.map(str::to_string)))
}

fn missing_parameters(checks: &[(&str, bool)]) -> Error {
    Error::MissingParameters {
        missing: checks
            .iter()
            .filter(|(_, missing)| *missing)
            .map(|(key, _)| key.to_string())
            .collect(),
    }
}

/// Host, port and database are written as given; only credentials are escaped
fn sql_server_url(user: &str, password: &str, host: &str, port: &str, database: &str) -> String {
    let user = utf8_percent_encode(user, USERINFO);
    let password = utf8_percent_encode(password, USERINFO);

    format!("{SQL_SERVER_DRIVER}://{user}:{password}@{host}:{port}/{database}")
}
