//! Database engine construction
//!
//! An [`Engine`] is a reusable handle bound to one connection string. Building
//! one performs no I/O and needs no async runtime; connections are opened on
//! checkout and every checkout is verified before it is handed out.

use percent_encoding::percent_decode_str;
use sqlx::pool::PoolConnection;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Sqlite;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, OnceLock};
use tiberius::{AuthMethod, Client, Config, SqlBrowser};
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};
use tracing::debug;

use crate::connection::{
    get_connection_string, redact, resolve, ConnectionRequest, ExecutionOptions,
    ResolvedConnection,
};
use crate::error::{Error, Result};
use crate::settings::DatabaseSettings;

const SQL_SERVER_DEFAULT_PORT: u16 = 1433;

/// Build an engine from an explicit connection string, or resolve one from
/// the request and the current environment
pub fn create_engine(connection_string: Option<&str>, request: &ConnectionRequest) -> Result<Engine> {
    let resolved = match connection_string {
        Some(connection_string) => ResolvedConnection::explicit(connection_string),
        None => get_connection_string(request)?,
    };
    Engine::from_resolved(resolved)
}

/// Like [`create_engine`], resolving against an explicit settings snapshot
pub fn create_engine_with_settings(
    connection_string: Option<&str>,
    request: &ConnectionRequest,
    settings: &DatabaseSettings,
) -> Result<Engine> {
    let resolved = match connection_string {
        Some(connection_string) => ResolvedConnection::explicit(connection_string),
        None => resolve(request, settings)?,
    };
    Engine::from_resolved(resolved)
}

/// Handle to a database, cheap to clone
#[derive(Clone)]
pub struct Engine {
    url: String,
    execution_options: Option<ExecutionOptions>,
    backend: Backend,
}

#[derive(Clone)]
enum Backend {
    Sqlite(LazySqlitePool),
    SqlServer(SqlServerTarget),
}

/// A checked-out, verified connection
pub enum Connection {
    Sqlite(PoolConnection<Sqlite>),
    SqlServer(Client<Compat<TcpStream>>),
}

impl Engine {
    /// Bind an engine to a resolved connection
    pub fn from_resolved(resolved: ResolvedConnection) -> Result<Self> {
        let ResolvedConnection {
            connection_string,
            execution_options,
        } = resolved;

        let (scheme, rest) = connection_string
            .split_once("://")
            .ok_or_else(|| invalid("expected <driver>://..."))?;

        let backend = match scheme.split('+').next() {
            Some("sqlite") => Backend::Sqlite(LazySqlitePool::parse(rest)?),
            Some("mssql") => Backend::SqlServer(SqlServerTarget::parse(&connection_string)?),
            _ => return Err(Error::UnsupportedDriver(scheme.to_string())),
        };

        let engine = Self {
            url: connection_string,
            execution_options,
            backend,
        };
        debug!(driver = engine.driver(), url = %redact(&engine.url), "Created database engine");

        Ok(engine)
    }

    /// The connection string exactly as given or resolved
    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn execution_options(&self) -> Option<&ExecutionOptions> {
        self.execution_options.as_ref()
    }

    pub fn driver(&self) -> &'static str {
        match self.backend {
            Backend::Sqlite(_) => "sqlite",
            Backend::SqlServer(_) => "mssql",
        }
    }

    /// Connections are always validated on checkout
    pub fn pre_ping(&self) -> bool {
        true
    }

    /// The underlying SQLite pool, for running queries through sqlx
    ///
    /// The pool is created on first use and must be requested from inside a
    /// tokio runtime. `None` for non-SQLite engines.
    pub fn sqlite_pool(&self) -> Result<Option<&SqlitePool>> {
        match &self.backend {
            Backend::Sqlite(lazy) => lazy.get().map(Some),
            Backend::SqlServer(_) => Ok(None),
        }
    }

    /// Schema after applying the engine's schema translation
    pub fn translate_schema<'a>(&'a self, schema: Option<&'a str>) -> Option<&'a str> {
        match &self.execution_options {
            Some(options) => options.translate_schema(schema),
            None => schema,
        }
    }

    /// Table name qualified with its (translated) schema
    pub fn qualify(&self, schema: Option<&str>, table: &str) -> String {
        match self.translate_schema(schema) {
            Some(schema) => format!("{schema}.{table}"),
            None => table.to_string(),
        }
    }

    /// Check out a connection that has just answered a liveness query
    pub async fn connect(&self) -> Result<Connection> {
        match &self.backend {
            // test_before_acquire pings pooled connections and replaces stale ones
            Backend::Sqlite(lazy) => Ok(Connection::Sqlite(lazy.get()?.acquire().await?)),
            Backend::SqlServer(target) => {
                let config = target.config();
                let tcp = if target.uses_browser() {
                    TcpStream::connect_named(&config).await?
                } else {
                    TcpStream::connect(config.get_addr()).await?
                };
                tcp.set_nodelay(true)?;

                let mut client = Client::connect(config, tcp.compat_write()).await?;
                client.simple_query("SELECT 1").await?.into_results().await?;

                Ok(Connection::SqlServer(client))
            }
        }
    }

    /// Open a connection and run a trivial query against it
    pub async fn ping(&self) -> Result<()> {
        match self.connect().await? {
            Connection::Sqlite(mut conn) => {
                sqlx::query("SELECT 1").execute(&mut *conn).await?;
            }
            Connection::SqlServer(_) => {}
        }
        Ok(())
    }
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("driver", &self.driver())
            .field("url", &redact(&self.url))
            .field("execution_options", &self.execution_options)
            .finish()
    }
}

fn invalid(reason: impl Into<String>) -> Error {
    Error::InvalidConnectionString {
        reason: reason.into(),
    }
}

/// SQLite pool built on first checkout
///
/// sqlx spawns the pool's maintenance task when the pool is created, so
/// creation waits until a caller is inside a runtime.
#[derive(Clone)]
struct LazySqlitePool {
    options: SqliteConnectOptions,
    in_memory: bool,
    pool: Arc<OnceLock<SqlitePool>>,
}

impl LazySqlitePool {
    /// `sqlite://` and `sqlite:///:memory:` are in-memory, `sqlite:///<path>` is a file
    fn parse(rest: &str) -> Result<Self> {
        let (options, in_memory) = match rest {
            "" | "/:memory:" => (SqliteConnectOptions::from_str("sqlite::memory:")?, true),
            _ => {
                let path = rest
                    .strip_prefix('/')
                    .filter(|path| !path.is_empty())
                    .ok_or_else(|| invalid("expected sqlite:///<path>"))?;
                let options = SqliteConnectOptions::new()
                    .filename(path)
                    .create_if_missing(true);
                (options, false)
            }
        };

        Ok(Self {
            options,
            in_memory,
            pool: Arc::new(OnceLock::new()),
        })
    }

    fn get(&self) -> Result<&SqlitePool> {
        if let Some(pool) = self.pool.get() {
            return Ok(pool);
        }
        Handle::try_current().map_err(|_| Error::NoRuntime)?;
        Ok(self.pool.get_or_init(|| self.build()))
    }

    fn build(&self) -> SqlitePool {
        let options = SqlitePoolOptions::new().test_before_acquire(true);
        let options = if self.in_memory {
            // Every in-memory connection is its own database, so keep exactly one
            options
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            options
        };
        options.connect_lazy_with(self.options.clone())
    }
}

/// Decoded pieces of a `mssql[+driver]://user:password@host[\instance][:port]/database` URL
#[derive(Debug, Clone, PartialEq, Eq)]
struct SqlServerTarget {
    host: String,
    instance: Option<String>,
    port: Option<u16>,
    database: String,
    user: String,
    password: String,
    trust_cert: bool,
}

impl SqlServerTarget {
    /// Split the URL by hand: named-instance hosts (`srv\SQLEXPRESS`) are not
    /// valid URL hosts
    fn parse(connection_string: &str) -> Result<Self> {
        let (_, rest) = connection_string
            .split_once("://")
            .ok_or_else(|| invalid("expected <driver>://..."))?;
        let (rest, query) = rest.split_once('?').unwrap_or((rest, ""));
        let (authority, database) = rest.split_once('/').unwrap_or((rest, ""));
        let (userinfo, host_port) = authority.rsplit_once('@').unwrap_or(("", authority));
        let (user, password) = userinfo.split_once(':').unwrap_or((userinfo, ""));

        let (host, port) = match host_port.rsplit_once(':') {
            Some((host, port)) if !port.contains(']') => {
                let port = port
                    .parse::<u16>()
                    .map_err(|_| invalid(format!("invalid port {port:?}")))?;
                (host, Some(port))
            }
            _ => (host_port, None),
        };
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(invalid("missing host"));
        }
        let (host, instance) = match host.split_once('\\') {
            Some((host, instance)) => (host, Some(instance.to_string())),
            None => (host, None),
        };

        let trust_cert = url::form_urlencoded::parse(query.as_bytes()).any(|(key, value)| {
            key.eq_ignore_ascii_case("trustservercertificate")
                && matches!(value.to_ascii_lowercase().as_str(), "1" | "true" | "yes")
        });

        Ok(Self {
            host: host.to_string(),
            instance,
            port,
            database: decode(database)?,
            user: decode(user)?,
            password: decode(password)?,
            trust_cert,
        })
    }

    /// Named instance without an explicit port: ask SQL Browser for the port
    fn uses_browser(&self) -> bool {
        self.instance.is_some() && self.port.is_none()
    }

    fn config(&self) -> Config {
        let mut config = Config::new();
        config.host(&self.host);
        config.port(self.port.unwrap_or(SQL_SERVER_DEFAULT_PORT));
        if let Some(instance) = &self.instance {
            config.instance_name(instance);
        }
        if !self.database.is_empty() {
            config.database(&self.database);
        }
        config.authentication(AuthMethod::sql_server(&self.user, &self.password));
        if self.trust_cert {
            config.trust_cert();
        }
        config
    }
}

fn decode(component: &str) -> Result<String> {
    percent_decode_str(component)
        .decode_utf8()
        .map(|decoded| decoded.into_owned())
        .map_err(|e| invalid(format!("invalid UTF-8 in URL component: {e}")))
}
