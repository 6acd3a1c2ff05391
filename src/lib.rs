//! Database connection helpers
//!
//! Resolves a connection string from explicit parameters, settings files and
//! `DB_*` environment variables, and builds an [`Engine`] from it. Without a
//! configured user the local debug SQLite database (`./sql_app.db`) is used.
//!
//! ```no_run
//! use umcu_db::{create_engine, ConnectionRequest};
//!
//! # async fn run() -> umcu_db::Result<()> {
//! let engine = create_engine(None, &ConnectionRequest::new().environment("ACC"))?;
//! engine.ping().await?;
//! # Ok(())
//! # }
//! ```

pub mod cli;
pub mod connection;
pub mod engine;
pub mod error;
pub mod settings;

pub use connection::{
    get_connection_string, resolve, ConnectionParams, ConnectionRequest, ExecutionOptions,
    ResolvedConnection,
};
pub use engine::{create_engine, create_engine_with_settings, Connection, Engine};
pub use error::{Error, Result};
pub use settings::{DatabaseSettings, DbEnvironment, SettingsBuilder};
