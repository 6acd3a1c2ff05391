use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use crate::connection::{resolve, ConnectionRequest, ResolvedConnection};
use crate::engine::Engine;
use crate::settings::DatabaseSettings;

#[derive(Parser)]
#[command(name = "umcu-db")]
#[command(about = "Resolve database connection strings and check connectivity", long_about = None)]
pub struct Cli {
    /// Path to a TOML settings file (environment variables take precedence)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(flatten)]
    pub connection: ConnectionArgs,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Args, Debug, Default)]
pub struct ConnectionArgs {
    /// Explicit connection string (skips resolution entirely)
    #[arg(long, global = true)]
    pub connection_string: Option<String>,

    /// Deployment whose tagged variables to read: ACC or PROD
    #[arg(long = "env", global = true)]
    pub environment: Option<String>,

    /// Schema to strip when the debug database is used
    #[arg(long = "schema", global = true)]
    pub schema_name: Option<String>,

    /// Use the local debug SQLite database
    #[arg(long, global = true)]
    pub debug: bool,

    /// Database user (overrides DB_USER)
    #[arg(long, global = true)]
    pub user: Option<String>,

    /// Database host (overrides DB_HOST / DB_HOST_<ENV>)
    #[arg(long, global = true)]
    pub host: Option<String>,

    /// Database port (overrides DB_PORT)
    #[arg(long, global = true)]
    pub port: Option<String>,

    /// Database name (overrides DB_DATABASE / DB_DATABASE_<ENV>)
    #[arg(long, global = true)]
    pub database: Option<String>,
}

impl ConnectionArgs {
    /// Request built from the flags; the password only ever comes from settings
    pub fn to_request(&self) -> ConnectionRequest {
        let mut request = ConnectionRequest::new().use_debug(self.debug);
        request.environment = self.environment.clone();
        request.schema_name = self.schema_name.clone();
        request.params.user = self.user.clone();
        request.params.host = self.host.clone();
        request.params.port = self.port.clone();
        request.params.database = self.database.clone();
        request
    }
}

#[derive(Subcommand)]
pub enum Commands {
    /// Print the resolved connection string (password redacted)
    Url,

    /// Build an engine and check the database answers
    Ping,
}

/// Run the CLI by parsing process arguments
pub async fn run_cli() -> Result<()> {
    let cli = Cli::parse();
    run_cli_with_args(cli).await
}

/// Run the CLI with provided arguments
pub async fn run_cli_from_args(args: Vec<String>) -> Result<()> {
    let cli = Cli::parse_from(args);
    run_cli_with_args(cli).await
}

async fn run_cli_with_args(cli: Cli) -> Result<()> {
    let resolved = resolve_from_cli(&cli)?;

    match cli.command {
        Commands::Url => {
            println!("{}", resolved.redacted());
            if let Some(options) = &resolved.execution_options {
                for (schema, target) in &options.schema_translate_map {
                    println!(
                        "schema translation: {} -> {}",
                        schema.as_deref().unwrap_or("<none>"),
                        target.as_deref().unwrap_or("<none>")
                    );
                }
            }
        }

        Commands::Ping => {
            let redacted = resolved.redacted();
            let engine = Engine::from_resolved(resolved).context("Failed to create engine")?;
            engine
                .ping()
                .await
                .with_context(|| format!("Failed to reach {}", redacted))?;
            println!("✓ {} is reachable", redacted);
        }
    }

    Ok(())
}

fn resolve_from_cli(cli: &Cli) -> Result<ResolvedConnection> {
    if let Some(connection_string) = &cli.connection.connection_string {
        return Ok(ResolvedConnection::explicit(connection_string.clone()));
    }

    let settings = DatabaseSettings::builder()
        .config_path(cli.config.clone())
        .build()
        .context("Failed to load settings")?;

    resolve(&cli.connection.to_request(), &settings)
        .context("Failed to resolve connection string")
}
