/// umcu-db CLI
///
/// Resolves the database connection string the library would use and checks
/// that the database is reachable, without writing any code.

use tracing_subscriber::EnvFilter;
use umcu_db::cli;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = cli::run_cli().await {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}
