use thiserror::Error;

/// Errors raised while resolving a connection string or building an engine
#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid environment: {0}")]
    InvalidEnvironment(String),

    #[error("Database connection parameters are not all set (missing: {})", .missing.join(", "))]
    MissingParameters { missing: Vec<String> },

    #[error("Invalid connection string: {reason}")]
    InvalidConnectionString { reason: String },

    #[error("Unsupported database driver: {0}")]
    UnsupportedDriver(String),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Failed to load .env file: {0}")]
    Dotenv(#[from] dotenvy::Error),

    #[error("A tokio runtime is required to open database connections")]
    NoRuntime,

    #[error("SQLite error: {0}")]
    Sqlite(#[from] sqlx::Error),

    #[error("SQL Server error: {0}")]
    SqlServer(#[from] tiberius::error::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Bad configuration: the caller asked for something that can never connect
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Error::InvalidEnvironment(_)
                | Error::MissingParameters { .. }
                | Error::InvalidConnectionString { .. }
                | Error::UnsupportedDriver(_)
                | Error::Config(_)
                | Error::Dotenv(_)
                | Error::NoRuntime
        )
    }

    /// Failure reported by the database runtime or the network
    pub fn is_connection(&self) -> bool {
        !self.is_validation()
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_parameters_message_lists_variables() {
        let err = Error::MissingParameters {
            missing: vec!["DB_HOST".to_string(), "DB_PORT".to_string()],
        };

        let message = err.to_string();
        assert!(message.starts_with("Database connection parameters are not all set"));
        assert!(message.contains("DB_HOST, DB_PORT"));
        assert!(err.is_validation());
    }

    #[test]
    fn io_errors_are_connection_errors() {
        let err = Error::from(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "refused",
        ));

        assert!(err.is_connection());
        assert!(!err.is_validation());
    }
}
