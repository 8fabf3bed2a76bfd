use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum TollgateError {
    #[error("I/O error: {0}")]
    #[diagnostic(code(tollgate::io))]
    Io(#[from] std::io::Error),

    #[error("Config error: {0}")]
    #[diagnostic(code(tollgate::config))]
    Config(#[from] config::ConfigError),

    #[error("Serialization error: {0}")]
    #[diagnostic(code(tollgate::serde))]
    Serde(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    #[diagnostic(code(tollgate::db))]
    Db(#[from] sea_orm::DbErr),

    #[error("JOSE error: {0}")]
    #[diagnostic(code(tollgate::jose))]
    Jose(String),

    #[error("{0}")]
    #[diagnostic(code(tollgate::other))]
    Other(String),
}

impl From<josekit::JoseError> for TollgateError {
    fn from(value: josekit::JoseError) -> Self {
        TollgateError::Jose(value.to_string())
    }
}
