use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum GateError {
    #[error("I/O error: {0}")]
    #[diagnostic(code(nightgate::io))]
    Io(#[from] std::io::Error),

    #[error("Config error: {0}")]
    #[diagnostic(code(nightgate::config))]
    Config(#[from] config::ConfigError),

    #[error("Serialization error: {0}")]
    #[diagnostic(code(nightgate::serde))]
    Serde(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    #[diagnostic(code(nightgate::db))]
    Db(#[from] sea_orm::DbErr),

    #[error("JOSE error: {0}")]
    #[diagnostic(code(nightgate::jose))]
    Jose(String),

    /// The random source or user-code space is degraded; never mapped to a client-facing code.
    #[error("could not allocate a unique user code after {attempts} attempts")]
    #[diagnostic(
        code(nightgate::user_code_space_exhausted),
        help("check the system random source and the number of live device codes")
    )]
    UserCodeSpaceExhausted { attempts: u32 },

    #[error("Not found: {0}")]
    #[diagnostic(code(nightgate::not_found))]
    NotFound(String),

    #[error("Conflict: {0}")]
    #[diagnostic(code(nightgate::conflict))]
    Conflict(String),

    #[error("Validation failed: {0}")]
    #[diagnostic(code(nightgate::validation))]
    Validation(String),

    #[error("Password hashing failed: {0}")]
    #[diagnostic(code(nightgate::password_hash))]
    PasswordHash(String),

    #[error("HTTP error: {0}")]
    #[diagnostic(code(nightgate::http))]
    Http(String),

    #[error("{0}")]
    #[diagnostic(code(nightgate::other))]
    Other(String),
}

impl From<josekit::JoseError> for GateError {
    fn from(value: josekit::JoseError) -> Self {
        GateError::Jose(value.to_string())
    }
}

impl From<reqwest::Error> for GateError {
    fn from(value: reqwest::Error) -> Self {
        GateError::Http(value.to_string())
    }
}
