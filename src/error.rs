use thiserror::Error;

#[derive(Error, Debug)]
pub enum ImportsError {
    #[error("Polars error: {0}")]
    Polars(#[from] polars::error::PolarsError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("HTTP error for {url}: {message}")]
    Http { url: String, message: String },

    #[error("Missing column: {0}")]
    MissingColumn(String),

    #[error("Missing input file: {0}")]
    MissingFile(String),

    #[error("Duplicate keys in {table}: {keys}")]
    DuplicateKeys { table: String, keys: String },

    #[error("Config: {0}")]
    Config(String),

    #[error("InvalidData: {0}")]
    InvalidData(String),

    #[error("No concordance path from '{from}' to '{to}'")]
    NoConcordancePath { from: String, to: String },
}

pub type Result<T> = std::result::Result<T, ImportsError>;
