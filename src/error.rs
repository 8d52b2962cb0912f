use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid graph structure: {0}")]
    InvalidGraph(String),

    #[error("Unknown node: {0}")]
    UnknownNode(usize),

    #[error("Unknown edge: {0}")]
    UnknownEdge(usize),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Validation error: {0}")]
    Validation(String),
}
