use thiserror::Error;

#[derive(Debug, Error)]
pub enum RustBalanceError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Can't resolve upstream: {0}")]
    Resolve(String),

    #[error("No target present in upstream")]
    EmptyPool,

    #[error("Discovery error: {0}")]
    Discovery(String),

    #[error("Pacemaker error: {0}")]
    Pacemaker(String),
}

pub type Result<T> = std::result::Result<T, RustBalanceError>;
