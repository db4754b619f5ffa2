use thiserror::Error;

pub type Result<T> = std::result::Result<T, RelayError>;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("config: {0}")]
    Config(String),

    #[error("storage: {0}")]
    Db(#[from] sqlx::Error),

    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),

    #[error("bind failed: {0}")]
    Bind(std::io::Error),
}
