use thiserror::Error;

#[derive(Debug, Error)]
pub enum KeelError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl KeelError {
    /// Short error code string surfaced to admin clients.
    pub fn code(&self) -> &'static str {
        match self {
            KeelError::Config(_) => "CONFIG_ERROR",
            KeelError::Io(_) => "IO_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, KeelError>;
