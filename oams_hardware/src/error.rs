use thiserror::Error;

#[derive(Debug, Error)]
pub enum PortError {
    #[error("feeder link disconnected")]
    Disconnected,
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, PortError>;
