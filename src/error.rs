//! ReplIMap Error Types

use thiserror::Error;

/// Result type alias for ReplIMap operations
pub type Result<T> = std::result::Result<T, Error>;

/// ReplIMap error types
#[derive(Error, Debug)]
pub enum Error {
    // Argument errors
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    // Observer errors
    #[error("Observer closed")]
    ObserverClosed,

    #[error("Observer lagging: queue of {capacity} commands is full")]
    ObserverLagging { capacity: usize },

    #[error("Observer failed: {0}")]
    Observer(String),

    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Encoding errors
    #[error("Command serialization error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("Command argument decoding error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Frame corrupted: {0}")]
    FrameCorrupted(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Check if an observer returning this error should be deregistered
    pub fn detaches_observer(&self) -> bool {
        matches!(self, Error::ObserverClosed | Error::ObserverLagging { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detaching_errors() {
        assert!(Error::ObserverClosed.detaches_observer());
        assert!(Error::ObserverLagging { capacity: 4 }.detaches_observer());
        assert!(!Error::Observer("boom".into()).detaches_observer());
        assert!(!Error::InvalidArgument("x".into()).detaches_observer());
    }
}
