/// Error types for the chat engine
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ChatError {
    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Timeout error: {0}")]
    Timeout(String),
}

impl ChatError {
    /// Transport-level failures the caller may retry on its own terms
    pub fn is_network(&self) -> bool {
        matches!(
            self,
            ChatError::Network(_) | ChatError::Io(_) | ChatError::Timeout(_)
        )
    }

    pub fn is_auth(&self) -> bool {
        matches!(self, ChatError::Auth(_))
    }
}

pub type Result<T> = std::result::Result<T, ChatError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_category() {
        let io = ChatError::Io(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe"));
        assert!(io.is_network());
        assert!(ChatError::Timeout("handshake".into()).is_network());
        assert!(!ChatError::Auth("rejected".into()).is_network());
        assert!(ChatError::Auth("rejected".into()).is_auth());
    }
}
