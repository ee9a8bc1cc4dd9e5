use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("failed to connect to {addr}: {source}")]
    Connection {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("i/o error: {0}")]
    Io(io::Error),

    #[error("call timed out")]
    Timeout,

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("invalid API password")]
    InvalidPassword,

    #[error("action '{0}' not found on device")]
    ActionNotFound(String),

    #[error("not connected")]
    NotConnected,
}

impl NotifyError {
    /// Whether trying again after a reconnect could help.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            NotifyError::ActionNotFound(_) | NotifyError::InvalidPassword
        )
    }
}

impl From<io::Error> for NotifyError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => NotifyError::Timeout,
            _ => NotifyError::Io(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn socket_timeouts_map_to_timeout() {
        let err = NotifyError::from(io::Error::from(io::ErrorKind::WouldBlock));
        assert!(matches!(err, NotifyError::Timeout));

        let err = NotifyError::from(io::Error::from(io::ErrorKind::ConnectionReset));
        assert!(matches!(err, NotifyError::Io(_)));
    }

    #[test]
    fn missing_actions_are_not_retried() {
        assert!(!NotifyError::ActionNotFound("x".into()).is_retryable());
        assert!(!NotifyError::InvalidPassword.is_retryable());
        assert!(NotifyError::Timeout.is_retryable());
    }
}
