// MIT License - Copyright (c) 2026 Peter Wright
// Error taxonomy of the bridge

/// All errors that can occur inside the bridge.
///
/// None of these are fatal to the running bridge: transport errors are
/// retried by the connection supervisor, everything else is logged and
/// dropped at the point where it happens.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Connection error: {details}")]
    Connection { details: String },

    #[error("Connection timeout")]
    ConnectTimeout,

    #[error("Not connected to broker")]
    NotConnected,

    #[error("Client request rejected: {details}")]
    Client { details: String },

    #[error("Command queue full (capacity {capacity})")]
    QueueFull { capacity: usize },

    #[error("Invalid state {state} for category {category}")]
    InvalidState { state: String, category: String },

    #[error("Handler {name} failed: {details}")]
    Handler { name: String, details: String },

    #[error("Invalid configuration: {reason}")]
    Config { reason: String },
}

impl BridgeError {
    /// Whether this error is a transport failure that the supervisor retries.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BridgeError::Io(_)
                | BridgeError::Connection { .. }
                | BridgeError::ConnectTimeout
                | BridgeError::NotConnected
                | BridgeError::Client { .. }
        )
    }

    pub(crate) fn handler(name: &str, details: impl std::fmt::Display) -> Self {
        BridgeError::Handler {
            name: name.to_string(),
            details: details.to_string(),
        }
    }
}

impl From<rumqttc::ClientError> for BridgeError {
    fn from(e: rumqttc::ClientError) -> Self {
        BridgeError::Client {
            details: e.to_string(),
        }
    }
}

impl From<rumqttc::ConnectionError> for BridgeError {
    fn from(e: rumqttc::ConnectionError) -> Self {
        BridgeError::Connection {
            details: e.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, BridgeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_errors_are_retryable() {
        assert!(BridgeError::ConnectTimeout.is_retryable());
        assert!(BridgeError::NotConnected.is_retryable());
        assert!(BridgeError::Connection { details: "reset".into() }.is_retryable());
    }

    #[test]
    fn test_local_errors_are_not_retryable() {
        assert!(!BridgeError::QueueFull { capacity: 10 }.is_retryable());
        assert!(!BridgeError::handler("command_handler", "boom").is_retryable());
        let decode = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        assert!(!BridgeError::from(decode).is_retryable());
    }

    #[test]
    fn test_error_display() {
        let e = BridgeError::InvalidState {
            state: "DIM".into(),
            category: "switch".into(),
        };
        assert_eq!(e.to_string(), "Invalid state DIM for category switch");
        let e = BridgeError::handler("command_handler", "boom");
        assert_eq!(e.to_string(), "Handler command_handler failed: boom");
    }
}
