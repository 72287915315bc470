//! Gateway errors

/// Errors that can occur starting or operating the gateway
#[derive(Debug)]
pub enum GatewayError {
    /// Failed to start the gateway
    StartFailed(String),
    /// Database error
    Database(String),
    /// Authentication against the messaging network failed
    Auth(String),
    /// Network error
    Network(String),
    /// Gateway is not running
    NotRunning,
    /// Invalid input provided
    InvalidInput(String),
    /// IO error
    Io(String),
}

impl std::fmt::Display for GatewayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GatewayError::StartFailed(e) => write!(f, "failed to start gateway: {}", e),
            GatewayError::Database(e) => write!(f, "database error: {}", e),
            GatewayError::Auth(e) => write!(f, "authentication failed: {}", e),
            GatewayError::Network(e) => write!(f, "network error: {}", e),
            GatewayError::NotRunning => write!(f, "gateway is not running"),
            GatewayError::InvalidInput(e) => write!(f, "invalid input: {}", e),
            GatewayError::Io(e) => write!(f, "io error: {}", e),
        }
    }
}

impl std::error::Error for GatewayError {}

impl From<std::io::Error> for GatewayError {
    fn from(e: std::io::Error) -> Self {
        GatewayError::Io(e.to_string())
    }
}

impl From<rusqlite::Error> for GatewayError {
    fn from(e: rusqlite::Error) -> Self {
        GatewayError::Database(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gateway_error_display() {
        let err = GatewayError::NotRunning;
        assert_eq!(err.to_string(), "gateway is not running");

        let err = GatewayError::StartFailed("no session".to_string());
        assert_eq!(err.to_string(), "failed to start gateway: no session");

        let err = GatewayError::Database("locked".to_string());
        assert_eq!(err.to_string(), "database error: locked");

        let err = GatewayError::Auth("bad password".to_string());
        assert_eq!(err.to_string(), "authentication failed: bad password");

        let err = GatewayError::InvalidInput("empty body".to_string());
        assert_eq!(err.to_string(), "invalid input: empty body");
    }

    #[test]
    fn test_gateway_error_is_error_trait() {
        let err: Box<dyn std::error::Error> = Box::new(GatewayError::NotRunning);
        assert!(!err.to_string().is_empty());
    }

    #[test]
    fn test_from_io_error() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk gone");
        let err: GatewayError = io.into();
        assert!(matches!(err, GatewayError::Io(_)));
    }
}
