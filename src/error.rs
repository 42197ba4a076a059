//! Error taxonomy for the decision engine.
//!
//! Transient data and connection failures are retried locally, numeric and
//! position disagreements are resolved against the broker, and exhausted
//! connection retries halt the session loop.

use thiserror::Error;

/// Errors raised by the strategy core and its external collaborators.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Price, close or volatility missing from the feed.
    #[error("data unavailable: {0}")]
    DataUnavailable(String),

    /// Broker or data link down.
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// Non-finite equity or price.
    #[error("invalid numeric value for {field}: {value}")]
    InvalidNumeric { field: &'static str, value: f64 },

    /// Local belief disagrees with the broker's reported position.
    #[error("position mismatch: local {local} shares, broker {broker} shares")]
    PositionMismatch { local: i64, broker: i64 },

    /// The execution collaborator refused the order.
    #[error("order rejected: {0}")]
    OrderRejected(String),

    #[error("{operation} failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        operation: String,
        attempts: u32,
        #[source]
        source: Box<EngineError>,
    },

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl EngineError {
    /// Whether the retry policy should try the call again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::DataUnavailable(_) | Self::ConnectionLost(_))
    }

    /// Whether the session loop must halt (no further orders).
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::RetriesExhausted { source, .. } => {
                matches!(**source, Self::ConnectionLost(_))
            }
            Self::Config(_) => true,
            _ => false,
        }
    }
}

/// Convert a raw collaborator number into a validated finite value.
pub fn ensure_finite(field: &'static str, value: f64) -> Result<f64, EngineError> {
    if value.is_finite() {
        Ok(value)
    } else {
        Err(EngineError::InvalidNumeric { field, value })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(EngineError::ConnectionLost("eof".into()).is_retryable());
        assert!(EngineError::DataUnavailable("no vix".into()).is_retryable());
        assert!(!EngineError::OrderRejected("halted".into()).is_retryable());

        let exhausted = EngineError::RetriesExhausted {
            operation: "get_account_equity".into(),
            attempts: 5,
            source: Box::new(EngineError::ConnectionLost("refused".into())),
        };
        assert!(exhausted.is_fatal());

        let no_data = EngineError::RetriesExhausted {
            operation: "get_mark_price".into(),
            attempts: 5,
            source: Box::new(EngineError::DataUnavailable("no quote".into())),
        };
        assert!(!no_data.is_fatal());
        assert!(!no_data.is_retryable());
    }

    #[test]
    fn test_ensure_finite() {
        assert_eq!(ensure_finite("price", 281.5).unwrap(), 281.5);
        assert!(matches!(
            ensure_finite("price", f64::NAN),
            Err(EngineError::InvalidNumeric { field: "price", .. })
        ));
        assert!(ensure_finite("equity", f64::INFINITY).is_err());
    }
}
