//! Broker error taxonomy.

use thiserror::Error;

/// Failures talking to the broker. All of them are transient from a
/// monitor's point of view and are retried on its own poll schedule.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("request to {endpoint} failed: {source}")]
    Http {
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{endpoint} returned HTTP {status}")]
    Status { endpoint: String, status: u16 },

    #[error("{endpoint} rejected the request (code {code}): {message}")]
    Api {
        endpoint: String,
        code: i32,
        message: String,
    },

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("failed to decode {endpoint} response: {source}")]
    Decode {
        endpoint: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("no active contract found for '{0}'")]
    ContractNotFound(String),

    #[error("'{symbol}' matches {count} active contracts")]
    AmbiguousContract { symbol: String, count: usize },

    #[error("no recent price for contract {0}")]
    NoPrice(String),

    #[error("simulated failure: {0}")]
    Simulated(String),
}

impl BrokerError {
    /// True for 401 responses, which invalidate the cached session token.
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, BrokerError::Status { status: 401, .. })
    }
}
