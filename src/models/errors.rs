use thiserror::Error;

/// Service-level errors that can occur in business logic
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("This item is no longer in your cart: store={store_id}, denomination={denomination}")]
    ItemNoLongerInCart {
        store_id: String,
        denomination: String,
    },

    #[error("No cart has been loaded yet")]
    NoCurrentCart,

    #[error("Validation error: {message}")]
    ValidationError { message: String },

    #[error("Repository error: {source}")]
    Repository {
        #[from]
        source: RepositoryError,
    },

    #[error("Serialization error: {source}")]
    Serialization {
        #[from]
        source: serde_json::Error,
    },
}

/// Errors raised while talking to the cart backend
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("Backend connection failed: {message}")]
    ConnectionFailed { message: String },

    #[error("Timeout occurred during operation")]
    Timeout,

    #[error("Unexpected status from {endpoint}: {status}: {body}")]
    UnexpectedStatus {
        endpoint: String,
        status: u16,
        body: String,
    },

    #[error("Invalid response body from {endpoint}: {message}")]
    Decode { endpoint: String, message: String },

    #[error("Serialization error: {source}")]
    Serialization {
        #[from]
        source: serde_json::Error,
    },

    #[error("HTTP client error: {message}")]
    Client { message: String },
}

impl From<reqwest::Error> for RepositoryError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            RepositoryError::Timeout
        } else if err.is_decode() {
            RepositoryError::Decode {
                endpoint: err
                    .url()
                    .map(|url| url.path().to_string())
                    .unwrap_or_default(),
                message: err.to_string(),
            }
        } else if err.is_connect() || err.is_request() {
            RepositoryError::ConnectionFailed {
                message: err.to_string(),
            }
        } else {
            RepositoryError::Client {
                message: err.to_string(),
            }
        }
    }
}

/// Result type alias for service operations
pub type ServiceResult<T> = Result<T, ServiceError>;

/// Result type alias for repository operations
pub type RepositoryResult<T> = Result<T, RepositoryError>;
