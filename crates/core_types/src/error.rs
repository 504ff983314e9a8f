use thiserror::Error;

pub type GatewayResult<T> = std::result::Result<T, GatewayError>;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("provider `{0}` is not registered or none is available")]
    ProviderNotFound(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("provider `{backend}` failed: {source}")]
    Provider {
        backend: String,
        #[source]
        source: anyhow::Error,
    },
}

impl GatewayError {
    pub fn provider(backend: impl Into<String>, source: impl Into<anyhow::Error>) -> Self {
        Self::Provider {
            backend: backend.into(),
            source: source.into(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Only failures reported by a contacted backend are worth retrying.
    /// Missing credentials surface as `InvalidConfiguration` and are not.
    /// Callers re-enter the gateway, so a retry queues behind the rate
    /// limiter again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Provider { .. })
    }
}
