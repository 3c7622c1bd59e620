use thiserror::Error;

/// Errors surfaced by the broker-facing layers (auth, REST, streaming).
///
/// Non-fatal variants are absorbed at the component boundary; only
/// `AuthUnavailable` at startup terminates the process.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("authentication unavailable: {reason}")]
    AuthUnavailable { reason: String },

    #[error("rate limited by broker, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("streaming subscription limit exceeded")]
    SubscriptionLimit,

    #[error("transport failure: {reason}")]
    Transport { reason: String },

    #[error("malformed stream frame at offset {offset}: {reason}")]
    Decode { offset: usize, reason: String },

    #[error("broker returned {status}: {body}")]
    Remote { status: u16, body: String },
}

impl GatewayError {
    /// Non-retryable failures: callers should not loop on these.
    pub fn is_fatal(&self) -> bool {
        matches!(self, GatewayError::AuthUnavailable { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limited_formatting() {
        let err = GatewayError::RateLimited {
            retry_after_secs: 42,
        };
        assert!(err.to_string().contains("42s"));
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_auth_unavailable_is_fatal() {
        let err = GatewayError::AuthUnavailable {
            reason: "refresh rejected".to_string(),
        };
        assert!(err.is_fatal());
        assert!(err.to_string().contains("refresh rejected"));
    }
}
