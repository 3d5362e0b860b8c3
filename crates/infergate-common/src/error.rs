use thiserror::Error;

/// Error taxonomy surfaced through the OpenAI-shaped error body
/// `{"error": {"message", "type", "code"}}`.
#[derive(Debug, Clone, Error)]
pub enum ApiError {
    #[error("{0}")]
    InvalidRequest(String),

    #[error("Invalid API key")]
    Unauthorized,

    #[error("{0}")]
    NotFound(String),

    #[error("Rate limit exceeded")]
    RateLimited,

    #[error("{0}")]
    Server(String),

    /// First event never arrived within the request timeout.
    #[error("{0}")]
    Timeout(String),

    /// A model handler failed.
    #[error("{0}")]
    Model(String),
}

impl ApiError {
    /// Wire `type`/`code` string of the error.
    pub fn code(&self) -> &'static str {
        match self {
            ApiError::InvalidRequest(_) => "invalid_request_error",
            ApiError::Unauthorized => "unauthorized",
            ApiError::NotFound(_) => "not_found",
            ApiError::RateLimited => "rate_limit_exceeded",
            ApiError::Server(_) | ApiError::Timeout(_) => "server_error",
            ApiError::Model(_) => "model_error",
        }
    }

    pub fn status(&self) -> u16 {
        match self {
            ApiError::InvalidRequest(_) => 400,
            ApiError::Unauthorized => 401,
            ApiError::NotFound(_) => 404,
            ApiError::RateLimited => 429,
            ApiError::Server(_) => 500,
            ApiError::Timeout(_) => 504,
            ApiError::Model(_) => 400,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_and_statuses() {
        assert_eq!(ApiError::RateLimited.status(), 429);
        assert_eq!(ApiError::RateLimited.code(), "rate_limit_exceeded");
        assert_eq!(ApiError::Timeout("t".into()).status(), 504);
        assert_eq!(ApiError::Timeout("t".into()).code(), "server_error");
        assert_eq!(
            ApiError::InvalidRequest("x".into()).code(),
            "invalid_request_error"
        );
    }
}
