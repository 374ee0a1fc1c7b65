//! LLM error types with retry classification.
//!
//! Distinguishes rate-limit errors (retried with exponential backoff by the
//! gateways) from everything else (propagated immediately).

/// Markers that classify an error message as a rate limit. Matching is
/// case-insensitive substring search over the provider's error text.
pub const RATE_LIMIT_MARKERS: &[&str] = &["rate_limit", "429", "overloaded"];

/// Error from LLM API calls.
#[derive(Debug)]
pub struct LlmError {
    /// The kind of error
    pub kind: LlmErrorKind,
    /// HTTP status code, if applicable
    pub status_code: Option<u16>,
    /// Error message
    pub message: String,
}

impl LlmError {
    /// Create a rate limit error.
    pub fn rate_limited(message: String) -> Self {
        Self {
            kind: LlmErrorKind::RateLimited,
            status_code: Some(429),
            message,
        }
    }

    /// Create a server error.
    pub fn server_error(status_code: u16, message: String) -> Self {
        Self {
            kind: LlmErrorKind::ServerError,
            status_code: Some(status_code),
            message,
        }
    }

    /// Create a client error (bad request, auth, etc.).
    pub fn client_error(status_code: u16, message: String) -> Self {
        Self {
            kind: LlmErrorKind::ClientError,
            status_code: Some(status_code),
            message,
        }
    }

    /// Create a network error.
    pub fn network_error(message: String) -> Self {
        Self {
            kind: LlmErrorKind::NetworkError,
            status_code: None,
            message,
        }
    }

    /// Create a parse error.
    pub fn parse_error(message: String) -> Self {
        Self {
            kind: LlmErrorKind::ParseError,
            status_code: None,
            message,
        }
    }

    /// Check if this error should be retried with backoff.
    pub fn is_rate_limited(&self) -> bool {
        self.kind == LlmErrorKind::RateLimited
    }
}

impl std::fmt::Display for LlmError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.status_code {
            Some(code) => write!(f, "{} (HTTP {}): {}", self.kind, code, self.message),
            None => write!(f, "{}: {}", self.kind, self.message),
        }
    }
}

impl std::error::Error for LlmError {}

/// Classification of LLM errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmErrorKind {
    /// Rate limited or provider overloaded - retried with backoff
    RateLimited,
    /// Server error (500, 502, 503, 504) - propagated
    ServerError,
    /// Client error (400, 401, 403, 404) - propagated
    ClientError,
    /// Network error (connection failed, timeout) - propagated
    NetworkError,
    /// Response parsing error - propagated
    ParseError,
}

impl std::fmt::Display for LlmErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LlmErrorKind::RateLimited => write!(f, "Rate limited"),
            LlmErrorKind::ServerError => write!(f, "Server error"),
            LlmErrorKind::ClientError => write!(f, "Client error"),
            LlmErrorKind::NetworkError => write!(f, "Network error"),
            LlmErrorKind::ParseError => write!(f, "Parse error"),
        }
    }
}

/// Parse HTTP status code into error kind. 529 is Anthropic's "overloaded".
pub fn classify_http_status(status: u16) -> LlmErrorKind {
    match status {
        429 | 529 => LlmErrorKind::RateLimited,
        500 | 502 | 503 | 504 => LlmErrorKind::ServerError,
        400..=499 => LlmErrorKind::ClientError,
        _ => LlmErrorKind::ServerError,
    }
}

/// Classify an error by its message text. Rate limits surface in many
/// shapes across providers; the markers are substring-matched so a body
/// like `{"type":"rate_limit_error",...}` or a bare `429` both count.
pub fn classify_error_message(message: &str) -> LlmErrorKind {
    let lower = message.to_lowercase();
    if RATE_LIMIT_MARKERS.iter().any(|m| lower.contains(m)) {
        LlmErrorKind::RateLimited
    } else {
        LlmErrorKind::ServerError
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_status_classification() {
        assert_eq!(classify_http_status(429), LlmErrorKind::RateLimited);
        assert_eq!(classify_http_status(529), LlmErrorKind::RateLimited);
        assert_eq!(classify_http_status(500), LlmErrorKind::ServerError);
        assert_eq!(classify_http_status(503), LlmErrorKind::ServerError);
        assert_eq!(classify_http_status(400), LlmErrorKind::ClientError);
        assert_eq!(classify_http_status(401), LlmErrorKind::ClientError);
    }

    #[test]
    fn test_message_classification() {
        assert_eq!(
            classify_error_message("Error code: 429 - rate_limit_error"),
            LlmErrorKind::RateLimited
        );
        assert_eq!(
            classify_error_message("The API is temporarily OVERLOADED"),
            LlmErrorKind::RateLimited
        );
        assert_eq!(
            classify_error_message("invalid request body"),
            LlmErrorKind::ServerError
        );
    }

    #[test]
    fn test_rate_limited_flag() {
        assert!(LlmError::rate_limited("busy".to_string()).is_rate_limited());
        assert!(!LlmError::server_error(500, "boom".to_string()).is_rate_limited());
    }
}
