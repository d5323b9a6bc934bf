pub mod client_core;
pub mod image_transport;
pub mod observer;
pub mod registry;
pub mod structured;
pub mod tool_execution;
pub mod types;

use reqwest::StatusCode;

pub use client_core::*;
pub use image_transport::*;
pub use observer::*;
pub use registry::*;
pub use structured::*;
pub use tool_execution::*;
pub use types::*;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LlmErrorKind {
    #[error("rate limited")]
    RateLimited,
    #[error("server error")]
    Server,
    #[error("network error")]
    Network,
    #[error("request timed out")]
    Timeout,
    #[error("client error")]
    Client,
    #[error("deserialize error")]
    Deserialize,
    #[error("request cancelled")]
    Cancelled,
    #[error("context length exceeded")]
    ContextLengthExceeded,
    #[error("content policy rejection")]
    ContentPolicy,
    #[error("unknown error")]
    Unknown,
}

impl LlmErrorKind {
    /// Transient kinds worth another attempt. Cancellation, policy
    /// rejections, and oversized contexts never are.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LlmErrorKind::RateLimited
                | LlmErrorKind::Server
                | LlmErrorKind::Network
                | LlmErrorKind::Timeout
        )
    }
}

pub fn classify_error(status: Option<StatusCode>, err: &anyhow::Error) -> LlmErrorKind {
    if let Some(kind) = err.downcast_ref::<LlmErrorKind>() {
        return kind.clone();
    }
    if let Some(st) = status {
        if st == StatusCode::TOO_MANY_REQUESTS {
            return LlmErrorKind::RateLimited;
        }
        if st.is_server_error() {
            return LlmErrorKind::Server;
        }
        if st.is_client_error() {
            return LlmErrorKind::Client;
        }
    }
    if let Some(e) = err.downcast_ref::<reqwest::Error>() {
        if e.is_timeout() {
            return LlmErrorKind::Timeout;
        }
        if e.is_connect() || e.is_body() || e.is_request() {
            return LlmErrorKind::Network;
        }
    }
    if err.downcast_ref::<serde_json::Error>().is_some() {
        return LlmErrorKind::Deserialize;
    }
    LlmErrorKind::Unknown
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn classifies_embedded_kind_first() {
        let err = anyhow!(LlmErrorKind::ContentPolicy);
        assert_eq!(classify_error(None, &err), LlmErrorKind::ContentPolicy);
    }

    #[test]
    fn classifies_status_codes() {
        let err = anyhow!("whatever");
        assert_eq!(
            classify_error(Some(StatusCode::TOO_MANY_REQUESTS), &err),
            LlmErrorKind::RateLimited
        );
        assert_eq!(
            classify_error(Some(StatusCode::INTERNAL_SERVER_ERROR), &err),
            LlmErrorKind::Server
        );
        assert_eq!(
            classify_error(Some(StatusCode::BAD_REQUEST), &err),
            LlmErrorKind::Client
        );
    }

    #[test]
    fn retryable_kinds() {
        assert!(LlmErrorKind::RateLimited.is_retryable());
        assert!(LlmErrorKind::Timeout.is_retryable());
        assert!(!LlmErrorKind::Cancelled.is_retryable());
        assert!(!LlmErrorKind::ContentPolicy.is_retryable());
        assert!(!LlmErrorKind::ContextLengthExceeded.is_retryable());
    }
}
