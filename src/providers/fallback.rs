//! Error classification for provider rotation.
//!
//! A failed call either counts against the provider and moves on to the
//! next one, or stops the request outright.
//!
//! **Rotate** (the provider is unhealthy or overloaded):
//! - 429 Too Many Requests
//! - any other non-2xx response
//! - connection errors, timeouts, broken streams, unparseable responses
//!
//! **Stop** (no other provider would do better):
//! - a request that could not be built
//! - no providers configured

use http::StatusCode;

use super::ProviderError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackDecision {
    /// Count an error against the provider and try the next one.
    Rotate,
    /// Return the error to the caller without touching provider state.
    Stop,
}

pub fn classify_provider_error(error: &ProviderError) -> FallbackDecision {
    match error {
        ProviderError::Request(e) => classify_reqwest_error(e),
        ProviderError::RateLimited { .. }
        | ProviderError::Timeout(_)
        | ProviderError::Stream(_)
        | ProviderError::InvalidResponse(_) => FallbackDecision::Rotate,
        ProviderError::Status { status, .. } => classify_http_status(*status),
        ProviderError::NoProviders | ProviderError::Exhausted { .. } => FallbackDecision::Stop,
        // Provider-local failure, e.g. a test backend or a local proxy bug
        ProviderError::Internal(_) => FallbackDecision::Rotate,
    }
}

fn classify_reqwest_error(error: &reqwest::Error) -> FallbackDecision {
    if error.is_builder() {
        return FallbackDecision::Stop;
    }
    match error.status() {
        Some(status) => classify_http_status(status),
        None => FallbackDecision::Rotate,
    }
}

/// Non-2xx responses rotate; anything else is not an error.
pub fn classify_http_status(status: StatusCode) -> FallbackDecision {
    if status.is_success() {
        FallbackDecision::Stop
    } else {
        FallbackDecision::Rotate
    }
}

/// Short label for logs.
pub fn error_kind(error: &ProviderError) -> &'static str {
    match error {
        ProviderError::Request(e) if e.is_timeout() => "timeout",
        ProviderError::Request(e) if e.is_connect() => "connect",
        ProviderError::Request(_) => "request",
        ProviderError::RateLimited { .. } => "rate_limited",
        ProviderError::Status { status, .. } if status.is_server_error() => "server_error",
        ProviderError::Status { .. } => "client_error",
        ProviderError::Timeout(_) => "timeout",
        ProviderError::Stream(_) => "stream",
        ProviderError::InvalidResponse(_) => "invalid_response",
        ProviderError::NoProviders => "no_providers",
        ProviderError::Exhausted { .. } => "exhausted",
        ProviderError::Internal(_) => "internal",
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(StatusCode::TOO_MANY_REQUESTS)]
    #[case(StatusCode::INTERNAL_SERVER_ERROR)]
    #[case(StatusCode::SERVICE_UNAVAILABLE)]
    #[case(StatusCode::BAD_REQUEST)]
    #[case(StatusCode::UNAUTHORIZED)]
    fn test_non_success_statuses_rotate(#[case] status: StatusCode) {
        assert_eq!(classify_http_status(status), FallbackDecision::Rotate);
        let err = ProviderError::from_status(status, "x");
        assert_eq!(classify_provider_error(&err), FallbackDecision::Rotate);
    }

    #[test]
    fn test_success_status_is_not_a_failure() {
        assert_eq!(classify_http_status(StatusCode::OK), FallbackDecision::Stop);
    }

    #[test]
    fn test_transport_failures_rotate() {
        for err in [
            ProviderError::Timeout(Duration::from_secs(1)),
            ProviderError::Stream("reset".into()),
            ProviderError::InvalidResponse("no choices".into()),
        ] {
            assert_eq!(classify_provider_error(&err), FallbackDecision::Rotate, "{err}");
        }
    }

    #[test]
    fn test_gateway_level_errors_stop() {
        assert_eq!(
            classify_provider_error(&ProviderError::NoProviders),
            FallbackDecision::Stop
        );
    }

    #[test]
    fn test_error_kind_labels() {
        assert_eq!(
            error_kind(&ProviderError::from_status(StatusCode::TOO_MANY_REQUESTS, "")),
            "rate_limited"
        );
        assert_eq!(
            error_kind(&ProviderError::from_status(StatusCode::BAD_GATEWAY, "")),
            "server_error"
        );
        assert_eq!(error_kind(&ProviderError::Timeout(Duration::ZERO)), "timeout");
    }
}
