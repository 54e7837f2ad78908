//! HTTP status and transport error mapping shared by the adapters.

use opsloop_core::error::ProviderError;
use reqwest::header::{HeaderMap, RETRY_AFTER};

/// Fallback wait when a 429 carries no usable `retry-after` header.
const DEFAULT_RETRY_AFTER_SECS: u64 = 5;

/// Map a transport-level reqwest failure.
pub(crate) fn transport_error(provider: &str, err: reqwest::Error) -> ProviderError {
    if err.is_timeout() {
        ProviderError::timeout(format!("{provider}: {err}"))
    } else {
        ProviderError::network(format!("{provider}: {err}"))
    }
}

/// Map a non-2xx response to a typed error.
pub(crate) fn status_error(
    provider: &str,
    status: u16,
    headers: &HeaderMap,
    body: String,
) -> ProviderError {
    match status {
        429 => ProviderError::RateLimited {
            retry_after_secs: retry_after_secs(headers).unwrap_or(DEFAULT_RETRY_AFTER_SECS),
        },
        401 | 403 => ProviderError::AuthenticationFailed {
            message: format!("{provider} rejected the API key (status {status})"),
        },
        _ => ProviderError::ApiError {
            status_code: status,
            message: body,
        },
    }
}

fn retry_after_secs(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<f64>()
        .ok()
        .map(|secs| secs.ceil().max(0.0) as u64)
}
