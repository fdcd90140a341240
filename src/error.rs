//! Failure taxonomy for the relay.
//!
//! Every failure the relay can observe falls into one of these kinds. Only
//! `Startup` and `Config` are allowed to end the process; everything else is
//! caught at a loop boundary, logged and recovered from.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum RelayError {
    /// Upstream unreachable or rejected the connection. Retried with backoff.
    #[error("connect to {url} failed (attempt {attempt}): {reason}")]
    Connect {
        url: String,
        attempt: u64,
        reason: String,
    },

    /// Stream ended or broke mid-session. Handled like `Connect`.
    #[error("read from {url} failed: {reason}")]
    Read { url: String, reason: String },

    /// Per-frame processing error. The frame passes through unannotated.
    #[error("processor '{processor}' failed: {reason}")]
    Processing { processor: String, reason: String },

    /// Outbound sink rejected a frame. The listener stays up.
    #[error("publish to {sink} failed: {reason}")]
    Publish { sink: String, reason: String },

    /// Could not acquire an outbound resource at start. Fatal.
    #[error("startup failed: {0}")]
    Startup(String),

    /// Invalid configuration. Fatal.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl RelayError {
    /// Whether the process should exit on this error.
    pub fn is_fatal(&self) -> bool {
        matches!(self, RelayError::Startup(_) | RelayError::Config(_))
    }
}

/// Strip userinfo from a stream URL before it reaches a log line.
///
/// Camera URLs routinely embed `user:password@`; anything that does not parse
/// as a URL is returned unchanged.
pub fn redact_url(raw: &str) -> String {
    match url::Url::parse(raw) {
        Ok(mut parsed) => {
            if parsed.password().is_some() || !parsed.username().is_empty() {
                let _ = parsed.set_username("***");
                let _ = parsed.set_password(None);
            }
            parsed.to_string()
        }
        Err(_) => raw.to_string(),
    }
}
