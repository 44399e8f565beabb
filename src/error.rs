//! Closed error taxonomy for the pipeline.
//!
//! Every fallible operation in this crate resolves to one of these
//! variants. Only `ConfigError` is fatal; everything else is either
//! retried locally or turned into a typed outcome (a PASS reason, a
//! reject reason, a DLQ record).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("transient io error: {0}")]
    TransientIo(String),

    #[error("auth error: {0}")]
    AuthError(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("parse error: {0}")]
    ParseError(String),

    #[error("persist error: {0}")]
    PersistError(String),

    #[error("validation error: {0}")]
    ValidationError(String),

    #[error("config error: {0}")]
    ConfigError(String),
}

impl PipelineError {
    /// Exit code this error implies if it escapes all the way out of `main`.
    pub fn exit_code(&self) -> i32 {
        match self {
            PipelineError::ConfigError(_) => 2,
            _ => 1,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::TransientIo(_) => "transient_io",
            PipelineError::AuthError(_) => "auth_error",
            PipelineError::RateLimited(_) => "rate_limited",
            PipelineError::ParseError(_) => "parse_error",
            PipelineError::PersistError(_) => "persist_error",
            PipelineError::ValidationError(_) => "validation_error",
            PipelineError::ConfigError(_) => "config_error",
        }
    }
}

/// Retry a transient operation with bounded exponential backoff + jitter.
///
/// Mirrors the reconnect-with-backoff idiom used by the scraper session
/// helpers: cap the delay at 30s, give up after `max_attempts`.
pub async fn retry_transient<F, Fut, T>(max_attempts: u32, mut op: F) -> anyhow::Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = anyhow::Result<T>>,
{
    use rand::Rng;

    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if attempt + 1 >= max_attempts => return Err(e),
            Err(e) => {
                attempt += 1;
                let base_ms = 250u64.saturating_mul(1u64 << attempt.min(7));
                let jitter_ms = rand::thread_rng().gen_range(0..250);
                let delay_ms = base_ms.saturating_add(jitter_ms).min(30_000);
                tracing::warn!(
                    attempt,
                    max_attempts,
                    error = %e,
                    delay_ms,
                    "transient operation failed, retrying"
                );
                tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;
            }
        }
    }
}
