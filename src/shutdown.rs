use crate::error::PipelineError;
use std::thread;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Cancel the returned token on SIGINT or SIGTERM.
pub fn install_termination_handler() -> Result<CancellationToken, PipelineError> {
    let token = CancellationToken::new();
    let handler_token = token.clone();
    ctrlc::set_handler(move || {
        tracing::info!("termination requested");
        handler_token.cancel();
    })
    .map_err(|e| PipelineError::Other(format!("Failed to set signal handler: {}", e)))?;
    Ok(token)
}

/// Sleep for `duration` in short slices, returning early (false) when cancelled.
pub fn sleep_unless_cancelled(token: &CancellationToken, duration: Duration) -> bool {
    let deadline = Instant::now() + duration;
    while !token.is_cancelled() {
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        thread::sleep((deadline - now).min(Duration::from_millis(100)));
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sleep_returns_early_when_cancelled() {
        let token = CancellationToken::new();
        token.cancel();
        let started = Instant::now();
        assert!(!sleep_unless_cancelled(&token, Duration::from_secs(5)));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_sleep_completes_without_cancel() {
        let token = CancellationToken::new();
        assert!(sleep_unless_cancelled(&token, Duration::from_millis(20)));
    }
}
