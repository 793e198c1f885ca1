//! Async utilities
//!
//! Store calls on the decision path run under a bounded timeout so that a
//! hung backend resolves to deny instead of blocking the caller.

use crate::error::{ErrorContext, GatekeepError, GatekeepResult};
use tokio::time::{timeout, Duration};

/// Timeout wrapper for async operations
pub async fn with_timeout<F, T>(
    future: F,
    timeout_ms: u64,
    operation_name: &str,
) -> GatekeepResult<T>
where
    F: std::future::Future<Output = GatekeepResult<T>>,
{
    match timeout(Duration::from_millis(timeout_ms), future).await {
        Ok(result) => result,
        Err(_) => Err(GatekeepError::Timeout {
            operation: operation_name.to_string(),
            duration_ms: timeout_ms,
            context: ErrorContext::new("async_utils")
                .with_operation(operation_name)
                .with_suggestion("Check store connectivity or raise store_timeout_ms"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn timeout_elapses_on_slow_operation() {
        let result: GatekeepResult<()> = with_timeout(
            async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok(())
            },
            10,
            "slow_op",
        )
        .await;

        assert!(matches!(result, Err(GatekeepError::Timeout { .. })));
    }

    #[tokio::test]
    async fn fast_operation_passes_through() {
        let result = with_timeout(async { Ok(42) }, 1_000, "fast_op").await;
        assert_eq!(result.unwrap(), 42);
    }
}
