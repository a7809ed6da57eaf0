//! Per-call time bounds for external collaborators
//!
//! Every blob and record call the core makes goes through [`bounded`], so a
//! slow dependency turns into an `Upstream` error and follows the same failure
//! path as an explicit error.

use std::future::Future;
use std::time::Duration;

use crate::errors::AppError;

/// How long a single call to each external store may take
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadlines {
    pub blob: Duration,
    pub record: Duration,
}

impl Default for Deadlines {
    fn default() -> Self {
        Self {
            blob: Duration::from_secs(10),
            record: Duration::from_secs(3),
        }
    }
}

/// Run `call`, failing with `Upstream` if it takes longer than `limit`
pub async fn bounded<T, E, F>(limit: Duration, what: &str, call: F) -> Result<T, AppError>
where
    F: Future<Output = Result<T, E>>,
    E: Into<AppError>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result.map_err(Into::into),
        Err(_) => Err(AppError::upstream(format!(
            "{what} timed out after {}ms",
            limit.as_millis()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoreError;

    #[tokio::test]
    async fn test_bounded_passes_through_success() {
        let result = bounded(Duration::from_secs(1), "noop", async { Ok::<_, StoreError>(7) }).await;
        assert_eq!(result, Ok(7));
    }

    #[tokio::test]
    async fn test_bounded_converts_errors() {
        let result: Result<(), AppError> = bounded(Duration::from_secs(1), "insert", async {
            Err(StoreError::Conflict("taken".into()))
        })
        .await;
        assert_eq!(result, Err(AppError::conflict("taken")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_bounded_times_out_as_upstream() {
        let result: Result<(), AppError> = bounded(Duration::from_millis(50), "upload", async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<_, StoreError>(())
        })
        .await;

        match result {
            Err(AppError::Upstream(message)) => assert!(message.contains("upload timed out")),
            other => panic!("expected upstream timeout, got {other:?}"),
        }
    }
}
