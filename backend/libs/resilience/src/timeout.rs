/// Timeout wrappers for request-scoped work
use std::future::Future;
use std::time::{Duration, Instant};
use tokio::time::{timeout, timeout_at};

#[derive(Debug, thiserror::Error)]
pub enum TimeoutError {
    #[error("Operation timed out after {0:?}")]
    Elapsed(Duration),
    #[error("Deadline already passed")]
    DeadlinePassed,
}

/// Execute a future with timeout
pub async fn with_timeout<F, T>(duration: Duration, future: F) -> Result<T, TimeoutError>
where
    F: Future<Output = T>,
{
    timeout(duration, future)
        .await
        .map_err(|_| TimeoutError::Elapsed(duration))
}

/// Execute a future against an absolute deadline shared by several tasks of
/// one request. A deadline in the past fails without polling the future.
pub async fn with_deadline<F, T>(deadline: Instant, future: F) -> Result<T, TimeoutError>
where
    F: Future<Output = T>,
{
    let now = Instant::now();
    if deadline <= now {
        return Err(TimeoutError::DeadlinePassed);
    }
    let budget = deadline - now;
    timeout_at(tokio::time::Instant::from_std(deadline), future)
        .await
        .map_err(|_| TimeoutError::Elapsed(budget))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_timeout_success() {
        let result = with_timeout(Duration::from_secs(1), async { 42 }).await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_timeout_elapsed() {
        let result = with_timeout(Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            42
        })
        .await;

        assert!(matches!(result, Err(TimeoutError::Elapsed(_))));
    }

    #[tokio::test]
    async fn test_deadline_shared_by_tasks() {
        let deadline = Instant::now() + Duration::from_millis(30);

        let fast = with_deadline(deadline, async { 1 }).await;
        let slow = with_deadline(deadline, async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            2
        })
        .await;

        assert_eq!(fast.unwrap(), 1);
        assert!(matches!(slow, Err(TimeoutError::Elapsed(_))));
    }

    #[tokio::test]
    async fn test_past_deadline_rejected() {
        let deadline = Instant::now() - Duration::from_millis(1);
        let result = with_deadline(deadline, async { 1 }).await;
        assert!(matches!(result, Err(TimeoutError::DeadlinePassed)));
    }
}
