use std::future::Future;
use std::time::Duration;

/// Run `fut` for at most `limit`. `None` means the deadline passed and the
/// future was dropped.
pub(crate) async fn within<F>(limit: Duration, fut: F) -> Option<F::Output>
where
    F: Future,
{
    tokio::time::timeout(limit, fut).await.ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_within_returns_output_before_deadline() {
        assert_eq!(within(Duration::from_secs(1), async { 7 }).await, Some(7));
    }

    #[tokio::test]
    async fn test_within_gives_up_after_deadline() {
        let slow = tokio::time::sleep(Duration::from_secs(5));
        assert_eq!(within(Duration::from_millis(10), slow).await, None);
    }
}
