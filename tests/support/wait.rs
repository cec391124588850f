use std::future::Future;
use std::time::{Duration, Instant};

use anyhow::{Context as _, Result};

pub async fn wait_for<T, F, Fut>(description: &str, timeout: Duration, mut f: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>>>,
{
    let deadline = Instant::now() + timeout;
    let sleep_for = Duration::from_millis(50);

    loop {
        if let Some(value) = f().await.with_context(|| format!("poll {description}"))? {
            return Ok(value);
        }

        if Instant::now() >= deadline {
            anyhow::bail!("timeout waiting for {description}");
        }

        tokio::time::sleep(sleep_for).await;
    }
}
