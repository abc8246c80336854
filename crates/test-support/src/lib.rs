use anyhow::Context as _;
use std::future::Future;
use std::time::{Duration, Instant};

/// Write `contents` to a fresh temp file and return its handle.
///
/// The file is deleted when the handle drops, so keep it alive for the
/// duration of the test.
///
/// # Errors
///
/// Returns an error if the temp file cannot be created or written.
pub fn write_temp_config(contents: &str) -> anyhow::Result<tempfile::NamedTempFile> {
    let file = tempfile::NamedTempFile::new().context("create temp config")?;
    std::fs::write(file.path(), contents).context("write temp config")?;
    Ok(file)
}

/// Poll `check` until it returns true or `timeout_dur` elapses.
///
/// # Errors
///
/// Returns an error naming `what` if the timeout elapses first.
pub async fn wait_until<F, Fut>(
    what: &str,
    timeout_dur: Duration,
    mut check: F,
) -> anyhow::Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = Instant::now();
    loop {
        if check().await {
            return Ok(());
        }
        if start.elapsed() > timeout_dur {
            anyhow::bail!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
