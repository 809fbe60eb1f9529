use anyhow::Result;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// Bytes collected from a running process, shared with the task reading them
#[derive(Debug, Clone, Default)]
pub struct OutputCapture {
    raw_output: Arc<Mutex<Vec<u8>>>,
}

impl OutputCapture {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn capture_bytes(&self, data: &[u8]) {
        self.raw_output.lock().await.extend_from_slice(data);
    }

    /// For readers running on a blocking thread
    pub fn capture_bytes_blocking(&self, data: &[u8]) {
        self.raw_output.blocking_lock().extend_from_slice(data);
    }

    pub async fn raw_output(&self) -> Vec<u8> {
        self.raw_output.lock().await.clone()
    }

    pub async fn text(&self) -> String {
        String::from_utf8_lossy(&self.raw_output.lock().await).into_owned()
    }

    /// Lines with the terminal's `\r\n` endings normalised
    pub async fn lines(&self) -> Vec<String> {
        self.text()
            .await
            .lines()
            .map(|line| line.trim_end_matches('\r').to_string())
            .collect()
    }

    pub async fn clear(&self) {
        self.raw_output.lock().await.clear();
    }

    /// Wait until the output contains `pattern`, returning everything seen so far
    pub async fn wait_for(&self, pattern: &str, timeout: Duration) -> Result<String> {
        let start = Instant::now();

        while start.elapsed() < timeout {
            let text = self.text().await;
            if text.contains(pattern) {
                return Ok(text);
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        anyhow::bail!(
            "Timeout waiting for {:?}, got {:?}",
            pattern,
            self.text().await
        )
    }

    /// Wait for a line matching `regex` and return that line
    pub async fn wait_for_regex(&self, regex: &regex::Regex, timeout: Duration) -> Result<String> {
        let start = Instant::now();

        while start.elapsed() < timeout {
            if let Some(line) = self.lines().await.into_iter().find(|l| regex.is_match(l)) {
                return Ok(line);
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        anyhow::bail!("Timeout waiting for regex: {}", regex)
    }
}
