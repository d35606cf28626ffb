//! External decision commands.
//!
//! Analysis and supervision decisions are made outside this crate. A
//! configured shell command receives its inputs through environment
//! variables and prints a JSON object on stdout, possibly surrounded by
//! other text such as a fenced code block.

use anyhow::{bail, Context, Result};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

/// Run `command` through the shell and decode the JSON object it prints.
pub async fn run_json_command<T: DeserializeOwned>(
    command: &str,
    env: &[(&str, String)],
    timeout: Duration,
) -> Result<T> {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(command).kill_on_drop(true);
    for (key, value) in env {
        cmd.env(key, value);
    }

    debug!(command, "Running decision command");
    let output = tokio::time::timeout(timeout, cmd.output())
        .await
        .with_context(|| format!("Decision command timed out after {:?}", timeout))?
        .context("Failed to spawn decision command")?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        warn!(status = %output.status, %stderr, "Decision command failed");
        bail!("Decision command exited with {}", output.status);
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let json = extract_json_object(&stdout)
        .with_context(|| format!("No JSON object in command output: {}", stdout.trim()))?;
    serde_json::from_str(json).context("Failed to decode decision JSON")
}

/// The outermost `{...}` span of `text`.
pub fn extract_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}
