use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use crate::NotificationSink;

/// macOS notification center, through `osascript`.
pub struct DesktopNotifier {
    timeout: Duration,
}

impl Default for DesktopNotifier {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
        }
    }
}

/// Escape a value for an AppleScript string literal.
fn quote(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}

pub(crate) fn notification_script(title: &str, message: &str, subtitle: Option<&str>) -> String {
    let mut script = format!(
        "display notification {} with title {}",
        quote(message),
        quote(title)
    );
    if let Some(subtitle) = subtitle {
        script.push_str(" subtitle ");
        script.push_str(&quote(subtitle));
    }
    script
}

#[async_trait]
impl NotificationSink for DesktopNotifier {
    async fn notify(&self, title: &str, message: &str, subtitle: Option<&str>) {
        let script = notification_script(title, message, subtitle);
        let result = tokio::time::timeout(
            self.timeout,
            Command::new("osascript").arg("-e").arg(&script).kill_on_drop(true).output(),
        )
        .await;

        match result {
            Ok(Ok(output)) if output.status.success() => {}
            Ok(Ok(output)) => debug!(
                status = %output.status,
                stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                "notification rejected"
            ),
            Ok(Err(err)) => debug!(error = %err, "failed to run osascript"),
            Err(_) => debug!("notification timed out"),
        }
    }
}

/// Writes notifications to the log instead of the desktop.
pub struct LogNotifier;

#[async_trait]
impl NotificationSink for LogNotifier {
    async fn notify(&self, title: &str, message: &str, subtitle: Option<&str>) {
        match subtitle {
            Some(subtitle) => info!(target: "notification", "{title}: {message} ({subtitle})"),
            None => info!(target: "notification", "{title}: {message}"),
        }
    }
}
