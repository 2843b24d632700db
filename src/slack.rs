//! Slack delivery of finished report artifacts.
//!
//! Notification is best-effort: an upload failure is reported into the
//! channel as a plain message when possible, and logged either way. A run
//! never fails because delivery failed.

use std::path::Path;

use anyhow::{Context, Result};
use reqwest::multipart;
use serde_json::json;
use tracing::{error, info};

const UPLOAD_URL: &str = "https://slack.com/api/files.upload";
const POST_MESSAGE_URL: &str = "https://slack.com/api/chat.postMessage";

pub struct SlackNotifier {
    http: reqwest::Client,
    token: String,
}

impl SlackNotifier {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            token: token.into(),
        }
    }

    /// Reads `SLACK_TOKEN`.
    pub fn from_env() -> Result<Self> {
        let token = std::env::var("SLACK_TOKEN").context("SLACK_TOKEN not set")?;
        Ok(Self::new(token))
    }

    /// Upload `file` to `channel` with an initial comment. Falls back to
    /// posting the error as a message if the upload fails.
    pub async fn upload_file(&self, file: &Path, channel: &str, comment: &str) {
        match self.try_upload(file, channel, comment).await {
            Ok(()) => info!(channel, file = %file.display(), "report uploaded"),
            Err(e) => {
                error!(channel, error = %e, "file upload failed");
                let text = format!("Error uploading file: {e}");
                if let Err(e) = self.post_message(channel, &text).await {
                    error!(channel, error = %e, "could not post upload error to channel");
                }
            }
        }
    }

    async fn try_upload(&self, file: &Path, channel: &str, comment: &str) -> Result<()> {
        let bytes = tokio::fs::read(file)
            .await
            .with_context(|| format!("reading {}", file.display()))?;
        let filename = file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "report.csv".to_string());

        let form = multipart::Form::new()
            .text("channels", channel.to_string())
            .text("initial_comment", comment.to_string())
            .part("file", multipart::Part::bytes(bytes).file_name(filename));

        let response = self
            .http
            .post(UPLOAD_URL)
            .bearer_auth(&self.token)
            .multipart(form)
            .send()
            .await?;
        check_slack_response(response).await
    }

    async fn post_message(&self, channel: &str, text: &str) -> Result<()> {
        let response = self
            .http
            .post(POST_MESSAGE_URL)
            .bearer_auth(&self.token)
            .json(&json!({ "channel": channel, "text": text }))
            .send()
            .await?;
        check_slack_response(response).await
    }
}

// Slack reports API errors in the body with HTTP 200, so the `ok` field is
// the real success signal.
async fn check_slack_response(response: reqwest::Response) -> Result<()> {
    if !response.status().is_success() {
        anyhow::bail!("slack returned {}", response.status());
    }
    let body: serde_json::Value = response.json().await?;
    if body["ok"].as_bool() != Some(true) {
        anyhow::bail!(
            "slack error: {}",
            body["error"].as_str().unwrap_or("unknown")
        );
    }
    Ok(())
}
