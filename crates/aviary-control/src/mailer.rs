//! Transactional email notifications.
//!
//! Email is never part of the core control flow: every call site logs and
//! swallows failures. Template rendering is out of scope; bodies are plain
//! formatted strings.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tracing::debug;

use crate::config::MailerConfig;
use crate::error::{ControlError, ControlResult};

/// A message to deliver.
#[derive(Debug, Clone, Serialize)]
pub struct EmailMessage {
    /// Recipient address.
    pub to: String,
    /// Subject line.
    pub subject: String,
    /// Plain-text body.
    pub body: String,
}

/// Transactional email sender.
#[async_trait]
pub trait Mailer: Send + Sync {
    /// Deliver a single message.
    async fn send(&self, message: &EmailMessage) -> ControlResult<()>;
}

/// Create a mailer from configuration.
#[must_use]
pub fn create_mailer(config: &MailerConfig) -> std::sync::Arc<dyn Mailer> {
    if config.enabled {
        match HttpMailer::new(config) {
            Ok(mailer) => return std::sync::Arc::new(mailer),
            Err(e) => {
                tracing::warn!(error = %e, "failed to build HTTP mailer, email disabled");
            }
        }
    }
    std::sync::Arc::new(NoopMailer)
}

/// HTTP implementation posting to the email API.
#[derive(Debug, Clone)]
pub struct HttpMailer {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    from_address: String,
}

impl HttpMailer {
    /// Build a mailer from configuration.
    pub fn new(config: &MailerConfig) -> ControlResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(ControlError::Http)?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_owned(),
            api_key: config.api_key.clone(),
            from_address: config.from_address.clone(),
        })
    }
}

#[derive(Serialize)]
struct OutgoingMessage<'a> {
    from: &'a str,
    to: &'a str,
    subject: &'a str,
    text: &'a str,
}

#[async_trait]
impl Mailer for HttpMailer {
    async fn send(&self, message: &EmailMessage) -> ControlResult<()> {
        let url = format!("{}/messages", self.base_url);
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&OutgoingMessage {
                from: &self.from_address,
                to: &message.to,
                subject: &message.subject,
                text: &message.body,
            })
            .send()
            .await
            .map_err(ControlError::Http)?;

        if !response.status().is_success() {
            return Err(ControlError::mailer(format!(
                "email API returned {}",
                response.status()
            )));
        }

        Ok(())
    }
}

/// Mailer that drops every message. Used when email is disabled and in tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMailer;

#[async_trait]
impl Mailer for NoopMailer {
    async fn send(&self, message: &EmailMessage) -> ControlResult<()> {
        debug!(to = %message.to, subject = %message.subject, "email suppressed (mailer disabled)");
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn noop_mailer_accepts_everything() {
        let mailer = NoopMailer;
        let message = EmailMessage {
            to: "owner@example.com".to_owned(),
            subject: "Your bot was approved".to_owned(),
            body: "echo-bot is now available for deployment.".to_owned(),
        };
        assert!(mailer.send(&message).await.is_ok());
    }

    #[test]
    fn http_mailer_construction() {
        let config = MailerConfig::default();
        assert!(HttpMailer::new(&config).is_ok());
    }
}
