//! Delivery transport: one external send attempt per call.
//!
//! Retry policy lives with the callers ([`crate::service::Service`]); a
//! transport only reports how a single attempt went. Ordinary provider
//! rejection is data ([`SendOutcome::Rejected`]), not an error. The only
//! error a transport raises is [`Error::TransportUnavailable`], for calls
//! that never reached the provider and must not count as an attempt.

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::config::Config;
use crate::error::Error;
use crate::message::EmailMessage;

const REASON_PREVIEW_LEN: usize = 256;

/// Result of a single send attempt that reached the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    Delivered { provider_id: String },
    Rejected { reason: String },
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, email: &EmailMessage) -> Result<SendOutcome, Error>;
}

#[derive(Serialize)]
struct SendPayload<'a> {
    from: String,
    to: [String; 1],
    subject: &'a str,
    html: &'a str,
    text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    reply_to: Option<&'a str>,
}

#[derive(Deserialize)]
struct ProviderResponse {
    id: String,
}

/// HTTP client for the provider's JSON send API, authenticated with a
/// bearer key. Requests carry a bounded timeout; a timed-out call is an
/// ordinary rejection with reason `"timeout"`.
pub struct HttpTransport {
    client: reqwest::Client,
    api_url: Url,
    api_key: SecretString,
}

impl HttpTransport {
    /// Builds a transport from configuration, or `None` when no API key is
    /// configured, in which case the queue runs in accept-only mode.
    pub fn from_config(config: &Config) -> eyre::Result<Option<Self>> {
        let Some(api_key) = config.transport_api_key.clone() else {
            return Ok(None);
        };

        let client = reqwest::Client::builder()
            .timeout(config.transport_timeout())
            .build()?;

        Ok(Some(Self {
            client,
            api_url: config.transport_api_url(),
            api_key,
        }))
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, email: &EmailMessage) -> Result<SendOutcome, Error> {
        if self.api_key.expose_secret().trim().is_empty() {
            return Err(Error::TransportUnavailable);
        }

        let payload = SendPayload {
            from: EmailMessage::format_address(&email.sender, email.sender_name.as_deref()),
            to: [EmailMessage::format_address(
                &email.recipient,
                email.recipient_name.as_deref(),
            )],
            subject: &email.subject,
            html: &email.html_body,
            text: &email.text_body,
            reply_to: email.reply_to.as_deref(),
        };

        let response = match self
            .client
            .post(self.api_url.clone())
            .bearer_auth(self.api_key.expose_secret())
            .json(&payload)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) if e.is_timeout() => {
                return Ok(SendOutcome::Rejected {
                    reason: "timeout".to_owned(),
                })
            }
            Err(e) => {
                return Ok(SendOutcome::Rejected {
                    reason: format!("transport request failed: {e}"),
                })
            }
        };

        let status = response.status();

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Ok(SendOutcome::Rejected {
                reason: format!("provider returned {status}: {}", preview(&body)),
            });
        }

        match response.json::<ProviderResponse>().await {
            Ok(accepted) => {
                tracing::debug!(email = email.id, provider_id = %accepted.id, "provider accepted message");
                Ok(SendOutcome::Delivered {
                    provider_id: accepted.id,
                })
            }
            Err(e) => Ok(SendOutcome::Rejected {
                reason: format!("provider response was unreadable: {e}"),
            }),
        }
    }
}

fn preview(body: &str) -> &str {
    let end = body
        .char_indices()
        .nth(REASON_PREVIEW_LEN)
        .map(|(i, _)| i)
        .unwrap_or(body.len());
    &body[..end]
}
