use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{
    sqlite::{
        SqliteAutoVacuum, SqliteConnectOptions, SqliteJournalMode, SqliteLockingMode,
        SqlitePoolOptions,
    },
    SqlitePool,
};

use crate::{
    config::Config,
    error::Error,
    message::{strip_html, EmailMessage, EmailStatus, NewEmail, DEFAULT_PRIORITY},
    transport::{HttpTransport, SendOutcome, Transport},
};

/// Records drained per invocation when the caller does not pass a limit.
pub const DEFAULT_DRAIN_LIMIT: i64 = 10;

/// An inbound send request, as received on the wire. Every field is
/// tolerated as absent at the serde layer; required-field checks happen in
/// [`Service::enqueue`] so violations surface as validation errors rather
/// than body-parse failures.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EnqueueRequest {
    pub to: String,
    pub to_name: Option<String>,
    pub from: Option<String>,
    pub from_name: Option<String>,
    pub reply_to: Option<String>,
    pub subject: String,
    pub html: String,
    pub text: Option<String>,
    pub template_type: Option<String>,
    pub template_data: Option<serde_json::Map<String, serde_json::Value>>,
    pub priority: Option<i64>,
}

/// What became of an accepted enqueue call: the record id, plus the
/// provider id when the immediate attempt already delivered it.
#[derive(Debug, Clone, Serialize)]
pub struct EnqueueReceipt {
    pub id: i64,
    pub delivered: bool,
    pub provider_id: Option<String>,
}

/// Per-invocation drain accounting. `failed` counts only records that went
/// terminal during this drain; rejected-but-retryable records count as
/// neither.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct DrainSummary {
    pub total: u64,
    pub sent: u64,
    pub failed: u64,
}

/// Read-only diagnostic projection of one record.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EmailStatusView {
    pub status: EmailStatus,
    pub attempts: i64,
    pub max_attempts: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sent_at: Option<DateTime<Utc>>,
}

/// How a single delivery attempt ended.
enum Attempt {
    /// Provider accepted; record is `sent`
    Sent { provider_id: String },
    /// Rejected with attempts remaining; record is `pending` again
    Requeued,
    /// Rejected at the attempt ceiling; record is `failed`
    Exhausted,
    /// The record was no longer `pending` when we tried to claim it
    Skipped,
    /// The send call never reached the provider; claim backed out
    NotAttempted,
}

pub struct Service {
    db: SqlitePool,
    config: Config,
    transport: Option<Arc<dyn Transport>>,
}

impl Service {
    pub async fn connect() -> eyre::Result<Self> {
        Self::connect_with(Config::default()).await
    }

    pub async fn connect_with(config: Config) -> eyre::Result<Self> {
        let transport =
            HttpTransport::from_config(&config)?.map(|t| Arc::new(t) as Arc<dyn Transport>);

        Self::connect_with_transport(config, transport).await
    }

    /// Connects with a caller-supplied transport (or none), bypassing
    /// transport construction from config.
    pub async fn connect_with_transport(
        config: Config,
        transport: Option<Arc<dyn Transport>>,
    ) -> eyre::Result<Self> {
        let opts = if let Some(path) = config.db_path() {
            SqliteConnectOptions::new()
                .filename(path)
                .create_if_missing(true)
        } else {
            SqliteConnectOptions::new().in_memory(true)
        }
        .foreign_keys(true)
        .journal_mode(SqliteJournalMode::Wal)
        .locking_mode(SqliteLockingMode::Normal)
        .optimize_on_close(true, None)
        .auto_vacuum(SqliteAutoVacuum::Full);

        // An in-memory database exists per connection, so the pool must not
        // grow past the connection the migrations ran on.
        let pool_opts = match config.db_path() {
            Some(_) => SqlitePoolOptions::new(),
            None => SqlitePoolOptions::new().max_connections(1),
        };

        let pool = pool_opts.connect_with(opts).await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self {
            db: pool,
            config,
            transport,
        })
    }

    pub fn db(&self) -> &SqlitePool {
        &self.db
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn transport_configured(&self) -> bool {
        self.transport.is_some()
    }

    /// Validates and persists a send request, then makes one immediate
    /// delivery attempt when a transport is configured.
    ///
    /// Validation failure is the only path that persists nothing. Once the
    /// record exists, delivery trouble never fails the call: the message is
    /// reported as queued and left to the drain worker.
    pub async fn enqueue(&self, request: EnqueueRequest) -> Result<EnqueueReceipt, Error> {
        Self::validate(&request)?;

        let text_body = match request.text {
            Some(text) if !text.trim().is_empty() => text,
            _ => strip_html(&request.html),
        };

        let new = NewEmail {
            recipient: request.to,
            recipient_name: request.to_name,
            sender: request
                .from
                .unwrap_or_else(|| self.config.default_sender.clone()),
            sender_name: request
                .from_name
                .or_else(|| self.config.default_sender_name.clone()),
            reply_to: request.reply_to,
            subject: request.subject,
            html_body: request.html,
            text_body,
            template_kind: request.template_type,
            template_data: request.template_data.unwrap_or_default(),
            priority: request.priority.unwrap_or(DEFAULT_PRIORITY),
        };

        let mut conn = self.db.acquire().await?;
        let email = EmailMessage::insert(&mut conn, new).await?;
        drop(conn);

        tracing::info!(email = email.id, recipient = %email.recipient, "queued outbound email");

        let Some(transport) = self.transport.clone() else {
            return Ok(EnqueueReceipt {
                id: email.id,
                delivered: false,
                provider_id: None,
            });
        };

        match self.attempt(transport.as_ref(), &email).await {
            Ok(Attempt::Sent { provider_id }) => Ok(EnqueueReceipt {
                id: email.id,
                delivered: true,
                provider_id: Some(provider_id),
            }),
            Ok(_) => Ok(EnqueueReceipt {
                id: email.id,
                delivered: false,
                provider_id: None,
            }),
            Err(e) => {
                tracing::warn!(email = email.id, error = %e, "immediate delivery attempt aborted");
                Ok(EnqueueReceipt {
                    id: email.id,
                    delivered: false,
                    provider_id: None,
                })
            }
        }
    }

    /// Attempts delivery for a bounded batch of eligible records, oldest
    /// highest-priority first. Sends run strictly one at a time; a failure
    /// on one record never aborts the rest of the batch.
    pub async fn drain(&self, limit: Option<i64>) -> Result<DrainSummary, Error> {
        let Some(transport) = self.transport.clone() else {
            return Err(Error::TransportUnavailable);
        };

        let limit = limit.unwrap_or(DEFAULT_DRAIN_LIMIT);

        let mut conn = self.db.acquire().await?;
        let eligible = EmailMessage::select_eligible(&mut conn, limit).await?;
        drop(conn);

        let mut summary = DrainSummary {
            total: eligible.len() as u64,
            sent: 0,
            failed: 0,
        };

        for email in eligible {
            match self.attempt(transport.as_ref(), &email).await {
                Ok(Attempt::Sent { .. }) => summary.sent += 1,
                Ok(Attempt::Exhausted) => summary.failed += 1,
                Ok(Attempt::Requeued | Attempt::Skipped | Attempt::NotAttempted) => {}
                Err(e) => {
                    tracing::warn!(email = email.id, error = %e, "skipping record after storage error");
                }
            }
        }

        tracing::info!(
            total = summary.total,
            sent = summary.sent,
            failed = summary.failed,
            "drain complete"
        );

        Ok(summary)
    }

    /// Read-only projection of one record's delivery state.
    pub async fn status(&self, id: i64) -> Result<EmailStatusView, Error> {
        let mut conn = self.db.acquire().await?;

        let email = EmailMessage::get(&mut conn, id)
            .await?
            .ok_or_else(|| Error::email_not_found(id))?;

        Ok(EmailStatusView {
            status: email.status,
            attempts: email.attempts,
            max_attempts: email.max_attempts,
            last_error: email.last_error,
            sent_at: email.sent_at,
        })
    }

    /// One claim-send-update cycle for a single record.
    async fn attempt(
        &self,
        transport: &dyn Transport,
        email: &EmailMessage,
    ) -> Result<Attempt, Error> {
        let mut conn = self.db.acquire().await?;
        let Some(claimed) = EmailMessage::claim(&mut conn, email.id).await? else {
            return Ok(Attempt::Skipped);
        };
        drop(conn);

        match transport.send(&claimed).await {
            Ok(SendOutcome::Delivered { provider_id }) => {
                let mut conn = self.db.acquire().await?;
                EmailMessage::mark_sent(&mut conn, claimed.id).await?;

                tracing::info!(email = claimed.id, provider_id = %provider_id, "email delivered");

                Ok(Attempt::Sent { provider_id })
            }
            Ok(SendOutcome::Rejected { reason }) => {
                let mut conn = self.db.acquire().await?;
                let updated = EmailMessage::mark_rejected(&mut conn, claimed.id, &reason).await?;

                if updated.status == EmailStatus::Failed {
                    tracing::warn!(
                        email = claimed.id,
                        attempts = updated.attempts,
                        reason = %reason,
                        "delivery failed permanently"
                    );
                    Ok(Attempt::Exhausted)
                } else {
                    tracing::info!(
                        email = claimed.id,
                        attempts = updated.attempts,
                        reason = %reason,
                        "delivery rejected, message requeued"
                    );
                    Ok(Attempt::Requeued)
                }
            }
            Err(Error::TransportUnavailable) => {
                let mut conn = self.db.acquire().await?;
                EmailMessage::release(&mut conn, claimed.id).await?;

                Ok(Attempt::NotAttempted)
            }
            Err(e) => {
                // Any other transport error reached the provider's side of
                // the fence and consumes the attempt.
                let mut conn = self.db.acquire().await?;
                let updated =
                    EmailMessage::mark_rejected(&mut conn, claimed.id, &e.to_string()).await?;

                Ok(if updated.status == EmailStatus::Failed {
                    Attempt::Exhausted
                } else {
                    Attempt::Requeued
                })
            }
        }
    }

    fn validate(request: &EnqueueRequest) -> Result<(), Error> {
        for (field, value) in [
            ("to", request.to.as_str()),
            ("subject", request.subject.as_str()),
            ("html", request.html.as_str()),
        ] {
            if value.trim().is_empty() {
                return Err(Error::validation(format!(
                    "missing required field: {field}"
                )));
            }
        }

        for (field, address) in [
            ("to", Some(&request.to)),
            ("from", request.from.as_ref()),
            ("replyTo", request.reply_to.as_ref()),
        ] {
            if let Some(address) = address {
                serde_email::Email::from_str(address)
                    .map_err(|e| Error::validation(format!("invalid {field} address: {e}")))?;
            }
        }

        Ok(())
    }
}
