use chrono::Utc;
use sqlx::types::Json;
use sqlx::SqliteConnection;
use tokio_stream::StreamExt;

use crate::error::Error;
use crate::message::{EmailMessage, NewEmail, DEFAULT_MAX_ATTEMPTS};

impl EmailMessage {
    pub async fn insert(db: &mut SqliteConnection, new: NewEmail) -> Result<EmailMessage, Error> {
        let now = Utc::now();

        let email = sqlx::query_as(
            "
            INSERT INTO emails (
                recipient, recipient_name, sender, sender_name, reply_to,
                subject, html_body, text_body, template_kind, template_data,
                status, priority, attempts, max_attempts, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, 'pending', $11, 0, $12, $13, $13)
            RETURNING *
            ",
        )
        .bind(&new.recipient)
        .bind(&new.recipient_name)
        .bind(&new.sender)
        .bind(&new.sender_name)
        .bind(&new.reply_to)
        .bind(&new.subject)
        .bind(&new.html_body)
        .bind(&new.text_body)
        .bind(&new.template_kind)
        .bind(Json(&new.template_data))
        .bind(new.priority)
        .bind(DEFAULT_MAX_ATTEMPTS)
        .bind(now)
        .fetch_one(db)
        .await?;

        Ok(email)
    }

    pub async fn get(db: &mut SqliteConnection, id: i64) -> Result<Option<EmailMessage>, Error> {
        Ok(sqlx::query_as("SELECT * FROM emails WHERE id = $1")
            .bind(id)
            .fetch_optional(db)
            .await?)
    }

    /// Up to `limit` records eligible for delivery, oldest highest-priority
    /// first. The trailing id ordering keeps same-timestamp rows
    /// deterministic.
    pub async fn select_eligible(
        db: &mut SqliteConnection,
        limit: i64,
    ) -> Result<Vec<EmailMessage>, Error> {
        let mut stream = sqlx::query_as(
            "
            SELECT * FROM emails
            WHERE status = 'pending' AND attempts < max_attempts
            ORDER BY priority ASC, created_at ASC, id ASC
            LIMIT $1
            ",
        )
        .bind(limit)
        .fetch(db);

        let mut emails = Vec::new();

        while let Some(res) = stream.next().await.transpose()? {
            emails.push(res);
        }

        Ok(emails)
    }

    /// Transitions a record to `sending` and counts the attempt, but only if
    /// it is still `pending`. `None` means another invocation claimed it
    /// first and the caller should skip it.
    pub async fn claim(db: &mut SqliteConnection, id: i64) -> Result<Option<EmailMessage>, Error> {
        Ok(sqlx::query_as(
            "
            UPDATE emails
            SET status = 'sending', attempts = attempts + 1, updated_at = $2
            WHERE id = $1 AND status = 'pending'
            RETURNING *
            ",
        )
        .bind(id)
        .bind(Utc::now())
        .fetch_optional(db)
        .await?)
    }

    pub async fn mark_sent(db: &mut SqliteConnection, id: i64) -> Result<EmailMessage, Error> {
        sqlx::query_as(
            "
            UPDATE emails
            SET status = 'sent', sent_at = $2, updated_at = $2
            WHERE id = $1
            RETURNING *
            ",
        )
        .bind(id)
        .bind(Utc::now())
        .fetch_optional(db)
        .await?
        .ok_or_else(|| Error::email_not_found(id))
    }

    /// Records a rejected attempt: terminal `failed` once the ceiling is
    /// reached, otherwise back to `pending` for a future drain.
    pub async fn mark_rejected(
        db: &mut SqliteConnection,
        id: i64,
        reason: &str,
    ) -> Result<EmailMessage, Error> {
        sqlx::query_as(
            "
            UPDATE emails
            SET status = CASE WHEN attempts >= max_attempts THEN 'failed' ELSE 'pending' END,
                last_error = $2,
                updated_at = $3
            WHERE id = $1
            RETURNING *
            ",
        )
        .bind(id)
        .bind(reason)
        .bind(Utc::now())
        .fetch_optional(db)
        .await?
        .ok_or_else(|| Error::email_not_found(id))
    }

    /// Backs out a claim whose send call never reached the provider: the
    /// record returns to `pending` and the claimed attempt is un-counted.
    pub async fn release(db: &mut SqliteConnection, id: i64) -> Result<(), Error> {
        sqlx::query(
            "
            UPDATE emails
            SET status = 'pending', attempts = attempts - 1, updated_at = $2
            WHERE id = $1 AND status = 'sending'
            ",
        )
        .bind(id)
        .bind(Utc::now())
        .execute(db)
        .await
        .map(|_| ())
        .map_err(Error::from)
    }
}
