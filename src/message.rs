//! Email message types and delivery lifecycle.
//!
//! An [`EmailMessage`] is the persisted unit representing one outbound email
//! and its delivery state. Records are created in `Pending` status and move
//! through `Sending` on each delivery attempt, landing in `Sent` on provider
//! acceptance or `Failed` once the attempt ceiling is exhausted.
//!
//! # Lifecycle
//!
//! 1. Created `Pending` with zero attempts
//! 2. Claimed for delivery: `Sending`, attempts incremented
//! 3. Provider accepted: `Sent` (terminal, `sent_at` recorded)
//! 4. Provider rejected: back to `Pending` while attempts remain,
//!    otherwise `Failed` (terminal, `last_error` recorded)

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::prelude::FromRow;
use sqlx::types::Json;

/// Ceiling on delivery attempts for newly created records.
pub const DEFAULT_MAX_ATTEMPTS: i64 = 3;

/// Priority assigned when the caller does not provide one. Lower values
/// drain first.
pub const DEFAULT_PRIORITY: i64 = 100;

/// Current delivery state of an email record.
///
/// `Sent` and `Failed` are terminal. A record is eligible for a delivery
/// attempt only while `Pending` with attempts below its ceiling.
#[derive(
    Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, sqlx::Type, strum::Display,
)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum EmailStatus {
    /// Waiting for a delivery attempt
    Pending,
    /// Claimed by an in-flight delivery attempt
    Sending,
    /// Provider accepted the message
    Sent,
    /// Attempts exhausted without provider acceptance
    Failed,
}

/// A queued outbound email and its delivery bookkeeping.
#[derive(Serialize, Deserialize, Debug, Clone, FromRow)]
pub struct EmailMessage {
    /// Unique identifier, assigned on insert
    pub id: i64,

    pub recipient: String,
    pub recipient_name: Option<String>,
    pub sender: String,
    pub sender_name: Option<String>,
    pub reply_to: Option<String>,

    pub subject: String,
    pub html_body: String,
    /// Plain-text alternative; derived from `html_body` when the caller
    /// does not supply one
    pub text_body: String,

    /// Caller-side template tag, stored but never interpreted
    pub template_kind: Option<String>,
    /// Opaque caller bookkeeping, stored but never interpreted
    pub template_data: Json<serde_json::Map<String, serde_json::Value>>,

    pub status: EmailStatus,
    /// Lower values drain first
    pub priority: i64,
    /// Delivery attempts made so far; only ever increases
    pub attempts: i64,
    pub max_attempts: i64,
    /// Failure description from the most recent rejected attempt
    pub last_error: Option<String>,
    /// Set exactly once, when the provider accepts the message
    pub sent_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl EmailMessage {
    /// Formats an address with its optional display name, e.g.
    /// `Ada Lovelace <ada@example.com>`.
    pub fn format_address(address: &str, name: Option<&str>) -> String {
        match name {
            Some(name) => format!("{name} <{address}>"),
            None => address.to_owned(),
        }
    }
}

/// Content fields for a new record, validated upstream. System fields
/// (status, attempts, timestamps) are assigned on insert.
#[derive(Debug, Clone)]
pub struct NewEmail {
    pub recipient: String,
    pub recipient_name: Option<String>,
    pub sender: String,
    pub sender_name: Option<String>,
    pub reply_to: Option<String>,
    pub subject: String,
    pub html_body: String,
    pub text_body: String,
    pub template_kind: Option<String>,
    pub template_data: serde_json::Map<String, serde_json::Value>,
    pub priority: i64,
}

/// Derives a plain-text body from markup: tags are dropped, the handful of
/// entities that show up in transactional mail are decoded, and whitespace
/// is collapsed.
pub fn strip_html(html: &str) -> String {
    let mut text = String::with_capacity(html.len());
    let mut in_tag = false;

    for ch in html.chars() {
        match ch {
            '<' => {
                in_tag = true;
                text.push(' ');
            }
            '>' => in_tag = false,
            c if !in_tag => text.push(c),
            _ => {}
        }
    }

    for (entity, plain) in [
        ("&nbsp;", " "),
        ("&amp;", "&"),
        ("&lt;", "<"),
        ("&gt;", ">"),
        ("&quot;", "\""),
        ("&#39;", "'"),
    ] {
        if text.contains(entity) {
            text = text.replace(entity, plain);
        }
    }

    text.split_whitespace().collect::<Vec<_>>().join(" ")
}
