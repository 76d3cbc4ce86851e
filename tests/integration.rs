use std::collections::VecDeque;
use std::ops::Deref;
use std::sync::{Arc, Mutex};

use mailspool::config::Config;
use mailspool::error::Error;
use mailspool::message::{EmailMessage, EmailStatus};
use mailspool::service::{EnqueueRequest, Service};
use mailspool::transport::{SendOutcome, Transport};
use tempfile::TempDir;

/// Transport double: replays scripted outcomes in order, then keeps
/// delivering. Records every send call it receives.
struct MockTransport {
    script: Mutex<VecDeque<Result<SendOutcome, Error>>>,
    sent_to: Mutex<Vec<String>>,
}

impl MockTransport {
    fn delivering() -> Arc<Self> {
        Self::scripted(vec![])
    }

    fn scripted(outcomes: Vec<Result<SendOutcome, Error>>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(outcomes.into()),
            sent_to: Mutex::new(Vec::new()),
        })
    }

    fn rejecting(reasons: &[&str]) -> Arc<Self> {
        Self::scripted(
            reasons
                .iter()
                .map(|reason| {
                    Ok(SendOutcome::Rejected {
                        reason: (*reason).to_owned(),
                    })
                })
                .collect(),
        )
    }

    fn recipients(&self) -> Vec<String> {
        self.sent_to.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl Transport for MockTransport {
    async fn send(&self, email: &EmailMessage) -> Result<SendOutcome, Error> {
        let calls = {
            let mut sent = self.sent_to.lock().unwrap();
            sent.push(email.recipient.clone());
            sent.len()
        };

        match self.script.lock().unwrap().pop_front() {
            Some(outcome) => outcome,
            None => Ok(SendOutcome::Delivered {
                provider_id: format!("mock-{calls}"),
            }),
        }
    }
}

struct TmpService {
    svc: Service,
    tmpdir: TempDir,
}

impl Deref for TmpService {
    type Target = Service;

    fn deref(&self) -> &Self::Target {
        &self.svc
    }
}

fn config_for(tmpdir: &TempDir) -> Config {
    Config {
        db_path: Some(
            tmpdir
                .path()
                .join("mailspool.db")
                .to_string_lossy()
                .to_string(),
        ),
        ..Config::default()
    }
}

async fn setup(transport: Option<Arc<dyn Transport>>) -> TmpService {
    let tmpdir = tempfile::tempdir().unwrap();

    TmpService {
        svc: Service::connect_with_transport(config_for(&tmpdir), transport)
            .await
            .unwrap(),
        tmpdir,
    }
}

/// Second service over the same database file, as when a transport key is
/// configured after messages were already queued.
async fn reopen(tmp: &TmpService, transport: Option<Arc<dyn Transport>>) -> Service {
    Service::connect_with_transport(config_for(&tmp.tmpdir), transport)
        .await
        .unwrap()
}

fn request(to: &str) -> EnqueueRequest {
    EnqueueRequest {
        to: to.to_owned(),
        subject: "Welcome".to_owned(),
        html: "<p>Hello <b>there</b></p>".to_owned(),
        ..Default::default()
    }
}

async fn record_count(service: &Service) -> i64 {
    sqlx::query_scalar("SELECT COUNT(*) FROM emails")
        .fetch_one(service.db())
        .await
        .unwrap()
}

#[tokio::test]
async fn rejects_incomplete_requests() {
    let service = setup(None).await;

    let missing_to = EnqueueRequest {
        to: String::new(),
        ..request("member@example.com")
    };
    let missing_subject = EnqueueRequest {
        subject: "  ".to_owned(),
        ..request("member@example.com")
    };
    let missing_html = EnqueueRequest {
        html: String::new(),
        ..request("member@example.com")
    };

    for bad in [missing_to, missing_subject, missing_html] {
        let err = service.enqueue(bad).await.unwrap_err();
        assert!(matches!(err, Error::Validation { .. }), "got {err}");
    }

    // Nothing persists on the validation path.
    assert_eq!(record_count(&service).await, 0);
}

#[tokio::test]
async fn rejects_malformed_addresses() {
    let service = setup(None).await;

    let bad_to = request("not-an-address");
    let bad_from = EnqueueRequest {
        from: Some("also not an address".to_owned()),
        ..request("member@example.com")
    };
    let bad_reply_to = EnqueueRequest {
        reply_to: Some("nope".to_owned()),
        ..request("member@example.com")
    };

    for bad in [bad_to, bad_from, bad_reply_to] {
        let err = service.enqueue(bad).await.unwrap_err();
        assert!(matches!(err, Error::Validation { .. }), "got {err}");
    }

    assert_eq!(record_count(&service).await, 0);
}

#[tokio::test]
async fn enqueue_without_transport_queues_untouched() {
    let service = setup(None).await;

    let mut ids = Vec::new();
    for n in 0..3 {
        let receipt = service
            .enqueue(request(&format!("member{n}@example.com")))
            .await
            .unwrap();
        assert!(!receipt.delivered);
        assert!(receipt.provider_id.is_none());
        ids.push(receipt.id);
    }

    for id in &ids {
        let view = service.status(*id).await.unwrap();
        assert_eq!(view.status, EmailStatus::Pending);
        assert_eq!(view.attempts, 0);
        assert!(view.sent_at.is_none());
    }

    // Drain cannot proceed at all without a transport, and mutates nothing.
    let err = service.drain(None).await.unwrap_err();
    assert!(matches!(err, Error::TransportUnavailable), "got {err}");

    for id in ids {
        let view = service.status(id).await.unwrap();
        assert_eq!(view.status, EmailStatus::Pending);
        assert_eq!(view.attempts, 0);
    }
}

#[tokio::test]
async fn immediate_attempt_delivers() {
    let mock = MockTransport::delivering();
    let service = setup(Some(mock.clone())).await;

    let receipt = service.enqueue(request("member@example.com")).await.unwrap();

    assert!(receipt.delivered);
    assert_eq!(receipt.provider_id.as_deref(), Some("mock-1"));

    let view = service.status(receipt.id).await.unwrap();
    assert_eq!(view.status, EmailStatus::Sent);
    assert_eq!(view.attempts, 1);
    assert!(view.sent_at.is_some());
    assert!(view.last_error.is_none());

    assert_eq!(mock.recipients(), vec!["member@example.com"]);
}

#[tokio::test]
async fn immediate_rejection_leaves_message_queued() {
    let mock = MockTransport::rejecting(&["mailbox full"]);
    let service = setup(Some(mock)).await;

    let receipt = service.enqueue(request("member@example.com")).await.unwrap();

    // Accepted and queued, not delivered.
    assert!(!receipt.delivered);
    assert!(receipt.provider_id.is_none());

    let view = service.status(receipt.id).await.unwrap();
    assert_eq!(view.status, EmailStatus::Pending);
    assert_eq!(view.attempts, 1);
    assert_eq!(view.last_error.as_deref(), Some("mailbox full"));
    assert!(view.sent_at.is_none());
}

#[tokio::test]
async fn queued_messages_drain_once_transport_appears() {
    let service = setup(None).await;

    let receipt = service.enqueue(request("member@example.com")).await.unwrap();

    let configured = reopen(&service, Some(MockTransport::delivering())).await;
    let summary = configured.drain(None).await.unwrap();

    assert_eq!(summary.total, 1);
    assert_eq!(summary.sent, 1);
    assert_eq!(summary.failed, 0);

    let view = configured.status(receipt.id).await.unwrap();
    assert_eq!(view.status, EmailStatus::Sent);
    assert_eq!(view.attempts, 1);
    assert!(view.sent_at.is_some());
}

#[tokio::test]
async fn drain_orders_by_priority_then_age() {
    let service = setup(None).await;

    for (to, priority) in [
        ("third@example.com", 2),
        ("first@example.com", 1),
        ("second@example.com", 1),
    ] {
        service
            .enqueue(EnqueueRequest {
                priority: Some(priority),
                ..request(to)
            })
            .await
            .unwrap();
    }

    let mock = MockTransport::delivering();
    let configured = reopen(&service, Some(mock.clone())).await;

    let summary = configured.drain(Some(3)).await.unwrap();
    assert_eq!(summary.total, 3);
    assert_eq!(summary.sent, 3);

    // Both priority-1 records by age, then the priority-2 record.
    assert_eq!(
        mock.recipients(),
        vec![
            "first@example.com",
            "second@example.com",
            "third@example.com"
        ]
    );
}

#[tokio::test]
async fn drain_respects_limit() {
    let service = setup(None).await;

    for n in 0..3 {
        service
            .enqueue(request(&format!("member{n}@example.com")))
            .await
            .unwrap();
    }

    let configured = reopen(&service, Some(MockTransport::delivering())).await;

    let summary = configured.drain(Some(1)).await.unwrap();
    assert_eq!(summary.total, 1);
    assert_eq!(summary.sent, 1);

    let summary = configured.drain(Some(10)).await.unwrap();
    assert_eq!(summary.total, 2);
    assert_eq!(summary.sent, 2);
}

#[tokio::test]
async fn rejected_message_fails_only_at_attempt_ceiling() {
    let mock = MockTransport::rejecting(&["bounce #1", "bounce #2", "bounce #3"]);
    let service = setup(Some(mock)).await;

    // Attempt 1 happens inline during enqueue.
    let receipt = service.enqueue(request("member@example.com")).await.unwrap();
    assert!(!receipt.delivered);

    let view = service.status(receipt.id).await.unwrap();
    assert_eq!(view.status, EmailStatus::Pending);
    assert_eq!(view.attempts, 1);

    // Attempt 2: rejected again, still short of the ceiling.
    let summary = service.drain(None).await.unwrap();
    assert_eq!((summary.total, summary.sent, summary.failed), (1, 0, 0));

    let view = service.status(receipt.id).await.unwrap();
    assert_eq!(view.status, EmailStatus::Pending);
    assert_eq!(view.attempts, 2);
    assert_eq!(view.last_error.as_deref(), Some("bounce #2"));

    // Attempt 3 reaches max_attempts: terminal failure.
    let summary = service.drain(None).await.unwrap();
    assert_eq!((summary.total, summary.sent, summary.failed), (1, 0, 1));

    let view = service.status(receipt.id).await.unwrap();
    assert_eq!(view.status, EmailStatus::Failed);
    assert_eq!(view.attempts, 3);
    assert_eq!(view.last_error.as_deref(), Some("bounce #3"));
    assert!(view.sent_at.is_none());

    // Terminal records are no longer eligible.
    let summary = service.drain(None).await.unwrap();
    assert_eq!((summary.total, summary.sent, summary.failed), (0, 0, 0));
}

#[tokio::test]
async fn unavailable_transport_mid_batch_skips_record_and_continues() {
    let service = setup(None).await;

    let first = service.enqueue(request("first@example.com")).await.unwrap();
    let second = service.enqueue(request("second@example.com")).await.unwrap();

    let mock = MockTransport::scripted(vec![
        Err(Error::TransportUnavailable),
        Ok(SendOutcome::Delivered {
            provider_id: "mock-ok".to_owned(),
        }),
    ]);
    let configured = reopen(&service, Some(mock)).await;

    let summary = configured.drain(None).await.unwrap();
    assert_eq!((summary.total, summary.sent, summary.failed), (2, 1, 0));

    // The unavailable call never reached the provider: no attempt counted.
    let view = configured.status(first.id).await.unwrap();
    assert_eq!(view.status, EmailStatus::Pending);
    assert_eq!(view.attempts, 0);

    let view = configured.status(second.id).await.unwrap();
    assert_eq!(view.status, EmailStatus::Sent);
    assert_eq!(view.attempts, 1);
}

/// Transport double that deletes one record's row mid-send, so the
/// post-send status update hits a storage error.
struct RowDroppingTransport {
    db: sqlx::SqlitePool,
    drop_id: i64,
}

#[async_trait::async_trait]
impl Transport for RowDroppingTransport {
    async fn send(&self, email: &EmailMessage) -> Result<SendOutcome, Error> {
        if email.id == self.drop_id {
            sqlx::query("DELETE FROM emails WHERE id = $1")
                .bind(self.drop_id)
                .execute(&self.db)
                .await
                .unwrap();

            return Ok(SendOutcome::Rejected {
                reason: "mailbox full".to_owned(),
            });
        }

        Ok(SendOutcome::Delivered {
            provider_id: "mock-ok".to_owned(),
        })
    }
}

#[tokio::test]
async fn storage_error_on_one_record_does_not_abort_batch() {
    let service = setup(None).await;

    let first = service.enqueue(request("first@example.com")).await.unwrap();
    let second = service.enqueue(request("second@example.com")).await.unwrap();

    let sabotage = Arc::new(RowDroppingTransport {
        db: service.db().clone(),
        drop_id: first.id,
    });
    let configured = reopen(&service, Some(sabotage)).await;

    // The first record's post-send update fails against the vanished row;
    // the batch still processes the second record.
    let summary = configured.drain(None).await.unwrap();
    assert_eq!((summary.total, summary.sent, summary.failed), (2, 1, 0));

    let view = configured.status(second.id).await.unwrap();
    assert_eq!(view.status, EmailStatus::Sent);

    let err = configured.status(first.id).await.unwrap_err();
    assert!(matches!(err, Error::NotFound { .. }), "got {err}");
}

#[tokio::test]
async fn claim_is_exclusive() {
    let service = setup(None).await;

    let receipt = service.enqueue(request("member@example.com")).await.unwrap();

    let mut conn = service.db().acquire().await.unwrap();

    let claimed = EmailMessage::claim(&mut conn, receipt.id).await.unwrap();
    let claimed = claimed.expect("first claim wins");
    assert_eq!(claimed.status, EmailStatus::Sending);
    assert_eq!(claimed.attempts, 1);

    // A concurrent invocation that selected the same record loses the claim
    // and skips it.
    let lost = EmailMessage::claim(&mut conn, receipt.id).await.unwrap();
    assert!(lost.is_none());
}

#[tokio::test]
async fn status_lookup_is_read_only() {
    let service = setup(None).await;

    let receipt = service.enqueue(request("member@example.com")).await.unwrap();

    let mut conn = service.db().acquire().await.unwrap();
    let before = EmailMessage::get(&mut conn, receipt.id).await.unwrap().unwrap();

    service.status(receipt.id).await.unwrap();
    service.status(receipt.id).await.unwrap();

    let after = EmailMessage::get(&mut conn, receipt.id).await.unwrap().unwrap();
    assert_eq!(before.updated_at, after.updated_at);
    assert_eq!(after.attempts, 0);
}

#[tokio::test]
async fn status_lookup_unknown_id_is_not_found() {
    let service = setup(None).await;

    let err = service.status(4242).await.unwrap_err();
    assert!(matches!(err, Error::NotFound { .. }), "got {err}");
}

#[tokio::test]
async fn derives_text_body_when_absent() {
    let service = setup(None).await;

    let receipt = service.enqueue(request("member@example.com")).await.unwrap();

    let mut conn = service.db().acquire().await.unwrap();
    let email = EmailMessage::get(&mut conn, receipt.id).await.unwrap().unwrap();
    assert_eq!(email.text_body, "Hello there");

    // A caller-supplied text body is stored as-is.
    let receipt = service
        .enqueue(EnqueueRequest {
            text: Some("plain version".to_owned()),
            ..request("member@example.com")
        })
        .await
        .unwrap();

    let email = EmailMessage::get(&mut conn, receipt.id).await.unwrap().unwrap();
    assert_eq!(email.text_body, "plain version");
}

#[tokio::test]
async fn applies_sender_defaults_and_priority() {
    let service = setup(None).await;

    let receipt = service.enqueue(request("member@example.com")).await.unwrap();

    let mut conn = service.db().acquire().await.unwrap();
    let email = EmailMessage::get(&mut conn, receipt.id).await.unwrap().unwrap();

    assert_eq!(email.sender, "no-reply@localhost");
    assert_eq!(email.priority, 100);
    assert_eq!(email.max_attempts, 3);

    let receipt = service
        .enqueue(EnqueueRequest {
            from: Some("events@example.com".to_owned()),
            from_name: Some("Events".to_owned()),
            priority: Some(5),
            ..request("member@example.com")
        })
        .await
        .unwrap();

    let email = EmailMessage::get(&mut conn, receipt.id).await.unwrap().unwrap();
    assert_eq!(email.sender, "events@example.com");
    assert_eq!(email.sender_name.as_deref(), Some("Events"));
    assert_eq!(email.priority, 5);
}
