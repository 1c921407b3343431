//! SeaORM repository against an in-memory SQLite database.

use emergency_broadcast::emergency::profiles::config_for_severity;
use emergency_broadcast::emergency::types::{
    AckMethod, Acknowledgment, Channel, ContactPoint, DeliveryState, EmergencyContext,
    EmergencyDetails, EmergencyState, EmergencyType, QueuedEmergencyMessage, Recipient,
    RecipientDelivery, Severity,
};
use emergency_broadcast::error::PersistenceError;
use emergency_broadcast::render::RenderedMessage;
use emergency_broadcast::store::{EmergencyRepository, SeaOrmRepository};
use sea_orm::{ConnectionTrait, Database, DatabaseConnection, DbBackend, Statement};
use std::sync::Arc;
use time::macros::datetime;
use time::{Duration, OffsetDateTime};

const START: OffsetDateTime = datetime!(2026-10-17 08:00 UTC);

/// Create an in-memory SQLite database with the emergency tables.
async fn setup_test_db() -> Arc<DatabaseConnection> {
    let db = Database::connect("sqlite::memory:")
        .await
        .expect("Failed to connect to in-memory database");

    let statements = [
        r#"CREATE TABLE emergency (
            id TEXT PRIMARY KEY,
            state TEXT NOT NULL,
            emergency_type TEXT NOT NULL,
            severity TEXT NOT NULL,
            details TEXT NOT NULL,
            config TEXT NOT NULL,
            recipients TEXT NOT NULL,
            initiated_by TEXT NOT NULL,
            initiated_at TEXT NOT NULL,
            school_id TEXT NOT NULL,
            total_recipients INTEGER NOT NULL,
            sent_count INTEGER NOT NULL DEFAULT 0,
            delivered_count INTEGER NOT NULL DEFAULT 0,
            acknowledged_count INTEGER NOT NULL DEFAULT 0,
            pending_acks INTEGER NOT NULL,
            escalation_level INTEGER NOT NULL DEFAULT 0,
            last_escalation_at TEXT NULL,
            resolved_at TEXT NULL,
            resolved_by TEXT NULL,
            cancelled_at TEXT NULL,
            cancelled_by TEXT NULL,
            archived_at TEXT NULL,
            escalation_exhausted INTEGER NOT NULL DEFAULT 0,
            version INTEGER NOT NULL DEFAULT 0
        );"#,
        r#"CREATE TABLE recipient_delivery (
            emergency_id TEXT NOT NULL,
            recipient_id TEXT NOT NULL,
            channel TEXT NOT NULL,
            guardian_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            address TEXT NOT NULL,
            state TEXT NOT NULL,
            attempts INTEGER NOT NULL DEFAULT 0,
            resend_count INTEGER NOT NULL DEFAULT 0,
            escalation_level INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            last_attempt_at TEXT NULL,
            last_resend_at TEXT NULL,
            delivered_at TEXT NULL,
            acknowledged_at TEXT NULL,
            escalated_at TEXT NULL,
            error_message TEXT NULL,
            PRIMARY KEY (emergency_id, recipient_id, channel)
        );"#,
        r#"CREATE TABLE acknowledgment (
            id TEXT PRIMARY KEY,
            emergency_id TEXT NOT NULL,
            recipient_id TEXT NOT NULL,
            guardian_id TEXT NOT NULL,
            acknowledged_at TEXT NOT NULL,
            channel TEXT NOT NULL,
            method TEXT NOT NULL,
            UNIQUE (emergency_id, recipient_id)
        );"#,
        r#"CREATE TABLE queued_message (
            id TEXT PRIMARY KEY,
            emergency_id TEXT NOT NULL,
            recipient_id TEXT NOT NULL,
            guardian_id TEXT NOT NULL,
            channel TEXT NOT NULL,
            address TEXT NOT NULL,
            priority INTEGER NOT NULL,
            content TEXT NOT NULL,
            created_at TEXT NOT NULL,
            attempts INTEGER NOT NULL DEFAULT 0,
            max_attempts INTEGER NOT NULL,
            next_retry_at TEXT NOT NULL,
            bypass_offline_queue INTEGER NOT NULL DEFAULT 1
        );"#,
    ];
    for sql in statements {
        db.execute(Statement::from_string(DbBackend::Sqlite, sql))
            .await
            .expect("Failed to create table");
    }

    Arc::new(db)
}

fn recipient(n: u32) -> Recipient {
    Recipient {
        recipient_id: format!("r{n}"),
        guardian_id: format!("g{n}"),
        student_id: format!("s{n}"),
        contacts: vec![ContactPoint {
            channel: Channel::Sms,
            address: format!("+1555010{n:04}"),
        }],
    }
}

fn context(id: &str, state: EmergencyState) -> EmergencyContext {
    EmergencyContext {
        id: id.into(),
        state,
        details: EmergencyDetails {
            emergency_type: EmergencyType::SafetyIncident,
            severity: Severity::Critical,
            title: "Shelter in place".into(),
            description: "Gas leak reported near the gym.".into(),
            instructions: None,
        },
        config: config_for_severity(Severity::Critical).config,
        initiated_by: "principal-1".into(),
        initiated_at: START,
        school_id: "lincoln-high".into(),
        total_recipients: 2,
        sent_count: 0,
        delivered_count: 0,
        acknowledged_count: 0,
        pending_acks: 2,
        escalation_level: 0,
        last_escalation_at: None,
        resolved_at: None,
        resolved_by: None,
        cancelled_at: None,
        cancelled_by: None,
        archived_at: None,
        escalation_exhausted: false,
        version: 0,
    }
}

fn delivery(emergency_id: &str, n: u32) -> RecipientDelivery {
    let r = recipient(n);
    RecipientDelivery::new(emergency_id, &r, &r.contacts[0], 0, START)
}

fn acknowledgment(emergency_id: &str, recipient_id: &str, at: OffsetDateTime) -> Acknowledgment {
    Acknowledgment {
        id: uuid::Uuid::new_v4().to_string(),
        emergency_id: emergency_id.into(),
        recipient_id: recipient_id.into(),
        guardian_id: "g1".into(),
        acknowledged_at: at,
        channel: Channel::Sms,
        method: AckMethod::Reply,
    }
}

fn queued(emergency_id: &str, created_at: OffsetDateTime) -> QueuedEmergencyMessage {
    QueuedEmergencyMessage {
        id: uuid::Uuid::new_v4().to_string(),
        emergency_id: emergency_id.into(),
        recipient_id: "r1".into(),
        guardian_id: "g1".into(),
        channel: Channel::Sms,
        address: "+15550100001".into(),
        priority: 1000,
        content: RenderedMessage {
            subject: None,
            body: "EMERGENCY: Shelter in place".into(),
        },
        created_at,
        attempts: 0,
        max_attempts: 5,
        next_retry_at: created_at,
        bypass_offline_queue: true,
    }
}

#[tokio::test]
async fn context_round_trips_with_recipients() {
    let repo = SeaOrmRepository::new(setup_test_db().await);
    let ctx = context("em-1", EmergencyState::Initiated);
    repo.insert_context(&ctx, &[recipient(1), recipient(2)])
        .await
        .unwrap();

    let loaded = repo.load_context("em-1").await.unwrap().unwrap();
    assert_eq!(loaded, ctx);
    let recipients = repo.load_recipients("em-1").await.unwrap();
    assert_eq!(recipients, vec![recipient(1), recipient(2)]);

    assert!(repo.load_context("missing").await.unwrap().is_none());
    assert!(repo.load_recipients("missing").await.unwrap().is_empty());
}

#[tokio::test]
async fn save_context_rejects_stale_versions() {
    let repo = SeaOrmRepository::new(setup_test_db().await);
    let mut ctx = context("em-1", EmergencyState::Initiated);
    repo.insert_context(&ctx, &[recipient(1)]).await.unwrap();

    ctx.state = EmergencyState::Broadcasting;
    let version = repo.save_context(&ctx).await.unwrap();
    assert_eq!(version, 1);

    // A writer still holding version 0 loses.
    let stale = ctx.clone();
    ctx.version = version;
    ctx.state = EmergencyState::AwaitingAck;
    assert_eq!(repo.save_context(&ctx).await.unwrap(), 2);

    let err = repo.save_context(&stale).await.unwrap_err();
    assert!(matches!(
        err,
        PersistenceError::Conflict { expected: 0, .. }
    ));

    let stored = repo.load_context("em-1").await.unwrap().unwrap();
    assert_eq!(stored.state, EmergencyState::AwaitingAck);
    assert_eq!(stored.version, 2);
    // The recipient list is only written on insert.
    assert_eq!(repo.load_recipients("em-1").await.unwrap().len(), 1);
}

#[tokio::test]
async fn save_context_for_unknown_emergency_is_not_found() {
    let repo = SeaOrmRepository::new(setup_test_db().await);
    let err = repo
        .save_context(&context("ghost", EmergencyState::Broadcasting))
        .await
        .unwrap_err();
    assert!(matches!(err, PersistenceError::NotFound(id) if id == "ghost"));
}

#[tokio::test]
async fn list_active_skips_terminal_emergencies() {
    let repo = SeaOrmRepository::new(setup_test_db().await);
    let mut later = context("em-2", EmergencyState::Escalating);
    later.initiated_at = START + Duration::minutes(5);
    repo.insert_context(&later, &[]).await.unwrap();
    repo.insert_context(&context("em-1", EmergencyState::AwaitingAck), &[])
        .await
        .unwrap();
    repo.insert_context(&context("em-3", EmergencyState::Resolved), &[])
        .await
        .unwrap();
    repo.insert_context(&context("em-4", EmergencyState::Cancelled), &[])
        .await
        .unwrap();

    let ids: Vec<String> = repo
        .list_active()
        .await
        .unwrap()
        .into_iter()
        .map(|c| c.id)
        .collect();
    assert_eq!(ids, vec!["em-1".to_string(), "em-2".to_string()]);
}

#[tokio::test]
async fn upsert_delivery_replaces_progress() {
    let repo = SeaOrmRepository::new(setup_test_db().await);
    let mut d = delivery("em-1", 1);
    repo.upsert_delivery(&d).await.unwrap();
    repo.upsert_delivery(&delivery("em-1", 2)).await.unwrap();

    d.state = DeliveryState::Delivered;
    d.attempts = 2;
    d.last_attempt_at = Some(START + Duration::seconds(30));
    d.delivered_at = Some(START + Duration::seconds(31));
    d.resend_count = 1;
    d.last_resend_at = Some(START + Duration::seconds(90));
    repo.upsert_delivery(&d).await.unwrap();

    let deliveries = repo.load_deliveries("em-1").await.unwrap();
    assert_eq!(deliveries.len(), 2);
    assert_eq!(deliveries[0], d);
    assert_eq!(deliveries[1].state, DeliveryState::Pending);
    assert!(repo.load_deliveries("em-2").await.unwrap().is_empty());
}

#[tokio::test]
async fn second_acknowledgment_from_recipient_is_ignored() {
    let repo = SeaOrmRepository::new(setup_test_db().await);
    let first = acknowledgment("em-1", "r1", START + Duration::seconds(40));
    assert!(repo.insert_acknowledgment(&first).await.unwrap());

    let again = acknowledgment("em-1", "r1", START + Duration::seconds(90));
    assert!(!repo.insert_acknowledgment(&again).await.unwrap());

    // Same recipient in another emergency is a separate acknowledgment.
    let elsewhere = acknowledgment("em-2", "r1", START);
    assert!(repo.insert_acknowledgment(&elsewhere).await.unwrap());

    let acks = repo.load_acknowledgments("em-1").await.unwrap();
    assert_eq!(acks, vec![first]);
}

#[tokio::test]
async fn queued_messages_update_in_place_and_delete() {
    let repo = SeaOrmRepository::new(setup_test_db().await);
    let mut first = queued("em-1", START);
    let second = queued("em-1", START + Duration::seconds(1));
    repo.save_queued_message(&first).await.unwrap();
    repo.save_queued_message(&second).await.unwrap();
    repo.save_queued_message(&queued("em-2", START)).await.unwrap();

    first.attempts = 1;
    first.next_retry_at = START + Duration::seconds(30);
    repo.save_queued_message(&first).await.unwrap();

    let stored = repo.load_queued_messages("em-1").await.unwrap();
    assert_eq!(stored, vec![first.clone(), second.clone()]);

    repo.delete_queued_message(&first.id).await.unwrap();
    assert_eq!(repo.load_queued_messages("em-1").await.unwrap(), vec![second]);

    assert_eq!(repo.delete_queued_messages_for("em-1").await.unwrap(), 1);
    assert!(repo.load_queued_messages("em-1").await.unwrap().is_empty());
    assert_eq!(repo.load_queued_messages("em-2").await.unwrap().len(), 1);
}

#[tokio::test]
async fn purge_removes_old_archives_and_their_rows() {
    let repo = SeaOrmRepository::new(setup_test_db().await);

    let mut old = context("em-old", EmergencyState::Resolved);
    old.archived_at = Some(START);
    let mut recent = context("em-recent", EmergencyState::Cancelled);
    recent.archived_at = Some(START + Duration::days(20));
    let active = context("em-active", EmergencyState::AwaitingAck);

    for ctx in [&old, &recent, &active] {
        repo.insert_context(ctx, &[recipient(1)]).await.unwrap();
        repo.upsert_delivery(&delivery(&ctx.id, 1)).await.unwrap();
        repo.insert_acknowledgment(&acknowledgment(&ctx.id, "r1", START))
            .await
            .unwrap();
        repo.save_queued_message(&queued(&ctx.id, START)).await.unwrap();
    }

    let purged = repo
        .purge_archived_before(START + Duration::days(10))
        .await
        .unwrap();
    assert_eq!(purged, 1);

    assert!(repo.load_context("em-old").await.unwrap().is_none());
    assert!(repo.load_deliveries("em-old").await.unwrap().is_empty());
    assert!(repo.load_acknowledgments("em-old").await.unwrap().is_empty());
    assert!(repo.load_queued_messages("em-old").await.unwrap().is_empty());

    for id in ["em-recent", "em-active"] {
        assert!(repo.load_context(id).await.unwrap().is_some());
        assert_eq!(repo.load_deliveries(id).await.unwrap().len(), 1);
    }

    assert_eq!(
        repo.purge_archived_before(START + Duration::days(10))
            .await
            .unwrap(),
        0
    );
}
