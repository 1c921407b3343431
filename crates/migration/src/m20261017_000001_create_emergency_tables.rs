use sea_orm_migration::{prelude::*, schema::*};

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Emergency::Table)
                    .if_not_exists()
                    .col(string(Emergency::Id).primary_key())
                    .col(string(Emergency::State))
                    .col(string(Emergency::EmergencyType))
                    .col(string(Emergency::Severity))
                    .col(text(Emergency::Details))
                    .col(text(Emergency::Config))
                    .col(text(Emergency::Recipients))
                    .col(string(Emergency::InitiatedBy))
                    .col(timestamp_with_time_zone(Emergency::InitiatedAt))
                    .col(string(Emergency::SchoolId))
                    .col(integer(Emergency::TotalRecipients))
                    .col(integer(Emergency::SentCount).default(0))
                    .col(integer(Emergency::DeliveredCount).default(0))
                    .col(integer(Emergency::AcknowledgedCount).default(0))
                    .col(integer(Emergency::PendingAcks))
                    .col(integer(Emergency::EscalationLevel).default(0))
                    .col(timestamp_with_time_zone_null(Emergency::LastEscalationAt))
                    .col(timestamp_with_time_zone_null(Emergency::ResolvedAt))
                    .col(string_null(Emergency::ResolvedBy))
                    .col(timestamp_with_time_zone_null(Emergency::CancelledAt))
                    .col(string_null(Emergency::CancelledBy))
                    .col(timestamp_with_time_zone_null(Emergency::ArchivedAt))
                    .col(boolean(Emergency::EscalationExhausted).default(false))
                    .col(big_integer(Emergency::Version).default(0))
                    .to_owned(),
            )
            .await?;
        manager
            .create_index(
                Index::create()
                    .name("idx_emergency_state")
                    .table(Emergency::Table)
                    .col(Emergency::State)
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(RecipientDelivery::Table)
                    .if_not_exists()
                    .col(string(RecipientDelivery::EmergencyId))
                    .col(string(RecipientDelivery::RecipientId))
                    .col(string(RecipientDelivery::Channel))
                    .col(string(RecipientDelivery::GuardianId))
                    .col(string(RecipientDelivery::StudentId))
                    .col(string(RecipientDelivery::Address))
                    .col(string(RecipientDelivery::State))
                    .col(integer(RecipientDelivery::Attempts).default(0))
                    .col(integer(RecipientDelivery::ResendCount).default(0))
                    .col(integer(RecipientDelivery::EscalationLevel).default(0))
                    .col(timestamp_with_time_zone(RecipientDelivery::CreatedAt))
                    .col(timestamp_with_time_zone_null(RecipientDelivery::LastAttemptAt))
                    .col(timestamp_with_time_zone_null(RecipientDelivery::LastResendAt))
                    .col(timestamp_with_time_zone_null(RecipientDelivery::DeliveredAt))
                    .col(timestamp_with_time_zone_null(RecipientDelivery::AcknowledgedAt))
                    .col(timestamp_with_time_zone_null(RecipientDelivery::EscalatedAt))
                    .col(text_null(RecipientDelivery::ErrorMessage))
                    .primary_key(
                        Index::create()
                            .col(RecipientDelivery::EmergencyId)
                            .col(RecipientDelivery::RecipientId)
                            .col(RecipientDelivery::Channel),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(Acknowledgment::Table)
                    .if_not_exists()
                    .col(string(Acknowledgment::Id).primary_key())
                    .col(string(Acknowledgment::EmergencyId))
                    .col(string(Acknowledgment::RecipientId))
                    .col(string(Acknowledgment::GuardianId))
                    .col(timestamp_with_time_zone(Acknowledgment::AcknowledgedAt))
                    .col(string(Acknowledgment::Channel))
                    .col(string(Acknowledgment::Method))
                    .to_owned(),
            )
            .await?;
        manager
            .create_index(
                Index::create()
                    .name("idx_acknowledgment_emergency_recipient_unique")
                    .table(Acknowledgment::Table)
                    .col(Acknowledgment::EmergencyId)
                    .col(Acknowledgment::RecipientId)
                    .unique()
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(QueuedMessage::Table)
                    .if_not_exists()
                    .col(string(QueuedMessage::Id).primary_key())
                    .col(string(QueuedMessage::EmergencyId))
                    .col(string(QueuedMessage::RecipientId))
                    .col(string(QueuedMessage::GuardianId))
                    .col(string(QueuedMessage::Channel))
                    .col(string(QueuedMessage::Address))
                    .col(integer(QueuedMessage::Priority))
                    .col(text(QueuedMessage::Content))
                    .col(timestamp_with_time_zone(QueuedMessage::CreatedAt))
                    .col(integer(QueuedMessage::Attempts).default(0))
                    .col(integer(QueuedMessage::MaxAttempts))
                    .col(timestamp_with_time_zone(QueuedMessage::NextRetryAt))
                    .col(boolean(QueuedMessage::BypassOfflineQueue).default(true))
                    .to_owned(),
            )
            .await?;
        manager
            .create_index(
                Index::create()
                    .name("idx_queued_message_emergency")
                    .table(QueuedMessage::Table)
                    .col(QueuedMessage::EmergencyId)
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(QueuedMessage::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Acknowledgment::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(RecipientDelivery::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Emergency::Table).to_owned())
            .await
    }
}

#[derive(Iden)]
enum Emergency {
    Table,
    Id,
    State,
    EmergencyType,
    Severity,
    Details,
    Config,
    Recipients,
    InitiatedBy,
    InitiatedAt,
    SchoolId,
    TotalRecipients,
    SentCount,
    DeliveredCount,
    AcknowledgedCount,
    PendingAcks,
    EscalationLevel,
    LastEscalationAt,
    ResolvedAt,
    ResolvedBy,
    CancelledAt,
    CancelledBy,
    ArchivedAt,
    EscalationExhausted,
    Version,
}

#[derive(Iden)]
enum RecipientDelivery {
    Table,
    EmergencyId,
    RecipientId,
    Channel,
    GuardianId,
    StudentId,
    Address,
    State,
    Attempts,
    ResendCount,
    EscalationLevel,
    CreatedAt,
    LastAttemptAt,
    LastResendAt,
    DeliveredAt,
    AcknowledgedAt,
    EscalatedAt,
    ErrorMessage,
}

#[derive(Iden)]
enum Acknowledgment {
    Table,
    Id,
    EmergencyId,
    RecipientId,
    GuardianId,
    AcknowledgedAt,
    Channel,
    Method,
}

#[derive(Iden)]
enum QueuedMessage {
    Table,
    Id,
    EmergencyId,
    RecipientId,
    GuardianId,
    Channel,
    Address,
    Priority,
    Content,
    CreatedAt,
    Attempts,
    MaxAttempts,
    NextRetryAt,
    BypassOfflineQueue,
}
