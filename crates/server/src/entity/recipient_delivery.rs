use sea_orm::entity::prelude::*;
use serde::Serialize;
use time::OffsetDateTime;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize)]
#[sea_orm(table_name = "recipient_delivery")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub emergency_id: String,
    #[sea_orm(primary_key, auto_increment = false)]
    pub recipient_id: String,
    #[sea_orm(primary_key, auto_increment = false)]
    pub channel: String,
    pub guardian_id: String,
    pub student_id: String,
    pub address: String,
    pub state: String,
    pub attempts: i32,
    pub resend_count: i32,
    pub escalation_level: i32,
    pub created_at: OffsetDateTime,
    pub last_attempt_at: Option<OffsetDateTime>,
    pub last_resend_at: Option<OffsetDateTime>,
    pub delivered_at: Option<OffsetDateTime>,
    pub acknowledged_at: Option<OffsetDateTime>,
    pub escalated_at: Option<OffsetDateTime>,
    pub error_message: Option<String>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
