//! Persisted emergency context.
//!
//! `details`, `config` and `recipients` are JSON text. Counters are stored
//! signed because not every backend has unsigned integers.

use sea_orm::entity::prelude::*;
use serde::Serialize;
use time::OffsetDateTime;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize)]
#[sea_orm(table_name = "emergency")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    pub state: String,
    pub emergency_type: String,
    pub severity: String,
    #[sea_orm(column_type = "Text")]
    pub details: String,
    #[sea_orm(column_type = "Text")]
    pub config: String,
    #[sea_orm(column_type = "Text")]
    pub recipients: String,
    pub initiated_by: String,
    pub initiated_at: OffsetDateTime,
    pub school_id: String,
    pub total_recipients: i32,
    pub sent_count: i32,
    pub delivered_count: i32,
    pub acknowledged_count: i32,
    pub pending_acks: i32,
    pub escalation_level: i32,
    pub last_escalation_at: Option<OffsetDateTime>,
    pub resolved_at: Option<OffsetDateTime>,
    pub resolved_by: Option<String>,
    pub cancelled_at: Option<OffsetDateTime>,
    pub cancelled_by: Option<String>,
    pub archived_at: Option<OffsetDateTime>,
    pub escalation_exhausted: bool,
    pub version: i64,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
