//! Sends waiting in the priority queue, kept so a restart does not lose them.

use sea_orm::entity::prelude::*;
use serde::Serialize;
use time::OffsetDateTime;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize)]
#[sea_orm(table_name = "queued_message")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    pub emergency_id: String,
    pub recipient_id: String,
    pub guardian_id: String,
    pub channel: String,
    pub address: String,
    pub priority: i32,
    #[sea_orm(column_type = "Text")]
    pub content: String,
    pub created_at: OffsetDateTime,
    pub attempts: i32,
    pub max_attempts: i32,
    pub next_retry_at: OffsetDateTime,
    pub bypass_offline_queue: bool,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
