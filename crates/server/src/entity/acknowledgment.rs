//! Append-only acknowledgment log. `(emergency_id, recipient_id)` is unique.

use sea_orm::entity::prelude::*;
use serde::Serialize;
use time::OffsetDateTime;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize)]
#[sea_orm(table_name = "acknowledgment")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    pub emergency_id: String,
    pub recipient_id: String,
    pub guardian_id: String,
    pub acknowledged_at: OffsetDateTime,
    pub channel: String,
    pub method: String,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
