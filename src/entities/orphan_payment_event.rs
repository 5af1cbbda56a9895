use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use sea_orm::Set;
use serde::{Deserialize, Serialize};

use super::{from_json, to_json};
use crate::errors::ServiceError;
use crate::models::OrphanEvent;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "orphan_payment_events")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub event_id: String,
    #[sea_orm(indexed)]
    pub payment_intent_id: String,
    pub event: Json,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    pub fn into_domain(self) -> Result<OrphanEvent, ServiceError> {
        Ok(OrphanEvent {
            event: from_json(self.event)?,
            recorded_at: self.recorded_at,
        })
    }
}

impl ActiveModel {
    pub fn from_domain(orphan: &OrphanEvent) -> Result<Self, ServiceError> {
        Ok(Self {
            event_id: Set(orphan.event.id.clone()),
            payment_intent_id: Set(orphan.event.payment_intent_id.clone()),
            event: Set(to_json(&orphan.event)?),
            recorded_at: Set(orphan.recorded_at),
        })
    }
}
