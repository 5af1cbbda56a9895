use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use sea_orm::Set;
use serde::{Deserialize, Serialize};

use super::{from_json, parse_column, to_json};
use crate::errors::ServiceError;
use crate::models::ProcessedEvent;

/// Dedup table. The primary key on the gateway event id makes recording a
/// second delivery a no-op insert.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "processed_payment_events")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub event_id: String,
    pub kind: String,
    pub payment_intent_id: String,
    pub payload: Json,
    pub outcome: Json,
    pub processed_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    pub fn into_domain(self) -> Result<ProcessedEvent, ServiceError> {
        Ok(ProcessedEvent {
            event_id: self.event_id,
            kind: parse_column(&self.kind, "processed_payment_events.kind")?,
            payment_intent_id: self.payment_intent_id,
            payload: self.payload,
            outcome: from_json(self.outcome)?,
            processed_at: self.processed_at,
        })
    }
}

impl ActiveModel {
    pub fn from_domain(event: &ProcessedEvent) -> Result<Self, ServiceError> {
        Ok(Self {
            event_id: Set(event.event_id.clone()),
            kind: Set(event.kind.to_string()),
            payment_intent_id: Set(event.payment_intent_id.clone()),
            payload: Set(event.payload.clone()),
            outcome: Set(to_json(&event.outcome)?),
            processed_at: Set(event.processed_at),
        })
    }
}
