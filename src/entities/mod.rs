//! sea-orm entities backing the relational store.
//!
//! Nested collections (cart lines, order lines, coupon discount rules) are
//! stored as JSON columns; statuses are stored as their upper-case names.

pub mod cart;
pub mod commission;
pub mod coupon;
pub mod order;
pub mod orphan_payment_event;
pub mod processed_payment_event;
pub mod reservation;
pub mod stock_level;

use std::str::FromStr;

use sea_orm::entity::prelude::Json;
use serde::{de::DeserializeOwned, Serialize};

use crate::errors::ServiceError;

pub(crate) fn parse_column<T: FromStr>(value: &str, column: &str) -> Result<T, ServiceError> {
    value.parse::<T>().map_err(|_| {
        ServiceError::SerializationError(format!("unexpected value '{value}' in column {column}"))
    })
}

pub(crate) fn from_json<T: DeserializeOwned>(value: Json) -> Result<T, ServiceError> {
    Ok(serde_json::from_value(value)?)
}

pub(crate) fn to_json<T: Serialize>(value: &T) -> Result<Json, ServiceError> {
    Ok(serde_json::to_value(value)?)
}
