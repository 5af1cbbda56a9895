//! Live price lookups against the product catalog.
//!
//! Cart lines carry the price the buyer saw; checkout never trusts it and
//! asks the catalog again.

use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::errors::ServiceError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductPrice {
    pub product_id: Uuid,
    pub seller_id: Uuid,
    #[serde(default)]
    pub category: Option<String>,
    /// Minor units.
    pub unit_price: i64,
}

#[async_trait]
pub trait ProductCatalog: Send + Sync {
    /// Current price for a product. Fails with `PriceUnavailable` when the
    /// product is unknown or the catalog cannot be reached.
    async fn current_price(&self, product_id: Uuid) -> Result<ProductPrice, ServiceError>;
}

/// Catalog held in memory, used in development and tests.
#[derive(Debug, Default)]
pub struct InMemoryCatalog {
    prices: DashMap<Uuid, ProductPrice>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert(&self, price: ProductPrice) {
        self.prices.insert(price.product_id, price);
    }

    pub fn remove(&self, product_id: Uuid) {
        self.prices.remove(&product_id);
    }
}

#[async_trait]
impl ProductCatalog for InMemoryCatalog {
    async fn current_price(&self, product_id: Uuid) -> Result<ProductPrice, ServiceError> {
        self.prices
            .get(&product_id)
            .map(|entry| entry.value().clone())
            .ok_or(ServiceError::PriceUnavailable(product_id))
    }
}

/// Catalog service reached over HTTP: `GET {base_url}/products/{id}/price`.
#[derive(Debug, Clone)]
pub struct HttpCatalog {
    client: reqwest::Client,
    base_url: String,
}

impl HttpCatalog {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, ServiceError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ServiceError::InternalError(format!("catalog client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl ProductCatalog for HttpCatalog {
    async fn current_price(&self, product_id: Uuid) -> Result<ProductPrice, ServiceError> {
        let url = format!("{}/products/{}/price", self.base_url, product_id);
        let response = self.client.get(&url).send().await.map_err(|e| {
            warn!(%product_id, error = %e, "catalog request failed");
            ServiceError::PriceUnavailable(product_id)
        })?;

        if !response.status().is_success() {
            warn!(%product_id, status = %response.status(), "catalog returned an error");
            return Err(ServiceError::PriceUnavailable(product_id));
        }

        let price: ProductPrice = response.json().await.map_err(|e| {
            warn!(%product_id, error = %e, "catalog response did not parse");
            ServiceError::PriceUnavailable(product_id)
        })?;
        if price.product_id != product_id || price.unit_price < 0 {
            return Err(ServiceError::PriceUnavailable(product_id));
        }
        Ok(price)
    }
}
