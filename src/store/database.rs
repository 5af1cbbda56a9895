use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_orm::sea_query::{Expr, OnConflict};
use sea_orm::{
    ColumnTrait, DatabaseConnection, DatabaseTransaction, EntityTrait, QueryFilter, QueryOrder,
    QuerySelect, TransactionTrait,
};
use tracing::debug;
use uuid::Uuid;

use super::{
    CartRepository, CommissionRepository, CouponRepository, LedgerRepository, OrderRepository,
    PaymentEventRepository, Store, StoreTx,
};
use crate::entities::{
    cart, commission, coupon, order, orphan_payment_event, processed_payment_event, reservation,
    stock_level,
};
use crate::errors::ServiceError;
use crate::models::{
    Cart, Commission, Coupon, Order, OrderStatus, OrphanEvent, ProcessedEvent, Reservation,
    StockLevel,
};

/// Relational store backed by a sea-orm connection pool.
#[derive(Debug, Clone)]
pub struct DatabaseStore {
    db: DatabaseConnection,
}

impl DatabaseStore {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    pub fn connection(&self) -> &DatabaseConnection {
        &self.db
    }
}

#[async_trait]
impl Store for DatabaseStore {
    async fn begin(&self) -> Result<Box<dyn StoreTx>, ServiceError> {
        let txn = self.db.begin().await?;
        Ok(Box::new(DatabaseTx { txn }))
    }

    async fn health_check(&self) -> Result<(), ServiceError> {
        crate::db::check_connection(&self.db).await
    }
}

/// Rolls back on drop unless committed.
struct DatabaseTx {
    txn: DatabaseTransaction,
}

#[async_trait]
impl CartRepository for DatabaseTx {
    async fn get_cart(&mut self, id: Uuid) -> Result<Option<Cart>, ServiceError> {
        cart::Entity::find_by_id(id)
            .one(&self.txn)
            .await?
            .map(cart::Model::into_domain)
            .transpose()
    }

    async fn save_cart(&mut self, value: &Cart) -> Result<(), ServiceError> {
        cart::Entity::insert(cart::ActiveModel::from_domain(value)?)
            .on_conflict(
                OnConflict::column(cart::Column::Id)
                    .update_columns([
                        cart::Column::BuyerId,
                        cart::Column::Lines,
                        cart::Column::CouponCode,
                        cart::Column::Status,
                        cart::Column::UpdatedAt,
                    ])
                    .to_owned(),
            )
            .exec_without_returning(&self.txn)
            .await?;
        Ok(())
    }

    async fn delete_cart(&mut self, id: Uuid) -> Result<bool, ServiceError> {
        let result = cart::Entity::delete_by_id(id).exec(&self.txn).await?;
        Ok(result.rows_affected > 0)
    }
}

#[async_trait]
impl CouponRepository for DatabaseTx {
    async fn get_coupon(&mut self, code: &str) -> Result<Option<Coupon>, ServiceError> {
        coupon::Entity::find_by_id(code.to_string())
            .one(&self.txn)
            .await?
            .map(coupon::Model::into_domain)
            .transpose()
    }

    async fn save_coupon(&mut self, value: &Coupon) -> Result<(), ServiceError> {
        coupon::Entity::insert(coupon::ActiveModel::from_domain(value)?)
            .on_conflict(
                OnConflict::column(coupon::Column::Code)
                    .update_columns([
                        coupon::Column::Discount,
                        coupon::Column::Scope,
                        coupon::Column::MinSubtotal,
                        coupon::Column::StartsAt,
                        coupon::Column::ExpiresAt,
                        coupon::Column::UsageLimit,
                    ])
                    .to_owned(),
            )
            .exec_without_returning(&self.txn)
            .await?;
        Ok(())
    }

    async fn increment_coupon_usage(
        &mut self,
        code: &str,
    ) -> Result<Option<Coupon>, ServiceError> {
        coupon::Entity::update_many()
            .col_expr(
                coupon::Column::UsageCount,
                Expr::col(coupon::Column::UsageCount).add(1),
            )
            .filter(coupon::Column::Code.eq(code))
            .exec(&self.txn)
            .await?;
        self.get_coupon(code).await
    }
}

#[async_trait]
impl LedgerRepository for DatabaseTx {
    async fn get_stock(&mut self, product_id: Uuid) -> Result<Option<StockLevel>, ServiceError> {
        Ok(stock_level::Entity::find_by_id(product_id)
            .one(&self.txn)
            .await?
            .map(StockLevel::from))
    }

    async fn insert_stock(&mut self, level: &StockLevel) -> Result<(), ServiceError> {
        stock_level::Entity::insert(stock_level::ActiveModel::from(level))
            .exec_without_returning(&self.txn)
            .await?;
        Ok(())
    }

    async fn compare_and_swap_stock(
        &mut self,
        level: &StockLevel,
        expected_version: i64,
    ) -> Result<bool, ServiceError> {
        let result = stock_level::Entity::update_many()
            .col_expr(stock_level::Column::Available, Expr::value(level.available))
            .col_expr(stock_level::Column::Reserved, Expr::value(level.reserved))
            .col_expr(stock_level::Column::Version, Expr::value(expected_version + 1))
            .filter(stock_level::Column::ProductId.eq(level.product_id))
            .filter(stock_level::Column::Version.eq(expected_version))
            .exec(&self.txn)
            .await?;
        if result.rows_affected == 0 {
            debug!(product_id = %level.product_id, expected_version, "stock version moved");
        }
        Ok(result.rows_affected == 1)
    }

    async fn insert_reservation(&mut self, value: &Reservation) -> Result<(), ServiceError> {
        reservation::Entity::insert(reservation::ActiveModel::from(value))
            .exec_without_returning(&self.txn)
            .await?;
        Ok(())
    }

    async fn update_reservation(&mut self, value: &Reservation) -> Result<(), ServiceError> {
        reservation::Entity::update(reservation::ActiveModel::from(value))
            .exec(&self.txn)
            .await?;
        Ok(())
    }

    async fn reservations_for_order(
        &mut self,
        order_id: Uuid,
    ) -> Result<Vec<Reservation>, ServiceError> {
        reservation::Entity::find()
            .filter(reservation::Column::OrderId.eq(order_id))
            .order_by_asc(reservation::Column::CreatedAt)
            .order_by_asc(reservation::Column::ProductId)
            .all(&self.txn)
            .await?
            .into_iter()
            .map(reservation::Model::into_domain)
            .collect()
    }
}

#[async_trait]
impl OrderRepository for DatabaseTx {
    async fn insert_order(&mut self, value: &Order) -> Result<(), ServiceError> {
        order::Entity::insert(order::ActiveModel::from_domain(value)?)
            .exec_without_returning(&self.txn)
            .await?;
        Ok(())
    }

    async fn get_order(&mut self, id: Uuid) -> Result<Option<Order>, ServiceError> {
        order::Entity::find_by_id(id)
            .one(&self.txn)
            .await?
            .map(order::Model::into_domain)
            .transpose()
    }

    async fn find_order_by_idempotency_key(
        &mut self,
        key: &str,
    ) -> Result<Option<Order>, ServiceError> {
        order::Entity::find()
            .filter(order::Column::IdempotencyKey.eq(key))
            .one(&self.txn)
            .await?
            .map(order::Model::into_domain)
            .transpose()
    }

    async fn find_order_by_payment_intent(
        &mut self,
        payment_intent_id: &str,
    ) -> Result<Option<Order>, ServiceError> {
        order::Entity::find()
            .filter(order::Column::PaymentIntentId.eq(payment_intent_id))
            .one(&self.txn)
            .await?
            .map(order::Model::into_domain)
            .transpose()
    }

    async fn update_order(
        &mut self,
        value: &Order,
        expected_version: i64,
    ) -> Result<bool, ServiceError> {
        let result = order::Entity::update_many()
            .col_expr(order::Column::Status, Expr::value(value.status.to_string()))
            .col_expr(
                order::Column::PaymentIntentId,
                Expr::value(value.payment_intent_id.clone()),
            )
            .col_expr(
                order::Column::PaymentClientSecret,
                Expr::value(value.payment_client_secret.clone()),
            )
            .col_expr(order::Column::Version, Expr::value(value.version))
            .col_expr(order::Column::UpdatedAt, Expr::value(value.updated_at))
            .filter(order::Column::Id.eq(value.id))
            .filter(order::Column::Version.eq(expected_version))
            .exec(&self.txn)
            .await?;
        Ok(result.rows_affected == 1)
    }

    async fn pending_orders_created_before(
        &mut self,
        cutoff: DateTime<Utc>,
        limit: u64,
    ) -> Result<Vec<Uuid>, ServiceError> {
        let rows = order::Entity::find()
            .filter(order::Column::Status.eq(OrderStatus::PendingPayment.to_string()))
            .filter(order::Column::CreatedAt.lt(cutoff))
            .order_by_asc(order::Column::CreatedAt)
            .limit(limit)
            .all(&self.txn)
            .await?;
        Ok(rows.into_iter().map(|row| row.id).collect())
    }
}

#[async_trait]
impl PaymentEventRepository for DatabaseTx {
    async fn get_processed_event(
        &mut self,
        event_id: &str,
    ) -> Result<Option<ProcessedEvent>, ServiceError> {
        processed_payment_event::Entity::find_by_id(event_id.to_string())
            .one(&self.txn)
            .await?
            .map(processed_payment_event::Model::into_domain)
            .transpose()
    }

    async fn insert_processed_event(
        &mut self,
        event: &ProcessedEvent,
    ) -> Result<bool, ServiceError> {
        let inserted = processed_payment_event::Entity::insert(
            processed_payment_event::ActiveModel::from_domain(event)?,
        )
        .on_conflict(
            OnConflict::column(processed_payment_event::Column::EventId)
                .do_nothing()
                .to_owned(),
        )
        .exec_without_returning(&self.txn)
        .await?;
        Ok(inserted == 1)
    }

    async fn record_orphan(&mut self, orphan: &OrphanEvent) -> Result<(), ServiceError> {
        orphan_payment_event::Entity::insert(orphan_payment_event::ActiveModel::from_domain(
            orphan,
        )?)
        .on_conflict(
            OnConflict::column(orphan_payment_event::Column::EventId)
                .do_nothing()
                .to_owned(),
        )
        .exec_without_returning(&self.txn)
        .await?;
        Ok(())
    }

    async fn orphans_for_intent(
        &mut self,
        payment_intent_id: &str,
    ) -> Result<Vec<OrphanEvent>, ServiceError> {
        orphan_payment_event::Entity::find()
            .filter(orphan_payment_event::Column::PaymentIntentId.eq(payment_intent_id))
            .order_by_asc(orphan_payment_event::Column::RecordedAt)
            .all(&self.txn)
            .await?
            .into_iter()
            .map(orphan_payment_event::Model::into_domain)
            .collect()
    }

    async fn delete_orphan(&mut self, event_id: &str) -> Result<(), ServiceError> {
        orphan_payment_event::Entity::delete_by_id(event_id.to_string())
            .exec(&self.txn)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl CommissionRepository for DatabaseTx {
    async fn insert_commission(&mut self, value: &Commission) -> Result<bool, ServiceError> {
        let inserted = commission::Entity::insert(commission::ActiveModel::from(value))
            .on_conflict(
                OnConflict::columns([commission::Column::OrderId, commission::Column::SellerId])
                    .do_nothing()
                    .to_owned(),
            )
            .exec_without_returning(&self.txn)
            .await?;
        Ok(inserted == 1)
    }

    async fn commissions_for_order(
        &mut self,
        order_id: Uuid,
    ) -> Result<Vec<Commission>, ServiceError> {
        Ok(commission::Entity::find()
            .filter(commission::Column::OrderId.eq(order_id))
            .order_by_asc(commission::Column::SellerId)
            .all(&self.txn)
            .await?
            .into_iter()
            .map(Commission::from)
            .collect())
    }
}

#[async_trait]
impl StoreTx for DatabaseTx {
    async fn commit(self: Box<Self>) -> Result<(), ServiceError> {
        self.txn.commit().await?;
        Ok(())
    }
}
