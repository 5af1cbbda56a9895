//! Fire-and-forget order notifications.
//!
//! Engine code calls [`NotificationDispatcher::dispatch`], which only queues
//! the notification. A background worker hands queued notifications to the
//! [`Notifier`]; its failures are logged and never reach the caller.

use std::sync::Arc;

use async_trait::async_trait;
use metrics::counter;
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::errors::ServiceError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, AsRefStr)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationKind {
    OrderPlaced,
    PaymentSucceeded,
    PaymentFailed,
    OrderCancelled,
    OrderRefunded,
    OrderFulfilling,
    OrderShipped,
    OrderDelivered,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub order_id: Uuid,
    pub kind: NotificationKind,
}

/// Delivery channel for order notifications (email, push, ...).
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: &Notification) -> Result<(), ServiceError>;
}

/// Writes notifications to the log. Used when no delivery channel is wired.
#[derive(Debug, Default)]
pub struct LoggingNotifier;

#[async_trait]
impl Notifier for LoggingNotifier {
    async fn notify(&self, notification: &Notification) -> Result<(), ServiceError> {
        info!(
            order_id = %notification.order_id,
            kind = %notification.kind,
            "order notification"
        );
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct NotificationDispatcher {
    sender: mpsc::Sender<Notification>,
}

impl NotificationDispatcher {
    /// Spawns the delivery worker. The worker stops once every dispatcher
    /// clone has been dropped and the queue is drained.
    pub fn start(notifier: Arc<dyn Notifier>, capacity: usize) -> (Self, JoinHandle<()>) {
        let (sender, mut receiver) = mpsc::channel::<Notification>(capacity.max(1));

        let worker = tokio::spawn(async move {
            while let Some(notification) = receiver.recv().await {
                if let Err(e) = notifier.notify(&notification).await {
                    counter!("checkout.notifications.failed", 1);
                    warn!(
                        order_id = %notification.order_id,
                        kind = %notification.kind,
                        error = %e,
                        "notification delivery failed"
                    );
                }
            }
            debug!("notification worker stopped");
        });

        (Self { sender }, worker)
    }

    /// Queues a notification without waiting. A full or closed queue drops
    /// it with a warning.
    pub fn dispatch(&self, order_id: Uuid, kind: NotificationKind) {
        match self.sender.try_send(Notification { order_id, kind }) {
            Ok(()) => {
                counter!("checkout.notifications.queued", 1);
            }
            Err(TrySendError::Full(dropped)) => {
                counter!("checkout.notifications.dropped", 1);
                warn!(order_id = %dropped.order_id, kind = %dropped.kind, "notification queue full");
            }
            Err(TrySendError::Closed(dropped)) => {
                warn!(order_id = %dropped.order_id, kind = %dropped.kind, "notification worker gone");
            }
        }
    }
}
