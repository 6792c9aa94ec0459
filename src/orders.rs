use std::sync::Arc;

use ledger::{LedgerAdapter, LedgerError, Order, OrderAdmission};
use metrics::counter;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::luhn;

/// Validates and records submitted order numbers.
#[derive(Clone)]
pub struct OrderService {
    ledger: Arc<dyn LedgerAdapter>,
}

impl OrderService {
    pub fn new(ledger: Arc<dyn LedgerAdapter>) -> Self {
        Self { ledger }
    }

    /// Admit `number` for `owner`.
    ///
    /// `AlreadyOwnedBySelf` is a success: the earlier submission stands and
    /// nothing new is written.
    #[tracing::instrument(skip(self, owner), fields(owner = %owner))]
    pub async fn submit(&self, owner: Uuid, number: &str) -> Result<OrderAdmission, LedgerError> {
        if !luhn::validate(number) {
            counter!("loyalty.orders.submitted", "outcome" => "invalid").increment(1);
            return Err(LedgerError::InvalidNumber);
        }

        match self.ledger.create_order(owner, number).await {
            Ok(OrderAdmission::Created) => {
                counter!("loyalty.orders.submitted", "outcome" => "created").increment(1);
                info!(order = number, "order accepted for processing");
                Ok(OrderAdmission::Created)
            }
            Ok(OrderAdmission::AlreadyOwnedBySelf) => {
                counter!("loyalty.orders.submitted", "outcome" => "duplicate").increment(1);
                debug!(order = number, "order already submitted by this user");
                Ok(OrderAdmission::AlreadyOwnedBySelf)
            }
            Err(LedgerError::OwnedByAnotherUser) => {
                counter!("loyalty.orders.submitted", "outcome" => "conflict").increment(1);
                warn!(order = number, "order belongs to another user");
                Err(LedgerError::OwnedByAnotherUser)
            }
            Err(e) => Err(e),
        }
    }

    pub async fn list(&self, owner: Uuid) -> Result<Vec<Order>, LedgerError> {
        self.ledger.list_orders(owner).await
    }

    pub async fn get(&self, owner: Uuid, number: &str) -> Result<Order, LedgerError> {
        self.ledger.get_order(owner, number).await
    }
}
