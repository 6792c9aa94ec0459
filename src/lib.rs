//! Loyalty points core.
//!
//! Users submit purchase order numbers, an external accrual authority
//! decides how many points each order earns, and users spend points by
//! withdrawing them against other order numbers. Storage lives behind
//! [`ledger::LedgerAdapter`]; the services here add validation, the
//! reconciliation loop and the HTTP client for the authority.
pub mod accrual;
pub mod balance;
pub mod config;
pub mod luhn;
pub mod orders;
pub mod reconcile;

pub use ledger;

use std::{sync::Arc, time::Duration};

use crate::{
    accrual::AccrualSource, balance::BalanceService, orders::OrderService, reconcile::Reconciler,
};
use ledger::LedgerAdapter;

/// Entry point wiring the services to one ledger.
#[derive(Clone)]
pub struct Engine {
    ledger: Arc<dyn LedgerAdapter>,
}

impl Engine {
    pub fn new(ledger: Arc<dyn LedgerAdapter>) -> Self {
        Self { ledger }
    }

    pub fn orders(&self) -> OrderService {
        OrderService::new(self.ledger.clone())
    }

    pub fn balances(&self) -> BalanceService {
        BalanceService::new(self.ledger.clone())
    }

    pub fn reconciler(&self, accrual: Arc<dyn AccrualSource>, interval: Duration) -> Reconciler {
        Reconciler::new(self.ledger.clone(), accrual).with_interval(interval)
    }
}
