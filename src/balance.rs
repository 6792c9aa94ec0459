use std::sync::Arc;

use ledger::{Balance, LedgerAdapter, LedgerError, Withdrawal};
use metrics::{counter, histogram};
use tracing::{info, warn};
use uuid::Uuid;

use crate::luhn;

/// Balance reads and point withdrawals.
#[derive(Clone)]
pub struct BalanceService {
    ledger: Arc<dyn LedgerAdapter>,
}

impl BalanceService {
    pub fn new(ledger: Arc<dyn LedgerAdapter>) -> Self {
        Self { ledger }
    }

    pub async fn balance(&self, owner: Uuid) -> Result<Balance, LedgerError> {
        self.ledger.get_balance(owner).await
    }

    /// Debit `amount` internal points against `order`.
    ///
    /// `order` only has to pass the checksum; it need not be one of the
    /// owner's uploaded orders. The solvency check happens inside the
    /// ledger transaction.
    #[tracing::instrument(skip(self, owner), fields(owner = %owner))]
    pub async fn withdraw(
        &self,
        owner: Uuid,
        order: &str,
        amount: u64,
    ) -> Result<Withdrawal, LedgerError> {
        if !luhn::validate(order) {
            return Err(LedgerError::InvalidNumber);
        }
        if amount == 0 {
            return Err(LedgerError::InvalidAmount);
        }

        match self.ledger.create_withdrawal(owner, order, amount).await {
            Ok(withdrawal) => {
                counter!("loyalty.withdrawals.total").increment(1);
                histogram!("loyalty.withdrawals.amount").record(amount as f64);
                info!(order, amount, "withdrawal committed");
                Ok(withdrawal)
            }
            Err(LedgerError::InsufficientFunds) => {
                counter!("loyalty.withdrawals.rejected", "reason" => "insufficient_funds")
                    .increment(1);
                warn!(order, amount, "withdrawal rejected: insufficient funds");
                Err(LedgerError::InsufficientFunds)
            }
            Err(e) => Err(e),
        }
    }

    pub async fn withdrawals(&self, owner: Uuid) -> Result<Vec<Withdrawal>, LedgerError> {
        self.ledger.list_withdrawals(owner).await
    }
}
