// ledger/src/adapters/memory.rs
use crate::{
    Balance, LedgerAdapter, LedgerError, Order, OrderAdmission, OrderStatus, ResolutionOutcome,
    Withdrawal, points,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use uuid::Uuid;

/// Orders and withdrawals are kept in insertion order, which is also
/// submission order.
#[derive(Default)]
struct MemoryState {
    orders: Vec<Order>,
    balances: HashMap<Uuid, Balance>,
    withdrawals: Vec<Withdrawal>,
}

impl MemoryState {
    fn order_mut(&mut self, number: &str) -> Option<&mut Order> {
        self.orders.iter_mut().find(|o| o.number == number)
    }

    fn balance_mut(&mut self, owner: Uuid) -> &mut Balance {
        self.balances
            .entry(owner)
            .or_insert_with(|| Balance::new(owner))
    }
}

/// Process-local ledger. Each operation runs under one lock, which gives
/// the same all-or-nothing behavior as a database transaction.
#[derive(Clone, Default)]
pub struct MemoryAdapter {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryState>, LedgerError> {
        self.state
            .lock()
            .map_err(|_| LedgerError::Storage("memory ledger lock poisoned".to_string()))
    }
}

#[async_trait]
impl LedgerAdapter for MemoryAdapter {
    async fn create_order(
        &self,
        owner: Uuid,
        number: &str,
    ) -> Result<OrderAdmission, LedgerError> {
        let mut state = self.lock()?;

        if let Some(existing) = state.orders.iter().find(|o| o.number == number) {
            return if existing.owner == owner {
                Ok(OrderAdmission::AlreadyOwnedBySelf)
            } else {
                Err(LedgerError::OwnedByAnotherUser)
            };
        }

        state.orders.push(Order::new(owner, number));
        Ok(OrderAdmission::Created)
    }

    async fn list_orders(&self, owner: Uuid) -> Result<Vec<Order>, LedgerError> {
        let state = self.lock()?;
        Ok(state
            .orders
            .iter()
            .rev()
            .filter(|o| o.owner == owner)
            .cloned()
            .collect())
    }

    async fn get_order(&self, owner: Uuid, number: &str) -> Result<Order, LedgerError> {
        let state = self.lock()?;
        state
            .orders
            .iter()
            .find(|o| o.number == number && o.owner == owner)
            .cloned()
            .ok_or_else(|| LedgerError::OrderNotFound(number.to_string()))
    }

    async fn list_unresolved(&self) -> Result<Vec<Order>, LedgerError> {
        let state = self.lock()?;
        Ok(state
            .orders
            .iter()
            .filter(|o| o.is_unresolved())
            .cloned()
            .collect())
    }

    async fn apply_resolution(
        &self,
        number: &str,
        status: OrderStatus,
        accrual: u64,
    ) -> Result<ResolutionOutcome, LedgerError> {
        let mut state = self.lock()?;

        let order = state
            .order_mut(number)
            .ok_or_else(|| LedgerError::OrderNotFound(number.to_string()))?;

        if !status.predecessors().contains(&order.status) {
            return Ok(ResolutionOutcome::Unchanged);
        }

        let owner = order.owner;
        let credited = if status == OrderStatus::Resolved {
            accrual
        } else {
            0
        };

        // Credit first so a refused credit leaves the order as it was.
        if credited > 0 {
            state.balance_mut(owner).credit(credited)?;
        }

        let order = state
            .order_mut(number)
            .ok_or_else(|| LedgerError::OrderNotFound(number.to_string()))?;
        order.status = status;
        if status == OrderStatus::Resolved {
            order.accrual = Some(accrual);
        }

        Ok(ResolutionOutcome::Applied { owner, credited })
    }

    async fn get_balance(&self, owner: Uuid) -> Result<Balance, LedgerError> {
        let mut state = self.lock()?;
        Ok(state.balance_mut(owner).clone())
    }

    async fn create_withdrawal(
        &self,
        owner: Uuid,
        order: &str,
        amount: u64,
    ) -> Result<Withdrawal, LedgerError> {
        if amount == 0 {
            return Err(LedgerError::InvalidAmount);
        }
        if amount > points::MAX_AMOUNT {
            return Err(LedgerError::AmountOverflow);
        }

        let mut state = self.lock()?;
        state.balance_mut(owner).debit(amount)?;

        let withdrawal = Withdrawal::new(owner, order, amount);
        state.withdrawals.push(withdrawal.clone());

        Ok(withdrawal)
    }

    async fn list_withdrawals(&self, owner: Uuid) -> Result<Vec<Withdrawal>, LedgerError> {
        let state = self.lock()?;
        Ok(state
            .withdrawals
            .iter()
            .rev()
            .filter(|w| w.owner == owner)
            .cloned()
            .collect())
    }
}
