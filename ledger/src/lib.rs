// ledger/src/lib.rs
pub mod adapters;
pub mod balance;
pub mod error;
pub mod order;
pub mod points;
pub mod withdrawal;

pub use balance::Balance;
pub use error::LedgerError;
pub use order::{Order, OrderAdmission, OrderStatus, ResolutionOutcome};
pub use withdrawal::Withdrawal;

use async_trait::async_trait;
use uuid::Uuid;

/// Storage contract for orders, balances and withdrawals.
///
/// The ledger is the only writer of these records. Every method either
/// commits completely or has no effect; a `LedgerError::Storage` means
/// nothing was written and the call may be repeated.
#[async_trait]
pub trait LedgerAdapter: Send + Sync {
    /// Record `number` for `owner` with status `Pending`.
    ///
    /// Returns `AlreadyOwnedBySelf` when the owner already holds the number
    /// and `LedgerError::OwnedByAnotherUser` when someone else does.
    async fn create_order(&self, owner: Uuid, number: &str)
    -> Result<OrderAdmission, LedgerError>;

    /// Newest first.
    async fn list_orders(&self, owner: Uuid) -> Result<Vec<Order>, LedgerError>;

    async fn get_order(&self, owner: Uuid, number: &str) -> Result<Order, LedgerError>;

    /// All `Pending` and `InProgress` orders across owners, oldest first.
    async fn list_unresolved(&self) -> Result<Vec<Order>, LedgerError>;

    /// Move an order to `status` and, for `Resolved` with a positive
    /// accrual, credit the owner's available balance in the same
    /// transaction.
    ///
    /// Only forward moves take effect (see [`OrderStatus::predecessors`]).
    /// Repeating a call for an order that already reached `status` or a
    /// terminal state returns `Unchanged` and credits nothing.
    async fn apply_resolution(
        &self,
        number: &str,
        status: OrderStatus,
        accrual: u64,
    ) -> Result<ResolutionOutcome, LedgerError>;

    /// Materializes a zero balance on first access.
    async fn get_balance(&self, owner: Uuid) -> Result<Balance, LedgerError>;

    /// Re-read the balance under lock, fail with `InsufficientFunds` when
    /// `available < amount`, otherwise record the withdrawal and move
    /// `amount` from available to withdrawn.
    async fn create_withdrawal(
        &self,
        owner: Uuid,
        order: &str,
        amount: u64,
    ) -> Result<Withdrawal, LedgerError>;

    /// Newest first.
    async fn list_withdrawals(&self, owner: Uuid) -> Result<Vec<Withdrawal>, LedgerError>;
}
