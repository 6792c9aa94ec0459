// ledger/src/balance.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{LedgerError, points};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Balance {
    #[serde(skip)]
    pub owner: Uuid,
    #[serde(rename = "current", serialize_with = "crate::points::serialize_display", skip_deserializing)]
    pub available: u64,
    #[serde(serialize_with = "crate::points::serialize_display", skip_deserializing)]
    pub withdrawn: u64,
    #[serde(skip)]
    pub updated_at: DateTime<Utc>,
}

impl Balance {
    pub fn new(owner: Uuid) -> Self {
        Self {
            owner,
            available: 0,
            withdrawn: 0,
            updated_at: Utc::now(),
        }
    }

    /// Leaves the balance untouched when `available` would pass
    /// [`points::MAX_AMOUNT`].
    pub fn credit(&mut self, amount: u64) -> Result<(), LedgerError> {
        self.available = checked_add(self.available, amount)?;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Move `amount` from available to withdrawn. Leaves the balance untouched
    /// when it would go negative or overflow.
    pub fn debit(&mut self, amount: u64) -> Result<(), LedgerError> {
        if self.available < amount {
            return Err(LedgerError::InsufficientFunds);
        }
        self.withdrawn = checked_add(self.withdrawn, amount)?;
        self.available -= amount;
        self.updated_at = Utc::now();
        Ok(())
    }
}

fn checked_add(current: u64, amount: u64) -> Result<u64, LedgerError> {
    current
        .checked_add(amount)
        .filter(|total| *total <= points::MAX_AMOUNT)
        .ok_or(LedgerError::AmountOverflow)
}
