// ledger/src/order.rs
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::LedgerError;

/// Order lifecycle: `Pending -> InProgress -> {Resolved, Rejected}`.
///
/// Serialized with the public wire names; persisted with the lowercase
/// storage names from [`OrderStatus::as_str`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum OrderStatus {
    #[serde(rename = "NEW")]
    Pending,
    #[serde(rename = "PROCESSING")]
    InProgress,
    #[serde(rename = "PROCESSED")]
    Resolved,
    #[serde(rename = "INVALID")]
    Rejected,
}

impl OrderStatus {
    pub const UNRESOLVED: [OrderStatus; 2] = [OrderStatus::Pending, OrderStatus::InProgress];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Resolved => "resolved",
            Self::Rejected => "rejected",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Resolved | Self::Rejected)
    }

    /// Statuses an order may be in for a move to `self` to take effect.
    /// Empty for `Pending`: nothing ever moves back to it.
    pub fn predecessors(&self) -> &'static [OrderStatus] {
        match self {
            Self::Pending => &[],
            Self::InProgress => &[Self::Pending],
            Self::Resolved | Self::Rejected => &Self::UNRESOLVED,
        }
    }
}

impl FromStr for OrderStatus {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "resolved" => Ok(Self::Resolved),
            "rejected" => Ok(Self::Rejected),
            other => Err(LedgerError::Storage(format!("unknown order status: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Order {
    pub number: String,
    #[serde(skip)]
    pub owner: Uuid,
    pub status: OrderStatus,
    /// Set only once the order is `Resolved`.
    #[serde(
        skip_serializing_if = "Option::is_none",
        serialize_with = "crate::points::serialize_display_opt",
        skip_deserializing,
        default
    )]
    pub accrual: Option<u64>,
    #[serde(rename = "uploaded_at")]
    pub submitted_at: DateTime<Utc>,
}

impl Order {
    pub fn new(owner: Uuid, number: &str) -> Self {
        Self {
            number: number.to_string(),
            owner,
            status: OrderStatus::Pending,
            accrual: None,
            submitted_at: Utc::now(),
        }
    }

    pub fn is_unresolved(&self) -> bool {
        !self.status.is_terminal()
    }
}

/// Result of recording an order number for an owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderAdmission {
    Created,
    /// The same owner submitted this number before; nothing was written.
    AlreadyOwnedBySelf,
}

/// Result of applying an authority verdict to an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionOutcome {
    /// Status changed; `credited` points were added to the owner's balance.
    Applied { owner: Uuid, credited: u64 },
    /// The order was already at or past the requested status.
    Unchanged,
}
