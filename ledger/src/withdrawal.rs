// ledger/src/withdrawal.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A committed debit. Created only by a successful withdrawal transaction
/// and never modified afterwards.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Withdrawal {
    #[serde(skip)]
    pub id: Uuid,
    #[serde(skip)]
    pub owner: Uuid,
    pub order: String,
    #[serde(rename = "sum", serialize_with = "crate::points::serialize_display", skip_deserializing)]
    pub amount: u64,
    #[serde(rename = "processed_at")]
    pub created_at: DateTime<Utc>,
}

impl Withdrawal {
    pub fn new(owner: Uuid, order: &str, amount: u64) -> Self {
        Self {
            id: Uuid::now_v7(),
            owner,
            order: order.to_string(),
            amount,
            created_at: Utc::now(),
        }
    }
}
