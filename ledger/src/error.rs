// ledger/src/error.rs
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    InvalidNumber,
    OwnedByAnotherUser,
    InsufficientFunds,
    InvalidAmount,
    /// A balance or amount would leave the representable range.
    AmountOverflow,
    OrderNotFound(String),
    Storage(String),
}

impl LedgerError {
    /// Storage failures leave no partial effect and may be retried.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Storage(_))
    }
}

impl fmt::Display for LedgerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidNumber => write!(f, "Invalid order number"),
            Self::OwnedByAnotherUser => write!(f, "Order already submitted by another user"),
            Self::InsufficientFunds => write!(f, "Insufficient funds"),
            Self::InvalidAmount => write!(f, "Invalid amount"),
            Self::AmountOverflow => write!(f, "Amount out of range"),
            Self::OrderNotFound(number) => write!(f, "Order not found: {}", number),
            Self::Storage(msg) => write!(f, "Storage error: {}", msg),
        }
    }
}

impl std::error::Error for LedgerError {}

/// SQLSTATE `numeric_value_out_of_range`.
const NUMERIC_OUT_OF_RANGE: &str = "22003";

impl From<sqlx::Error> for LedgerError {
    fn from(err: sqlx::Error) -> Self {
        if let Some(db) = err.as_database_error() {
            if db.code().as_deref() == Some(NUMERIC_OUT_OF_RANGE) {
                return Self::AmountOverflow;
            }
        }
        Self::Storage(err.to_string())
    }
}
