// ledger/src/points.rs
//! Points are held as integer hundredths. The accrual authority and the
//! public API speak in decimal numbers; conversion happens at those edges.

use serde::Serializer;

pub const DECIMALS: u8 = 2;

fn scale() -> f64 {
    10_f64.powi(DECIMALS as i32)
}

/// Largest amount in internal units; balances are stored as `BIGINT`.
pub const MAX_AMOUNT: u64 = i64::MAX as u64;

/// Convert a display amount (e.g. `500.5`) to internal units, rounding to
/// the nearest hundredth.
///
/// `None` for negative, non-finite or out-of-range input.
pub fn to_internal(display_amount: f64) -> Option<u64> {
    let scaled = (display_amount * scale()).round();
    if !(scaled >= 0.0) || scaled >= MAX_AMOUNT as f64 {
        return None;
    }
    Some(scaled as u64)
}

pub fn to_display(internal_amount: u64) -> f64 {
    internal_amount as f64 / scale()
}

pub(crate) fn serialize_display<S: Serializer>(amount: &u64, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_f64(to_display(*amount))
}

pub(crate) fn serialize_display_opt<S: Serializer>(
    amount: &Option<u64>,
    s: S,
) -> Result<S::Ok, S::Error> {
    match amount {
        Some(amount) => s.serialize_some(&to_display(*amount)),
        None => s.serialize_none(),
    }
}
