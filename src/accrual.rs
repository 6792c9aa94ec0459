//! Client for the external accrual authority.
//!
//! The authority answers `GET {base}/api/orders/{number}` with `204` while it
//! knows nothing about the order, or `200` and a JSON body
//! `{"order", "status", "accrual"}` once it does. Everything else is
//! reported as an [`AccrualError`] and must not touch order state.

use std::time::Duration;

use async_trait::async_trait;
use ledger::{OrderStatus, points};
use reqwest::{Client, StatusCode, header::RETRY_AFTER};
use serde::Deserialize;

/// Statuses reported by the authority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AccrualStatus {
    Registered,
    Processing,
    Invalid,
    Processed,
}

impl AccrualStatus {
    pub fn order_status(&self) -> OrderStatus {
        match self {
            Self::Registered => OrderStatus::Pending,
            Self::Processing => OrderStatus::InProgress,
            Self::Invalid => OrderStatus::Rejected,
            Self::Processed => OrderStatus::Resolved,
        }
    }
}

/// What the authority currently says about one order, in ledger terms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccrualVerdict {
    pub status: OrderStatus,
    /// Internal points; zero unless `status` is `Resolved`.
    pub accrual: u64,
}

impl AccrualVerdict {
    pub fn pending() -> Self {
        Self {
            status: OrderStatus::Pending,
            accrual: 0,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.status == OrderStatus::Pending
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AccrualError {
    #[error("accrual request timed out")]
    Timeout,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("rate limited by accrual service")]
    RateLimited { retry_after: Option<Duration> },
    #[error("unexpected status code: {0}")]
    UnexpectedStatus(u16),
    #[error("malformed accrual response: {0}")]
    Decode(String),
    #[error("order number mismatch: expected {expected}, got {got}")]
    OrderMismatch { expected: String, got: String },
}

impl AccrualError {
    /// Infrastructure trouble; asking again later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout | Self::Transport(_) | Self::RateLimited { .. } | Self::UnexpectedStatus(_)
        )
    }

    /// The authority answered, but the answer cannot be trusted.
    pub fn is_protocol(&self) -> bool {
        matches!(self, Self::Decode(_) | Self::OrderMismatch { .. })
    }
}

impl From<reqwest::Error> for AccrualError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else if err.is_decode() {
            Self::Decode(err.to_string())
        } else {
            Self::Transport(err.to_string())
        }
    }
}

/// Source of accrual verdicts. The reconciler only depends on this.
#[async_trait]
pub trait AccrualSource: Send + Sync {
    async fn resolve(&self, number: &str) -> Result<AccrualVerdict, AccrualError>;
}

#[derive(Deserialize)]
struct AccrualResponse {
    order: String,
    status: AccrualStatus,
    #[serde(default)]
    accrual: Option<f64>,
}

/// HTTP client for the accrual authority. Every request carries the
/// configured timeout.
pub struct AccrualClient {
    client: Client,
    base_url: String,
}

impl AccrualClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, AccrualError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

fn parse_retry_after(value: &str) -> Option<Duration> {
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}

#[async_trait]
impl AccrualSource for AccrualClient {
    #[tracing::instrument(level = "debug", skip(self))]
    async fn resolve(&self, number: &str) -> Result<AccrualVerdict, AccrualError> {
        let response = self
            .client
            .get(format!("{}/api/orders/{}", self.base_url, number))
            .send()
            .await?;

        match response.status() {
            StatusCode::NO_CONTENT => Ok(AccrualVerdict::pending()),
            StatusCode::TOO_MANY_REQUESTS => {
                let retry_after = response
                    .headers()
                    .get(RETRY_AFTER)
                    .and_then(|v| v.to_str().ok())
                    .and_then(parse_retry_after);
                Err(AccrualError::RateLimited { retry_after })
            }
            StatusCode::OK => {
                let body: AccrualResponse = response.json().await?;
                if body.order != number {
                    return Err(AccrualError::OrderMismatch {
                        expected: number.to_string(),
                        got: body.order,
                    });
                }

                let status = body.status.order_status();
                let accrual = match (status, body.accrual) {
                    (OrderStatus::Resolved, Some(amount)) => points::to_internal(amount)
                        .ok_or_else(|| {
                            AccrualError::Decode(format!("accrual out of range: {}", amount))
                        })?,
                    _ => 0,
                };
                Ok(AccrualVerdict { status, accrual })
            }
            other => Err(AccrualError::UnexpectedStatus(other.as_u16())),
        }
    }
}
