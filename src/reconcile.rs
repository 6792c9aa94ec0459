//! Background reconciliation of unresolved orders against the accrual
//! authority.
//!
//! One cycle walks every `Pending`/`InProgress` order oldest first, asks the
//! authority about it and applies any forward status change through the
//! ledger. Cycles run one after another on a single task, so they never
//! overlap. A failure on one order is logged and the order is retried on the
//! next cycle; the rest of the cycle carries on. Rate limiting is the
//! exception: the cycle stops and the next one waits for the advertised
//! delay.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use ledger::{LedgerAdapter, LedgerError, OrderStatus, ResolutionOutcome};
use metrics::{counter, histogram};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::accrual::{AccrualError, AccrualSource};

pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(1);

/// Tally of a single reconciliation cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub scanned: usize,
    pub resolved: usize,
    pub rejected: usize,
    pub progressed: usize,
    /// Authority has nothing new to say, or the ledger already had it.
    pub unchanged: usize,
    pub failed: usize,
    /// Set when the authority asked us to slow down.
    pub backoff: Option<Duration>,
    /// Shutdown was requested before every order was visited.
    pub interrupted: bool,
}

pub struct Reconciler {
    ledger: Arc<dyn LedgerAdapter>,
    accrual: Arc<dyn AccrualSource>,
    interval: Duration,
}

impl Reconciler {
    pub fn new(ledger: Arc<dyn LedgerAdapter>, accrual: Arc<dyn AccrualSource>) -> Self {
        Self {
            ledger,
            accrual,
            interval: DEFAULT_INTERVAL,
        }
    }

    /// Pause between the end of one cycle and the start of the next.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Run a single cycle to completion.
    pub async fn run_once(&self) -> Result<CycleReport, LedgerError> {
        self.cycle(&CancellationToken::new()).await
    }

    /// Cycle until `shutdown` is cancelled. The first cycle starts
    /// immediately.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            interval_ms = self.interval.as_millis() as u64,
            "reconciler started"
        );

        let mut wait = Duration::ZERO;
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }

            wait = match self.cycle(&shutdown).await {
                Ok(report) => match report.backoff {
                    Some(backoff) => backoff.max(self.interval),
                    None => self.interval,
                },
                Err(e) => {
                    warn!(error = %e, "failed to load unresolved orders");
                    self.interval
                }
            };
        }

        info!("reconciler stopped");
    }

    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    async fn cycle(&self, shutdown: &CancellationToken) -> Result<CycleReport, LedgerError> {
        let started = Instant::now();
        let orders = self.ledger.list_unresolved().await?;
        let mut report = CycleReport::default();

        for order in orders {
            if shutdown.is_cancelled() {
                report.interrupted = true;
                break;
            }
            report.scanned += 1;

            let verdict = match self.accrual.resolve(&order.number).await {
                Ok(verdict) => verdict,
                Err(AccrualError::RateLimited { retry_after }) => {
                    let backoff = retry_after.unwrap_or(self.interval);
                    counter!("loyalty.reconcile.errors", "kind" => "rate_limited").increment(1);
                    warn!(
                        order = %order.number,
                        backoff_ms = backoff.as_millis() as u64,
                        "accrual service is rate limiting, ending cycle early"
                    );
                    report.failed += 1;
                    report.backoff = Some(backoff);
                    break;
                }
                Err(e) if e.is_protocol() => {
                    counter!("loyalty.reconcile.errors", "kind" => "protocol").increment(1);
                    error!(order = %order.number, error = %e, "accrual response rejected");
                    report.failed += 1;
                    continue;
                }
                Err(e) => {
                    counter!("loyalty.reconcile.errors", "kind" => "accrual").increment(1);
                    warn!(order = %order.number, error = %e, "accrual lookup failed");
                    report.failed += 1;
                    continue;
                }
            };

            if verdict.is_pending() || verdict.status == order.status {
                debug!(order = %order.number, status = verdict.status.as_str(), "no change");
                report.unchanged += 1;
                continue;
            }

            match self
                .ledger
                .apply_resolution(&order.number, verdict.status, verdict.accrual)
                .await
            {
                Ok(ResolutionOutcome::Applied { owner, credited }) => {
                    counter!("loyalty.reconcile.resolved", "status" => verdict.status.as_str())
                        .increment(1);
                    info!(
                        order = %order.number,
                        owner = %owner,
                        status = verdict.status.as_str(),
                        credited,
                        "order status updated"
                    );
                    match verdict.status {
                        OrderStatus::Resolved => report.resolved += 1,
                        OrderStatus::Rejected => report.rejected += 1,
                        _ => report.progressed += 1,
                    }
                }
                Ok(ResolutionOutcome::Unchanged) => report.unchanged += 1,
                Err(e) if e.is_transient() => {
                    counter!("loyalty.reconcile.errors", "kind" => "ledger").increment(1);
                    warn!(order = %order.number, error = %e, "failed to apply resolution");
                    report.failed += 1;
                }
                Err(e) => {
                    counter!("loyalty.reconcile.errors", "kind" => "ledger_rejected").increment(1);
                    error!(order = %order.number, error = %e, "ledger refused resolution");
                    report.failed += 1;
                }
            }
        }

        histogram!("loyalty.reconcile.cycle.duration_ms")
            .record(started.elapsed().as_secs_f64() * 1000.0);
        if report.scanned > 0 {
            debug!(?report, "reconcile cycle finished");
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accrual::AccrualVerdict;
    use async_trait::async_trait;
    use ledger::{Balance, Order, OrderAdmission, Withdrawal, adapters::MemoryAdapter};
    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex;
    use uuid::Uuid;

    /// Answers from a per-order script; unscripted orders stay pending.
    #[derive(Default)]
    struct ScriptedAccrual {
        script: Mutex<HashMap<String, VecDeque<Result<AccrualVerdict, AccrualError>>>>,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedAccrual {
        fn push(&self, number: &str, reply: Result<AccrualVerdict, AccrualError>) {
            self.script
                .lock()
                .unwrap()
                .entry(number.to_string())
                .or_default()
                .push_back(reply);
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl AccrualSource for ScriptedAccrual {
        async fn resolve(&self, number: &str) -> Result<AccrualVerdict, AccrualError> {
            self.calls.lock().unwrap().push(number.to_string());
            self.script
                .lock()
                .unwrap()
                .get_mut(number)
                .and_then(|replies| replies.pop_front())
                .unwrap_or_else(|| Ok(AccrualVerdict::pending()))
        }
    }

    /// Fails the first `failures` resolutions with a storage error.
    struct FlakyLedger {
        inner: MemoryAdapter,
        failures: Mutex<usize>,
    }

    #[async_trait]
    impl LedgerAdapter for FlakyLedger {
        async fn create_order(
            &self,
            owner: Uuid,
            number: &str,
        ) -> Result<OrderAdmission, LedgerError> {
            self.inner.create_order(owner, number).await
        }

        async fn list_orders(&self, owner: Uuid) -> Result<Vec<Order>, LedgerError> {
            self.inner.list_orders(owner).await
        }

        async fn get_order(&self, owner: Uuid, number: &str) -> Result<Order, LedgerError> {
            self.inner.get_order(owner, number).await
        }

        async fn list_unresolved(&self) -> Result<Vec<Order>, LedgerError> {
            self.inner.list_unresolved().await
        }

        async fn apply_resolution(
            &self,
            number: &str,
            status: OrderStatus,
            accrual: u64,
        ) -> Result<ResolutionOutcome, LedgerError> {
            {
                let mut failures = self.failures.lock().unwrap();
                if *failures > 0 {
                    *failures -= 1;
                    return Err(LedgerError::Storage("connection reset".to_string()));
                }
            }
            self.inner.apply_resolution(number, status, accrual).await
        }

        async fn get_balance(&self, owner: Uuid) -> Result<Balance, LedgerError> {
            self.inner.get_balance(owner).await
        }

        async fn create_withdrawal(
            &self,
            owner: Uuid,
            order: &str,
            amount: u64,
        ) -> Result<Withdrawal, LedgerError> {
            self.inner.create_withdrawal(owner, order, amount).await
        }

        async fn list_withdrawals(&self, owner: Uuid) -> Result<Vec<Withdrawal>, LedgerError> {
            self.inner.list_withdrawals(owner).await
        }
    }

    fn processed(accrual: u64) -> Result<AccrualVerdict, AccrualError> {
        Ok(AccrualVerdict {
            status: OrderStatus::Resolved,
            accrual,
        })
    }

    fn verdict(status: OrderStatus) -> Result<AccrualVerdict, AccrualError> {
        Ok(AccrualVerdict { status, accrual: 0 })
    }

    struct Fixture {
        ledger: Arc<MemoryAdapter>,
        accrual: Arc<ScriptedAccrual>,
        reconciler: Reconciler,
        user: Uuid,
    }

    async fn fixture(numbers: &[&str]) -> Fixture {
        let ledger = Arc::new(MemoryAdapter::new());
        let accrual = Arc::new(ScriptedAccrual::default());
        let user = Uuid::now_v7();
        for number in numbers {
            ledger.create_order(user, number).await.unwrap();
        }
        let reconciler = Reconciler::new(ledger.clone(), accrual.clone());
        Fixture {
            ledger,
            accrual,
            reconciler,
            user,
        }
    }

    #[tokio::test]
    async fn test_orders_are_visited_oldest_first() {
        let f = fixture(&["79927398713", "12345678903", "2377225624"]).await;

        let report = f.reconciler.run_once().await.unwrap();

        assert_eq!(report.scanned, 3);
        assert_eq!(report.unchanged, 3);
        assert_eq!(
            f.accrual.calls(),
            vec!["79927398713", "12345678903", "2377225624"]
        );
    }

    #[tokio::test]
    async fn test_pending_orders_are_left_alone() {
        let f = fixture(&["12345678903"]).await;

        f.reconciler.run_once().await.unwrap();

        let order = f.ledger.get_order(f.user, "12345678903").await.unwrap();
        assert_eq!(order.status, OrderStatus::Pending);
        assert_eq!(f.ledger.list_unresolved().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_processed_order_credits_once() {
        let f = fixture(&["12345678903"]).await;
        f.accrual.push("12345678903", processed(500_50));

        let report = f.reconciler.run_once().await.unwrap();
        assert_eq!(report.resolved, 1);

        let order = f.ledger.get_order(f.user, "12345678903").await.unwrap();
        assert_eq!(order.status, OrderStatus::Resolved);
        assert_eq!(order.accrual, Some(500_50));
        assert_eq!(f.ledger.get_balance(f.user).await.unwrap().available, 500_50);

        // Resolved orders drop out of later cycles.
        let report = f.reconciler.run_once().await.unwrap();
        assert_eq!(report.scanned, 0);
        assert_eq!(f.ledger.get_balance(f.user).await.unwrap().available, 500_50);
    }

    #[tokio::test]
    async fn test_processing_then_processed() {
        let f = fixture(&["12345678903"]).await;
        f.accrual.push("12345678903", verdict(OrderStatus::InProgress));
        f.accrual.push("12345678903", verdict(OrderStatus::InProgress));
        f.accrual.push("12345678903", processed(10_00));

        let report = f.reconciler.run_once().await.unwrap();
        assert_eq!(report.progressed, 1);
        let order = f.ledger.get_order(f.user, "12345678903").await.unwrap();
        assert_eq!(order.status, OrderStatus::InProgress);

        let report = f.reconciler.run_once().await.unwrap();
        assert_eq!(report.unchanged, 1);

        let report = f.reconciler.run_once().await.unwrap();
        assert_eq!(report.resolved, 1);
        assert_eq!(f.ledger.get_balance(f.user).await.unwrap().available, 10_00);
    }

    #[tokio::test]
    async fn test_invalid_order_is_rejected_without_credit() {
        let f = fixture(&["12345678903"]).await;
        f.accrual.push("12345678903", verdict(OrderStatus::Rejected));

        let report = f.reconciler.run_once().await.unwrap();
        assert_eq!(report.rejected, 1);

        let order = f.ledger.get_order(f.user, "12345678903").await.unwrap();
        assert_eq!(order.status, OrderStatus::Rejected);
        assert_eq!(order.accrual, None);
        assert_eq!(f.ledger.get_balance(f.user).await.unwrap().available, 0);
    }

    #[tokio::test]
    async fn test_accrual_failure_skips_order_until_next_cycle() {
        let f = fixture(&["79927398713", "12345678903"]).await;
        f.accrual.push("79927398713", Err(AccrualError::Timeout));
        f.accrual.push("12345678903", processed(1_00));
        f.accrual.push("79927398713", processed(2_00));

        let report = f.reconciler.run_once().await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(report.resolved, 1);
        assert_eq!(f.ledger.get_balance(f.user).await.unwrap().available, 1_00);

        let report = f.reconciler.run_once().await.unwrap();
        assert_eq!(report.resolved, 1);
        assert_eq!(f.ledger.get_balance(f.user).await.unwrap().available, 3_00);
    }

    #[tokio::test]
    async fn test_ledger_failure_is_retried_next_cycle() {
        let ledger = Arc::new(FlakyLedger {
            inner: MemoryAdapter::new(),
            failures: Mutex::new(1),
        });
        let accrual = Arc::new(ScriptedAccrual::default());
        let user = Uuid::now_v7();
        ledger.create_order(user, "12345678903").await.unwrap();
        accrual.push("12345678903", processed(7_25));
        accrual.push("12345678903", processed(7_25));
        let reconciler = Reconciler::new(ledger.clone(), accrual.clone());

        let report = reconciler.run_once().await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(ledger.get_balance(user).await.unwrap().available, 0);
        let order = ledger.get_order(user, "12345678903").await.unwrap();
        assert_eq!(order.status, OrderStatus::Pending);

        let report = reconciler.run_once().await.unwrap();
        assert_eq!(report.resolved, 1);
        assert_eq!(ledger.get_balance(user).await.unwrap().available, 7_25);
    }

    #[tokio::test]
    async fn test_refused_credit_does_not_stop_the_cycle() {
        let f = fixture(&["79927398713", "12345678903", "2377225624"]).await;
        f.accrual.push("79927398713", processed(ledger::points::MAX_AMOUNT));
        f.accrual.push("12345678903", processed(1_00));
        f.accrual.push("2377225624", verdict(OrderStatus::Rejected));

        let report = f.reconciler.run_once().await.unwrap();
        assert_eq!(report.resolved, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(report.rejected, 1);

        let order = f.ledger.get_order(f.user, "12345678903").await.unwrap();
        assert_eq!(order.status, OrderStatus::Pending);
        assert_eq!(
            f.ledger.get_balance(f.user).await.unwrap().available,
            ledger::points::MAX_AMOUNT
        );
    }

    #[tokio::test]
    async fn test_mismatched_response_is_not_applied() {
        let f = fixture(&["12345678903"]).await;
        f.accrual.push(
            "12345678903",
            Err(AccrualError::OrderMismatch {
                expected: "12345678903".to_string(),
                got: "79927398713".to_string(),
            }),
        );

        let report = f.reconciler.run_once().await.unwrap();
        assert_eq!(report.failed, 1);

        let order = f.ledger.get_order(f.user, "12345678903").await.unwrap();
        assert_eq!(order.status, OrderStatus::Pending);
        assert_eq!(f.ledger.get_balance(f.user).await.unwrap().available, 0);
    }

    #[tokio::test]
    async fn test_rate_limit_ends_cycle() {
        let f = fixture(&["79927398713", "12345678903", "2377225624"]).await;
        f.accrual.push(
            "79927398713",
            Err(AccrualError::RateLimited {
                retry_after: Some(Duration::from_secs(60)),
            }),
        );

        let report = f.reconciler.run_once().await.unwrap();

        assert_eq!(report.scanned, 1);
        assert_eq!(report.backoff, Some(Duration::from_secs(60)));
        assert_eq!(f.accrual.calls(), vec!["79927398713"]);
    }

    #[tokio::test]
    async fn test_rate_limit_without_hint_backs_off_one_interval() {
        let f = fixture(&["12345678903"]).await;
        f.accrual
            .push("12345678903", Err(AccrualError::RateLimited { retry_after: None }));
        let reconciler = f.reconciler.with_interval(Duration::from_millis(250));

        let report = reconciler.run_once().await.unwrap();
        assert_eq!(report.backoff, Some(Duration::from_millis(250)));
    }

    #[tokio::test]
    async fn test_cancelled_cycle_visits_nothing() {
        let f = fixture(&["12345678903"]).await;
        let shutdown = CancellationToken::new();
        shutdown.cancel();

        let report = f.reconciler.cycle(&shutdown).await.unwrap();

        assert!(report.interrupted);
        assert_eq!(report.scanned, 0);
        assert!(f.accrual.calls().is_empty());
    }

    #[tokio::test]
    async fn test_spawned_loop_resolves_and_stops_on_shutdown() {
        let f = fixture(&["12345678903"]).await;
        f.accrual.push("12345678903", processed(3_00));
        let shutdown = CancellationToken::new();

        let handle = f
            .reconciler
            .with_interval(Duration::from_millis(10))
            .spawn(shutdown.clone());

        let deadline = Instant::now() + Duration::from_secs(2);
        while f.ledger.get_balance(f.user).await.unwrap().available == 0 {
            assert!(Instant::now() < deadline, "order was never resolved");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        shutdown.cancel();
        let joined = tokio::time::timeout(Duration::from_secs(1), handle).await;
        assert!(joined.is_ok());
        assert_eq!(f.ledger.get_balance(f.user).await.unwrap().available, 3_00);
    }
}
