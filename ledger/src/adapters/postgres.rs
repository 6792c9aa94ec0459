// ledger/src/adapters/postgres.rs
use crate::{
    Balance, LedgerAdapter, LedgerError, Order, OrderAdmission, OrderStatus, ResolutionOutcome,
    Withdrawal,
};
use sqlx::{PgPool, Row, postgres::PgRow};
use uuid::Uuid;

/// Anything that can hand out a Postgres pool gets the full ledger.
pub trait PostgresLedgerAdapter {
    fn get_pool(&self) -> PgPool;
}

/// Plain pool wrapper for running the ledger on its own.
#[derive(Clone)]
pub struct PostgresAdapter {
    pool: PgPool,
}

impl PostgresAdapter {
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl PostgresLedgerAdapter for PostgresAdapter {
    fn get_pool(&self) -> PgPool {
        self.pool.clone()
    }
}

#[async_trait::async_trait]
pub trait PostgresSchemaLedgerAdapter {
    /// Create the ledger tables and indexes if they do not exist yet.
    async fn init_ledger_schema(&self) -> Result<(), LedgerError>;
}

#[async_trait::async_trait]
impl<T> PostgresSchemaLedgerAdapter for T
where
    T: PostgresLedgerAdapter + Send + Sync,
{
    async fn init_ledger_schema(&self) -> Result<(), LedgerError> {
        let mut tx = self.get_pool().begin().await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS loyalty_orders (
                number TEXT PRIMARY KEY,
                owner UUID NOT NULL,
                status TEXT NOT NULL
                    CHECK (status IN ('pending', 'in_progress', 'resolved', 'rejected')),
                accrual BIGINT CHECK (accrual IS NULL OR accrual >= 0),
                uploaded_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_loyalty_orders_owner
            ON loyalty_orders(owner, uploaded_at DESC)
            "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_loyalty_orders_unresolved
            ON loyalty_orders(uploaded_at)
            WHERE status IN ('pending', 'in_progress')
            "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS loyalty_balances (
                owner UUID PRIMARY KEY,
                available BIGINT NOT NULL DEFAULT 0 CHECK (available >= 0),
                withdrawn BIGINT NOT NULL DEFAULT 0 CHECK (withdrawn >= 0),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS loyalty_withdrawals (
                id UUID PRIMARY KEY,
                owner UUID NOT NULL,
                order_number TEXT NOT NULL,
                amount BIGINT NOT NULL CHECK (amount > 0),
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_loyalty_withdrawals_owner
            ON loyalty_withdrawals(owner, created_at DESC)
            "#,
        )
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }
}

fn to_sql_amount(amount: u64) -> Result<i64, LedgerError> {
    i64::try_from(amount).map_err(|_| LedgerError::AmountOverflow)
}

fn from_sql_amount(amount: i64) -> Result<u64, LedgerError> {
    u64::try_from(amount)
        .map_err(|_| LedgerError::Storage(format!("negative amount in storage: {}", amount)))
}

fn order_from_row(row: &PgRow) -> Result<Order, LedgerError> {
    let status: String = row.try_get("status")?;
    let accrual: Option<i64> = row.try_get("accrual")?;

    Ok(Order {
        number: row.try_get("number")?,
        owner: row.try_get("owner")?,
        status: status.parse()?,
        accrual: accrual.map(from_sql_amount).transpose()?,
        submitted_at: row.try_get("uploaded_at")?,
    })
}

fn balance_from_row(owner: Uuid, row: &PgRow) -> Result<Balance, LedgerError> {
    Ok(Balance {
        owner,
        available: from_sql_amount(row.try_get("available")?)?,
        withdrawn: from_sql_amount(row.try_get("withdrawn")?)?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn withdrawal_from_row(row: &PgRow) -> Result<Withdrawal, LedgerError> {
    Ok(Withdrawal {
        id: row.try_get("id")?,
        owner: row.try_get("owner")?,
        order: row.try_get("order_number")?,
        amount: from_sql_amount(row.try_get("amount")?)?,
        created_at: row.try_get("created_at")?,
    })
}

const ORDER_COLUMNS: &str = "number, owner, status, accrual, uploaded_at";

#[async_trait::async_trait]
impl<T> LedgerAdapter for T
where
    T: PostgresLedgerAdapter + Send + Sync,
{
    async fn create_order(
        &self,
        owner: Uuid,
        number: &str,
    ) -> Result<OrderAdmission, LedgerError> {
        let pool = self.get_pool();

        let inserted = sqlx::query(
            r#"
            INSERT INTO loyalty_orders (number, owner, status, uploaded_at, updated_at)
            VALUES ($1, $2, 'pending', NOW(), NOW())
            ON CONFLICT (number) DO NOTHING
            "#,
        )
        .bind(number)
        .bind(owner)
        .execute(&pool)
        .await?;

        if inserted.rows_affected() == 1 {
            return Ok(OrderAdmission::Created);
        }

        // Rows are never deleted, so a conflicting row is still there.
        let existing: Uuid = sqlx::query_scalar("SELECT owner FROM loyalty_orders WHERE number = $1")
            .bind(number)
            .fetch_one(&pool)
            .await?;

        if existing == owner {
            Ok(OrderAdmission::AlreadyOwnedBySelf)
        } else {
            Err(LedgerError::OwnedByAnotherUser)
        }
    }

    async fn list_orders(&self, owner: Uuid) -> Result<Vec<Order>, LedgerError> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM loyalty_orders WHERE owner = $1 ORDER BY uploaded_at DESC, number DESC",
            ORDER_COLUMNS
        ))
        .bind(owner)
        .fetch_all(&self.get_pool())
        .await?;

        rows.iter().map(order_from_row).collect()
    }

    async fn get_order(&self, owner: Uuid, number: &str) -> Result<Order, LedgerError> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM loyalty_orders WHERE number = $1 AND owner = $2",
            ORDER_COLUMNS
        ))
        .bind(number)
        .bind(owner)
        .fetch_optional(&self.get_pool())
        .await?
        .ok_or_else(|| LedgerError::OrderNotFound(number.to_string()))?;

        order_from_row(&row)
    }

    async fn list_unresolved(&self) -> Result<Vec<Order>, LedgerError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {}
            FROM loyalty_orders
            WHERE status IN ('pending', 'in_progress')
            ORDER BY uploaded_at ASC, number ASC
            "#,
            ORDER_COLUMNS
        ))
        .fetch_all(&self.get_pool())
        .await?;

        rows.iter().map(order_from_row).collect()
    }

    async fn apply_resolution(
        &self,
        number: &str,
        status: OrderStatus,
        accrual: u64,
    ) -> Result<ResolutionOutcome, LedgerError> {
        let from: Vec<String> = status
            .predecessors()
            .iter()
            .map(|s| s.as_str().to_string())
            .collect();
        let stored_accrual = if status == OrderStatus::Resolved {
            Some(to_sql_amount(accrual)?)
        } else {
            None
        };

        let mut tx = self.get_pool().begin().await?;

        // The status guard makes a concurrent or repeated resolution match
        // zero rows once the first one commits.
        let owner: Option<Uuid> = sqlx::query_scalar(
            r#"
            UPDATE loyalty_orders
            SET status = $1, accrual = COALESCE($2, accrual), updated_at = NOW()
            WHERE number = $3 AND status = ANY($4)
            RETURNING owner
            "#,
        )
        .bind(status.as_str())
        .bind(stored_accrual)
        .bind(number)
        .bind(from)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(owner) = owner else {
            let exists: bool =
                sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM loyalty_orders WHERE number = $1)")
                    .bind(number)
                    .fetch_one(&mut *tx)
                    .await?;
            tx.rollback().await.ok();

            return if exists {
                Ok(ResolutionOutcome::Unchanged)
            } else {
                Err(LedgerError::OrderNotFound(number.to_string()))
            };
        };

        let credited = match stored_accrual {
            Some(amount) if amount > 0 => {
                sqlx::query(
                    r#"
                    INSERT INTO loyalty_balances (owner, available, withdrawn, updated_at)
                    VALUES ($1, $2, 0, NOW())
                    ON CONFLICT (owner) DO UPDATE
                    SET available = loyalty_balances.available + EXCLUDED.available,
                        updated_at = NOW()
                    "#,
                )
                .bind(owner)
                .bind(amount)
                .execute(&mut *tx)
                .await?;
                accrual
            }
            _ => 0,
        };

        tx.commit().await?;
        Ok(ResolutionOutcome::Applied { owner, credited })
    }

    async fn get_balance(&self, owner: Uuid) -> Result<Balance, LedgerError> {
        let pool = self.get_pool();

        sqlx::query("INSERT INTO loyalty_balances (owner) VALUES ($1) ON CONFLICT (owner) DO NOTHING")
            .bind(owner)
            .execute(&pool)
            .await?;

        let row = sqlx::query(
            "SELECT available, withdrawn, updated_at FROM loyalty_balances WHERE owner = $1",
        )
        .bind(owner)
        .fetch_one(&pool)
        .await?;

        balance_from_row(owner, &row)
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
        let sql_amount = to_sql_amount(amount)?;

        let mut tx = self.get_pool().begin().await?;

        sqlx::query("INSERT INTO loyalty_balances (owner) VALUES ($1) ON CONFLICT (owner) DO NOTHING")
            .bind(owner)
            .execute(&mut *tx)
            .await?;

        // Row lock: a concurrent withdrawal or credit for this owner waits
        // here and then sees the committed balance.
        let available: i64 = sqlx::query_scalar(
            "SELECT available FROM loyalty_balances WHERE owner = $1 FOR UPDATE",
        )
        .bind(owner)
        .fetch_one(&mut *tx)
        .await?;

        if available < sql_amount {
            tx.rollback().await.ok();
            return Err(LedgerError::InsufficientFunds);
        }

        let withdrawal = Withdrawal::new(owner, order, amount);

        sqlx::query(
            r#"
            INSERT INTO loyalty_withdrawals (id, owner, order_number, amount, created_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(withdrawal.id)
        .bind(withdrawal.owner)
        .bind(&withdrawal.order)
        .bind(sql_amount)
        .bind(withdrawal.created_at)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            UPDATE loyalty_balances
            SET available = available - $1, withdrawn = withdrawn + $1, updated_at = NOW()
            WHERE owner = $2
            "#,
        )
        .bind(sql_amount)
        .bind(owner)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(withdrawal)
    }

    async fn list_withdrawals(&self, owner: Uuid) -> Result<Vec<Withdrawal>, LedgerError> {
        let rows = sqlx::query(
            r#"
            SELECT id, owner, order_number, amount, created_at
            FROM loyalty_withdrawals
            WHERE owner = $1
            ORDER BY created_at DESC, id DESC
            "#,
        )
        .bind(owner)
        .fetch_all(&self.get_pool())
        .await?;

        rows.iter().map(withdrawal_from_row).collect()
    }
}
