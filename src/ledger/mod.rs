pub mod scope;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use tracing::info;

use crate::error::CreditResult;
use crate::money::{decimal_from_sql, decimal_to_sql};

/// A user's current balance.
///
/// `credit` round-trips through the `credit` `TEXT` column by hand (see
/// `money::decimal_from_sql`/`decimal_to_sql`) rather than via a derived
/// `FromRow` — `rust_decimal` has no `sqlx::Decode`/`Encode` impl for
/// SQLite, only Postgres/MySQL.
#[derive(Debug, Clone, Serialize)]
pub struct Balance {
    pub user_id: String,
    pub credit: Decimal,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl sqlx::FromRow<'_, SqliteRow> for Balance {
    fn from_row(row: &SqliteRow) -> sqlx::Result<Self> {
        let credit: String = row.try_get("credit")?;
        Ok(Self {
            user_id: row.try_get("user_id")?,
            credit: decimal_from_sql(&credit)?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

/// One append-only ledger row.
#[derive(Debug, Clone, Serialize)]
pub struct LedgerEntry {
    pub id: String,
    pub user_id: String,
    pub credit: Decimal,
    pub detail: sqlx::types::Json<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

impl sqlx::FromRow<'_, SqliteRow> for LedgerEntry {
    fn from_row(row: &SqliteRow) -> sqlx::Result<Self> {
        let credit: String = row.try_get("credit")?;
        Ok(Self {
            id: row.try_get("id")?,
            user_id: row.try_get("user_id")?,
            credit: decimal_from_sql(&credit)?,
            detail: row.try_get("detail")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

/// The persistent credit ledger: one `credit` row per user, plus an
/// append-only `credit_log`. Every mutation goes through [`add_delta`] or
/// [`set_absolute`] so the two tables never drift apart.
#[derive(Clone)]
pub struct CreditLedger {
    pool: SqlitePool,
}

impl CreditLedger {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// The underlying pool, so callers that must share a transaction with
    /// another store (redemption, payment) can `pool.begin()` themselves
    /// and drive [`add_delta_in_tx`](Self::add_delta_in_tx) directly.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Create-or-read a user's balance, seeding new rows with the
    /// configured default credit.
    pub async fn ensure(&self, user_id: &str, default_credit: Decimal) -> CreditResult<Balance> {
        if let Some(balance) = self.get(user_id).await? {
            return Ok(balance);
        }

        let now = Utc::now();
        sqlx::query(
            "INSERT INTO credit (user_id, credit, created_at, updated_at) VALUES (?, ?, ?, ?)
             ON CONFLICT(user_id) DO NOTHING",
        )
        .bind(user_id)
        .bind(decimal_to_sql(default_credit))
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        // Another task may have inserted concurrently; re-read either way.
        self.get(user_id)
            .await?
            .ok_or_else(|| crate::error::CreditError::remote("balance row vanished after insert"))
    }

    pub async fn get(&self, user_id: &str) -> CreditResult<Option<Balance>> {
        let balance = sqlx::query_as::<_, Balance>(
            "SELECT user_id, credit, created_at, updated_at FROM credit WHERE user_id = ?",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(balance)
    }

    /// Apply a relative balance change (`credit = credit + delta`) inside a
    /// single transaction, alongside an append-only log entry. Expressed as
    /// a database-side update rather than read-modify-write so concurrent
    /// debits for the same user never clobber each other.
    pub async fn add_delta(
        &self,
        user_id: &str,
        delta: Decimal,
        detail: serde_json::Value,
    ) -> CreditResult<Balance> {
        let mut tx = self.pool.begin().await?;
        let balance = Self::add_delta_in_tx(&mut tx, user_id, delta, detail).await?;
        tx.commit().await?;

        info!(user_id = %user_id, delta = %delta, balance = %balance.credit, "ledger entry recorded");
        Ok(balance)
    }

    /// Same as [`add_delta`](Self::add_delta), but against a transaction the
    /// caller already holds open — so a redemption or payment webhook can
    /// stamp its own row and credit the ledger as one atomic commit instead
    /// of two separate writes.
    pub async fn add_delta_in_tx(
        tx: &mut Transaction<'_, Sqlite>,
        user_id: &str,
        delta: Decimal,
        detail: serde_json::Value,
    ) -> CreditResult<Balance> {
        let now = Utc::now();

        sqlx::query(
            "INSERT INTO credit (user_id, credit, created_at, updated_at) VALUES (?, 0, ?, ?)
             ON CONFLICT(user_id) DO UPDATE SET credit = credit + excluded.credit, updated_at = excluded.updated_at",
        )
        .bind(user_id)
        .bind(now)
        .bind(now)
        .execute(&mut **tx)
        .await?;

        sqlx::query("UPDATE credit SET credit = credit + ?, updated_at = ? WHERE user_id = ?")
            .bind(decimal_to_sql(delta))
            .bind(now)
            .bind(user_id)
            .execute(&mut **tx)
            .await?;

        let entry_id = uuid::Uuid::new_v4().to_string();
        sqlx::query(
            "INSERT INTO credit_log (id, user_id, credit, detail, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&entry_id)
        .bind(user_id)
        .bind(decimal_to_sql(delta))
        .bind(sqlx::types::Json(&detail))
        .bind(now)
        .execute(&mut **tx)
        .await?;

        let balance = sqlx::query_as::<_, Balance>(
            "SELECT user_id, credit, created_at, updated_at FROM credit WHERE user_id = ?",
        )
        .bind(user_id)
        .fetch_one(&mut **tx)
        .await?;

        Ok(balance)
    }

    /// Operator override: replace the balance outright, still logging the
    /// change as a ledger entry (the entry's `credit` field records the
    /// resulting delta, not the absolute value, so P1 conservation holds).
    pub async fn set_absolute(
        &self,
        user_id: &str,
        new_credit: Decimal,
        detail: serde_json::Value,
    ) -> CreditResult<Balance> {
        let current = self.ensure(user_id, Decimal::ZERO).await?;
        let delta = new_credit - current.credit;
        self.add_delta(user_id, delta, detail).await
    }

    pub async fn list(&self, user_id: &str, offset: i64, limit: i64) -> CreditResult<Vec<LedgerEntry>> {
        let rows = sqlx::query_as::<_, LedgerEntry>(
            "SELECT id, user_id, credit, detail, created_at FROM credit_log
             WHERE user_id = ? ORDER BY created_at DESC LIMIT ? OFFSET ?",
        )
        .bind(user_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn list_all(&self, offset: i64, limit: i64) -> CreditResult<Vec<LedgerEntry>> {
        let rows = sqlx::query_as::<_, LedgerEntry>(
            "SELECT id, user_id, credit, detail, created_at FROM credit_log
             ORDER BY created_at DESC LIMIT ? OFFSET ?",
        )
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn count(&self, user_id: &str) -> CreditResult<i64> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM credit_log WHERE user_id = ?")
                .bind(user_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    /// All entries in `[start, end)`, ascending, for reporting.
    pub async fn range(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> CreditResult<Vec<LedgerEntry>> {
        let rows = sqlx::query_as::<_, LedgerEntry>(
            "SELECT id, user_id, credit, detail, created_at FROM credit_log
             WHERE created_at >= ? AND created_at < ? ORDER BY created_at ASC",
        )
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Operator bulk-prune of entries older than `before`. Does not touch
    /// balances — pruning is an audit-log retention operation only.
    pub async fn prune(&self, before: DateTime<Utc>) -> CreditResult<u64> {
        let result = sqlx::query("DELETE FROM credit_log WHERE created_at < ?")
            .bind(before)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn ledger() -> CreditLedger {
        let pool = crate::db::connect(":memory:").await.expect("connect");
        CreditLedger::new(pool)
    }

    #[tokio::test]
    async fn ensure_seeds_default_credit_once() {
        let ledger = ledger().await;
        let first = ledger.ensure("alice", Decimal::from(10)).await.unwrap();
        assert_eq!(first.credit, Decimal::from(10));

        let second = ledger.ensure("alice", Decimal::from(999)).await.unwrap();
        assert_eq!(second.credit, Decimal::from(10));
    }

    #[tokio::test]
    async fn add_delta_is_relative_not_absolute() {
        let ledger = ledger().await;
        ledger.ensure("bob", Decimal::from(10)).await.unwrap();
        let after = ledger
            .add_delta("bob", Decimal::new(-5, 1), serde_json::json!({}))
            .await
            .unwrap();
        assert_eq!(after.credit, Decimal::new(95, 1));

        let entries = ledger.list("bob", 0, 10).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].credit, Decimal::new(-5, 1));
    }

    #[tokio::test]
    async fn balance_may_go_negative() {
        let ledger = ledger().await;
        ledger.ensure("carol", Decimal::ZERO).await.unwrap();
        let after = ledger
            .add_delta("carol", Decimal::from(-3), serde_json::json!({}))
            .await
            .unwrap();
        assert_eq!(after.credit, Decimal::from(-3));
    }

    #[tokio::test]
    async fn conservation_holds_across_many_deltas() {
        let ledger = ledger().await;
        ledger.ensure("dana", Decimal::from(100)).await.unwrap();
        for _ in 0..5 {
            ledger
                .add_delta("dana", Decimal::new(-1, 1), serde_json::json!({}))
                .await
                .unwrap();
        }
        let balance = ledger.get("dana").await.unwrap().unwrap();
        assert_eq!(balance.credit, Decimal::new(995, 1));

        let entries = ledger.list("dana", 0, 100).await.unwrap();
        let sum: Decimal = entries.iter().map(|e| e.credit).sum();
        assert_eq!(Decimal::from(100) + sum, balance.credit);
    }
}
