use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::error::{CreditError, CreditResult};
use crate::ledger::CreditLedger;
use crate::money::{decimal_from_sql, decimal_to_sql};

/// A bulk-issued one-shot top-up token. Inert once `received_at` is set,
/// whether by redemption or (checked at redeem time, not stored) expiry.
///
/// `amount` is stored as `TEXT` and converted by hand at the row boundary —
/// `rust_decimal` has no SQLite `sqlx` impl, only Postgres/MySQL.
#[derive(Debug, Clone, serde::Serialize)]
pub struct RedemptionCode {
    pub code: String,
    pub purpose: String,
    pub amount: Decimal,
    pub created_at: DateTime<Utc>,
    pub expired_at: Option<DateTime<Utc>>,
    pub user_id: Option<String>,
    pub received_at: Option<DateTime<Utc>>,
}

impl sqlx::FromRow<'_, SqliteRow> for RedemptionCode {
    fn from_row(row: &SqliteRow) -> sqlx::Result<Self> {
        let amount: String = row.try_get("amount")?;
        Ok(Self {
            code: row.try_get("code")?,
            purpose: row.try_get("purpose")?,
            amount: decimal_from_sql(&amount)?,
            created_at: row.try_get("created_at")?,
            expired_at: row.try_get("expired_at")?,
            user_id: row.try_get("user_id")?,
            received_at: row.try_get("received_at")?,
        })
    }
}

impl RedemptionCode {
    pub fn is_received(&self) -> bool {
        self.received_at.is_some()
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expired_at.is_some_and(|t| t <= now)
    }
}

const MAX_ISSUE_COUNT: u32 = 1000;

/// Generate one code: two concatenated uuid hex forms, 64 hex characters.
/// Long enough that a guessing attack against the bearer token is
/// infeasible, unlike the original's shorter source of entropy.
fn generate_code() -> String {
    format!(
        "{}{}",
        uuid::Uuid::new_v4().simple(),
        uuid::Uuid::new_v4().simple()
    )
}

/// Persistence and business logic for redemption codes. Redemption
/// (`redeem`) is the only path that also touches the [`CreditLedger`];
/// issuance and admin mutation never do.
#[derive(Clone)]
pub struct RedemptionCodes {
    pool: SqlitePool,
}

impl RedemptionCodes {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Bulk-issue `count` codes sharing one `purpose` and `amount`.
    pub async fn issue(
        &self,
        purpose: &str,
        count: u32,
        amount: Decimal,
        expired_at: Option<DateTime<Utc>>,
    ) -> CreditResult<Vec<RedemptionCode>> {
        if !(1..=MAX_ISSUE_COUNT).contains(&count) {
            return Err(CreditError::input(format!(
                "count must be between 1 and {MAX_ISSUE_COUNT}"
            )));
        }
        if amount <= Decimal::ZERO {
            return Err(CreditError::input("amount must be > 0"));
        }
        let now = Utc::now();
        if let Some(expiry) = expired_at {
            if expiry <= now {
                return Err(CreditError::input("expired_at must be in the future"));
            }
        }

        let mut tx = self.pool.begin().await?;
        let mut codes = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let code = RedemptionCode {
                code: generate_code(),
                purpose: purpose.to_string(),
                amount,
                created_at: now,
                expired_at,
                user_id: None,
                received_at: None,
            };
            sqlx::query(
                "INSERT INTO redemption_code (code, purpose, amount, created_at, expired_at, user_id, received_at)
                 VALUES (?, ?, ?, ?, ?, NULL, NULL)",
            )
            .bind(&code.code)
            .bind(&code.purpose)
            .bind(decimal_to_sql(code.amount))
            .bind(code.created_at)
            .bind(code.expired_at)
            .execute(&mut *tx)
            .await?;
            codes.push(code);
        }
        tx.commit().await?;
        Ok(codes)
    }

    pub async fn get(&self, code: &str) -> CreditResult<Option<RedemptionCode>> {
        let row = sqlx::query_as::<_, RedemptionCode>(
            "SELECT code, purpose, amount, created_at, expired_at, user_id, received_at
             FROM redemption_code WHERE code = ?",
        )
        .bind(code)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn list(&self, offset: i64, limit: i64) -> CreditResult<Vec<RedemptionCode>> {
        let rows = sqlx::query_as::<_, RedemptionCode>(
            "SELECT code, purpose, amount, created_at, expired_at, user_id, received_at
             FROM redemption_code ORDER BY created_at DESC LIMIT ? OFFSET ?",
        )
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Codes whose `purpose` or `code` contains `keyword`, for the export
    /// endpoint. Empty keyword returns every code.
    pub async fn search(&self, keyword: &str) -> CreditResult<Vec<RedemptionCode>> {
        let pattern = format!("%{keyword}%");
        let rows = sqlx::query_as::<_, RedemptionCode>(
            "SELECT code, purpose, amount, created_at, expired_at, user_id, received_at
             FROM redemption_code WHERE purpose LIKE ? OR code LIKE ?
             ORDER BY created_at DESC",
        )
        .bind(&pattern)
        .bind(&pattern)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Redeem a code for `user_id`: atomically stamp it received and
    /// credit the user's balance by `amount * exchange_ratio`. Rejects a
    /// missing, already-received, or expired code before touching the
    /// ledger.
    pub async fn redeem(
        &self,
        ledger: &CreditLedger,
        exchange_ratio: Decimal,
        code: &str,
        user_id: &str,
    ) -> CreditResult<Decimal> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let existing = sqlx::query_as::<_, RedemptionCode>(
            "SELECT code, purpose, amount, created_at, expired_at, user_id, received_at
             FROM redemption_code WHERE code = ?",
        )
        .bind(code)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(existing) = existing else {
            return Err(CreditError::not_found("redemption code"));
        };
        if existing.is_received() {
            return Err(CreditError::input("redemption code already received"));
        }
        if existing.is_expired(now) {
            return Err(CreditError::input("redemption code expired"));
        }

        let updated = sqlx::query(
            "UPDATE redemption_code SET user_id = ?, received_at = ?
             WHERE code = ? AND received_at IS NULL",
        )
        .bind(user_id)
        .bind(now)
        .bind(code)
        .execute(&mut *tx)
        .await?;
        if updated.rows_affected() == 0 {
            return Err(CreditError::input("redemption code already received"));
        }

        let amount = existing.amount * exchange_ratio;
        let balance = CreditLedger::add_delta_in_tx(
            &mut tx,
            user_id,
            amount,
            serde_json::json!({"desc": "redemption code", "code": code}),
        )
        .await?;

        tx.commit().await?;
        Ok(balance.credit)
    }

    /// Admin-only: change `amount`/`expired_at`/`purpose` on an
    /// unreceived code.
    pub async fn update(
        &self,
        code: &str,
        purpose: Option<&str>,
        amount: Option<Decimal>,
        expired_at: Option<Option<DateTime<Utc>>>,
    ) -> CreditResult<RedemptionCode> {
        let existing = self
            .get(code)
            .await?
            .ok_or_else(|| CreditError::not_found("redemption code"))?;
        if existing.is_received() {
            return Err(CreditError::input("cannot update a received redemption code"));
        }

        let new_purpose = purpose.unwrap_or(&existing.purpose);
        let new_amount = amount.unwrap_or(existing.amount);
        let new_expiry = expired_at.unwrap_or(existing.expired_at);

        sqlx::query(
            "UPDATE redemption_code SET purpose = ?, amount = ?, expired_at = ? WHERE code = ?",
        )
        .bind(new_purpose)
        .bind(decimal_to_sql(new_amount))
        .bind(new_expiry)
        .bind(code)
        .execute(&self.pool)
        .await?;

        self.get(code)
            .await?
            .ok_or_else(|| CreditError::not_found("redemption code"))
    }

    /// Admin-only: delete an unreceived code.
    pub async fn delete(&self, code: &str) -> CreditResult<()> {
        let existing = self
            .get(code)
            .await?
            .ok_or_else(|| CreditError::not_found("redemption code"))?;
        if existing.is_received() {
            return Err(CreditError::input("cannot delete a received redemption code"));
        }
        sqlx::query("DELETE FROM redemption_code WHERE code = ?")
            .bind(code)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn setup() -> (RedemptionCodes, CreditLedger) {
        let pool = crate::db::connect(":memory:").await.expect("connect");
        (RedemptionCodes::new(pool.clone()), CreditLedger::new(pool))
    }

    #[tokio::test]
    async fn issue_generates_distinct_codes_of_64_hex_chars() {
        let (codes, _ledger) = setup().await;
        let issued = codes.issue("promo", 2, Decimal::from(3), None).await.unwrap();
        assert_eq!(issued.len(), 2);
        assert_ne!(issued[0].code, issued[1].code);
        assert_eq!(issued[0].code.len(), 64);
        assert!(issued[0].code.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[tokio::test]
    async fn issue_rejects_bad_count_or_amount() {
        let (codes, _ledger) = setup().await;
        assert!(codes.issue("promo", 0, Decimal::from(1), None).await.is_err());
        assert!(codes.issue("promo", 1001, Decimal::from(1), None).await.is_err());
        assert!(codes.issue("promo", 1, Decimal::ZERO, None).await.is_err());
    }

    #[tokio::test]
    async fn redeem_credits_user_and_stamps_received() {
        let (codes, ledger) = setup().await;
        let issued = codes.issue("promo", 1, Decimal::from(30), None).await.unwrap();
        let code = &issued[0].code;

        let balance = codes.redeem(&ledger, Decimal::ONE, code, "u1").await.unwrap();
        assert_eq!(balance, Decimal::from(30));

        let row = codes.get(code).await.unwrap().unwrap();
        assert!(row.is_received());
        assert_eq!(row.user_id.as_deref(), Some("u1"));
    }

    #[tokio::test]
    async fn second_redeem_of_same_code_fails() {
        let (codes, ledger) = setup().await;
        let issued = codes.issue("promo", 1, Decimal::from(30), None).await.unwrap();
        let code = &issued[0].code;

        codes.redeem(&ledger, Decimal::ONE, code, "u1").await.unwrap();
        let second = codes.redeem(&ledger, Decimal::ONE, code, "u2").await;
        assert!(second.is_err());
    }

    #[tokio::test]
    async fn redeem_rejects_missing_code() {
        let (codes, ledger) = setup().await;
        let result = codes.redeem(&ledger, Decimal::ONE, "nonexistent", "u1").await;
        assert!(matches!(result, Err(CreditError::NotFound(_))));
    }

    #[tokio::test]
    async fn redeem_rejects_expired_code() {
        let (codes, ledger) = setup().await;
        let issued = codes.issue("promo", 1, Decimal::from(10), None).await.unwrap();
        // issue() itself refuses a past expired_at, so backdate via update
        // (admin-only, no future-date validation) to exercise the expiry
        // check inside redeem().
        let past = Utc::now() - chrono::Duration::hours(1);
        codes
            .update(&issued[0].code, None, None, Some(Some(past)))
            .await
            .unwrap();
        let result = codes.redeem(&ledger, Decimal::ONE, &issued[0].code, "u1").await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn update_rejects_received_code() {
        let (codes, ledger) = setup().await;
        let issued = codes.issue("promo", 1, Decimal::from(10), None).await.unwrap();
        codes.redeem(&ledger, Decimal::ONE, &issued[0].code, "u1").await.unwrap();
        let result = codes.update(&issued[0].code, None, Some(Decimal::from(99)), None).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn delete_removes_unreceived_code() {
        let (codes, _ledger) = setup().await;
        let issued = codes.issue("promo", 1, Decimal::from(10), None).await.unwrap();
        codes.delete(&issued[0].code).await.unwrap();
        assert!(codes.get(&issued[0].code).await.unwrap().is_none());
    }
}
