use std::collections::HashMap;

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::Serialize;

use crate::error::CreditResult;
use crate::ledger::{CreditLedger, LedgerEntry};
use crate::payment::{PaymentTicket, TicketStore};

/// One slice of a cost/token pie, keyed by model id or `"id:name"` user key.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct PieSlice {
    pub cost: Decimal,
    pub tokens: u64,
}

/// One point in the daily payment series.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DailyAmount {
    pub date: String,
    pub amount: Decimal,
}

/// The seven aggregates `statistics(start, end)` produces.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Statistics {
    pub total_cost: Decimal,
    pub total_tokens: u64,
    pub total_requests: u64,
    pub cost_by_model: HashMap<String, PieSlice>,
    pub cost_by_user: HashMap<String, PieSlice>,
    pub payments_total: Decimal,
    pub payments_by_day: Vec<DailyAmount>,
}

/// Entries with valid usage and a model id fold into the model/user pies;
/// operator `set_absolute` overrides and pruning markers have neither and
/// are skipped so they don't distort per-model/per-user costs.
fn fold_ledger_entry(stats: &mut Statistics, entry: &LedgerEntry) {
    let Some(usage) = entry.detail.get("usage") else {
        return;
    };
    let Some(model_id) = entry
        .detail
        .get("api_params")
        .and_then(|p| p.get("model"))
        .and_then(|m| m.as_str())
    else {
        return;
    };

    let total_price: Decimal = usage
        .get("total_price")
        .and_then(|v| v.as_str())
        .and_then(|s| s.parse().ok())
        .unwrap_or_default();
    let total_tokens = usage.get("total_tokens").and_then(|v| v.as_u64()).unwrap_or(0);

    stats.total_cost += total_price;
    stats.total_tokens += total_tokens;
    stats.total_requests += 1;

    let model_slice = stats.cost_by_model.entry(model_id.to_string()).or_default();
    model_slice.cost += total_price;
    model_slice.tokens += total_tokens;

    // user key is "id:name"; this crate doesn't own user management (see
    // SPEC_FULL.md Non-goals), so the name half is the id until a real
    // user directory is wired in.
    let user_slice = stats
        .cost_by_user
        .entry(format!("{}:{}", entry.user_id, entry.user_id))
        .or_default();
    user_slice.cost += total_price;
    user_slice.tokens += total_tokens;
}

fn fold_payment(daily: &mut HashMap<NaiveDate, Decimal>, total: &mut Decimal, ticket: &PaymentTicket) {
    let is_success = ticket
        .detail
        .get("callback")
        .and_then(|c| c.get("trade_status"))
        .and_then(|s| s.as_str())
        == Some("TRADE_SUCCESS");
    if !is_success {
        return;
    }
    *total += ticket.amount;
    *daily.entry(ticket.created_at.date_naive()).or_default() += ticket.amount;
}

/// Stream ledger entries and payment tickets in `[start, end)` and fold
/// them into the seven reporting aggregates. Entries with no usage/model
/// (operator `set_absolute` overrides, pruning) are skipped rather than
/// distorting the per-model/per-user pies.
pub async fn statistics(
    ledger: &CreditLedger,
    tickets: &TicketStore,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> CreditResult<Statistics> {
    let mut stats = Statistics::default();

    for entry in ledger.range(start, end).await? {
        fold_ledger_entry(&mut stats, &entry);
    }

    let mut daily: HashMap<NaiveDate, Decimal> = HashMap::new();
    for ticket in tickets.range(start, end).await? {
        fold_payment(&mut daily, &mut stats.payments_total, &ticket);
    }

    let mut days: Vec<NaiveDate> = daily.keys().copied().collect();
    days.sort();
    stats.payments_by_day = days
        .into_iter()
        .map(|d| DailyAmount {
            date: d.format("%Y-%m-%d").to_string(),
            amount: daily[&d],
        })
        .collect();

    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn harness() -> (CreditLedger, TicketStore) {
        let pool = crate::db::connect(":memory:").await.expect("connect");
        (CreditLedger::new(pool.clone()), TicketStore::new(pool))
    }

    fn usage_detail(model: &str, cost: &str, tokens: u64) -> serde_json::Value {
        serde_json::json!({
            "usage": {"total_price": cost, "total_tokens": tokens},
            "api_params": {"model": model},
        })
    }

    #[tokio::test]
    async fn statistics_folds_ledger_entries_by_model_and_user() {
        let (ledger, tickets) = harness().await;
        let start = Utc::now() - chrono::Duration::hours(1);

        ledger
            .add_delta("alice", Decimal::new(-5, 3), usage_detail("gpt-4o", "0.005", 100))
            .await
            .unwrap();
        ledger
            .add_delta("alice", Decimal::new(-2, 3), usage_detail("gpt-4o", "0.002", 40))
            .await
            .unwrap();
        ledger
            .add_delta("bob", Decimal::new(-1, 2), usage_detail("claude-3", "0.01", 200))
            .await
            .unwrap();

        let end = Utc::now() + chrono::Duration::hours(1);
        let stats = statistics(&ledger, &tickets, start, end).await.unwrap();

        assert_eq!(stats.total_requests, 3);
        assert_eq!(stats.total_tokens, 340);
        assert_eq!(stats.cost_by_model["gpt-4o"].tokens, 140);
        assert_eq!(stats.cost_by_model["claude-3"].tokens, 200);
        assert_eq!(stats.cost_by_user["alice:alice"].tokens, 140);
    }

    #[tokio::test]
    async fn statistics_skips_entries_without_usage() {
        let (ledger, tickets) = harness().await;
        let start = Utc::now() - chrono::Duration::hours(1);
        ledger
            .add_delta("carol", Decimal::from(10), serde_json::json!({"desc": "admin override"}))
            .await
            .unwrap();
        let end = Utc::now() + chrono::Duration::hours(1);
        let stats = statistics(&ledger, &tickets, start, end).await.unwrap();
        assert_eq!(stats.total_requests, 0);
    }

    #[tokio::test]
    async fn statistics_sums_successful_payments_daily() {
        let (ledger, tickets) = harness().await;
        let start = Utc::now() - chrono::Duration::hours(1);

        tickets
            .insert("T1", "alice", Decimal::from(50), serde_json::json!({"callback": {"trade_status": "TRADE_SUCCESS"}}))
            .await
            .unwrap();
        tickets
            .insert("T2", "bob", Decimal::from(20), serde_json::json!({}))
            .await
            .unwrap();

        let end = Utc::now() + chrono::Duration::hours(1);
        let stats = statistics(&ledger, &tickets, start, end).await.unwrap();

        assert_eq!(stats.payments_total, Decimal::from(50));
        assert_eq!(stats.payments_by_day.len(), 1);
        assert_eq!(stats.payments_by_day[0].amount, Decimal::from(50));
    }
}
