use rust_decimal::Decimal;
use serde_json::Value;

use super::{verify, EzfpConfig, TicketStore};
use crate::error::CreditResult;
use crate::ledger::CreditLedger;

/// Plain-text responses this handler can return. These strings are part
/// of the external contract with the payment provider (it retries on any
/// non-200, not on body content), so they are returned as-is rather than
/// mapped to HTTP error statuses — see `SignatureInvalid`/`NotFound`
/// handling in `CreditError`.
pub const INVALID_SIGNATURE: &str = "invalid signature";
pub const NO_TICKET_FOUND: &str = "no ticket fount";
pub const SUCCESS: &str = "success";

/// Process one payment callback. Verifies the signature, looks up the
/// ticket, and credits the user's balance exactly once even if the same
/// callback is replayed (idempotent on `detail.callback` being already
/// set).
pub async fn process_callback(
    config: &EzfpConfig,
    tickets: &TicketStore,
    ledger: &CreditLedger,
    exchange_ratio: Decimal,
    callback: &Value,
) -> CreditResult<&'static str> {
    if !verify(callback, config) {
        return Ok(INVALID_SIGNATURE);
    }

    let trade_status = callback.get("trade_status").and_then(|v| v.as_str()).unwrap_or("");
    if trade_status != "TRADE_SUCCESS" {
        return Ok(SUCCESS);
    }

    let Some(out_trade_no) = callback.get("out_trade_no").and_then(|v| v.as_str()) else {
        return Ok(NO_TICKET_FOUND);
    };

    let Some(ticket) = tickets.get(out_trade_no).await? else {
        return Ok(NO_TICKET_FOUND);
    };

    if ticket.is_completed() {
        return Ok(SUCCESS);
    }

    let mut detail = ticket.detail.0.clone();
    match &mut detail {
        Value::Object(map) => {
            map.insert("callback".to_string(), callback.clone());
        }
        _ => detail = serde_json::json!({"callback": callback}),
    }

    // Seal the ticket and credit the ledger in one transaction: a crash
    // between the two would otherwise let a retried callback double-credit
    // (detail already sealed, ledger untouched) or lose the credit entirely
    // (ledger untouched, ticket visibly still open).
    let mut tx = tickets.pool().begin().await?;
    super::TicketStore::set_detail_in_tx(&mut tx, &ticket.id, detail).await?;
    CreditLedger::add_delta_in_tx(
        &mut tx,
        &ticket.user_id,
        ticket.amount * exchange_ratio,
        serde_json::json!({"desc": "payment success", "api_path": "/credit/callback"}),
    )
    .await?;
    tx.commit().await?;

    Ok(SUCCESS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payment::sign;
    use serde_json::Map;

    fn config() -> EzfpConfig {
        EzfpConfig {
            endpoint: Some("https://pay.example.com".into()),
            pid: Some("1000".into()),
            key: Some("sharedsecret".into()),
            pay_priority: "qrcode".into(),
            callback_host: Some("https://app.example.com".into()),
            amount_control: None,
        }
    }

    async fn harness() -> (TicketStore, CreditLedger) {
        let pool = crate::db::connect(":memory:").await.expect("connect");
        (TicketStore::new(pool.clone()), CreditLedger::new(pool))
    }

    fn signed_callback(cfg: &EzfpConfig, out_trade_no: &str, amount: &str) -> Value {
        let mut payload = Map::new();
        payload.insert("pid".into(), Value::String(cfg.pid.clone().unwrap()));
        payload.insert("trade_status".into(), Value::String("TRADE_SUCCESS".into()));
        payload.insert("out_trade_no".into(), Value::String(out_trade_no.into()));
        payload.insert("money".into(), Value::String(amount.into()));
        sign(&mut payload, cfg.key.as_deref().unwrap());
        Value::Object(payload)
    }

    #[tokio::test]
    async fn bad_signature_is_rejected_and_does_nothing() {
        let cfg = config();
        let (tickets, ledger) = harness().await;
        tickets
            .insert("T1", "alice", Decimal::from(5), serde_json::json!({}))
            .await
            .unwrap();

        let mut callback = signed_callback(&cfg, "T1", "5");
        callback["out_trade_no"] = Value::String("T2".into()); // mutate after signing

        let result = process_callback(&cfg, &tickets, &ledger, Decimal::from(10), &callback)
            .await
            .unwrap();
        assert_eq!(result, INVALID_SIGNATURE);
        assert!(ledger.get("alice").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn missing_ticket_reports_typo_string() {
        let cfg = config();
        let (tickets, ledger) = harness().await;
        let callback = signed_callback(&cfg, "GHOST", "5");
        let result = process_callback(&cfg, &tickets, &ledger, Decimal::from(10), &callback)
            .await
            .unwrap();
        assert_eq!(result, NO_TICKET_FOUND);
    }

    #[tokio::test]
    async fn successful_callback_credits_once() {
        let cfg = config();
        let (tickets, ledger) = harness().await;
        tickets
            .insert("T1", "alice", Decimal::from(5), serde_json::json!({}))
            .await
            .unwrap();
        let callback = signed_callback(&cfg, "T1", "5");

        let first = process_callback(&cfg, &tickets, &ledger, Decimal::from(10), &callback)
            .await
            .unwrap();
        assert_eq!(first, SUCCESS);
        assert_eq!(ledger.get("alice").await.unwrap().unwrap().credit, Decimal::from(50));

        // replay: same callback again must not double-credit
        let second = process_callback(&cfg, &tickets, &ledger, Decimal::from(10), &callback)
            .await
            .unwrap();
        assert_eq!(second, SUCCESS);
        assert_eq!(ledger.get("alice").await.unwrap().unwrap().credit, Decimal::from(50));
    }

    #[tokio::test]
    async fn non_success_trade_status_is_acknowledged_without_crediting() {
        let cfg = config();
        let (tickets, ledger) = harness().await;
        tickets
            .insert("T1", "alice", Decimal::from(5), serde_json::json!({}))
            .await
            .unwrap();

        let mut payload = Map::new();
        payload.insert("pid".into(), Value::String(cfg.pid.clone().unwrap()));
        payload.insert("trade_status".into(), Value::String("TRADE_PENDING".into()));
        payload.insert("out_trade_no".into(), Value::String("T1".into()));
        sign(&mut payload, cfg.key.as_deref().unwrap());

        let result = process_callback(&cfg, &tickets, &ledger, Decimal::from(10), &Value::Object(payload))
            .await
            .unwrap();
        assert_eq!(result, SUCCESS);
        assert!(ledger.get("alice").await.unwrap().is_none());
    }
}
