pub mod webhook;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde_json::{Map, Value};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use std::collections::HashMap;
use subtle::ConstantTimeEq;

use crate::config::{parse_amount_range, EzfpConfig};
use crate::error::CreditResult;
use crate::money::{decimal_from_sql, decimal_to_sql};

/// Infer the paying device from a user-agent string, in the same
/// substring-match order the gateway's checkout form uses to pick a QR
/// code vs. an in-app redirect.
pub fn device_from_user_agent(user_agent: &str) -> &'static str {
    let ua = user_agent.to_ascii_lowercase();
    if ua.contains("micromessenger") {
        "wechat"
    } else if ua.contains("qq") {
        "qq"
    } else if ua.contains("alipay") {
        "alipay"
    } else if ua.contains("android") || ua.contains("iphone") {
        "mobile"
    } else {
        "pc"
    }
}

fn field_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        _ => String::new(),
    }
}

/// Sign `payload` in place: sort every truthy field (excluding `sign` /
/// `sign_type`) as `key=value`, join with `&`, append the shared secret,
/// and MD5-hex the result into `sign`, with `sign_type` set to `"MD5"`.
pub fn sign(payload: &mut Map<String, Value>, secret: &str) {
    let mut parts: Vec<String> = payload
        .iter()
        .filter(|(k, _)| k.as_str() != "sign" && k.as_str() != "sign_type")
        .filter_map(|(k, v)| {
            let s = field_to_string(v);
            if s.is_empty() { None } else { Some(format!("{k}={s}")) }
        })
        .collect();
    parts.sort();

    let mut plain = parts.join("&");
    plain.push_str(secret);

    let digest = md5::compute(plain.as_bytes());
    payload.insert("sign".into(), Value::String(format!("{digest:x}")));
    payload.insert("sign_type".into(), Value::String("MD5".into()));
}

/// Verify a callback payload: the merchant id must match, and re-signing a
/// copy (after stripping the existing `sign`/`sign_type`) must reproduce
/// the same signature. Comparison is constant-time since this runs over
/// attacker-controlled HTTP input.
pub fn verify(payload: &Value, config: &EzfpConfig) -> bool {
    let Some(obj) = payload.as_object() else {
        return false;
    };

    if obj.get("pid").map(field_to_string).as_deref() != config.pid.as_deref() {
        return false;
    }

    let Some(given_sign) = obj.get("sign").and_then(|v| v.as_str()) else {
        return false;
    };
    let given_sign_type = obj.get("sign_type").and_then(|v| v.as_str()).unwrap_or("");

    let mut copy = obj.clone();
    sign(&mut copy, config.key.as_deref().unwrap_or(""));

    let expected_sign = copy.get("sign").and_then(|v| v.as_str()).unwrap_or("");
    let expected_sign_type = copy.get("sign_type").and_then(|v| v.as_str()).unwrap_or("");

    bool::from(given_sign.as_bytes().ct_eq(expected_sign.as_bytes()))
        && given_sign_type == expected_sign_type
}

/// Check an amount against the configured amount-control policy. `None`
/// (no policy configured) always accepts.
pub fn check_amount(amount: Decimal, control: Option<&str>) -> bool {
    let Some(control) = control else {
        return true;
    };

    control.split(',').any(|segment| match parse_amount_range(segment) {
        Ok((lo, Some(hi))) => amount >= lo && amount <= hi,
        Ok((exact, None)) => amount == exact,
        Err(_) => false,
    })
}

/// Outcome of a checkout attempt.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct TradeResponse {
    pub code: i64,
    #[serde(default)]
    pub msg: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Thin client for the EZFP-style payment gateway: builds and signs a
/// checkout request, POSTs it form-encoded, and returns whatever JSON the
/// gateway replies with.
pub struct EzfpClient {
    http: reqwest::Client,
    config: EzfpConfig,
}

impl EzfpClient {
    pub fn new(http: reqwest::Client, config: EzfpConfig) -> Self {
        Self { http, config }
    }

    pub fn config(&self) -> &EzfpConfig {
        &self.config
    }

    /// Start a checkout. Rejects out-of-policy amounts before making any
    /// network call.
    pub async fn create_trade(
        &self,
        pay_type: &str,
        out_trade_no: &str,
        amount: Decimal,
        client_ip: &str,
        user_agent: &str,
        product_name: &str,
    ) -> TradeResponse {
        if !check_amount(amount, self.config.amount_control.as_deref()) {
            return TradeResponse {
                code: -1,
                msg: Some("amount not allowed".into()),
                extra: Map::new(),
            };
        }

        let Some(endpoint) = self.config.endpoint.as_deref() else {
            return TradeResponse {
                code: -1,
                msg: Some("payment gateway not configured".into()),
                extra: Map::new(),
            };
        };

        let callback_host = self.config.callback_host.clone().unwrap_or_default();
        let device = device_from_user_agent(user_agent);

        let mut payload = Map::new();
        payload.insert("pid".into(), Value::String(self.config.pid.clone().unwrap_or_default()));
        payload.insert("type".into(), Value::String(pay_type.into()));
        payload.insert("out_trade_no".into(), Value::String(out_trade_no.into()));
        payload.insert("notify_url".into(), Value::String(format!("{callback_host}/credit/callback")));
        payload.insert("return_url".into(), Value::String(format!("{callback_host}/credit/callback/redirect")));
        payload.insert("name".into(), Value::String(product_name.into()));
        payload.insert("money".into(), Value::String(format!("{:.2}", amount)));
        payload.insert("clientip".into(), Value::String(client_ip.into()));
        payload.insert("device".into(), Value::String(device.into()));

        sign(&mut payload, self.config.key.as_deref().unwrap_or(""));

        let form: HashMap<String, String> = payload
            .into_iter()
            .map(|(k, v)| (k, field_to_string(&v)))
            .collect();

        let url = format!("{endpoint}/mapi.php");
        match self.http.post(&url).form(&form).send().await {
            Ok(resp) => match resp.json::<TradeResponse>().await {
                Ok(parsed) => parsed,
                Err(e) => TradeResponse {
                    code: -1,
                    msg: Some(e.to_string()),
                    extra: Map::new(),
                },
            },
            Err(e) => TradeResponse {
                code: -1,
                msg: Some(e.to_string()),
                extra: Map::new(),
            },
        }
    }
}

/// A checkout ticket: created when the user starts a payment, sealed once
/// the gateway's callback has been processed.
///
/// `amount` is stored as `TEXT` and converted by hand at the row boundary —
/// `rust_decimal` has no SQLite `sqlx` impl, only Postgres/MySQL.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PaymentTicket {
    pub id: String,
    pub user_id: String,
    pub amount: Decimal,
    pub detail: sqlx::types::Json<Value>,
    pub created_at: DateTime<Utc>,
}

impl sqlx::FromRow<'_, SqliteRow> for PaymentTicket {
    fn from_row(row: &SqliteRow) -> sqlx::Result<Self> {
        let amount: String = row.try_get("amount")?;
        Ok(Self {
            id: row.try_get("id")?,
            user_id: row.try_get("user_id")?,
            amount: decimal_from_sql(&amount)?,
            detail: row.try_get("detail")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

impl PaymentTicket {
    /// A ticket is sealed once its detail blob records a processed callback.
    pub fn is_completed(&self) -> bool {
        self.detail
            .get("callback")
            .map(|c| !c.is_null())
            .unwrap_or(false)
    }
}

/// Generate a monotonic-looking external trade number:
/// `YYYYMMDDhhmmss.<uuid-hex>`.
pub fn generate_trade_no(now: DateTime<Utc>) -> String {
    format!("{}.{}", now.format("%Y%m%d%H%M%S"), uuid::Uuid::new_v4().simple())
}

/// Persistence for [`PaymentTicket`] rows.
#[derive(Clone)]
pub struct TicketStore {
    pool: SqlitePool,
}

impl TicketStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// The underlying pool, so the webhook handler can open one
    /// transaction shared with [`CreditLedger::add_delta_in_tx`].
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn insert(&self, id: &str, user_id: &str, amount: Decimal, detail: Value) -> CreditResult<PaymentTicket> {
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO trade_ticket (id, user_id, amount, detail, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(id)
        .bind(user_id)
        .bind(decimal_to_sql(amount))
        .bind(sqlx::types::Json(&detail))
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(PaymentTicket {
            id: id.to_string(),
            user_id: user_id.to_string(),
            amount,
            detail: sqlx::types::Json(detail),
            created_at: now,
        })
    }

    pub async fn get(&self, id: &str) -> CreditResult<Option<PaymentTicket>> {
        let ticket = sqlx::query_as::<_, PaymentTicket>(
            "SELECT id, user_id, amount, detail, created_at FROM trade_ticket WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(ticket)
    }

    pub async fn set_detail(&self, id: &str, detail: Value) -> CreditResult<()> {
        let mut tx = self.pool.begin().await?;
        Self::set_detail_in_tx(&mut tx, id, detail).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Same as [`set_detail`](Self::set_detail), but against a transaction
    /// the caller already holds open — so the webhook handler can seal the
    /// ticket and credit the ledger as one atomic commit.
    pub async fn set_detail_in_tx(
        tx: &mut Transaction<'_, Sqlite>,
        id: &str,
        detail: Value,
    ) -> CreditResult<()> {
        sqlx::query("UPDATE trade_ticket SET detail = ? WHERE id = ?")
            .bind(sqlx::types::Json(&detail))
            .bind(id)
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    /// All tickets created in `[start, end)`, ascending, for reporting.
    pub async fn range(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> CreditResult<Vec<PaymentTicket>> {
        let rows = sqlx::query_as::<_, PaymentTicket>(
            "SELECT id, user_id, amount, detail, created_at FROM trade_ticket
             WHERE created_at >= ? AND created_at < ? ORDER BY created_at ASC",
        )
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

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

    #[test]
    fn device_inference_order() {
        assert_eq!(device_from_user_agent("MicroMessenger/8"), "wechat");
        assert_eq!(device_from_user_agent("QQ/8"), "qq");
        assert_eq!(device_from_user_agent("AlipayClient"), "alipay");
        assert_eq!(device_from_user_agent("Mozilla Android 10"), "mobile");
        assert_eq!(device_from_user_agent("iPhone OS 17"), "mobile");
        assert_eq!(device_from_user_agent("Mozilla Windows NT"), "pc");
    }

    #[test]
    fn sign_then_verify_round_trips() {
        let cfg = config();
        let mut payload = Map::new();
        payload.insert("pid".into(), Value::String("1000".into()));
        payload.insert("trade_status".into(), Value::String("TRADE_SUCCESS".into()));
        payload.insert("out_trade_no".into(), Value::String("T1".into()));
        sign(&mut payload, cfg.key.as_deref().unwrap());

        assert!(verify(&Value::Object(payload), &cfg));
    }

    #[test]
    fn mutated_field_invalidates_signature() {
        let cfg = config();
        let mut payload = Map::new();
        payload.insert("pid".into(), Value::String("1000".into()));
        payload.insert("trade_status".into(), Value::String("TRADE_SUCCESS".into()));
        payload.insert("out_trade_no".into(), Value::String("T1".into()));
        sign(&mut payload, cfg.key.as_deref().unwrap());

        payload.insert("out_trade_no".into(), Value::String("T2".into()));
        assert!(!verify(&Value::Object(payload), &cfg));
    }

    #[test]
    fn wrong_pid_fails_verification() {
        let cfg = config();
        let mut payload = Map::new();
        payload.insert("pid".into(), Value::String("9999".into()));
        sign(&mut payload, cfg.key.as_deref().unwrap());
        assert!(!verify(&Value::Object(payload), &cfg));
    }

    #[test]
    fn amount_control_ranges_and_exact_values() {
        assert!(check_amount(Decimal::from(250), Some("1-500,1000")));
        assert!(check_amount(Decimal::from(1000), Some("1-500,1000")));
        assert!(!check_amount(Decimal::from(501), Some("1-500,1000")));
        assert!(check_amount(Decimal::from(123456), None));
    }
}
