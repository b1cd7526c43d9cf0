use rust_decimal::Decimal;

use crate::config::CreditConfig;
use crate::error::{CreditError, CreditResult};
use crate::ledger::CreditLedger;
use crate::pricing::UnitPrices;

/// Gate a request before it reaches the provider. A model/feature
/// combination that is entirely free always passes; otherwise the user
/// must have a positive balance at least as large as the model's
/// configured minimum credit.
pub async fn check(
    config: &CreditConfig,
    ledger: &CreditLedger,
    user_id: &str,
    prices: UnitPrices,
    features: &[String],
) -> CreditResult<()> {
    let feature_cost = crate::pricing::feature_price(config, features);
    let is_free = prices.is_free() && feature_cost <= Decimal::ZERO;
    if is_free {
        return Ok(());
    }

    let balance = ledger.ensure(user_id, config.credit.default_credit).await?;

    if balance.credit <= Decimal::ZERO || balance.credit < prices.minimum_credit {
        return Err(CreditError::InsufficientCredit {
            message: config.credit.no_credit_message.clone(),
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn ledger() -> CreditLedger {
        let pool = crate::db::connect(":memory:").await.expect("connect");
        CreditLedger::new(pool)
    }

    fn free_prices() -> UnitPrices {
        UnitPrices {
            prompt: Decimal::ZERO,
            completion: Decimal::ZERO,
            request: Decimal::ZERO,
            minimum_credit: Decimal::ZERO,
        }
    }

    fn paid_prices(minimum: Decimal) -> UnitPrices {
        UnitPrices {
            prompt: Decimal::from(1),
            completion: Decimal::from(1),
            request: Decimal::ZERO,
            minimum_credit: minimum,
        }
    }

    #[tokio::test]
    async fn free_model_always_passes() {
        let cfg = CreditConfig::default();
        let ledger = ledger().await;
        let result = check(&cfg, &ledger, "anyone", free_prices(), &[]).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn zero_balance_is_refused() {
        let cfg = CreditConfig::default();
        let ledger = ledger().await;
        let result = check(&cfg, &ledger, "broke", paid_prices(Decimal::ZERO), &[]).await;
        assert!(matches!(result, Err(CreditError::InsufficientCredit { .. })));
    }

    #[tokio::test]
    async fn balance_below_minimum_credit_is_refused() {
        let cfg = CreditConfig::default();
        let ledger = ledger().await;
        ledger
            .add_delta("close", Decimal::new(5, 1), serde_json::json!({}))
            .await
            .unwrap();
        let result = check(&cfg, &ledger, "close", paid_prices(Decimal::from(1)), &[]).await;
        assert!(matches!(result, Err(CreditError::InsufficientCredit { .. })));
    }

    #[tokio::test]
    async fn sufficient_balance_passes() {
        let cfg = CreditConfig::default();
        let ledger = ledger().await;
        ledger
            .add_delta("rich", Decimal::from(100), serde_json::json!({}))
            .await
            .unwrap();
        let result = check(&cfg, &ledger, "rich", paid_prices(Decimal::from(1)), &[]).await;
        assert!(result.is_ok());
    }
}
