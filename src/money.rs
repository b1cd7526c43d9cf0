use rust_decimal::Decimal;
use rust_decimal::prelude::FromPrimitive;
use std::str::FromStr;

/// One million, as a `Decimal` — unit prices in this crate are always
/// expressed per-million-tokens, matching the vendor billing convention.
pub fn per_million() -> Decimal {
    Decimal::from(1_000_000u32)
}

/// `amount * unit_price / 1_000_000`, never via floating point.
pub fn price_for_tokens(tokens: u64, unit_price_per_million: Decimal) -> Decimal {
    Decimal::from(tokens) * unit_price_per_million / per_million()
}

/// `flat_price / 1_000_000`, used for per-request and feature surcharges.
pub fn price_flat(unit_price_per_million: Decimal) -> Decimal {
    unit_price_per_million / per_million()
}

/// Parse a decimal from a loosely-typed JSON value (string or number),
/// defaulting to zero. Mirrors the tolerance of the source system's ORM,
/// which stores prices as `Numeric` but exchanges them as JSON.
pub fn decimal_from_json(value: Option<&serde_json::Value>) -> Decimal {
    match value {
        Some(serde_json::Value::String(s)) => Decimal::from_str(s).unwrap_or_default(),
        Some(serde_json::Value::Number(n)) => n
            .as_f64()
            .and_then(Decimal::from_f64)
            .unwrap_or_default(),
        _ => Decimal::default(),
    }
}

/// Render a `Decimal` for a SQLite `TEXT` money column.
///
/// `rust_decimal`'s own `sqlx` support only wires up `Encode`/`Decode` for
/// Postgres and MySQL (see the `cowprotocol-services` example pack repo,
/// which uses `rust_decimal` over a `postgres` pool) — SQLite has no
/// native decimal column type, so every money column round-trips through
/// `TEXT` and this pair of helpers instead of a derived `FromRow`/`bind`.
pub fn decimal_to_sql(value: Decimal) -> String {
    value.to_string()
}

/// Parse a `Decimal` back out of a SQLite `TEXT` money column, mapping a
/// malformed value to `sqlx::Error::Decode` so callers can propagate it
/// through the same `sqlx::Error` path as any other row-decode failure.
pub fn decimal_from_sql(raw: &str) -> sqlx::Result<Decimal> {
    Decimal::from_str(raw).map_err(|e| sqlx::Error::Decode(Box::new(e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prices_one_thousand_tokens_at_two_per_million() {
        let price = price_for_tokens(1000, Decimal::from(2));
        assert_eq!(price, Decimal::new(2, 3)); // 0.002
    }

    #[test]
    fn flat_price_divides_by_a_million() {
        let price = price_flat(Decimal::from(2000));
        assert_eq!(price, Decimal::new(2, 3)); // 0.002
    }

    #[test]
    fn decimal_from_json_accepts_strings_and_numbers() {
        assert_eq!(
            decimal_from_json(Some(&serde_json::json!("1.50"))),
            Decimal::new(150, 2)
        );
        assert_eq!(
            decimal_from_json(Some(&serde_json::json!(3))),
            Decimal::from(3)
        );
        assert_eq!(decimal_from_json(None), Decimal::default());
    }
}
