//! Lenient deserializers for venue payloads.
//!
//! The venue sends numeric fields as JSON numbers, numeric strings, empty
//! strings or null depending on endpoint and order state.

use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer};
use std::str::FromStr;

/// Deserialize a number, numeric string, empty string or null into a `Decimal`.
/// Empty and null become zero.
pub fn flexible_decimal<'de, D: Deserializer<'de>>(d: D) -> Result<Decimal, D::Error> {
    let value = serde_json::Value::deserialize(d)?;
    match value {
        serde_json::Value::Null => Ok(Decimal::ZERO),
        serde_json::Value::Number(n) => {
            let text = n.to_string();
            Decimal::from_str(&text)
                .or_else(|_| Decimal::from_scientific(&text))
                .map_err(serde::de::Error::custom)
        }
        serde_json::Value::String(s) if s.trim().is_empty() => Ok(Decimal::ZERO),
        serde_json::Value::String(s) => {
            Decimal::from_str(s.trim()).map_err(serde::de::Error::custom)
        }
        other => Err(serde::de::Error::custom(format!(
            "expected number, got {other}"
        ))),
    }
}

/// Accept a JSON bool or the strings `"true"`/`"false"`; null is false.
pub fn flexible_bool<'de, D: Deserializer<'de>>(d: D) -> Result<bool, D::Error> {
    let value = serde_json::Value::deserialize(d)?;
    match value {
        serde_json::Value::Bool(b) => Ok(b),
        serde_json::Value::String(s) => Ok(s.eq_ignore_ascii_case("true")),
        serde_json::Value::Null => Ok(false),
        other => Err(serde::de::Error::custom(format!(
            "expected bool, got {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde::Deserialize;

    #[derive(Deserialize)]
    struct Row {
        #[serde(default, deserialize_with = "flexible_decimal")]
        value: Decimal,
        #[serde(default, deserialize_with = "flexible_bool")]
        flag: bool,
    }

    fn value(json: &str) -> Decimal {
        serde_json::from_str::<Row>(json).unwrap().value
    }

    #[test]
    fn test_flexible_decimal_shapes() {
        assert_eq!(value(r#"{"value":104.5}"#), dec!(104.5));
        assert_eq!(value(r#"{"value":"50"}"#), dec!(50));
        assert_eq!(value(r#"{"value":" -25 "}"#), dec!(-25));
        assert_eq!(value(r#"{"value":""}"#), Decimal::ZERO);
        assert_eq!(value(r#"{"value":null}"#), Decimal::ZERO);
        assert_eq!(value(r#"{}"#), Decimal::ZERO);
    }

    #[test]
    fn test_flexible_decimal_rejects_garbage() {
        assert!(serde_json::from_str::<Row>(r#"{"value":"abc"}"#).is_err());
        assert!(serde_json::from_str::<Row>(r#"{"value":[1]}"#).is_err());
    }

    #[test]
    fn test_flexible_bool_shapes() {
        let parse = |json: &str| serde_json::from_str::<Row>(json).unwrap().flag;
        assert!(parse(r#"{"flag":true}"#));
        assert!(parse(r#"{"flag":"true"}"#));
        assert!(!parse(r#"{"flag":"false"}"#));
        assert!(!parse(r#"{}"#));
    }
}
