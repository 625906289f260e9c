//! EZKV - Value Codecs
//! Converts typed values to and from their stored text form.
//!
//! Every decoder reports [`EzkvError::MalformedValue`] on bad input; none of
//! them fall back to a zero value.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{EzkvError, Result};

pub fn encode_string(s: &str) -> String {
    s.to_owned()
}

/// Base-10 decimal text.
pub fn encode_int(i: i64) -> String {
    i.to_string()
}

pub fn decode_int(s: &str) -> Result<i64> {
    s.parse::<i64>().map_err(|e| EzkvError::malformed("int", e))
}

pub fn encode_bool(b: bool) -> String {
    b.to_string()
}

/// Accepts exactly `"true"` or `"false"`.
pub fn decode_bool(s: &str) -> Result<bool> {
    match s {
        "true" => Ok(true),
        "false" => Ok(false),
        other => Err(EzkvError::malformed(
            "bool",
            format!("expected \"true\" or \"false\", got {:?}", other),
        )),
    }
}

/// RFC3339 in UTC with nanosecond precision, e.g. `2024-01-02T03:04:05.000000006Z`.
/// Fixed width, so the text sorts in time order.
pub fn encode_time(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

pub fn decode_time(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| EzkvError::malformed("time", e))
}

/// JSON text.
pub fn encode_structured<T: Serialize + ?Sized>(v: &T) -> Result<String> {
    serde_json::to_string(v).map_err(|e| EzkvError::malformed("json", e))
}

pub fn decode_structured<T: DeserializeOwned>(s: &str) -> Result<T> {
    serde_json::from_str(s).map_err(|e| EzkvError::malformed("json", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde::Deserialize;
    use std::collections::BTreeMap;

    #[test]
    fn test_int_round_trip() {
        for i in [0, 42, -7, i64::MIN, i64::MAX] {
            assert_eq!(decode_int(&encode_int(i)).unwrap(), i);
        }
    }

    #[test]
    fn test_int_malformed() {
        assert!(matches!(
            decode_int("4x2"),
            Err(EzkvError::MalformedValue { kind: "int", .. })
        ));
        assert!(decode_int("").is_err());
    }

    #[test]
    fn test_bool_strict() {
        assert_eq!(encode_bool(true), "true");
        assert!(decode_bool("true").unwrap());
        assert!(!decode_bool("false").unwrap());
        for bad in ["1", "TRUE", "yes", ""] {
            assert!(matches!(
                decode_bool(bad),
                Err(EzkvError::MalformedValue { kind: "bool", .. })
            ));
        }
    }

    #[test]
    fn test_time_round_trip_keeps_nanos() {
        let t = Utc.timestamp_opt(1_700_000_000, 123_456_789).unwrap();
        let text = encode_time(&t);
        assert_eq!(text, "2023-11-14T22:13:20.123456789Z");
        assert_eq!(decode_time(&text).unwrap(), t);
    }

    #[test]
    fn test_time_text_sorts_chronologically() {
        let earlier = Utc.timestamp_opt(1_000, 5).unwrap();
        let later = Utc.timestamp_opt(1_000, 500_000_000).unwrap();
        assert!(encode_time(&earlier) < encode_time(&later));
    }

    #[test]
    fn test_time_malformed() {
        assert!(matches!(
            decode_time("yesterday"),
            Err(EzkvError::MalformedValue { kind: "time", .. })
        ));
    }

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Dish {
        name: String,
        servings: u32,
        tags: Vec<String>,
    }

    #[test]
    fn test_structured_round_trip() {
        let dish = Dish {
            name: "cabbage".into(),
            servings: 4,
            tags: vec!["green".into()],
        };
        let text = encode_structured(&dish).unwrap();
        assert_eq!(decode_structured::<Dish>(&text).unwrap(), dish);

        let mut map = BTreeMap::new();
        map.insert("a".to_string(), 1);
        let text = encode_structured(&map).unwrap();
        assert_eq!(text, r#"{"a":1}"#);
    }

    #[test]
    fn test_structured_wrong_shape() {
        assert!(matches!(
            decode_structured::<Dish>(r#"{"name":"milk"}"#),
            Err(EzkvError::MalformedValue { kind: "json", .. })
        ));
        assert!(decode_structured::<Dish>("not json").is_err());
    }
}
