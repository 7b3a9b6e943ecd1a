//! Value coercion: in-memory scalars to their storable form.
//!
//! Every function here is pure. Type mismatches are reported as
//! [`PersistError::TypeConversion`] carrying the dotted path of the field.
//!
//! | Type        | Accepted values                        | Stored as                            |
//! |-------------|----------------------------------------|--------------------------------------|
//! | `bool`      | bool, int                              | JSON boolean                         |
//! | `int`       | int, decimal without fraction, string  | JSON integer                         |
//! | `float`     | float, int, decimal, string            | JSON number                          |
//! | `decimal`   | decimal, int, float, string            | `{"$numberDecimal": "..."}`          |
//! | `string`    | any scalar                             | JSON string                          |
//! | `timestamp` | timestamp, date, epoch seconds, RFC3339| `{"$date": {"$numberLong": "<ms>"}}` |
//! | `date`      | same as `timestamp`                    | same, at midnight UTC for dates      |
//! | `id`        | any scalar                             | as-is                                |
//! | `hash`      | JSON object                            | as-is                                |
//! | `collection`| list, JSON array                       | JSON array                           |
//! | `raw`       | any scalar                             | as-is                                |

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use rust_decimal::Decimal;
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use serde_json::{Map, Number, Value as JsonValue};

use docmap_types::{FieldMapping, ScalarType, Value};

use crate::error::PersistError;

/// Convert a scalar field value for storage.
///
/// Returns `None` when the value is null and the mapping does not store
/// nulls; the caller then treats the field as absent.
///
/// # Errors
///
/// Returns [`PersistError::TypeConversion`] if the value does not fit `ty`.
pub fn to_storable(
    mapping: &FieldMapping,
    ty: ScalarType,
    value: &Value,
    path: &str,
) -> Result<Option<JsonValue>, PersistError> {
    if value.is_null() {
        return Ok(mapping.nullable.then_some(JsonValue::Null));
    }
    convert(ty, value, path).map(Some)
}

/// Convert a non-null value to the storage representation of `ty`.
///
/// # Errors
///
/// Returns [`PersistError::TypeConversion`] if the value does not fit `ty`.
pub fn convert(ty: ScalarType, value: &Value, path: &str) -> Result<JsonValue, PersistError> {
    let mismatch = || PersistError::TypeConversion {
        path: path.to_owned(),
        expected: ty,
        found: value.kind_name(),
    };

    match (ty, value) {
        (_, Value::Null) => Ok(JsonValue::Null),

        (ScalarType::Bool, Value::Bool(b)) => Ok(JsonValue::Bool(*b)),
        (ScalarType::Bool, Value::Int(i)) => Ok(JsonValue::Bool(*i != 0)),

        (ScalarType::Int, Value::Int(i)) => Ok(JsonValue::from(*i)),
        (ScalarType::Int, Value::Bool(b)) => Ok(JsonValue::from(i64::from(*b))),
        (ScalarType::Int, Value::Decimal(d)) if d.fract().is_zero() => {
            d.to_i64().map(JsonValue::from).ok_or_else(mismatch)
        }
        (ScalarType::Int, Value::String(s)) => {
            s.trim().parse::<i64>().map(JsonValue::from).map_err(|_| mismatch())
        }

        (ScalarType::Float, Value::Float(f)) => float_json(*f).ok_or_else(mismatch),
        (ScalarType::Float, Value::Int(i)) => Decimal::from(*i)
            .to_f64()
            .and_then(float_json)
            .ok_or_else(mismatch),
        (ScalarType::Float, Value::Decimal(d)) => {
            d.to_f64().and_then(float_json).ok_or_else(mismatch)
        }
        (ScalarType::Float, Value::String(s)) => s
            .trim()
            .parse::<f64>()
            .ok()
            .and_then(float_json)
            .ok_or_else(mismatch),

        (ScalarType::Decimal, Value::Decimal(d)) => Ok(decimal_json(*d)),
        (ScalarType::Decimal, Value::Int(i)) => Ok(decimal_json(Decimal::from(*i))),
        (ScalarType::Decimal, Value::Float(f)) => Decimal::from_f64(*f)
            .map(decimal_json)
            .ok_or_else(mismatch),
        (ScalarType::Decimal, Value::String(s)) => s
            .trim()
            .parse::<Decimal>()
            .map(decimal_json)
            .map_err(|_| mismatch()),

        (ScalarType::String, Value::String(s)) => Ok(JsonValue::String(s.clone())),
        (ScalarType::String, Value::Bool(b)) => Ok(JsonValue::String(b.to_string())),
        (ScalarType::String, Value::Int(i)) => Ok(JsonValue::String(i.to_string())),
        (ScalarType::String, Value::Float(f)) => Ok(JsonValue::String(f.to_string())),
        (ScalarType::String, Value::Decimal(d)) => Ok(JsonValue::String(d.to_string())),

        (ScalarType::Timestamp | ScalarType::Date, _) => {
            to_datetime(value).map(timestamp_json).ok_or_else(mismatch)
        }

        (ScalarType::Hash, Value::Json(json @ JsonValue::Object(_))) => Ok(json.clone()),

        (ScalarType::Collection, Value::List(items)) => items
            .iter()
            .map(|item| raw(item).ok_or_else(mismatch))
            .collect::<Result<Vec<_>, _>>()
            .map(JsonValue::Array),
        (ScalarType::Collection, Value::Json(json @ JsonValue::Array(_))) => Ok(json.clone()),

        (ScalarType::Id | ScalarType::Raw, _) => raw(value).ok_or_else(mismatch),

        _ => Err(mismatch()),
    }
}

/// Delta written by `$inc` for an increment field changing from `old` to `new`.
///
/// A null old value counts as zero. The sign of the delta is preserved.
///
/// # Errors
///
/// Returns [`PersistError::TypeConversion`] if either side is not numeric
/// or the subtraction overflows.
pub fn increment_delta(
    ty: ScalarType,
    old: &Value,
    new: &Value,
    path: &str,
) -> Result<JsonValue, PersistError> {
    let mismatch = |value: &Value| PersistError::TypeConversion {
        path: path.to_owned(),
        expected: ty,
        found: value.kind_name(),
    };

    match ty {
        ScalarType::Int => {
            let old_int = as_int(old).ok_or_else(|| mismatch(old))?;
            let new_int = as_int(new).ok_or_else(|| mismatch(new))?;
            new_int
                .checked_sub(old_int)
                .map(JsonValue::from)
                .ok_or_else(|| mismatch(new))
        }
        ScalarType::Decimal => {
            let old_dec = as_decimal(old).ok_or_else(|| mismatch(old))?;
            let new_dec = as_decimal(new).ok_or_else(|| mismatch(new))?;
            new_dec
                .checked_sub(old_dec)
                .map(decimal_json)
                .ok_or_else(|| mismatch(new))
        }
        ScalarType::Float => {
            let old_float = as_float(old).ok_or_else(|| mismatch(old))?;
            let new_float = as_float(new).ok_or_else(|| mismatch(new))?;
            float_json(new_float - old_float).ok_or_else(|| mismatch(new))
        }
        _ => Err(mismatch(new)),
    }
}

/// Native date representation of a point in time.
pub fn timestamp_json(at: DateTime<Utc>) -> JsonValue {
    let mut long = Map::new();
    long.insert(
        "$numberLong".to_owned(),
        JsonValue::String(at.timestamp_millis().to_string()),
    );
    let mut date = Map::new();
    date.insert("$date".to_owned(), JsonValue::Object(long));
    JsonValue::Object(date)
}

/// Native decimal representation.
pub fn decimal_json(value: Decimal) -> JsonValue {
    let mut decimal = Map::new();
    decimal.insert(
        "$numberDecimal".to_owned(),
        JsonValue::String(value.normalize().to_string()),
    );
    JsonValue::Object(decimal)
}

/// Store any scalar without type-directed conversion.
///
/// Returns `None` for association values, which have no scalar form.
pub fn raw(value: &Value) -> Option<JsonValue> {
    match value {
        Value::Null => Some(JsonValue::Null),
        Value::Bool(b) => Some(JsonValue::Bool(*b)),
        Value::Int(i) => Some(JsonValue::from(*i)),
        Value::Float(f) => float_json(*f),
        Value::Decimal(d) => Some(decimal_json(*d)),
        Value::String(s) => Some(JsonValue::String(s.clone())),
        Value::Timestamp(_) | Value::Date(_) => to_datetime(value).map(timestamp_json),
        Value::Json(json) => Some(json.clone()),
        Value::List(items) => items
            .iter()
            .map(raw)
            .collect::<Option<Vec<_>>>()
            .map(JsonValue::Array),
        Value::Document(_) | Value::Collection(_) => None,
    }
}

fn float_json(value: f64) -> Option<JsonValue> {
    Number::from_f64(value).map(JsonValue::Number)
}

fn to_datetime(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Timestamp(at) => Some(*at),
        Value::Date(date) => Some(midnight(*date)),
        Value::Int(secs) => DateTime::from_timestamp(*secs, 0),
        Value::String(s) => DateTime::parse_from_rfc3339(s.trim())
            .ok()
            .map(|at| at.with_timezone(&Utc))
            .or_else(|| {
                s.trim()
                    .parse::<NaiveDate>()
                    .ok()
                    .map(midnight)
            }),
        _ => None,
    }
}

fn midnight(date: NaiveDate) -> DateTime<Utc> {
    date.and_time(NaiveTime::MIN).and_utc()
}

const fn as_int(value: &Value) -> Option<i64> {
    match value {
        Value::Null => Some(0),
        Value::Int(i) => Some(*i),
        _ => None,
    }
}

fn as_decimal(value: &Value) -> Option<Decimal> {
    match value {
        Value::Null => Some(Decimal::ZERO),
        Value::Int(i) => Some(Decimal::from(*i)),
        Value::Decimal(d) => Some(*d),
        _ => None,
    }
}

fn as_float(value: &Value) -> Option<f64> {
    match value {
        Value::Null => Some(0.0),
        Value::Float(f) => Some(*f),
        Value::Int(i) => Decimal::from(*i).to_f64(),
        Value::Decimal(d) => d.to_f64(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docmap_types::DocumentKey;
    use serde_json::json;

    #[test]
    fn null_is_dropped_unless_nullable() {
        let plain = FieldMapping::scalar("nickname", ScalarType::String);
        let nullable = FieldMapping::scalar("nickname", ScalarType::String).nullable();

        let dropped = to_storable(&plain, ScalarType::String, &Value::Null, "nickname");
        let kept = to_storable(&nullable, ScalarType::String, &Value::Null, "nickname");

        assert!(matches!(dropped, Ok(None)));
        assert!(matches!(kept, Ok(Some(JsonValue::Null))));
    }

    #[test]
    fn timestamps_become_native_dates() {
        let at = DateTime::from_timestamp(1_700_000_000, 0).unwrap_or_default();
        let stored = convert(ScalarType::Timestamp, &Value::Timestamp(at), "created");
        assert_eq!(
            stored.ok(),
            Some(json!({"$date": {"$numberLong": "1700000000000"}}))
        );

        let from_epoch = convert(ScalarType::Timestamp, &Value::Int(1_700_000_000), "created");
        assert_eq!(
            from_epoch.ok(),
            Some(json!({"$date": {"$numberLong": "1700000000000"}}))
        );
    }

    #[test]
    fn dates_are_stored_at_midnight() {
        let date = NaiveDate::from_ymd_opt(1970, 1, 2).unwrap_or_default();
        let stored = convert(ScalarType::Date, &Value::Date(date), "born");
        assert_eq!(
            stored.ok(),
            Some(json!({"$date": {"$numberLong": "86400000"}}))
        );
    }

    #[test]
    fn decimals_keep_their_digits() {
        let stored = convert(ScalarType::Decimal, &Value::from("12.50"), "price");
        assert_eq!(stored.ok(), Some(json!({"$numberDecimal": "12.5"})));
    }

    #[test]
    fn numeric_strings_convert_to_int() {
        let stored = convert(ScalarType::Int, &Value::from(" 42 "), "age");
        assert_eq!(stored.ok(), Some(json!(42)));
    }

    #[test]
    fn mismatch_reports_path_and_kind() {
        let result = convert(ScalarType::Int, &Value::from("forty"), "profile.age");
        assert!(matches!(
            result,
            Err(PersistError::TypeConversion {
                ref path,
                expected: ScalarType::Int,
                found: "string",
            }) if path == "profile.age"
        ));
    }

    #[test]
    fn documents_have_no_scalar_form() {
        let result = convert(ScalarType::Raw, &Value::Document(DocumentKey::new()), "x");
        assert!(matches!(result, Err(PersistError::TypeConversion { .. })));
    }

    #[test]
    fn hash_requires_an_object() {
        let ok = convert(ScalarType::Hash, &Value::Json(json!({"a": 1})), "meta");
        let bad = convert(ScalarType::Hash, &Value::Json(json!([1])), "meta");
        assert_eq!(ok.ok(), Some(json!({"a": 1})));
        assert!(bad.is_err());
    }

    #[test]
    fn increment_delta_preserves_sign() {
        let up = increment_delta(ScalarType::Int, &Value::Int(3), &Value::Int(10), "n");
        let down = increment_delta(ScalarType::Int, &Value::Int(10), &Value::Int(3), "n");
        let from_null = increment_delta(ScalarType::Int, &Value::Null, &Value::Int(4), "n");
        assert_eq!(up.ok(), Some(json!(7)));
        assert_eq!(down.ok(), Some(json!(-7)));
        assert_eq!(from_null.ok(), Some(json!(4)));
    }

    #[test]
    fn decimal_increment_delta() {
        let old = Value::Decimal(Decimal::new(150, 2));
        let new = Value::Decimal(Decimal::new(100, 2));
        let delta = increment_delta(ScalarType::Decimal, &old, &new, "balance");
        assert_eq!(delta.ok(), Some(json!({"$numberDecimal": "-0.5"})));
    }

    #[test]
    fn increment_overflow_is_an_error() {
        let delta = increment_delta(ScalarType::Int, &Value::Int(-1), &Value::Int(i64::MAX), "n");
        assert!(delta.is_err());
    }
}
