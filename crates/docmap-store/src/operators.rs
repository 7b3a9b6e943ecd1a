//! Update operator semantics.
//!
//! | Operator       | Effect                                                  |
//! |----------------|---------------------------------------------------------|
//! | `$set`         | replace the value at the path, creating parents         |
//! | `$setOnInsert` | like `$set`, only when an upsert inserts                |
//! | `$unset`       | remove the field; an array slot becomes `null`          |
//! | `$inc`         | add a delta; a missing field counts as zero             |
//! | `$push`        | append one value, or each of `{$each: [...]}`           |
//! | `$pushAll`     | append each value of an array                           |
//! | `$addToSet`    | append values not already present                       |
//! | `$pull`        | remove every element equal to the operand               |

use std::str::FromStr;

use rust_decimal::Decimal;
use serde_json::{Map, Number, Value as JsonValue};

use docmap_types::{CompiledUpdate, UpdateOperator};

use crate::error::StoreError;
use crate::path;

/// Apply every operator of `update` to `document`, in operator order.
///
/// `inserting` is true when an upsert creates the document. Returns whether
/// the document changed.
///
/// # Errors
///
/// Returns the [`StoreError`] of the first operator that cannot be applied.
/// The document may be partially modified; apply to a copy to keep the
/// command atomic.
pub fn apply(
    document: &mut Map<String, JsonValue>,
    update: &CompiledUpdate,
    inserting: bool,
) -> Result<bool, StoreError> {
    let before = document.clone();

    for (operator, fields) in update.iter() {
        for (field, operand) in fields {
            match operator {
                UpdateOperator::Set => *path::slot(document, field)? = operand.clone(),
                UpdateOperator::SetOnInsert => {
                    if inserting {
                        *path::slot(document, field)? = operand.clone();
                    }
                }
                UpdateOperator::Unset => {
                    path::unset(document, field);
                }
                UpdateOperator::Inc => increment(document, field, operand)?,
                UpdateOperator::Push => append(document, operator, field, each(operand), false)?,
                UpdateOperator::PushAll => {
                    let JsonValue::Array(items) = operand else {
                        return Err(StoreError::InvalidOperand {
                            path: field.clone(),
                        });
                    };
                    append(document, operator, field, items.clone(), false)?;
                }
                UpdateOperator::AddToSet => append(document, operator, field, each(operand), true)?,
                UpdateOperator::Pull => pull(document, field, operand)?,
            }
        }
    }

    Ok(*document != before)
}

/// Values carried by an append operand: `{$each: [...]}` or a single value.
fn each(operand: &JsonValue) -> Vec<JsonValue> {
    match operand {
        JsonValue::Object(modifiers) if modifiers.len() == 1 => match modifiers.get("$each") {
            Some(JsonValue::Array(items)) => items.clone(),
            _ => vec![operand.clone()],
        },
        _ => vec![operand.clone()],
    }
}

fn append(
    document: &mut Map<String, JsonValue>,
    operator: UpdateOperator,
    field: &str,
    values: Vec<JsonValue>,
    unique: bool,
) -> Result<(), StoreError> {
    let target = path::slot(document, field)?;
    if target.is_null() {
        *target = JsonValue::Array(Vec::new());
    }
    let JsonValue::Array(items) = target else {
        return Err(StoreError::NotAnArray {
            operator: operator.as_str(),
            path: field.to_owned(),
        });
    };
    for value in values {
        if !unique || !items.contains(&value) {
            items.push(value);
        }
    }
    Ok(())
}

fn pull(document: &mut Map<String, JsonValue>, field: &str, operand: &JsonValue) -> Result<(), StoreError> {
    match path::get_mut(document, field) {
        None | Some(JsonValue::Null) => Ok(()),
        Some(JsonValue::Array(items)) => {
            items.retain(|item| item != operand);
            Ok(())
        }
        Some(_) => Err(StoreError::NotAnArray {
            operator: UpdateOperator::Pull.as_str(),
            path: field.to_owned(),
        }),
    }
}

fn increment(document: &mut Map<String, JsonValue>, field: &str, delta: &JsonValue) -> Result<(), StoreError> {
    let not_a_number = || StoreError::NotANumber {
        path: field.to_owned(),
    };
    let overflow = || StoreError::Overflow {
        path: field.to_owned(),
    };

    let target = path::slot(document, field)?;
    let sum = match (&*target, delta) {
        (JsonValue::Null, _) if is_numeric(delta) => delta.clone(),
        (JsonValue::Number(current), JsonValue::Number(step)) => {
            match (current.as_i64(), step.as_i64()) {
                (Some(a), Some(b)) => JsonValue::from(a.checked_add(b).ok_or_else(overflow)?),
                _ => {
                    let a = current.as_f64().ok_or_else(not_a_number)?;
                    let b = step.as_f64().ok_or_else(not_a_number)?;
                    Number::from_f64(a + b).map(JsonValue::Number).ok_or_else(overflow)?
                }
            }
        }
        (current, step) => {
            let a = decimal(current).ok_or_else(not_a_number)?;
            let b = decimal(step).ok_or_else(not_a_number)?;
            let total = a.checked_add(b).ok_or_else(overflow)?;
            let mut wrapped = Map::new();
            wrapped.insert(
                "$numberDecimal".to_owned(),
                JsonValue::String(total.normalize().to_string()),
            );
            JsonValue::Object(wrapped)
        }
    };
    *target = sum;
    Ok(())
}

fn is_numeric(value: &JsonValue) -> bool {
    value.is_number() || decimal(value).is_some()
}

/// A `{"$numberDecimal": "..."}` value, or a plain number, as a decimal.
fn decimal(value: &JsonValue) -> Option<Decimal> {
    match value {
        JsonValue::Object(wrapped) => wrapped
            .get("$numberDecimal")
            .and_then(JsonValue::as_str)
            .and_then(|text| Decimal::from_str(text).ok()),
        JsonValue::Number(number) => Decimal::from_str(&number.to_string()).ok(),
        _ => None,
    }
}
