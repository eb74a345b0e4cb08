//! Conversion between JSON rows and Automerge objects.
//!
//! Rows are stored as nested Automerge maps so concurrent edits to different
//! fields of the same row merge instead of overwriting each other.

use automerge::transaction::Transactable;
use automerge::{AutoCommit, ObjId, ObjType, Prop, ReadDoc, ScalarValue, Value as AmValue};
use serde_json::{Map, Number, Value};

use super::DocumentError;

/// Writes `value` at `obj[prop]`, replacing whatever was there.
pub fn write_value(
    doc: &mut AutoCommit,
    obj: &ObjId,
    prop: impl Into<Prop>,
    value: &Value,
) -> Result<(), DocumentError> {
    let prop = prop.into();
    match value {
        Value::Array(items) => {
            let list = doc.put_object(obj, prop, ObjType::List)?;
            for (i, item) in items.iter().enumerate() {
                insert_value(doc, &list, i, item)?;
            }
        }
        Value::Object(fields) => {
            let map = doc.put_object(obj, prop, ObjType::Map)?;
            for (key, field) in fields {
                write_value(doc, &map, key.as_str(), field)?;
            }
        }
        scalar => doc.put(obj, prop, to_scalar(scalar))?,
    }
    Ok(())
}

fn insert_value(
    doc: &mut AutoCommit,
    list: &ObjId,
    index: usize,
    value: &Value,
) -> Result<(), DocumentError> {
    match value {
        Value::Array(items) => {
            let nested = doc.insert_object(list, index, ObjType::List)?;
            for (i, item) in items.iter().enumerate() {
                insert_value(doc, &nested, i, item)?;
            }
        }
        Value::Object(fields) => {
            let map = doc.insert_object(list, index, ObjType::Map)?;
            for (key, field) in fields {
                write_value(doc, &map, key.as_str(), field)?;
            }
        }
        scalar => doc.insert(list, index, to_scalar(scalar))?,
    }
    Ok(())
}

fn to_scalar(value: &Value) -> ScalarValue {
    match value {
        Value::Bool(b) => ScalarValue::Boolean(*b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                ScalarValue::Int(i)
            } else if let Some(u) = n.as_u64() {
                ScalarValue::Uint(u)
            } else {
                ScalarValue::F64(n.as_f64().unwrap_or_default())
            }
        }
        Value::String(s) => ScalarValue::Str(s.as_str().into()),
        _ => ScalarValue::Null,
    }
}

/// Reads `obj[prop]` back into JSON. Returns `None` if the property is unset.
pub fn read_value(
    doc: &AutoCommit,
    obj: &ObjId,
    prop: impl Into<Prop>,
) -> Result<Option<Value>, DocumentError> {
    match doc.get(obj, prop)? {
        Some((AmValue::Scalar(scalar), _)) => Ok(Some(from_scalar(&scalar))),
        Some((AmValue::Object(obj_type), id)) => Ok(Some(read_object(doc, &id, obj_type)?)),
        None => Ok(None),
    }
}

/// Reads a whole Automerge object into JSON.
pub fn read_object(
    doc: &AutoCommit,
    obj: &ObjId,
    obj_type: ObjType,
) -> Result<Value, DocumentError> {
    match obj_type {
        ObjType::Map | ObjType::Table => {
            let mut fields = Map::new();
            for key in doc.keys(obj) {
                if let Some(value) = read_value(doc, obj, key.as_str())? {
                    fields.insert(key, value);
                }
            }
            Ok(Value::Object(fields))
        }
        ObjType::List => {
            let mut items = Vec::with_capacity(doc.length(obj));
            for i in 0..doc.length(obj) {
                items.push(read_value(doc, obj, i)?.unwrap_or(Value::Null));
            }
            Ok(Value::Array(items))
        }
        ObjType::Text => Ok(Value::String(doc.text(obj)?)),
    }
}

fn from_scalar(scalar: &ScalarValue) -> Value {
    match scalar {
        ScalarValue::Str(s) => Value::String(s.to_string()),
        ScalarValue::Int(i) => Value::from(*i),
        ScalarValue::Uint(u) => Value::from(*u),
        ScalarValue::F64(f) => Number::from_f64(*f).map(Value::Number).unwrap_or(Value::Null),
        ScalarValue::Boolean(b) => Value::Bool(*b),
        ScalarValue::Null => Value::Null,
        other => other.to_i64().map(Value::from).unwrap_or(Value::Null),
    }
}
