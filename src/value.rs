//! Value conversion between `sea_query::Value`, PostgreSQL and JSON
//!
//! Statement parameters are built by [`to_sql_params`], which boxes each `sea_query::Value` as a
//! correctly typed (and correctly typed *NULL*) `ToSql` so binds type-check against text, uuid,
//! jsonb and timestamp columns alike. Rows coming back are decoded by the PostgreSQL type of
//! each column. [`coerce`] turns loosely typed caller input (JSON) into a value of a column's
//! native type.

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use may_postgres::types::{FromSql, ToSql, Type};
use rust_decimal::Decimal;
use sea_query::{Value, ValueType, Values};
use serde::Serialize;
use serde_json::Value as JsonValue;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::DbError;
use crate::executor::Row;
use crate::model::ColumnType;

pub(crate) type SqlParam = Box<dyn ToSql>;

fn extract<T>(value: &Value) -> Result<Option<T>, DbError>
where
    Option<T>: ValueType,
{
    <Option<T> as ValueType>::try_from(value.clone())
        .map_err(|_| DbError::Encode(format!("unexpected value {value:?}")))
}

/// Box every value as a typed `ToSql` parameter
pub(crate) fn to_sql_params(values: &Values) -> Result<Vec<SqlParam>, DbError> {
    values.iter().map(to_sql_param).collect()
}

fn to_sql_param(value: &Value) -> Result<SqlParam, DbError> {
    let param: SqlParam = match value {
        Value::Bool(_) => Box::new(extract::<bool>(value)?),
        Value::TinyInt(_) => Box::new(extract::<i8>(value)?.map(i16::from)),
        Value::SmallInt(_) => Box::new(extract::<i16>(value)?),
        Value::Int(_) => Box::new(extract::<i32>(value)?),
        Value::BigInt(_) => Box::new(extract::<i64>(value)?),
        Value::TinyUnsigned(_) => Box::new(extract::<u8>(value)?.map(i16::from)),
        Value::SmallUnsigned(_) => Box::new(extract::<u16>(value)?.map(i32::from)),
        Value::Unsigned(_) => Box::new(extract::<u32>(value)?.map(i64::from)),
        Value::BigUnsigned(_) => {
            let wide = extract::<u64>(value)?;
            let narrowed = wide
                .map(i64::try_from)
                .transpose()
                .map_err(|_| DbError::Encode(format!("{value:?} exceeds i64::MAX")))?;
            Box::new(narrowed)
        }
        Value::Float(_) => Box::new(extract::<f32>(value)?),
        Value::Double(_) => Box::new(extract::<f64>(value)?),
        Value::String(_) => Box::new(extract::<String>(value)?),
        Value::Char(_) => Box::new(extract::<char>(value)?.map(String::from)),
        Value::Bytes(_) => Box::new(extract::<Vec<u8>>(value)?),
        Value::Json(_) => Box::new(extract::<JsonValue>(value)?),
        Value::ChronoDate(_) => Box::new(extract::<NaiveDate>(value)?),
        Value::ChronoTime(_) => Box::new(extract::<NaiveTime>(value)?),
        Value::ChronoDateTime(_) => Box::new(extract::<NaiveDateTime>(value)?),
        Value::ChronoDateTimeUtc(_) => Box::new(extract::<DateTime<Utc>>(value)?),
        Value::Uuid(_) => Box::new(extract::<Uuid>(value)?),
        Value::Decimal(_) => Box::new(extract::<Decimal>(value)?),
        other => {
            return Err(DbError::Encode(format!(
                "unsupported value type in query: {other:?}"
            )))
        }
    };
    Ok(param)
}

fn get<'a, T: FromSql<'a>>(row: &'a may_postgres::Row, idx: usize) -> Result<T, DbError> {
    row.try_get(idx)
        .map_err(|e| DbError::Decode(format!("column {idx}: {e}")))
}

/// Decode a driver row into a [`Row`] of `sea_query::Value`s
pub(crate) fn decode_pg_row(row: &may_postgres::Row) -> Result<Row, DbError> {
    let mut columns = Vec::with_capacity(row.len());
    let mut values = Vec::with_capacity(row.len());
    for (idx, column) in row.columns().iter().enumerate() {
        columns.push(column.name().to_string());
        values.push(decode_column(row, idx, column.type_())?);
    }
    Ok(Row::new(columns, values))
}

fn decode_column(row: &may_postgres::Row, idx: usize, ty: &Type) -> Result<Value, DbError> {
    let value = if *ty == Type::BOOL {
        Value::from(get::<Option<bool>>(row, idx)?)
    } else if *ty == Type::INT2 {
        Value::from(get::<Option<i16>>(row, idx)?)
    } else if *ty == Type::INT4 {
        Value::from(get::<Option<i32>>(row, idx)?)
    } else if *ty == Type::INT8 {
        Value::from(get::<Option<i64>>(row, idx)?)
    } else if *ty == Type::FLOAT4 {
        Value::from(get::<Option<f32>>(row, idx)?)
    } else if *ty == Type::FLOAT8 {
        Value::from(get::<Option<f64>>(row, idx)?)
    } else if *ty == Type::NUMERIC {
        Value::from(get::<Option<Decimal>>(row, idx)?)
    } else if *ty == Type::TEXT
        || *ty == Type::VARCHAR
        || *ty == Type::BPCHAR
        || *ty == Type::NAME
    {
        Value::from(get::<Option<String>>(row, idx)?)
    } else if *ty == Type::UUID {
        Value::from(get::<Option<Uuid>>(row, idx)?)
    } else if *ty == Type::DATE {
        Value::from(get::<Option<NaiveDate>>(row, idx)?)
    } else if *ty == Type::TIME {
        Value::from(get::<Option<NaiveTime>>(row, idx)?)
    } else if *ty == Type::TIMESTAMP {
        Value::from(get::<Option<NaiveDateTime>>(row, idx)?)
    } else if *ty == Type::TIMESTAMPTZ {
        Value::from(get::<Option<DateTime<Utc>>>(row, idx)?)
    } else if *ty == Type::JSON || *ty == Type::JSONB {
        Value::from(get::<Option<JsonValue>>(row, idx)?)
    } else if *ty == Type::BYTEA {
        Value::from(get::<Option<Vec<u8>>>(row, idx)?)
    } else if *ty == Type::TEXT_ARRAY || *ty == Type::VARCHAR_ARRAY {
        let items = get::<Option<Vec<Option<String>>>>(row, idx)?;
        Value::from(items.map(|items| serde_json::json!(items)))
    } else if *ty == Type::INT4_ARRAY {
        let items = get::<Option<Vec<Option<i32>>>>(row, idx)?;
        Value::from(items.map(|items| serde_json::json!(items)))
    } else if *ty == Type::UUID_ARRAY {
        let items = get::<Option<Vec<Option<Uuid>>>>(row, idx)?;
        Value::from(items.map(|items| serde_json::json!(items)))
    } else {
        return Err(DbError::Decode(format!(
            "unsupported column type `{ty}` at index {idx}"
        )));
    };
    Ok(value)
}

fn json_of<T>(value: &Value) -> JsonValue
where
    Option<T>: ValueType,
    T: Serialize,
{
    match <Option<T> as ValueType>::try_from(value.clone()) {
        Ok(Some(v)) => serde_json::to_value(v).unwrap_or(JsonValue::Null),
        _ => JsonValue::Null,
    }
}

/// Render a value as JSON (uuid, dates and decimals as strings)
pub fn to_json(value: &Value) -> JsonValue {
    match value {
        Value::Bool(_) => json_of::<bool>(value),
        Value::TinyInt(_) => json_of::<i8>(value),
        Value::SmallInt(_) => json_of::<i16>(value),
        Value::Int(_) => json_of::<i32>(value),
        Value::BigInt(_) => json_of::<i64>(value),
        Value::TinyUnsigned(_) => json_of::<u8>(value),
        Value::SmallUnsigned(_) => json_of::<u16>(value),
        Value::Unsigned(_) => json_of::<u32>(value),
        Value::BigUnsigned(_) => json_of::<u64>(value),
        Value::Float(_) => json_of::<f32>(value),
        Value::Double(_) => json_of::<f64>(value),
        Value::String(_) => json_of::<String>(value),
        Value::Char(_) => json_of::<char>(value),
        Value::Bytes(_) => json_of::<Vec<u8>>(value),
        Value::Json(_) => json_of::<JsonValue>(value),
        Value::ChronoDate(_) => json_of::<NaiveDate>(value),
        Value::ChronoTime(_) => json_of::<NaiveTime>(value),
        Value::ChronoDateTime(_) => json_of::<NaiveDateTime>(value),
        Value::ChronoDateTimeUtc(_) => json_of::<DateTime<Utc>>(value),
        Value::Uuid(_) => json_of::<Uuid>(value),
        Value::Decimal(_) => json_of::<Decimal>(value),
        _ => JsonValue::Null,
    }
}

pub fn is_null(value: &Value) -> bool {
    to_json(value).is_null()
}

/// Stable grouping key for a value, independent of integer width
pub fn key_of(value: &Value) -> String {
    match to_json(value) {
        JsonValue::String(s) => s,
        other => other.to_string(),
    }
}

fn integer_of(value: &JsonValue) -> Result<i64, String> {
    match value {
        JsonValue::Number(n) => n
            .as_i64()
            .ok_or_else(|| format!("{n} is not an integer")),
        JsonValue::String(s) => s
            .trim()
            .parse::<i64>()
            .map_err(|e| format!("`{s}` is not an integer: {e}")),
        JsonValue::Bool(b) => Ok(i64::from(*b)),
        other => Err(format!("expected an integer, got {other}")),
    }
}

fn float_of(value: &JsonValue) -> Result<f64, String> {
    match value {
        JsonValue::Number(n) => n.as_f64().ok_or_else(|| format!("{n} is not a number")),
        JsonValue::String(s) => s
            .trim()
            .parse::<f64>()
            .map_err(|e| format!("`{s}` is not a number: {e}")),
        other => Err(format!("expected a number, got {other}")),
    }
}

fn text_of(value: &JsonValue) -> Result<String, String> {
    match value {
        JsonValue::String(s) => Ok(s.clone()),
        JsonValue::Number(n) => Ok(n.to_string()),
        JsonValue::Bool(b) => Ok(b.to_string()),
        other => Err(format!("expected text, got {other}")),
    }
}

fn bool_of(value: &JsonValue) -> Result<bool, String> {
    match value {
        JsonValue::Bool(b) => Ok(*b),
        JsonValue::Number(n) => Ok(n.as_i64().unwrap_or(0) != 0),
        JsonValue::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "t" | "1" | "yes" | "on" => Ok(true),
            "false" | "f" | "0" | "no" | "off" => Ok(false),
            other => Err(format!("`{other}` is not a boolean")),
        },
        other => Err(format!("expected a boolean, got {other}")),
    }
}

fn date_of(s: &str) -> Result<NaiveDate, String> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .or_else(|_| datetime_of(s).map(|dt| dt.date()))
        .map_err(|_| format!("`{s}` is not a date"))
}

fn datetime_of(s: &str) -> Result<NaiveDateTime, String> {
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
        .or_else(|| {
            DateTime::parse_from_rfc3339(s)
                .ok()
                .map(|dt| dt.with_timezone(&Utc).naive_utc())
        })
        .or_else(|| {
            NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
        .ok_or_else(|| format!("`{s}` is not a timestamp"))
}

/// Convert loosely typed JSON input into a value of the column's native type
///
/// JSON `null` becomes a typed NULL. Strings are parsed for numeric, boolean, uuid and temporal
/// columns so query-string style input ("10", "true") compares against typed columns.
pub fn coerce(value: &JsonValue, ty: ColumnType) -> Result<Value, String> {
    if value.is_null() {
        return Ok(ty.null_value());
    }
    let coerced = match ty {
        ColumnType::Uuid => {
            let text = text_of(value)?;
            Value::from(Uuid::parse_str(text.trim()).map_err(|e| format!("`{text}` is not a uuid: {e}"))?)
        }
        ColumnType::SmallInt => {
            let n = integer_of(value)?;
            Value::from(i16::try_from(n).map_err(|_| format!("{n} out of range for smallint"))?)
        }
        ColumnType::Integer => {
            let n = integer_of(value)?;
            Value::from(i32::try_from(n).map_err(|_| format!("{n} out of range for integer"))?)
        }
        ColumnType::BigInt => Value::from(integer_of(value)?),
        ColumnType::Double => Value::from(float_of(value)?),
        ColumnType::Decimal => {
            let text = text_of(value)?;
            Value::from(Decimal::from_str(text.trim()).map_err(|e| format!("`{text}` is not a decimal: {e}"))?)
        }
        ColumnType::Boolean => Value::from(bool_of(value)?),
        ColumnType::Text => Value::from(text_of(value)?),
        ColumnType::Date => Value::from(date_of(&text_of(value)?)?),
        ColumnType::Timestamp => Value::from(datetime_of(&text_of(value)?)?),
        ColumnType::TimestampTz => {
            let text = text_of(value)?;
            let parsed = DateTime::parse_from_rfc3339(&text)
                .map(|dt| dt.with_timezone(&Utc))
                .or_else(|_| datetime_of(&text).map(|naive| naive.and_utc()))
                .map_err(|_| format!("`{text}` is not a timestamp with time zone"))?;
            Value::from(parsed)
        }
        ColumnType::Json => Value::from(value.clone()),
        ColumnType::TextArray => match value {
            JsonValue::Array(items) => {
                let texts = items.iter().map(text_of).collect::<Result<Vec<_>, _>>()?;
                Value::from(serde_json::json!(texts))
            }
            JsonValue::String(s) => Value::from(serde_json::json!(crate::filter::decode_list(s))),
            other => return Err(format!("expected a list of text, got {other}")),
        },
    };
    Ok(coerced)
}

/// Split an array-typed JSON value into element values of `ty`'s element type
pub fn array_elements(value: &Value) -> Vec<Value> {
    match to_json(value) {
        JsonValue::Array(items) => items
            .iter()
            .filter_map(|item| text_of(item).ok())
            .map(Value::from)
            .collect(),
        _ => Vec::new(),
    }
}
