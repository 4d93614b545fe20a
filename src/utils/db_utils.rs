use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde_json::{Map, Value};
use sqlx::MySqlPool;

use crate::error::ApiError;

/// SQL bindable value
#[derive(Debug, PartialEq)]
pub enum SqlValue {
    String(String),
    I64(i64),
    U64(u64),
    F64(f64),
    Bool(bool),
    Date(NaiveDate),
    DateTime(NaiveDateTime),
    Null,
}

#[derive(Debug)]
pub struct SqlUpdate {
    pub sql: String,
    pub values: Vec<SqlValue>,
}

fn to_sql_value(value: &Value) -> Result<SqlValue, ApiError> {
    Ok(match value {
        Value::String(s) => {
            if let Ok(d) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
                SqlValue::Date(d)
            } else if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
                SqlValue::DateTime(dt.with_timezone(&Utc).naive_utc())
            } else if let Ok(dt) = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S") {
                SqlValue::DateTime(dt)
            } else {
                SqlValue::String(s.clone())
            }
        }
        Value::Number(n) => {
            if let Some(u) = n.as_u64() {
                SqlValue::U64(u)
            } else if let Some(i) = n.as_i64() {
                SqlValue::I64(i)
            } else if let Some(f) = n.as_f64() {
                SqlValue::F64(f)
            } else {
                return Err(ApiError::bad_request("Unsupported number"));
            }
        }
        Value::Bool(b) => SqlValue::Bool(*b),
        Value::Null => SqlValue::Null,
        _ => return Err(ApiError::bad_request("Unsupported JSON value type")),
    })
}

/// Payload of a partial update as a JSON object with at least one key.
pub fn update_object(payload: &Value) -> Result<&Map<String, Value>, ApiError> {
    let obj = payload
        .as_object()
        .ok_or_else(|| ApiError::bad_request("Payload must be a JSON object"))?;

    if obj.is_empty() {
        return Err(ApiError::bad_request("No fields provided for update"));
    }

    Ok(obj)
}

/// Build `UPDATE table SET a = ?, b = ? WHERE id = ?` from a JSON object.
///
/// Only keys listed in `allowed` become columns; anything else is rejected so
/// a client can never write to columns such as `created_by` or `password`.
pub fn build_update_sql(
    table: &str,
    payload: &Value,
    allowed: &[&str],
    id_column: &str,
    id_value: u64,
) -> Result<SqlUpdate, ApiError> {
    let obj = update_object(payload)?;

    if let Some(bad) = obj.keys().find(|k| !allowed.contains(&k.as_str())) {
        return Err(ApiError::bad_request(format!("Field cannot be updated: {bad}")));
    }

    let set_clause = obj
        .keys()
        .map(|k| format!("{} = ?", k))
        .collect::<Vec<_>>()
        .join(", ");

    let sql = format!("UPDATE {} SET {} WHERE {} = ?", table, set_clause, id_column);

    let mut values = Vec::with_capacity(obj.len() + 1);
    for value in obj.values() {
        values.push(to_sql_value(value)?);
    }

    values.push(SqlValue::U64(id_value));

    Ok(SqlUpdate { sql, values })
}

pub async fn execute_update(pool: &MySqlPool, update: SqlUpdate) -> Result<u64, sqlx::Error> {
    let mut query = sqlx::query(&update.sql);

    for value in update.values {
        query = match value {
            SqlValue::String(v) => query.bind(v),
            SqlValue::I64(v) => query.bind(v),
            SqlValue::U64(v) => query.bind(v),
            SqlValue::F64(v) => query.bind(v),
            SqlValue::Bool(v) => query.bind(v),
            SqlValue::Date(v) => query.bind(v),
            SqlValue::DateTime(v) => query.bind(v),
            SqlValue::Null => query.bind(None::<String>),
        };
    }

    let result = query.execute(pool).await?;
    Ok(result.rows_affected())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const ALLOWED: &[&str] = &["name", "status", "next_follow_up", "assigned_to"];

    #[test]
    fn builds_set_clause_in_payload_order() {
        let update = build_update_sql(
            "leads",
            &json!({"name": "Acme", "next_follow_up": "2026-03-01", "assigned_to": null}),
            ALLOWED,
            "id",
            9,
        )
        .unwrap();

        assert!(update.sql.starts_with("UPDATE leads SET "));
        assert!(update.sql.ends_with(" WHERE id = ?"));
        assert_eq!(update.values.len(), 4);
        assert_eq!(update.values.last(), Some(&SqlValue::U64(9)));
        assert!(update.values.contains(&SqlValue::Null));
        assert!(update.values.contains(&SqlValue::Date(
            NaiveDate::from_ymd_opt(2026, 3, 1).unwrap()
        )));
    }

    #[test]
    fn rejects_columns_outside_whitelist() {
        let err = build_update_sql("leads", &json!({"created_by": 1}), ALLOWED, "id", 1)
            .unwrap_err();
        assert!(err.to_string().contains("created_by"));
    }

    #[test]
    fn rejects_empty_and_non_object_payloads() {
        assert!(build_update_sql("leads", &json!({}), ALLOWED, "id", 1).is_err());
        assert!(build_update_sql("leads", &json!([1, 2]), ALLOWED, "id", 1).is_err());
    }

    #[test]
    fn rejects_nested_values() {
        assert!(build_update_sql("leads", &json!({"name": {"x": 1}}), ALLOWED, "id", 1).is_err());
    }

    #[test]
    fn rfc3339_timestamps_become_utc_datetimes() {
        let value = to_sql_value(&json!("2026-03-01T10:00:00+02:00")).unwrap();
        let expected = NaiveDate::from_ymd_opt(2026, 3, 1)
            .unwrap()
            .and_hms_opt(8, 0, 0)
            .unwrap();
        assert_eq!(value, SqlValue::DateTime(expected));
    }
}
