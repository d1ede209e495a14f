//! Result value normalization.
//!
//! Conversion from driver rows to [`SqlValue`] happens in two phases:
//! 1. `categorize_type` classifies the column's type name into a logical
//!    [`TypeCategory`]
//! 2. database-specific decoders extract the value for that category
//!
//! NULL is detected on the raw value before any typed decode, so decoders only
//! deal with present values. Values no decoder understands are rendered as
//! text inside [`SqlValue::Composite`] instead of being dropped.

use crate::models::{DatabaseType, SqlValue};
use sqlx::postgres::PgRow;
use sqlx::sqlite::SqliteRow;
use sqlx::{Column, Row, TypeInfo, ValueRef};

/// Logical category for database column types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeCategory {
    Integer,
    Float,
    Decimal,
    Boolean,
    Text,
    Temporal,
    Binary,
    Json,
    Uuid,
    Array,
    Unknown,
}

/// Classify a database type name into a logical category.
pub fn categorize_type(type_name: &str, db: DatabaseType) -> TypeCategory {
    let lower = type_name.to_lowercase();

    if lower.ends_with("[]") || lower.starts_with('_') {
        return TypeCategory::Array;
    }

    // Checked before floats since "numeric" would otherwise look ambiguous
    if lower.contains("decimal") || lower.contains("numeric") {
        // SQLite's NUMERIC affinity holds plain integers and reals
        if db == DatabaseType::SQLite {
            return TypeCategory::Float;
        }
        return TypeCategory::Decimal;
    }

    if lower == "interval" || lower == "point" {
        return TypeCategory::Unknown;
    }

    if lower.contains("int") || lower.contains("serial") {
        return TypeCategory::Integer;
    }

    if lower == "bool" || lower == "boolean" {
        return TypeCategory::Boolean;
    }

    if lower.contains("float") || lower.contains("double") || lower == "real" {
        return TypeCategory::Float;
    }

    if lower.starts_with("timestamp")
        || lower == "datetime"
        || lower == "date"
        || lower == "time"
    {
        return TypeCategory::Temporal;
    }

    if lower == "json" || lower == "jsonb" {
        return TypeCategory::Json;
    }

    if lower == "uuid" {
        return TypeCategory::Uuid;
    }

    if lower.contains("blob") || lower.contains("binary") || lower == "bytea" {
        return TypeCategory::Binary;
    }

    if lower.contains("char")
        || lower.contains("text")
        || lower == "name"
        || lower == "citext"
        || lower == "clob"
    {
        return TypeCategory::Text;
    }

    TypeCategory::Unknown
}

/// Conversion from a driver row into normalized values.
pub trait DecodeRow {
    fn column_names(&self) -> Vec<String>;
    fn decode_values(&self) -> Vec<SqlValue>;
}

impl DecodeRow for PgRow {
    fn column_names(&self) -> Vec<String> {
        self.columns().iter().map(|c| c.name().to_string()).collect()
    }

    fn decode_values(&self) -> Vec<SqlValue> {
        self.columns()
            .iter()
            .enumerate()
            .map(|(idx, col)| {
                let type_name = col.type_info().name();
                let category = categorize_type(type_name, DatabaseType::PostgreSQL);
                postgres::decode_column(self, idx, type_name, category)
            })
            .collect()
    }
}

impl DecodeRow for SqliteRow {
    fn column_names(&self) -> Vec<String> {
        self.columns().iter().map(|c| c.name().to_string()).collect()
    }

    fn decode_values(&self) -> Vec<SqlValue> {
        self.columns()
            .iter()
            .enumerate()
            .map(|(idx, col)| {
                let type_name = col.type_info().name();
                let category = categorize_type(type_name, DatabaseType::SQLite);
                sqlite::decode_column(self, idx, type_name, category)
            })
            .collect()
    }
}

fn is_null<R: Row>(row: &R, idx: usize) -> bool
where
    usize: sqlx::ColumnIndex<R>,
{
    row.try_get_raw(idx).map(|v| v.is_null()).unwrap_or(true)
}

fn opaque(type_name: &str) -> SqlValue {
    SqlValue::Composite(format!("<{}>", type_name.to_lowercase()))
}

mod postgres {
    use super::*;
    use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
    use rust_decimal::Decimal;
    use serde_json::Value as JsonValue;

    pub fn decode_column(
        row: &PgRow,
        idx: usize,
        type_name: &str,
        category: TypeCategory,
    ) -> SqlValue {
        if is_null(row, idx) {
            return SqlValue::Null;
        }
        let decoded = match category {
            TypeCategory::Integer => decode_integer(row, idx),
            TypeCategory::Float => decode_float(row, idx),
            TypeCategory::Decimal => decode_decimal(row, idx),
            TypeCategory::Boolean => row.try_get::<bool, _>(idx).ok().map(SqlValue::Bool),
            TypeCategory::Text => row.try_get::<String, _>(idx).ok().map(SqlValue::Text),
            TypeCategory::Temporal => decode_temporal(row, idx),
            TypeCategory::Binary => row.try_get::<Vec<u8>, _>(idx).ok().map(SqlValue::Binary),
            TypeCategory::Json => row
                .try_get::<JsonValue, _>(idx)
                .ok()
                .map(|v| SqlValue::Composite(v.to_string())),
            TypeCategory::Uuid => row
                .try_get::<uuid::Uuid, _>(idx)
                .ok()
                .map(|v| SqlValue::Text(v.to_string())),
            TypeCategory::Array => decode_array(row, idx),
            TypeCategory::Unknown => None,
        };
        decoded.unwrap_or_else(|| decode_fallback(row, idx, type_name))
    }

    fn decode_integer(row: &PgRow, idx: usize) -> Option<SqlValue> {
        if let Ok(v) = row.try_get::<i16, _>(idx) {
            return Some(SqlValue::Int(v.into()));
        }
        if let Ok(v) = row.try_get::<i32, _>(idx) {
            return Some(SqlValue::Int(v.into()));
        }
        row.try_get::<i64, _>(idx).ok().map(SqlValue::Int)
    }

    fn decode_float(row: &PgRow, idx: usize) -> Option<SqlValue> {
        if let Ok(v) = row.try_get::<f64, _>(idx) {
            return Some(SqlValue::Float(v));
        }
        row.try_get::<f32, _>(idx)
            .ok()
            .map(|v| SqlValue::Float(v.into()))
    }

    /// NUMERIC stays exact by travelling as text.
    fn decode_decimal(row: &PgRow, idx: usize) -> Option<SqlValue> {
        match row.try_get::<Decimal, _>(idx) {
            Ok(v) => Some(SqlValue::Text(v.to_string())),
            Err(e) => {
                tracing::debug!(error = %e, "NUMERIC value outside decimal range");
                None
            }
        }
    }

    fn decode_temporal(row: &PgRow, idx: usize) -> Option<SqlValue> {
        if let Ok(v) = row.try_get::<DateTime<Utc>, _>(idx) {
            return Some(SqlValue::Timestamp(v.to_rfc3339()));
        }
        if let Ok(v) = row.try_get::<NaiveDateTime, _>(idx) {
            return Some(SqlValue::Timestamp(
                v.format("%Y-%m-%dT%H:%M:%S%.f").to_string(),
            ));
        }
        if let Ok(v) = row.try_get::<NaiveDate, _>(idx) {
            return Some(SqlValue::Timestamp(v.to_string()));
        }
        row.try_get::<NaiveTime, _>(idx)
            .ok()
            .map(|v| SqlValue::Timestamp(v.to_string()))
    }

    fn decode_array(row: &PgRow, idx: usize) -> Option<SqlValue> {
        let json = if let Ok(v) = row.try_get::<Vec<i64>, _>(idx) {
            serde_json::to_string(&v)
        } else if let Ok(v) = row.try_get::<Vec<i32>, _>(idx) {
            serde_json::to_string(&v)
        } else if let Ok(v) = row.try_get::<Vec<String>, _>(idx) {
            serde_json::to_string(&v)
        } else if let Ok(v) = row.try_get::<Vec<f64>, _>(idx) {
            serde_json::to_string(&v)
        } else if let Ok(v) = row.try_get::<Vec<bool>, _>(idx) {
            serde_json::to_string(&v)
        } else {
            return None;
        };
        json.ok().map(SqlValue::Composite)
    }

    /// Enums and other text-encoded types decode as a string; anything else
    /// is reported by type name.
    fn decode_fallback(row: &PgRow, idx: usize, type_name: &str) -> SqlValue {
        match row.try_get_unchecked::<String, _>(idx) {
            Ok(s) => SqlValue::Composite(s),
            Err(_) => opaque(type_name),
        }
    }
}

mod sqlite {
    use super::*;

    pub fn decode_column(
        row: &SqliteRow,
        idx: usize,
        type_name: &str,
        category: TypeCategory,
    ) -> SqlValue {
        if is_null(row, idx) {
            return SqlValue::Null;
        }
        let decoded = match category {
            TypeCategory::Boolean => row.try_get::<bool, _>(idx).ok().map(SqlValue::Bool),
            TypeCategory::Binary => row.try_get::<Vec<u8>, _>(idx).ok().map(SqlValue::Binary),
            TypeCategory::Temporal => row
                .try_get::<String, _>(idx)
                .ok()
                .map(SqlValue::Timestamp),
            TypeCategory::Json => row
                .try_get::<String, _>(idx)
                .ok()
                .map(SqlValue::Composite),
            _ => None,
        };
        decoded.unwrap_or_else(|| decode_dynamic(row, idx, type_name))
    }

    /// Declared types are advisory in SQLite; decode by the value's storage class.
    fn decode_dynamic(row: &SqliteRow, idx: usize, type_name: &str) -> SqlValue {
        let storage_class = row
            .try_get_raw(idx)
            .map(|v| v.type_info().name().to_string())
            .unwrap_or_default();
        let value = match storage_class.as_str() {
            "INTEGER" => row.try_get_unchecked::<i64, _>(idx).map(SqlValue::Int),
            "REAL" => row.try_get_unchecked::<f64, _>(idx).map(SqlValue::Float),
            "BLOB" => row.try_get_unchecked::<Vec<u8>, _>(idx).map(SqlValue::Binary),
            _ => row.try_get_unchecked::<String, _>(idx).map(SqlValue::Text),
        };
        value.unwrap_or_else(|_| opaque(type_name))
    }
}
