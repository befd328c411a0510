//! Typed column access over Arrow record batches returned by DuckDB.

use arrow::array::{Array, BooleanArray, Float64Array, Int64Array, LargeStringArray, StringArray};
use arrow::record_batch::RecordBatch;
use chrono::{DateTime, Utc};

use crate::StoreError;

fn column<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a dyn Array, StoreError> {
    batch
        .column_by_name(name)
        .map(|c| c.as_ref())
        .ok_or_else(|| decode(name, "missing column"))
}

pub(crate) fn get_string(
    batch: &RecordBatch,
    name: &str,
    row: usize,
) -> Result<Option<String>, StoreError> {
    let col = column(batch, name)?;
    if col.is_null(row) {
        return Ok(None);
    }
    col.as_any()
        .downcast_ref::<StringArray>()
        .map(|arr| arr.value(row).to_string())
        .or_else(|| {
            col.as_any()
                .downcast_ref::<LargeStringArray>()
                .map(|arr| arr.value(row).to_string())
        })
        .map(Some)
        .ok_or_else(|| decode(name, "not a string column"))
}

pub(crate) fn get_i64(batch: &RecordBatch, name: &str, row: usize) -> Result<Option<i64>, StoreError> {
    let col = column(batch, name)?;
    if col.is_null(row) {
        return Ok(None);
    }
    col.as_any()
        .downcast_ref::<Int64Array>()
        .map(|arr| Some(arr.value(row)))
        .ok_or_else(|| decode(name, "not an i64 column"))
}

pub(crate) fn get_f64(batch: &RecordBatch, name: &str, row: usize) -> Result<Option<f64>, StoreError> {
    let col = column(batch, name)?;
    if col.is_null(row) {
        return Ok(None);
    }
    col.as_any()
        .downcast_ref::<Float64Array>()
        .map(|arr| Some(arr.value(row)))
        .ok_or_else(|| decode(name, "not an f64 column"))
}

pub(crate) fn get_bool(
    batch: &RecordBatch,
    name: &str,
    row: usize,
) -> Result<Option<bool>, StoreError> {
    let col = column(batch, name)?;
    if col.is_null(row) {
        return Ok(None);
    }
    col.as_any()
        .downcast_ref::<BooleanArray>()
        .map(|arr| Some(arr.value(row)))
        .ok_or_else(|| decode(name, "not a boolean column"))
}

/// Epoch-millisecond column as a UTC timestamp.
pub(crate) fn get_timestamp(
    batch: &RecordBatch,
    name: &str,
    row: usize,
) -> Result<Option<DateTime<Utc>>, StoreError> {
    match get_i64(batch, name, row)? {
        None => Ok(None),
        Some(ms) => DateTime::from_timestamp_millis(ms)
            .map(Some)
            .ok_or_else(|| decode(name, &format!("{ms} is out of range"))),
    }
}

pub(crate) fn required<T>(value: Option<T>, name: &str) -> Result<T, StoreError> {
    value.ok_or_else(|| decode(name, "unexpected NULL"))
}

pub(crate) fn decode(column: &str, reason: &str) -> StoreError {
    StoreError::Decode {
        column: column.to_string(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use arrow::datatypes::{DataType, Field, Schema};

    fn batch() -> RecordBatch {
        let schema = Schema::new(vec![
            Field::new("name", DataType::Utf8, true),
            Field::new("count", DataType::Int64, true),
            Field::new("ts", DataType::Int64, false),
        ]);
        RecordBatch::try_new(
            Arc::new(schema),
            vec![
                Arc::new(StringArray::from(vec![Some("shoprite"), None])),
                Arc::new(Int64Array::from(vec![Some(3), None])),
                Arc::new(Int64Array::from(vec![1_767_225_600_000, 0])),
            ],
        )
        .unwrap()
    }

    #[test]
    fn reads_typed_values_and_nulls() {
        let b = batch();
        assert_eq!(get_string(&b, "name", 0).unwrap().as_deref(), Some("shoprite"));
        assert_eq!(get_string(&b, "name", 1).unwrap(), None);
        assert_eq!(get_i64(&b, "count", 0).unwrap(), Some(3));
        assert_eq!(get_i64(&b, "count", 1).unwrap(), None);
        let ts = get_timestamp(&b, "ts", 0).unwrap().unwrap();
        assert_eq!(ts.timestamp_millis(), 1_767_225_600_000);
    }

    #[test]
    fn wrong_type_and_missing_column_are_decode_errors() {
        let b = batch();
        assert!(matches!(
            get_f64(&b, "count", 0),
            Err(StoreError::Decode { .. })
        ));
        assert!(matches!(
            get_bool(&b, "nope", 0),
            Err(StoreError::Decode { .. })
        ));
        assert!(required::<i64>(None, "count").is_err());
    }
}
