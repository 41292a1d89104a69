//! Polars <-> Arrow record batches.
//!
//! Frames cross the boundary as an in-memory IPC file, so the two Arrow
//! implementations never share buffers. On the way in, column types are
//! narrowed to what a Delta table can store; on the way out, Delta scan
//! artifacts (dictionary-wrapped partition values, UTC timestamps) are
//! unwrapped to plain Polars types.

use crate::error::{LakeError, Result};
use deltalake::arrow::array::ArrayRef;
use deltalake::arrow::compute::{cast_with_options, CastOptions};
use deltalake::arrow::datatypes::{DataType as ArrowType, Field, Schema, SchemaRef, TimeUnit as ArrowUnit};
use deltalake::arrow::ipc::reader::FileReader;
use deltalake::arrow::ipc::writer::FileWriter;
use deltalake::arrow::record_batch::RecordBatch;
use polars::prelude::*;
use std::collections::HashMap;
use std::io::Cursor;
use std::sync::Arc;

const UTC: &str = "UTC";

/// Frame as Arrow batches with Delta-compatible column types.
///
/// Columns named in `target` are cast to the type the table already has;
/// a value that does not fit is a `Schema` error.
pub(crate) fn to_record_batches(df: &DataFrame, target: Option<&Schema>) -> Result<Vec<RecordBatch>> {
    let mut buf = Vec::new();
    IpcWriter::new(&mut buf).finish(&mut df.clone())?;

    let reader = FileReader::try_new(Cursor::new(buf), None)?;
    let source = reader.schema();

    let target_types: HashMap<&str, ArrowType> = target
        .map(|schema| {
            schema
                .fields()
                .iter()
                .map(|f| (f.name().as_str(), plain_type(f.data_type())))
                .collect()
        })
        .unwrap_or_default();

    let fields: Vec<Field> = source
        .fields()
        .iter()
        .map(|f| {
            let dtype = target_types
                .get(f.name().as_str())
                .cloned()
                .unwrap_or_else(|| storage_type(f.data_type()));
            Field::new(f.name(), dtype, true)
        })
        .collect();
    let schema: SchemaRef = Arc::new(Schema::new(fields));

    reader
        .map(|batch| cast_batch(&batch?, &schema))
        .collect()
}

/// Batches read back from a table as a Polars frame. An empty batch list
/// still yields the table's columns.
pub(crate) fn to_data_frame(schema: &Schema, batches: &[RecordBatch]) -> Result<DataFrame> {
    let fields: Vec<Field> = schema
        .fields()
        .iter()
        .map(|f| Field::new(f.name(), frame_type(f.data_type()), true))
        .collect();
    let schema: SchemaRef = Arc::new(Schema::new(fields));

    let mut buf = Vec::new();
    {
        let mut writer = FileWriter::try_new(&mut buf, &schema)?;
        for batch in batches {
            writer.write(&cast_batch(batch, &schema)?)?;
        }
        writer.finish()?;
    }

    Ok(IpcReader::new(Cursor::new(buf)).finish()?)
}

fn cast_batch(batch: &RecordBatch, schema: &SchemaRef) -> Result<RecordBatch> {
    let options = CastOptions {
        safe: false,
        ..Default::default()
    };
    let columns = batch
        .columns()
        .iter()
        .zip(schema.fields())
        .map(|(column, field)| {
            if column.data_type() == field.data_type() {
                return Ok(Arc::clone(column));
            }
            cast_with_options(column, field.data_type(), &options).map_err(|e| {
                LakeError::Schema(format!(
                    "Column '{}' is {} in the batch and cannot be stored as {}: {}",
                    field.name(),
                    column.data_type(),
                    field.data_type(),
                    e
                ))
            })
        })
        .collect::<Result<Vec<ArrayRef>>>()?;

    Ok(RecordBatch::try_new(Arc::clone(schema), columns)?)
}

/// Type a column of a new table is stored as.
fn storage_type(dtype: &ArrowType) -> ArrowType {
    match dtype {
        ArrowType::Null | ArrowType::LargeUtf8 | ArrowType::Utf8View => ArrowType::Utf8,
        ArrowType::LargeBinary | ArrowType::BinaryView => ArrowType::Binary,
        ArrowType::UInt8 => ArrowType::Int16,
        ArrowType::UInt16 => ArrowType::Int32,
        ArrowType::UInt32 | ArrowType::UInt64 => ArrowType::Int64,
        ArrowType::Timestamp(_, tz) => {
            ArrowType::Timestamp(ArrowUnit::Microsecond, Some(tz.clone().unwrap_or_else(|| UTC.into())))
        }
        ArrowType::Dictionary(_, value) => storage_type(value),
        other => other.clone(),
    }
}

fn plain_type(dtype: &ArrowType) -> ArrowType {
    match dtype {
        ArrowType::Dictionary(_, value) => plain_type(value),
        other => other.clone(),
    }
}

/// Type a stored column is handed to Polars as.
fn frame_type(dtype: &ArrowType) -> ArrowType {
    match dtype {
        ArrowType::Dictionary(_, value) => frame_type(value),
        ArrowType::Utf8View => ArrowType::Utf8,
        ArrowType::BinaryView => ArrowType::Binary,
        ArrowType::Timestamp(unit, Some(_)) => ArrowType::Timestamp(*unit, None),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_survives_the_boundary() {
        let approach = Int64Chunked::from_vec("approach_datetime", vec![1_704_888_000_000, 1_704_891_600_000])
            .into_datetime(TimeUnit::Milliseconds, None)
            .into_series();
        let mut df = df![
            "neo_reference_id" => ["A", "B"],
            "week" => [2i32, 2],
            "count_per_date" => [1i16, 2]
        ]
        .unwrap();
        df.with_column(approach).unwrap();

        let batches = to_record_batches(&df, None).unwrap();
        let schema = batches[0].schema();
        assert_eq!(
            schema.field_with_name("neo_reference_id").unwrap().data_type(),
            &ArrowType::Utf8
        );
        assert_eq!(
            schema.field_with_name("approach_datetime").unwrap().data_type(),
            &ArrowType::Timestamp(ArrowUnit::Microsecond, Some(UTC.into()))
        );

        let back = to_data_frame(&schema, &batches).unwrap();
        assert_eq!(back.height(), 2);
        assert_eq!(back.column("count_per_date").unwrap().dtype(), &DataType::Int16);
        let millis = back
            .column("approach_datetime")
            .unwrap()
            .cast(&DataType::Datetime(TimeUnit::Milliseconds, None))
            .unwrap();
        assert_eq!(millis.datetime().unwrap().get(0), Some(1_704_888_000_000));
    }

    #[test]
    fn test_all_null_column_takes_the_table_type() {
        let magnitude = Series::new_null("absolute_magnitude_h", 1);
        let mut df = df!["neo_reference_id" => ["A"]].unwrap();
        df.with_column(magnitude).unwrap();

        let target = Schema::new(vec![
            Field::new("neo_reference_id", ArrowType::Utf8, true),
            Field::new("absolute_magnitude_h", ArrowType::Float64, true),
        ]);
        let batches = to_record_batches(&df, Some(&target)).unwrap();
        let column = batches[0].column_by_name("absolute_magnitude_h").unwrap();
        assert_eq!(column.data_type(), &ArrowType::Float64);
        assert_eq!(column.null_count(), 1);

        // no table yet: stored as text
        let fresh = to_record_batches(&df, None).unwrap();
        assert_eq!(
            fresh[0].column_by_name("absolute_magnitude_h").unwrap().data_type(),
            &ArrowType::Utf8
        );
    }

    #[test]
    fn test_uncastable_value_is_a_schema_error() {
        let df = df!["magnitude" => ["bright"]].unwrap();
        let target = Schema::new(vec![Field::new("magnitude", ArrowType::Float64, true)]);
        let err = to_record_batches(&df, Some(&target)).unwrap_err();
        assert!(matches!(err, LakeError::Schema(_)));
    }

    #[test]
    fn test_empty_read_keeps_columns() {
        let schema = Schema::new(vec![
            Field::new("extraction_date", ArrowType::Utf8, true),
            Field::new(
                "week",
                ArrowType::Dictionary(Box::new(ArrowType::UInt16), Box::new(ArrowType::Int32)),
                true,
            ),
        ]);
        let df = to_data_frame(&schema, &[]).unwrap();
        assert_eq!(df.height(), 0);
        assert_eq!(df.column("week").unwrap().dtype(), &DataType::Int32);
    }
}
