//! Export of a sealed chunk as an Arrow `RecordBatch` for host consumers.

use std::sync::Arc;

use arrow::array::{
    ArrayRef, BinaryBuilder, BooleanBuilder, Float16Builder, Float32Builder, Float64Builder,
    Int8Builder, Int16Builder, Int32Builder, Int64Builder, StringBuilder,
};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use xpu_result::{Error, Result};
use xpu_types::{Datum, TypeOpcode};

use crate::kds::Kds;

pub fn arrow_type(ty: TypeOpcode) -> DataType {
    match ty {
        TypeOpcode::Bool => DataType::Boolean,
        TypeOpcode::Int1 => DataType::Int8,
        TypeOpcode::Int2 => DataType::Int16,
        TypeOpcode::Int4 => DataType::Int32,
        TypeOpcode::Int8 => DataType::Int64,
        TypeOpcode::Float2 => DataType::Float16,
        TypeOpcode::Float4 => DataType::Float32,
        TypeOpcode::Float8 => DataType::Float64,
        TypeOpcode::Text => DataType::Utf8,
        TypeOpcode::Bytea => DataType::Binary,
    }
}

macro_rules! build_column {
    ($builder:ty, $rows:expr, $col:expr, $variant:ident) => {{
        let mut b = <$builder>::with_capacity($rows.len());
        for row in $rows {
            match &row[$col] {
                Datum::$variant(v) => b.append_value(v.clone()),
                Datum::Null => b.append_null(),
                other => return Err(mismatch($col, other)),
            }
        }
        Arc::new(b.finish()) as ArrayRef
    }};
}

fn mismatch(col: usize, datum: &Datum) -> Error {
    Error::Internal(format!("column {col} holds unexpected datum {datum:?}"))
}

impl Kds {
    pub fn arrow_schema(&self) -> Schema {
        Schema::new(
            self.columns
                .iter()
                .map(|c| Field::new(&c.name, arrow_type(c.type_op), c.nullable))
                .collect::<Vec<_>>(),
        )
    }

    /// Materialise every populated row into a `RecordBatch`.
    pub fn to_record_batch(&self) -> Result<RecordBatch> {
        let rows = self.rows()?;
        let mut arrays: Vec<ArrayRef> = Vec::with_capacity(self.columns.len());
        for (col, c) in self.columns.iter().enumerate() {
            let array = match c.type_op {
                TypeOpcode::Bool => build_column!(BooleanBuilder, &rows, col, Bool),
                TypeOpcode::Int1 => build_column!(Int8Builder, &rows, col, Int1),
                TypeOpcode::Int2 => build_column!(Int16Builder, &rows, col, Int2),
                TypeOpcode::Int4 => build_column!(Int32Builder, &rows, col, Int4),
                TypeOpcode::Int8 => build_column!(Int64Builder, &rows, col, Int8),
                TypeOpcode::Float2 => build_column!(Float16Builder, &rows, col, Float2),
                TypeOpcode::Float4 => build_column!(Float32Builder, &rows, col, Float4),
                TypeOpcode::Float8 => build_column!(Float64Builder, &rows, col, Float8),
                TypeOpcode::Text => {
                    let mut b = StringBuilder::with_capacity(rows.len(), rows.len() * 8);
                    for row in &rows {
                        match &row[col] {
                            Datum::Text(s) => b.append_value(s),
                            Datum::Null => b.append_null(),
                            other => return Err(mismatch(col, other)),
                        }
                    }
                    Arc::new(b.finish()) as ArrayRef
                }
                TypeOpcode::Bytea => {
                    let mut b = BinaryBuilder::with_capacity(rows.len(), rows.len() * 8);
                    for row in &rows {
                        match &row[col] {
                            Datum::Bytea(v) => b.append_value(v),
                            Datum::Null => b.append_null(),
                            other => return Err(mismatch(col, other)),
                        }
                    }
                    Arc::new(b.finish()) as ArrayRef
                }
            };
            arrays.push(array);
        }
        Ok(RecordBatch::try_new(Arc::new(self.arrow_schema()), arrays)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{Array, Int32Array, StringArray};
    use xpu_types::ColumnDef;

    #[test]
    fn exports_rows_with_nulls() {
        let cols = vec![
            ColumnDef::new("id", TypeOpcode::Int4).not_null(),
            ColumnDef::new("name", TypeOpcode::Text),
        ];
        let mut kds = Kds::new_column(cols, 8, 1024).unwrap();
        kds.push_row(&[Datum::Int4(1), Datum::Text("one".into())]).unwrap();
        kds.push_row(&[Datum::Int4(2), Datum::Null]).unwrap();

        let batch = kds.to_record_batch().unwrap();
        assert_eq!(batch.num_rows(), 2);
        let ids = batch.column(0).as_any().downcast_ref::<Int32Array>().unwrap();
        assert_eq!(ids.values(), &[1, 2]);
        let names = batch.column(1).as_any().downcast_ref::<StringArray>().unwrap();
        assert_eq!(names.value(0), "one");
        assert!(names.is_null(1));
        assert!(!batch.schema().field(0).is_nullable());
    }
}
