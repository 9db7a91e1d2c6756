use std::sync::Arc;

use arrow::array::{
    ArrayRef, BooleanArray, Float64Array, Int64Array, StringArray, new_null_array,
};
use arrow::datatypes::DataType;

/// Scalar constant embedded in a bound expression.
///
/// Literals are materialized to full-length arrays at execution time so that
/// every expression node produces inputs of equal length for the arrow
/// kernels.
#[derive(Clone, Debug, PartialEq)]
pub enum ScalarLiteral {
    Null,
    Boolean(bool),
    Int64(i64),
    Float64(f64),
    Utf8(String),
}

impl ScalarLiteral {
    /// The arrow type this literal materializes as. `Null` has no inherent
    /// type and materializes as a `DataType::Null` array.
    pub fn data_type(&self) -> DataType {
        match self {
            ScalarLiteral::Null => DataType::Null,
            ScalarLiteral::Boolean(_) => DataType::Boolean,
            ScalarLiteral::Int64(_) => DataType::Int64,
            ScalarLiteral::Float64(_) => DataType::Float64,
            ScalarLiteral::Utf8(_) => DataType::Utf8,
        }
    }

    /// Broadcast the literal to an array of `len` identical values.
    pub fn to_array(&self, len: usize) -> ArrayRef {
        match self {
            ScalarLiteral::Null => new_null_array(&DataType::Null, len),
            ScalarLiteral::Boolean(v) => Arc::new(BooleanArray::from(vec![*v; len])),
            ScalarLiteral::Int64(v) => Arc::new(Int64Array::from(vec![*v; len])),
            ScalarLiteral::Float64(v) => Arc::new(Float64Array::from(vec![*v; len])),
            ScalarLiteral::Utf8(v) => Arc::new(StringArray::from(vec![v.as_str(); len])),
        }
    }
}
