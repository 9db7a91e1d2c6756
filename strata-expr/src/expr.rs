use std::collections::BTreeSet;
use std::sync::Arc;

use arrow::array::{Array, ArrayRef, BooleanArray};
use arrow::compute::kernels::cmp;
use arrow::compute::kernels::numeric;
use arrow::compute::{and_kleene, cast, is_not_null, is_null, not, or_kleene};
use arrow::datatypes::DataType;
use arrow::record_batch::RecordBatch;

use strata_result::{Error, Result};

use crate::literal::ScalarLiteral;

/// Arithmetic operators supported by [`BoundExpression::Binary`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BinaryOperator {
    Add,
    Subtract,
    Multiply,
    Divide,
}

/// Comparison operators supported by [`BoundExpression::Compare`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompareOperator {
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
}

/// A scalar expression bound to chunk column positions.
#[derive(Clone, Debug)]
pub enum BoundExpression {
    /// Constant value broadcast over the chunk.
    Literal(ScalarLiteral),
    /// Reference to the column at `index` in the executed chunk.
    ColumnRef { index: usize },
    Binary {
        op: BinaryOperator,
        left: Box<BoundExpression>,
        right: Box<BoundExpression>,
    },
    Compare {
        op: CompareOperator,
        left: Box<BoundExpression>,
        right: Box<BoundExpression>,
    },
    And(Vec<BoundExpression>),
    Or(Vec<BoundExpression>),
    Not(Box<BoundExpression>),
    IsNull(Box<BoundExpression>),
    IsNotNull(Box<BoundExpression>),
    Cast {
        expr: Box<BoundExpression>,
        target: DataType,
    },
}

impl BoundExpression {
    #[inline]
    pub fn column(index: usize) -> BoundExpression {
        BoundExpression::ColumnRef { index }
    }

    #[inline]
    pub fn literal(value: ScalarLiteral) -> BoundExpression {
        BoundExpression::Literal(value)
    }

    pub fn binary(op: BinaryOperator, left: BoundExpression, right: BoundExpression) -> Self {
        BoundExpression::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    pub fn compare(op: CompareOperator, left: BoundExpression, right: BoundExpression) -> Self {
        BoundExpression::Compare {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    pub fn cast_to(self, target: DataType) -> Self {
        BoundExpression::Cast {
            expr: Box::new(self),
            target,
        }
    }

    /// Execute the expression over `chunk`, producing one value per row.
    pub fn execute(&self, chunk: &RecordBatch) -> Result<ArrayRef> {
        let num_rows = chunk.num_rows();
        match self {
            BoundExpression::Literal(lit) => Ok(lit.to_array(num_rows)),
            BoundExpression::ColumnRef { index } => {
                if *index >= chunk.num_columns() {
                    return Err(Error::Internal(format!(
                        "bound column reference {} out of range for chunk with {} columns",
                        index,
                        chunk.num_columns()
                    )));
                }
                Ok(chunk.column(*index).clone())
            }
            BoundExpression::Binary { op, left, right } => {
                let (lhs, rhs) = coerce_pair(left.execute(chunk)?, right.execute(chunk)?)?;
                let result = match op {
                    BinaryOperator::Add => numeric::add(&lhs, &rhs),
                    BinaryOperator::Subtract => numeric::sub(&lhs, &rhs),
                    BinaryOperator::Multiply => numeric::mul(&lhs, &rhs),
                    BinaryOperator::Divide => numeric::div(&lhs, &rhs),
                }?;
                Ok(result)
            }
            BoundExpression::Compare { op, left, right } => {
                let (lhs, rhs) = coerce_pair(left.execute(chunk)?, right.execute(chunk)?)?;
                let result = match op {
                    CompareOperator::Eq => cmp::eq(&lhs, &rhs),
                    CompareOperator::NotEq => cmp::neq(&lhs, &rhs),
                    CompareOperator::Lt => cmp::lt(&lhs, &rhs),
                    CompareOperator::LtEq => cmp::lt_eq(&lhs, &rhs),
                    CompareOperator::Gt => cmp::gt(&lhs, &rhs),
                    CompareOperator::GtEq => cmp::gt_eq(&lhs, &rhs),
                }?;
                Ok(Arc::new(result))
            }
            BoundExpression::And(children) => {
                fold_boolean(children, chunk, num_rows, |acc, next| {
                    Ok(and_kleene(acc, next)?)
                })
            }
            BoundExpression::Or(children) => {
                fold_boolean(children, chunk, num_rows, |acc, next| {
                    Ok(or_kleene(acc, next)?)
                })
            }
            BoundExpression::Not(inner) => {
                let value = inner.execute(chunk)?;
                let bools = as_boolean(&value)?;
                Ok(Arc::new(not(bools)?))
            }
            BoundExpression::IsNull(inner) => {
                let value = inner.execute(chunk)?;
                Ok(Arc::new(is_null(value.as_ref())?))
            }
            BoundExpression::IsNotNull(inner) => {
                let value = inner.execute(chunk)?;
                Ok(Arc::new(is_not_null(value.as_ref())?))
            }
            BoundExpression::Cast { expr, target } => {
                let value = expr.execute(chunk)?;
                Ok(cast(value.as_ref(), target)?)
            }
        }
    }

    /// Chunk column positions referenced anywhere in this expression,
    /// sorted and deduplicated.
    pub fn referenced_columns(&self) -> Vec<usize> {
        let mut out = BTreeSet::new();
        self.collect_columns(&mut out);
        out.into_iter().collect()
    }

    fn collect_columns(&self, out: &mut BTreeSet<usize>) {
        match self {
            BoundExpression::Literal(_) => {}
            BoundExpression::ColumnRef { index } => {
                out.insert(*index);
            }
            BoundExpression::Binary { left, right, .. }
            | BoundExpression::Compare { left, right, .. } => {
                left.collect_columns(out);
                right.collect_columns(out);
            }
            BoundExpression::And(children) | BoundExpression::Or(children) => {
                for child in children {
                    child.collect_columns(out);
                }
            }
            BoundExpression::Not(inner)
            | BoundExpression::IsNull(inner)
            | BoundExpression::IsNotNull(inner) => inner.collect_columns(out),
            BoundExpression::Cast { expr, .. } => expr.collect_columns(out),
        }
    }
}

/// Bring two operands to a common type before a kernel call.
///
/// Literals materialize as `Int64`/`Float64`/`Utf8` regardless of the column
/// type they are compared against, so mixed numeric widths are the normal
/// case rather than the exception.
fn coerce_pair(lhs: ArrayRef, rhs: ArrayRef) -> Result<(ArrayRef, ArrayRef)> {
    let (lt, rt) = (lhs.data_type().clone(), rhs.data_type().clone());
    if lt == rt {
        return Ok((lhs, rhs));
    }
    if lt == DataType::Null {
        let cast_lhs = cast(lhs.as_ref(), &rt)?;
        return Ok((cast_lhs, rhs));
    }
    if rt == DataType::Null {
        let cast_rhs = cast(rhs.as_ref(), &lt)?;
        return Ok((lhs, cast_rhs));
    }
    if lt.is_numeric() && rt.is_numeric() {
        let common = if lt.is_floating() || rt.is_floating() {
            DataType::Float64
        } else {
            DataType::Int64
        };
        let cast_lhs = cast(lhs.as_ref(), &common)?;
        let cast_rhs = cast(rhs.as_ref(), &common)?;
        return Ok((cast_lhs, cast_rhs));
    }
    // Fall back to aligning the right-hand side with the left.
    let cast_rhs = cast(rhs.as_ref(), &lt)?;
    Ok((lhs, cast_rhs))
}

fn as_boolean(array: &ArrayRef) -> Result<&BooleanArray> {
    array
        .as_any()
        .downcast_ref::<BooleanArray>()
        .ok_or_else(|| {
            Error::InvalidArgument(format!(
                "expected a boolean expression result, got {:?}",
                array.data_type()
            ))
        })
}

fn fold_boolean<F>(
    children: &[BoundExpression],
    chunk: &RecordBatch,
    num_rows: usize,
    combine: F,
) -> Result<ArrayRef>
where
    F: Fn(&BooleanArray, &BooleanArray) -> Result<BooleanArray>,
{
    let mut acc: Option<BooleanArray> = None;
    for child in children {
        let value = child.execute(chunk)?;
        let bools = as_boolean(&value)?;
        acc = Some(match acc {
            None => bools.clone(),
            Some(prev) => combine(&prev, bools)?,
        });
    }
    match acc {
        Some(result) => Ok(Arc::new(result)),
        // An empty conjunction is vacuously true.
        None => Ok(ScalarLiteral::Boolean(true).to_array(num_rows)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{Array, Int32Array, Int64Array, StringArray};
    use arrow::datatypes::{Field, Schema};

    fn sample_chunk() -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![
            Field::new("a", DataType::Int64, true),
            Field::new("b", DataType::Utf8, true),
        ]));
        RecordBatch::try_new(
            schema,
            vec![
                Arc::new(Int64Array::from(vec![Some(1), Some(-3), None])),
                Arc::new(StringArray::from(vec![Some("x"), None, Some("z")])),
            ],
        )
        .expect("chunk")
    }

    #[test]
    fn column_ref_returns_column() {
        let chunk = sample_chunk();
        let result = BoundExpression::column(0).execute(&chunk).expect("execute");
        assert_eq!(result.len(), 3);
        assert_eq!(result.data_type(), &DataType::Int64);
    }

    #[test]
    fn comparison_yields_booleans_with_null_propagation() {
        let chunk = sample_chunk();
        let expr = BoundExpression::compare(
            CompareOperator::Gt,
            BoundExpression::column(0),
            BoundExpression::literal(ScalarLiteral::Int64(0)),
        );
        let result = expr.execute(&chunk).expect("execute");
        let bools = result.as_any().downcast_ref::<BooleanArray>().unwrap();
        assert!(bools.value(0));
        assert!(!bools.value(1));
        assert!(bools.is_null(2));
    }

    #[test]
    fn arithmetic_then_cast() {
        let chunk = sample_chunk();
        let expr = BoundExpression::binary(
            BinaryOperator::Add,
            BoundExpression::column(0),
            BoundExpression::literal(ScalarLiteral::Int64(10)),
        )
        .cast_to(DataType::Int32);
        let result = expr.execute(&chunk).expect("execute");
        let ints = result.as_any().downcast_ref::<Int32Array>().unwrap();
        assert_eq!(ints.value(0), 11);
        assert_eq!(ints.value(1), 7);
        assert!(ints.is_null(2));
    }

    #[test]
    fn out_of_range_column_is_internal_error() {
        let chunk = sample_chunk();
        let err = BoundExpression::column(9).execute(&chunk).unwrap_err();
        assert!(err.is_internal());
    }

    #[test]
    fn referenced_columns_are_sorted_and_unique() {
        let expr = BoundExpression::And(vec![
            BoundExpression::compare(
                CompareOperator::Eq,
                BoundExpression::column(2),
                BoundExpression::column(0),
            ),
            BoundExpression::IsNotNull(Box::new(BoundExpression::column(2))),
        ]);
        assert_eq!(expr.referenced_columns(), vec![0, 2]);
    }
}
