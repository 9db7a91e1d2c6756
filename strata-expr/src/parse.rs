//! SQL-text convenience construction of bound expressions.
//!
//! Resolution is purely positional: identifiers are matched
//! (case-insensitively) against an ordered column-name list and become
//! [`BoundExpression::ColumnRef`] nodes addressing that position. No catalog
//! access, no type coercion beyond what execution performs.

use arrow::datatypes::DataType;
use sqlparser::ast::{self, BinaryOperator as SqlBinaryOperator, Expr as SqlExpr, UnaryOperator};
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;

use strata_result::{Error, Result};

use crate::expr::{BinaryOperator, BoundExpression, CompareOperator};
use crate::literal::ScalarLiteral;

/// Parse a scalar SQL expression into a [`BoundExpression`] bound against
/// `columns` (position in the slice = chunk column position).
pub fn parse_scalar_expression(text: &str, columns: &[&str]) -> Result<BoundExpression> {
    let dialect = GenericDialect {};
    let sql = format!("SELECT {}", text);
    let mut statements = Parser::parse_sql(&dialect, &sql).map_err(|e| {
        Error::InvalidArgument(format!("failed to parse expression '{}': {}", text, e))
    })?;

    let statement = statements.pop().ok_or_else(|| {
        Error::InvalidArgument(format!("expression '{}' resulted in empty AST", text))
    })?;

    let query = match statement {
        ast::Statement::Query(q) => q,
        _ => {
            return Err(Error::InvalidArgument(format!(
                "expression '{}' did not parse as a scalar expression",
                text
            )));
        }
    };

    let body = match *query.body {
        ast::SetExpr::Select(s) => s,
        _ => {
            return Err(Error::InvalidArgument(format!(
                "expression '{}' is not a simple scalar expression",
                text
            )));
        }
    };

    if body.projection.len() != 1 {
        return Err(Error::InvalidArgument(format!(
            "expression '{}' must have exactly one projection",
            text
        )));
    }

    let expr = match &body.projection[0] {
        ast::SelectItem::UnnamedExpr(expr) | ast::SelectItem::ExprWithAlias { expr, .. } => expr,
        _ => {
            return Err(Error::InvalidArgument(format!(
                "expression '{}' projection is not a simple expression",
                text
            )));
        }
    };

    translate(expr, columns)
}

fn translate(expr: &SqlExpr, columns: &[&str]) -> Result<BoundExpression> {
    match expr {
        SqlExpr::BinaryOp { left, op, right } => {
            let lhs = translate(left, columns)?;
            let rhs = translate(right, columns)?;
            Ok(match op {
                SqlBinaryOperator::Plus => {
                    BoundExpression::binary(BinaryOperator::Add, lhs, rhs)
                }
                SqlBinaryOperator::Minus => {
                    BoundExpression::binary(BinaryOperator::Subtract, lhs, rhs)
                }
                SqlBinaryOperator::Multiply => {
                    BoundExpression::binary(BinaryOperator::Multiply, lhs, rhs)
                }
                SqlBinaryOperator::Divide => {
                    BoundExpression::binary(BinaryOperator::Divide, lhs, rhs)
                }
                SqlBinaryOperator::Eq => BoundExpression::compare(CompareOperator::Eq, lhs, rhs),
                SqlBinaryOperator::NotEq => {
                    BoundExpression::compare(CompareOperator::NotEq, lhs, rhs)
                }
                SqlBinaryOperator::Lt => BoundExpression::compare(CompareOperator::Lt, lhs, rhs),
                SqlBinaryOperator::LtEq => {
                    BoundExpression::compare(CompareOperator::LtEq, lhs, rhs)
                }
                SqlBinaryOperator::Gt => BoundExpression::compare(CompareOperator::Gt, lhs, rhs),
                SqlBinaryOperator::GtEq => {
                    BoundExpression::compare(CompareOperator::GtEq, lhs, rhs)
                }
                SqlBinaryOperator::And => BoundExpression::And(vec![lhs, rhs]),
                SqlBinaryOperator::Or => BoundExpression::Or(vec![lhs, rhs]),
                _ => {
                    return Err(Error::InvalidArgument(format!(
                        "unsupported operator in expression: {:?}",
                        op
                    )));
                }
            })
        }
        SqlExpr::UnaryOp { op, expr } => match op {
            UnaryOperator::Not => Ok(BoundExpression::Not(Box::new(translate(expr, columns)?))),
            UnaryOperator::Minus => Ok(BoundExpression::binary(
                BinaryOperator::Subtract,
                BoundExpression::literal(ScalarLiteral::Int64(0)),
                translate(expr, columns)?,
            )),
            _ => Err(Error::InvalidArgument(format!(
                "unsupported unary operator in expression: {:?}",
                op
            ))),
        },
        SqlExpr::IsNull(inner) => Ok(BoundExpression::IsNull(Box::new(translate(
            inner, columns,
        )?))),
        SqlExpr::IsNotNull(inner) => Ok(BoundExpression::IsNotNull(Box::new(translate(
            inner, columns,
        )?))),
        SqlExpr::Nested(inner) => translate(inner, columns),
        SqlExpr::Identifier(ident) => {
            let index = columns
                .iter()
                .position(|name| name.eq_ignore_ascii_case(&ident.value))
                .ok_or_else(|| {
                    Error::InvalidArgument(format!(
                        "unknown column '{}' in expression",
                        ident.value
                    ))
                })?;
            Ok(BoundExpression::column(index))
        }
        SqlExpr::Value(value_with_span) => match &value_with_span.value {
            ast::Value::Number(n, _) => {
                if let Ok(i) = n.parse::<i64>() {
                    Ok(BoundExpression::literal(ScalarLiteral::Int64(i)))
                } else if let Ok(f) = n.parse::<f64>() {
                    Ok(BoundExpression::literal(ScalarLiteral::Float64(f)))
                } else {
                    Err(Error::InvalidArgument(format!(
                        "invalid number in expression: {}",
                        n
                    )))
                }
            }
            ast::Value::SingleQuotedString(s) | ast::Value::DoubleQuotedString(s) => {
                Ok(BoundExpression::literal(ScalarLiteral::Utf8(s.clone())))
            }
            ast::Value::Boolean(b) => Ok(BoundExpression::literal(ScalarLiteral::Boolean(*b))),
            ast::Value::Null => Ok(BoundExpression::literal(ScalarLiteral::Null)),
            other => Err(Error::InvalidArgument(format!(
                "unsupported value in expression: {:?}",
                other
            ))),
        },
        SqlExpr::Cast {
            expr, data_type, ..
        } => {
            let target = translate_type(data_type)?;
            Ok(translate(expr, columns)?.cast_to(target))
        }
        other => Err(Error::InvalidArgument(format!(
            "unsupported expression: {:?}",
            other
        ))),
    }
}

fn translate_type(data_type: &ast::DataType) -> Result<DataType> {
    use sqlparser::ast::DataType as SqlType;
    Ok(match data_type {
        SqlType::SmallInt(_) => DataType::Int16,
        SqlType::Int(_) | SqlType::Integer(_) => DataType::Int32,
        SqlType::BigInt(_) => DataType::Int64,
        SqlType::Real | SqlType::Float(_) => DataType::Float32,
        SqlType::Double(_) | SqlType::DoublePrecision => DataType::Float64,
        SqlType::Boolean => DataType::Boolean,
        SqlType::Varchar(_) | SqlType::Text | SqlType::String(_) => DataType::Utf8,
        other => {
            return Err(Error::InvalidArgument(format!(
                "unsupported cast target in expression: {:?}",
                other
            )));
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{Array, BooleanArray, Int64Array, StringArray};
    use arrow::datatypes::{Field, Schema};
    use arrow::record_batch::RecordBatch;
    use std::sync::Arc;

    fn chunk() -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![
            Field::new("qty", DataType::Int64, true),
            Field::new("tag", DataType::Utf8, true),
        ]));
        RecordBatch::try_new(
            schema,
            vec![
                Arc::new(Int64Array::from(vec![Some(5), Some(0), None])),
                Arc::new(StringArray::from(vec![Some("a"), Some("b"), None])),
            ],
        )
        .expect("chunk")
    }

    #[test]
    fn parses_and_executes_check_style_expression() {
        let expr =
            parse_scalar_expression("qty > 0 AND tag IS NOT NULL", &["qty", "tag"]).expect("parse");
        let result = expr.execute(&chunk()).expect("execute");
        let bools = result.as_any().downcast_ref::<BooleanArray>().unwrap();
        assert!(bools.value(0));
        assert!(!bools.value(1));
        assert!(!bools.value(2));
    }

    #[test]
    fn resolves_identifiers_case_insensitively() {
        let expr = parse_scalar_expression("QTY + 1", &["qty", "tag"]).expect("parse");
        assert_eq!(expr.referenced_columns(), vec![0]);
    }

    #[test]
    fn unknown_column_is_rejected() {
        let err = parse_scalar_expression("missing > 1", &["qty"]).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn parses_literals_and_casts() {
        let expr = parse_scalar_expression("CAST(7 AS INTEGER)", &[]).expect("parse");
        let schema = Arc::new(Schema::new(vec![Field::new(
            "unused",
            DataType::Int64,
            true,
        )]));
        let batch = RecordBatch::try_new(schema, vec![Arc::new(Int64Array::from(vec![1, 2]))])
            .expect("chunk");
        let result = expr.execute(&batch).expect("execute");
        assert_eq!(result.data_type(), &DataType::Int32);
        assert_eq!(result.len(), 2);
    }
}
