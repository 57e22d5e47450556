#![forbid(unsafe_code)]

//! Status-expression evaluator for in-memory attribute tables.
//!
//! A status expression is free text evaluated against one current row
//! and, for aggregate functions, an entire table of rows:
//!
//! ```text
//! "column"            column reference (current row's value)
//! 'text'              string literal
//! 123, 3.14           numeric literals
//! ||                  string concatenation
//! =, !=, >, <, >=, <= comparison
//! +, -, *, /          arithmetic
//! if(cond, yes, no)   conditional
//! round(num[, digits]) rounding (half away from zero)
//!
//! count()             table row count
//! count(cond)         rows where cond is truthy
//! sum(expr)           numeric sum across rows
//! min(expr), max(expr) extremum across rows
//! unique(expr)        distinct non-empty renderings
//! ```
//!
//! Examples:
//!
//! ```
//! use statusexpr::{Row, Value, evaluate_expression};
//!
//! let row = Row::from([
//!     ("block".to_owned(), Value::Text("A".to_owned())),
//!     ("lot".to_owned(), Value::Number(7.0)),
//! ]);
//! let label = evaluate_expression("\"block\" || '-' || \"lot\"", &row, &[]);
//! assert_eq!(label, "A-7");
//!
//! let table = vec![row.clone()];
//! let summary = evaluate_expression(
//!     "'set: ' || count(\"block\" != '') || '/' || count()",
//!     &row,
//!     &table,
//! );
//! assert_eq!(summary, "set: 1/1");
//! ```
//!
//! The evaluator never panics and never returns an error: malformed input
//! degrades to an empty string, a partial result, or the expression's own
//! text, per the defensive parsing rules in [`sx_expr`].

pub use sx_expr::{
    AggregateKind, ArithOp, CompareOp, EvalContext, Expr, ExprError, OpKind, Token,
    evaluate, evaluate_checked, evaluate_expression, parse, parse_expression, tokenize,
};
pub use sx_types::{Row, Value, format_value};
