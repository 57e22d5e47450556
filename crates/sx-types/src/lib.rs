#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A row of the host table: column name to cell value.
///
/// Rows are supplied by the caller and only ever read. Source rows hold
/// absent, number, or text cells; booleans appear only as intermediate
/// evaluation results.
pub type Row = BTreeMap<String, Value>;

/// The dynamic value flowing through status-expression evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Value {
    Absent,
    Bool(bool),
    Number(f64),
    Text(String),
}

impl Value {
    #[must_use]
    pub fn is_absent(&self) -> bool {
        matches!(self, Self::Absent)
    }

    /// Best-effort numeric coercion. Booleans count as 1/0, text is parsed
    /// as a float after trimming. `None` marks coercion failure; callers
    /// decide whether that means absent or a fallback to text semantics.
    #[must_use]
    pub fn to_number(&self) -> Option<f64> {
        match self {
            Self::Absent => None,
            Self::Bool(v) => Some(if *v { 1.0 } else { 0.0 }),
            Self::Number(v) => Some(*v),
            Self::Text(v) => v.trim().parse::<f64>().ok(),
        }
    }

    /// Textual rendering used for concatenation, string comparison, and the
    /// final formatter. Integral numbers render with no decimal point.
    #[must_use]
    pub fn to_text(&self) -> String {
        match self {
            Self::Absent => String::new(),
            Self::Bool(v) => v.to_string(),
            Self::Number(v) => render_number(*v),
            Self::Text(v) => v.clone(),
        }
    }

    /// Truthiness for conditionals and `count(predicate)`: absent is false,
    /// a boolean is itself, a number is true unless zero, text is true
    /// unless empty.
    #[must_use]
    pub fn truthy(&self) -> bool {
        match self {
            Self::Absent => false,
            Self::Bool(v) => *v,
            Self::Number(v) => *v != 0.0,
            Self::Text(v) => !v.is_empty(),
        }
    }
}

/// Render a value for user-facing display.
///
/// Absent becomes the empty string, booleans their literal form, integral
/// numbers an integer rendering, everything else its text form.
#[must_use]
pub fn format_value(value: &Value) -> String {
    value.to_text()
}

fn render_number(v: f64) -> String {
    if v == 0.0 {
        // Also normalizes -0.0.
        return "0".to_owned();
    }
    if v.is_finite() && v == v.trunc() {
        format!("{v:.0}")
    } else {
        v.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::{Value, format_value};

    #[test]
    fn integral_numbers_render_without_decimal_point() {
        assert_eq!(Value::Number(3.0).to_text(), "3");
        assert_eq!(Value::Number(-5.0).to_text(), "-5");
        assert_eq!(Value::Number(0.0).to_text(), "0");
        assert_eq!(Value::Number(-0.0).to_text(), "0");
        assert_eq!(Value::Number(1e20).to_text(), "100000000000000000000");
    }

    #[test]
    fn fractional_numbers_keep_their_fraction() {
        assert_eq!(Value::Number(3.14).to_text(), "3.14");
        assert_eq!(Value::Number(-0.5).to_text(), "-0.5");
    }

    #[test]
    fn formatter_maps_absent_to_empty_and_bools_to_literals() {
        assert_eq!(format_value(&Value::Absent), "");
        assert_eq!(format_value(&Value::Bool(true)), "true");
        assert_eq!(format_value(&Value::Bool(false)), "false");
        assert_eq!(format_value(&Value::Text("x".to_owned())), "x");
    }

    #[test]
    fn numeric_coercion_parses_trimmed_text_and_maps_bools() {
        assert_eq!(Value::Text(" 3.5 ".to_owned()).to_number(), Some(3.5));
        assert_eq!(Value::Text("abc".to_owned()).to_number(), None);
        assert_eq!(Value::Text(String::new()).to_number(), None);
        assert_eq!(Value::Bool(true).to_number(), Some(1.0));
        assert_eq!(Value::Bool(false).to_number(), Some(0.0));
        assert_eq!(Value::Absent.to_number(), None);
    }

    #[test]
    fn truthiness_follows_the_conditional_rules() {
        assert!(!Value::Absent.truthy());
        assert!(Value::Bool(true).truthy());
        assert!(!Value::Bool(false).truthy());
        assert!(Value::Number(-2.0).truthy());
        assert!(!Value::Number(0.0).truthy());
        assert!(Value::Text("x".to_owned()).truthy());
        assert!(!Value::Text(String::new()).truthy());
    }

    #[test]
    fn value_round_trips_through_serde_json() {
        let values = vec![
            Value::Absent,
            Value::Bool(true),
            Value::Number(2.5),
            Value::Text("hello".to_owned()),
        ];
        let encoded = serde_json::to_string(&values).expect("encode");
        let decoded: Vec<Value> = serde_json::from_str(&encoded).expect("decode");
        assert_eq!(decoded, values);
    }
}
