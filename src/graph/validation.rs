//! Property constraints checked on construction and on every mutation.

use regex::Regex;
use serde_json::{Map, Value};
use validator::ValidateLength;

use crate::error::ValidationError;

/// A single rule a property must satisfy.
#[derive(Debug, Clone, PartialEq)]
pub enum Rule {
    /// The field must be present and not null.
    Required,
    /// String values must match the pattern.
    Pattern(String),
    /// Minimum length for strings (chars) and arrays (items).
    MinLength(u64),
    /// Maximum length for strings (chars) and arrays (items).
    MaxLength(u64),
    /// Inclusive numeric bounds.
    Range {
        /// Lower bound.
        min: Option<f64>,
        /// Upper bound.
        max: Option<f64>,
    },
    /// The value must be one of the listed values.
    OneOf(Vec<Value>),
    /// The field cannot change once set.
    Immutable,
}

/// A rule bound to a field name.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldConstraint {
    /// Property name.
    pub field: String,
    /// Rule to apply.
    pub rule: Rule,
}

impl FieldConstraint {
    /// Creates a constraint.
    #[must_use]
    pub fn new(field: impl Into<String>, rule: Rule) -> Self {
        Self {
            field: field.into(),
            rule,
        }
    }
}

/// Validates a full property map, used when a node is created or hydrated.
///
/// # Errors
///
/// Returns the first violated constraint.
pub fn validate_properties(
    context: &str,
    constraints: &[FieldConstraint],
    properties: &Map<String, Value>,
) -> Result<(), ValidationError> {
    for constraint in constraints {
        check(context, constraint, properties.get(&constraint.field))?;
    }
    Ok(())
}

/// Validates a single field change. `previous` is the current value.
///
/// # Errors
///
/// Returns the first violated constraint for that field.
pub fn validate_change(
    context: &str,
    constraints: &[FieldConstraint],
    field: &str,
    previous: Option<&Value>,
    next: Option<&Value>,
) -> Result<(), ValidationError> {
    for constraint in constraints.iter().filter(|c| c.field == field) {
        if constraint.rule == Rule::Immutable && previous.is_some() && previous != next {
            return Err(ValidationError::new(context, field, "is immutable"));
        }
        check(context, constraint, next)?;
    }
    Ok(())
}

fn check(
    context: &str,
    constraint: &FieldConstraint,
    value: Option<&Value>,
) -> Result<(), ValidationError> {
    let field = constraint.field.as_str();
    let fail = |message: String| Err(ValidationError::new(context, field, message));

    let value = match value {
        None | Some(Value::Null) => {
            return if constraint.rule == Rule::Required {
                fail(String::from("is required"))
            } else {
                Ok(())
            };
        }
        Some(value) => value,
    };

    match &constraint.rule {
        Rule::Required | Rule::Immutable => Ok(()),
        Rule::Pattern(pattern) => {
            let regex = Regex::new(pattern)
                .map_err(|e| ValidationError::new(context, field, format!("has invalid pattern: {e}")))?;
            match value {
                Value::String(s) if regex.is_match(s) => Ok(()),
                Value::String(s) => fail(format!("'{s}' does not match {pattern}")),
                _ => fail(String::from("must be a string")),
            }
        }
        Rule::MinLength(min) => match value {
            Value::String(s) if s.validate_length(Some(*min), None, None) => Ok(()),
            Value::Array(items) if items.validate_length(Some(*min), None, None) => Ok(()),
            _ => fail(format!("must have length >= {min}")),
        },
        Rule::MaxLength(max) => match value {
            Value::String(s) if s.validate_length(None, Some(*max), None) => Ok(()),
            Value::Array(items) if items.validate_length(None, Some(*max), None) => Ok(()),
            _ => fail(format!("must have length <= {max}")),
        },
        Rule::Range { min, max } => {
            let Some(number) = value.as_f64() else {
                return fail(String::from("must be a number"));
            };
            if min.is_some_and(|min| number < min) || max.is_some_and(|max| number > max) {
                return fail(format!("{number} is out of range"));
            }
            Ok(())
        }
        Rule::OneOf(allowed) => {
            if allowed.contains(value) {
                Ok(())
            } else {
                fail(format!("{value} is not an allowed value"))
            }
        }
    }
}
