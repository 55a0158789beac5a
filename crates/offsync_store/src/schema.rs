//! Field schema and validation.

use crate::record::Record;
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Declared type of a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldType {
    /// Integer values only.
    Int,
    /// Integer or floating point values.
    Number,
    /// Text values.
    Text,
    /// Boolean values.
    Bool,
}

impl FieldType {
    /// Returns true if `value` belongs to this type.
    ///
    /// Text representations of numbers are accepted for `Int` and
    /// `Number` fields, matching the original form-input patterns.
    pub fn accepts(&self, value: &Value) -> bool {
        match self {
            FieldType::Int => match value {
                Value::Int(_) => true,
                Value::Text(s) => is_int_literal(s),
                _ => false,
            },
            FieldType::Number => match value {
                Value::Int(_) | Value::Float(_) => true,
                Value::Text(s) => is_number_literal(s),
                _ => false,
            },
            FieldType::Text => matches!(value, Value::Text(_)),
            FieldType::Bool => matches!(value, Value::Bool(_)),
        }
    }
}

/// Matches `^-?(?:0|[1-9]\d*)$`.
fn is_int_literal(s: &str) -> bool {
    let digits = s.strip_prefix('-').unwrap_or(s);
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return false;
    }
    digits.len() == 1 || !digits.starts_with('0')
}

/// Matches `^-?(?:[1-9]\d*\.?\d*|0?\.\d+)$`, plus plain `0`.
fn is_number_literal(s: &str) -> bool {
    let body = s.strip_prefix('-').unwrap_or(s);
    if body.is_empty() {
        return false;
    }
    match body.split_once('.') {
        None => is_int_literal(body),
        Some((int_part, frac)) => {
            let int_ok = int_part.is_empty()
                || int_part == "0"
                || (!int_part.starts_with('0') && int_part.bytes().all(|b| b.is_ascii_digit()));
            let frac_ok = frac.bytes().all(|b| b.is_ascii_digit());
            // ".5" and "1." are fine, "." alone is not
            int_ok && frac_ok && !(int_part.is_empty() && frac.is_empty())
        }
    }
}

/// Custom field validator callback.
pub type FieldValidator = Arc<dyn Fn(&Value) -> bool + Send + Sync>;

/// Configuration for a single field.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct FieldSpec {
    /// Declared type, checked on write.
    pub field_type: Option<FieldType>,
    /// Whether a value must be present on create.
    pub required: bool,
    /// Default applied when the value is absent or empty.
    pub default: Option<Value>,
    /// Maximum length for text values.
    pub max_length: Option<usize>,
    /// Custom validator, checked after the type check.
    #[serde(skip)]
    pub validator: Option<FieldValidator>,
}

impl fmt::Debug for FieldSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FieldSpec")
            .field("field_type", &self.field_type)
            .field("required", &self.required)
            .field("default", &self.default)
            .field("max_length", &self.max_length)
            .field("validator", &self.validator.as_ref().map(|_| "<fn>"))
            .finish()
    }
}

impl FieldSpec {
    /// A required field of the given type.
    pub fn required(field_type: FieldType) -> Self {
        Self {
            field_type: Some(field_type),
            required: true,
            ..Self::default()
        }
    }

    /// An optional field of the given type.
    pub fn optional(field_type: FieldType) -> Self {
        Self {
            field_type: Some(field_type),
            ..Self::default()
        }
    }

    /// Sets the default value.
    pub fn with_default(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }

    /// Sets the maximum text length.
    pub fn with_max_length(mut self, max: usize) -> Self {
        self.max_length = Some(max);
        self
    }

    /// Sets a custom validator.
    pub fn with_validator(
        mut self,
        validator: impl Fn(&Value) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.validator = Some(Arc::new(validator));
        self
    }
}

/// A validation failure for one field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldViolation {
    /// A required field carried no value and has no default.
    MissingRequired(String),
    /// A value failed its type, pattern, length, or custom check.
    Invalid(String),
}

/// Field configuration for a model, keyed by field name.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Schema {
    fields: BTreeMap<String, FieldSpec>,
}

impl Schema {
    /// Creates an empty schema.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a field, builder style.
    pub fn with_field(mut self, name: impl Into<String>, spec: FieldSpec) -> Self {
        self.fields.insert(name.into(), spec);
        self
    }

    /// Returns the spec for a field, if declared.
    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.get(name)
    }

    /// Iterates over declared fields.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &FieldSpec)> {
        self.fields.iter()
    }

    /// Returns a record pre-filled with every declared default.
    pub fn defaults(&self) -> Record {
        let mut record = Record::new();
        for (name, spec) in &self.fields {
            if let Some(default) = &spec.default {
                record.set_field(name.clone(), default.clone());
            }
        }
        record
    }

    /// Validates a record against the schema, filling defaults in place.
    ///
    /// With `full` set every declared field is checked (create path);
    /// otherwise only fields present on the record are checked (update
    /// path). Runs before any store is touched.
    pub fn validate(&self, record: &mut Record, full: bool) -> Result<(), FieldViolation> {
        for (name, spec) in &self.fields {
            let present = record.fields.contains_key(name);
            if !full && !present {
                continue;
            }
            let value = record.fields.get(name).cloned().unwrap_or(Value::Null);
            if value.is_empty() {
                if let Some(default) = &spec.default {
                    record.set_field(name.clone(), default.clone());
                } else if spec.required {
                    return Err(FieldViolation::MissingRequired(name.clone()));
                }
                continue;
            }
            self.check_value(name, spec, &value)?;
        }
        Ok(())
    }

    /// Validates a single field value against its spec.
    pub fn validate_field(&self, name: &str, value: &Value) -> Result<(), FieldViolation> {
        match self.fields.get(name) {
            Some(spec) => {
                if value.is_empty() {
                    if spec.required && spec.default.is_none() {
                        return Err(FieldViolation::MissingRequired(name.to_owned()));
                    }
                    return Ok(());
                }
                self.check_value(name, spec, value)
            }
            None => Ok(()),
        }
    }

    fn check_value(
        &self,
        name: &str,
        spec: &FieldSpec,
        value: &Value,
    ) -> Result<(), FieldViolation> {
        if let Some(validator) = &spec.validator {
            if !validator(value) {
                return Err(FieldViolation::Invalid(name.to_owned()));
            }
        }
        if let Some(field_type) = spec.field_type {
            if !field_type.accepts(value) {
                return Err(FieldViolation::Invalid(name.to_owned()));
            }
        }
        if let Some(max) = spec.max_length {
            if let Value::Text(s) = value {
                if s.chars().count() > max {
                    return Err(FieldViolation::Invalid(name.to_owned()));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn player_schema() -> Schema {
        Schema::new()
            .with_field("name", FieldSpec::required(FieldType::Text).with_max_length(8))
            .with_field("level", FieldSpec::optional(FieldType::Int).with_default(1i64))
            .with_field("score", FieldSpec::optional(FieldType::Number))
    }

    #[test]
    fn int_literal_pattern() {
        assert!(is_int_literal("0"));
        assert!(is_int_literal("-12"));
        assert!(is_int_literal("120"));
        assert!(!is_int_literal("012"));
        assert!(!is_int_literal(""));
        assert!(!is_int_literal("1.5"));
    }

    #[test]
    fn number_literal_pattern() {
        assert!(is_number_literal("1.5"));
        assert!(is_number_literal(".5"));
        assert!(is_number_literal("-0.25"));
        assert!(is_number_literal("10"));
        assert!(!is_number_literal("."));
        assert!(!is_number_literal("1.2.3"));
        assert!(!is_number_literal("abc"));
    }

    #[test]
    fn missing_required_field_rejected_on_create() {
        let schema = player_schema();
        let mut record = Record::new().with_field("score", 10i64);
        let err = schema.validate(&mut record, true).unwrap_err();
        assert_eq!(err, FieldViolation::MissingRequired("name".into()));
    }

    #[test]
    fn defaults_fill_absent_values() {
        let schema = player_schema();
        let mut record = Record::new().with_field("name", "alice");
        schema.validate(&mut record, true).unwrap();
        assert_eq!(record.field("level"), Some(&Value::Int(1)));
    }

    #[test]
    fn partial_validation_skips_absent_fields() {
        let schema = player_schema();
        let mut record = Record::new().with_field("score", 3.5f64);
        schema.validate(&mut record, false).unwrap();
        assert!(record.field("name").is_none());
    }

    #[test]
    fn type_and_length_checks() {
        let schema = player_schema();

        let mut record = Record::new()
            .with_field("name", "much-too-long-name")
            .with_field("level", 2i64);
        assert_eq!(
            schema.validate(&mut record, false),
            Err(FieldViolation::Invalid("name".into()))
        );

        let mut record = Record::new().with_field("level", "abc");
        assert_eq!(
            schema.validate(&mut record, false),
            Err(FieldViolation::Invalid("level".into()))
        );
    }

    #[test]
    fn custom_validator_runs() {
        let schema = Schema::new().with_field(
            "even",
            FieldSpec::optional(FieldType::Int)
                .with_validator(|v| v.as_int().is_some_and(|n| n % 2 == 0)),
        );
        let mut ok = Record::new().with_field("even", 4i64);
        assert!(schema.validate(&mut ok, false).is_ok());
        let mut bad = Record::new().with_field("even", 3i64);
        assert!(schema.validate(&mut bad, false).is_err());
    }

    #[test]
    fn defaults_record() {
        let schema = player_schema();
        let defaults = schema.defaults();
        assert_eq!(defaults.field("level"), Some(&Value::Int(1)));
        assert!(defaults.field("name").is_none());
    }
}
