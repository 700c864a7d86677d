//! Configuration checks run before planning.

use cachet_core::{AttributePath, IntoDiagnostic, Value};

use crate::{Presence, Schema};

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum ValidationIssue {
    #[error("A {0} attribute containing a valid value is required.")]
    MissingRequiredAttribute(String),
    #[error("The {0} attribute is determined by the provider and cannot be set in configuration.")]
    ComputedAttributeConfigured(String),
}

impl IntoDiagnostic for ValidationIssue {
    fn summary(&self) -> &'static str {
        match self {
            ValidationIssue::MissingRequiredAttribute(_) => "Missing required attribute in resource configuration",
            ValidationIssue::ComputedAttributeConfigured(_) => "Computed attribute set in resource configuration",
        }
    }

    fn attribute(&self) -> Option<AttributePath> {
        match self {
            ValidationIssue::MissingRequiredAttribute(name) | ValidationIssue::ComputedAttributeConfigured(name) => {
                Some(AttributePath::root(name))
            }
        }
    }
}

/// Check a decoded configuration object against `schema`.
///
/// A null or wholly unknown configuration has nothing to check. An unknown
/// attribute value counts as present.
pub fn validate_config(schema: &Schema, config: &Value) -> Vec<ValidationIssue> {
    if config.is_null() || config.is_unknown() {
        return Vec::new();
    }
    let mut issues = Vec::new();
    for attr in &schema.block.attributes {
        let v = config.get(&attr.name).unwrap_or(&Value::Null);
        match attr.presence {
            Presence::Required if v.is_null() => {
                issues.push(ValidationIssue::MissingRequiredAttribute(attr.name.clone()));
            }
            Presence::Computed if !v.is_null() => {
                issues.push(ValidationIssue::ComputedAttributeConfigured(attr.name.clone()));
            }
            _ => {}
        }
    }
    if !issues.is_empty() {
        tracing::debug!(issues = issues.len(), "configuration rejected");
    }
    issues
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{cache_store_schema, SchemaVersion};

    fn schema() -> Schema { cache_store_schema(SchemaVersion::LATEST) }

    #[test]
    fn value_is_required() {
        let cfg = Value::object([("value", Value::Null), ("timestamp", Value::Null), ("keepers", Value::Null)]);
        let issues = validate_config(&schema(), &cfg);
        assert_eq!(issues, vec![ValidationIssue::MissingRequiredAttribute("value".into())]);
        let d = issues[0].to_diagnostic();
        assert_eq!(d.attribute, Some(AttributePath::root("value")));
    }

    #[test]
    fn absent_value_is_missing_too() {
        let issues = validate_config(&schema(), &Value::empty_map());
        assert_eq!(issues, vec![ValidationIssue::MissingRequiredAttribute("value".into())]);
    }

    #[test]
    fn unknown_value_counts_as_present() {
        let cfg = Value::object([("value", Value::Unknown), ("timestamp", Value::Null), ("keepers", Value::Null)]);
        assert!(validate_config(&schema(), &cfg).is_empty());
    }

    #[test]
    fn computed_timestamp_cannot_be_configured() {
        let cfg = Value::object([("value", Value::from("abc")), ("timestamp", Value::from("1"))]);
        assert_eq!(
            validate_config(&schema(), &cfg),
            vec![ValidationIssue::ComputedAttributeConfigured("timestamp".into())]
        );
    }

    #[test]
    fn null_config_has_nothing_to_check() {
        assert!(validate_config(&schema(), &Value::Null).is_empty());
        assert!(validate_config(&schema(), &Value::Unknown).is_empty());
    }
}
