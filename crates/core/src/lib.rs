//! Cachet core types shared by every engine crate.
//!
//! - [`Value`] / [`Type`]: the structured value model and its structural descriptor
//! - [`AttributePath`]: pinpoints a field inside a value
//! - [`Diagnostic`]: the error/warning record returned at the boundary

#![forbid(unsafe_code)]

use std::fmt;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

pub mod value;

pub use value::{Type, Value};

pub mod prelude {
    pub use super::{AttributePath, Diagnostic, Diagnostics, IntoDiagnostic, PathStep, Severity, Type, Value};
}

/// One step of an [`AttributePath`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PathStep {
    /// Named attribute of an object.
    Attribute(String),
    /// Key of a map element.
    ElementKey(String),
    /// Index of a list element.
    ElementIndex(u64),
}

/// Sequence of steps from the root of a record to one of its fields.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AttributePath {
    steps: SmallVec<[PathStep; 4]>,
}

impl AttributePath {
    pub fn new() -> Self { Self::default() }

    pub fn root(name: &str) -> Self {
        let mut p = Self::new();
        p.push(PathStep::Attribute(name.to_string()));
        p
    }

    pub fn with_attribute(mut self, name: &str) -> Self { self.push(PathStep::Attribute(name.to_string())); self }
    pub fn with_key(mut self, key: &str) -> Self { self.push(PathStep::ElementKey(key.to_string())); self }
    pub fn with_index(mut self, idx: u64) -> Self { self.push(PathStep::ElementIndex(idx)); self }

    pub fn push(&mut self, step: PathStep) { self.steps.push(step); }
    pub fn pop(&mut self) -> Option<PathStep> { self.steps.pop() }

    pub fn steps(&self) -> &[PathStep] { &self.steps }
    pub fn is_empty(&self) -> bool { self.steps.is_empty() }
}

impl fmt::Display for AttributePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.steps.is_empty() {
            return f.write_str("(root)");
        }
        for (i, step) in self.steps.iter().enumerate() {
            match step {
                PathStep::Attribute(name) if i == 0 => write!(f, "{}", name)?,
                PathStep::Attribute(name) => write!(f, ".{}", name)?,
                PathStep::ElementKey(key) => write!(f, "[{:?}]", key)?,
                PathStep::ElementIndex(idx) => write!(f, "[{}]", idx)?,
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
}

/// Structured error/warning attached to a boundary response.
///
/// A response carrying an error diagnostic and no state is a soft failure:
/// the call itself still succeeds at the transport level.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub severity: Severity,
    pub summary: String,
    pub detail: String,
    pub attribute: Option<AttributePath>,
}

pub type Diagnostics = Vec<Diagnostic>;

impl Diagnostic {
    pub fn error(summary: impl Into<String>, detail: impl Into<String>) -> Self {
        Self { severity: Severity::Error, summary: summary.into(), detail: detail.into(), attribute: None }
    }

    pub fn warning(summary: impl Into<String>, detail: impl Into<String>) -> Self {
        Self { severity: Severity::Warning, summary: summary.into(), detail: detail.into(), attribute: None }
    }

    pub fn at(mut self, path: AttributePath) -> Self {
        self.attribute = Some(path);
        self
    }

    pub fn is_error(&self) -> bool { self.severity == Severity::Error }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sev = match self.severity { Severity::Error => "error", Severity::Warning => "warning" };
        write!(f, "{}: {}", sev, self.summary)?;
        if !self.detail.is_empty() {
            write!(f, ": {}", self.detail)?;
        }
        if let Some(path) = &self.attribute {
            write!(f, " (at {})", path)?;
        }
        Ok(())
    }
}

/// True when any diagnostic in the list has error severity.
pub fn has_errors(diags: &[Diagnostic]) -> bool {
    diags.iter().any(Diagnostic::is_error)
}

/// Errors that surface to the caller as a diagnostic rather than a transport failure.
pub trait IntoDiagnostic: std::error::Error {
    /// Short, fixed summary line for this failure.
    fn summary(&self) -> &'static str;

    /// Offending field, when the failure can be pinned to one.
    fn attribute(&self) -> Option<AttributePath> { None }

    fn to_diagnostic(&self) -> Diagnostic {
        Diagnostic {
            severity: Severity::Error,
            summary: self.summary().to_string(),
            detail: self.to_string(),
            attribute: self.attribute(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attribute_path_renders_steps() {
        let p = AttributePath::root("keepers").with_key("k");
        assert_eq!(p.to_string(), "keepers[\"k\"]");
        let p = AttributePath::root("block").with_index(0).with_attribute("name");
        assert_eq!(p.to_string(), "block[0].name");
        assert_eq!(AttributePath::new().to_string(), "(root)");
    }

    #[test]
    fn diagnostic_display_includes_path() {
        let d = Diagnostic::error("Missing required attribute", "value must be set").at(AttributePath::root("value"));
        assert_eq!(d.to_string(), "error: Missing required attribute: value must be set (at value)");
        assert!(has_errors(&[Diagnostic::warning("w", ""), d]));
        assert!(!has_errors(&[Diagnostic::warning("w", "")]));
    }
}
