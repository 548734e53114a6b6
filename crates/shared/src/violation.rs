use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Which policy rule a piece of source text broke.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationRule {
    Syntax,
    SourceTooLarge,
    DisallowedImport,
    NetworkImport,
    RelativeImport,
    DynamicEvaluation,
    DangerousCall,
    IntrospectionAttribute,
}

impl std::fmt::Display for ViolationRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Syntax => "syntax",
            Self::SourceTooLarge => "source_too_large",
            Self::DisallowedImport => "disallowed_import",
            Self::NetworkImport => "network_import",
            Self::RelativeImport => "relative_import",
            Self::DynamicEvaluation => "dynamic_evaluation",
            Self::DangerousCall => "dangerous_call",
            Self::IntrospectionAttribute => "introspection_attribute",
        };
        f.write_str(s)
    }
}

/// Position of a violation in the submitted source (1-based).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Location {
    Line { line: usize, column: usize },
    Unknown,
}

impl std::fmt::Display for Location {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Line { line, column } => write!(f, "line {line}, column {column}"),
            Self::Unknown => f.write_str("(unknown)"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    pub rule: ViolationRule,
    pub message: String,
    pub location: Location,
}

impl Violation {
    pub fn new(rule: ViolationRule, message: impl Into<String>, location: Location) -> Self {
        Self {
            rule,
            message: message.into(),
            location,
        }
    }
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {} [{}]", self.location, self.message, self.rule)
    }
}

pub(crate) fn join(violations: &[Violation]) -> String {
    violations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Outcome of a validation pass. Never an error: parse failures are violations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationResult {
    Valid,
    Invalid(Vec<Violation>),
}

impl ValidationResult {
    #[must_use]
    pub fn is_valid(&self) -> bool {
        matches!(self, Self::Valid)
    }

    #[must_use]
    pub fn violations(&self) -> &[Violation] {
        match self {
            Self::Valid => &[],
            Self::Invalid(v) => v,
        }
    }

    /// Persistable form, stamped with the time of the check.
    #[must_use]
    pub fn to_status(&self, checked_at: DateTime<Utc>) -> ValidationStatus {
        ValidationStatus {
            valid: self.is_valid(),
            violations: self.violations().to_vec(),
            checked_at,
        }
    }
}

/// Validation outcome as recorded in the manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationStatus {
    pub valid: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub violations: Vec<Violation>,
    pub checked_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_location_renders_placeholder() {
        let v = Violation::new(ViolationRule::Syntax, "could not parse source", Location::Unknown);
        assert_eq!(v.to_string(), "(unknown): could not parse source [syntax]");
    }

    #[test]
    fn test_invalid_result_status() {
        let now = Utc::now();
        let result = ValidationResult::Invalid(vec![Violation::new(
            ViolationRule::DisallowedImport,
            "import 'subprocess' is not allowed",
            Location::Line { line: 1, column: 1 },
        )]);
        let status = result.to_status(now);
        assert!(!status.valid);
        assert_eq!(status.violations.len(), 1);
        assert_eq!(status.checked_at, now);
    }

    #[test]
    fn test_valid_status_omits_violations_field() {
        let status = ValidationResult::Valid.to_status(Utc::now());
        let json = serde_json::to_value(&status).unwrap();
        assert!(json.get("violations").is_none());
        assert_eq!(json["valid"], true);
    }
}
