//! Normalized scanner findings.

use serde::{Deserialize, Serialize};

/// Severity reported by a scanner, ordered from most to least severe.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Exploitable now; fix before release.
    Critical,
    /// Serious weakness.
    High,
    /// Worth fixing.
    Medium,
    /// Minor.
    Low,
    /// Informational only.
    Info,
}

/// Where a finding was observed.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    /// Path relative to the scanned target, when the finding maps to a file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// 1-based line within `path`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    /// Package or image coordinate for findings that are not file-bound.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub component: Option<String>,
}

impl Location {
    /// A file-bound location.
    pub fn file(path: impl Into<String>, line: Option<u32>) -> Self {
        Self {
            path: Some(path.into()),
            line,
            component: None,
        }
    }

    /// A package or image coordinate.
    pub fn component(component: impl Into<String>) -> Self {
        Self {
            path: None,
            line: None,
            component: Some(component.into()),
        }
    }
}

/// A single result produced by a scanner adapter.
///
/// The engine treats findings as opaque beyond these fields; adapter-specific
/// detail rides along in `metadata`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    /// Scanner that reported it.
    pub scanner: String,
    /// Scanner-assigned severity.
    pub severity: Severity,
    /// One-line summary.
    pub title: String,
    /// Where it was observed.
    pub location: Location,
    /// Scanner rule identifier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule_id: Option<String>,
    /// Longer explanation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Adapter-specific detail.
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub metadata: serde_json::Value,
}

impl Finding {
    /// A finding with no rule, description or metadata.
    pub fn new(
        scanner: impl Into<String>,
        severity: Severity,
        title: impl Into<String>,
        location: Location,
    ) -> Self {
        Self {
            scanner: scanner.into(),
            severity,
            title: title.into(),
            location,
            rule_id: None,
            description: None,
            metadata: serde_json::Value::Null,
        }
    }

    /// Sets the rule identifier.
    pub fn with_rule(mut self, rule_id: impl Into<String>) -> Self {
        self.rule_id = Some(rule_id.into());
        self
    }
}
