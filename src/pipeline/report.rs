//! Human-readable run report.

use crate::stages::validate::MaterialReadiness;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use tracing::{info, warn};

/// Severity of a user-facing notice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
}

/// A non-blocking notice surfaced to the user.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notice {
    pub severity: Severity,
    pub message: String,
}

impl fmt::Display for Notice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.severity {
            Severity::Info => write!(f, "INFO: {}", self.message),
            Severity::Warning => write!(f, "WARNING: {}", self.message),
        }
    }
}

/// Append-only record of what a run did.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PipelineReport {
    /// Short summary fragments, e.g. "Decimated 4 objects (62% reduction)".
    pub fragments: Vec<String>,
    pub notices: Vec<Notice>,
    /// Materials that failed readiness analysis, in analysis order.
    pub unsupported_materials: Vec<String>,
    /// Readiness per analysed material.
    pub materials: BTreeMap<String, MaterialReadiness>,
    /// Face counts before/after reduction, per reduced entity.
    pub reductions: BTreeMap<String, (usize, usize)>,
}

impl PipelineReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fragment(&mut self, text: impl Into<String>) {
        let text = text.into();
        info!(summary = %text, "Stage summary");
        self.fragments.push(text);
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        let message = message.into();
        warn!("{}", message);
        self.notices.push(Notice {
            severity: Severity::Warning,
            message,
        });
    }

    pub fn info(&mut self, message: impl Into<String>) {
        let message = message.into();
        info!("{}", message);
        self.notices.push(Notice {
            severity: Severity::Info,
            message,
        });
    }

    pub fn warnings(&self) -> impl Iterator<Item = &str> {
        self.notices
            .iter()
            .filter(|n| n.severity == Severity::Warning)
            .map(|n| n.message.as_str())
    }

    pub fn has_warning_containing(&self, needle: &str) -> bool {
        self.warnings().any(|w| w.contains(needle))
    }

    /// Fragments joined for a one-line summary, e.g. `" (A, B)"`; empty when there are none.
    pub fn summary_suffix(&self) -> String {
        if self.fragments.is_empty() {
            String::new()
        } else {
            format!(" ({})", self.fragments.join(", "))
        }
    }
}

/// List at most five names, then "(+N more)".
pub fn capped_list(names: &[String]) -> String {
    const SHOWN: usize = 5;
    let mut list = names.iter().take(SHOWN).cloned().collect::<Vec<_>>().join(", ");
    if names.len() > SHOWN {
        list.push_str(&format!(" (+{} more)", names.len() - SHOWN));
    }
    list
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capped_list() {
        let names: Vec<String> = (1..=7).map(|i| format!("M{}", i)).collect();
        assert_eq!(capped_list(&names), "M1, M2, M3, M4, M5 (+2 more)");
        assert_eq!(capped_list(&names[..2]), "M1, M2");
    }

    #[test]
    fn test_summary_suffix() {
        let mut report = PipelineReport::new();
        assert_eq!(report.summary_suffix(), "");
        report.fragment("Uncompressed");
        report.fragment("Removed 2 unused materials");
        assert_eq!(report.summary_suffix(), " (Uncompressed, Removed 2 unused materials)");
    }

    #[test]
    fn test_warnings_filter() {
        let mut report = PipelineReport::new();
        report.info("hello");
        report.warn("Cube: repair failed");
        assert_eq!(report.warnings().collect::<Vec<_>>(), vec!["Cube: repair failed"]);
        assert!(report.has_warning_containing("repair"));
    }
}
