// Diagnostics - per-record problems collected alongside results
//
// A malformed row never aborts a batch. Each problem becomes a Diagnostic in a
// DiagnosticSink, and the sink travels next to the result set it describes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

// ============================================================================
// KIND & SEVERITY
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DiagnosticKind {
    /// CNPJ could not be parsed into digits; the record is excluded from joins
    InvalidIdentifier,

    /// Contradictory scalar values inside one dedup group; newest import kept
    ConflictingField,

    /// Market record without a registry counterpart
    UnregisteredInSource,

    /// Explicit `data_migracao` marker with no profile change at that period
    InconsistentMigrationMarker,
}

impl DiagnosticKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiagnosticKind::InvalidIdentifier => "InvalidIdentifier",
            DiagnosticKind::ConflictingField => "ConflictingField",
            DiagnosticKind::UnregisteredInSource => "UnregisteredInSource",
            DiagnosticKind::InconsistentMigrationMarker => "InconsistentMigrationMarker",
        }
    }

    pub fn default_severity(&self) -> Severity {
        match self {
            DiagnosticKind::InvalidIdentifier => Severity::Critical,
            DiagnosticKind::ConflictingField => Severity::Warning,
            DiagnosticKind::UnregisteredInSource => Severity::Info,
            DiagnosticKind::InconsistentMigrationMarker => Severity::Warning,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Severity {
    Critical, // Record could not be used at all
    Warning,  // Record used, but a value was chosen or questioned
    Info,     // Flagged state, nothing wrong with the data
}

// ============================================================================
// DIAGNOSTIC
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Diagnostic {
    pub id: String,
    pub kind: DiagnosticKind,
    pub severity: Severity,

    /// Logical table the record came from
    pub source_table: String,

    /// Record key as it appeared (raw CNPJ, or root/full/period)
    pub key: String,

    /// Offending field, when the problem is field-level
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,

    pub message: String,
    pub recorded_at: DateTime<Utc>,
}

impl Diagnostic {
    pub fn new(kind: DiagnosticKind, source_table: &str, key: &str, message: String) -> Self {
        Diagnostic {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            severity: kind.default_severity(),
            source_table: source_table.to_string(),
            key: key.to_string(),
            field: None,
            message,
            recorded_at: Utc::now(),
        }
    }

    pub fn with_field(mut self, field: &str) -> Self {
        self.field = Some(field.to_string());
        self
    }
}

// ============================================================================
// SINK
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiagnosticSink {
    entries: Vec<Diagnostic>,
}

impl DiagnosticSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, diagnostic: Diagnostic) {
        match diagnostic.severity {
            Severity::Critical | Severity::Warning => warn!(
                kind = diagnostic.kind.as_str(),
                table = %diagnostic.source_table,
                key = %diagnostic.key,
                "{}",
                diagnostic.message
            ),
            Severity::Info => debug!(
                kind = diagnostic.kind.as_str(),
                table = %diagnostic.source_table,
                key = %diagnostic.key,
                "{}",
                diagnostic.message
            ),
        }
        self.entries.push(diagnostic);
    }

    /// Merge another sink (e.g. one partition's diagnostics) into this one
    pub fn merge(&mut self, other: DiagnosticSink) {
        self.entries.extend(other.entries);
    }

    pub fn entries(&self) -> &[Diagnostic] {
        &self.entries
    }

    pub fn of_kind(&self, kind: DiagnosticKind) -> impl Iterator<Item = &Diagnostic> {
        self.entries.iter().filter(move |d| d.kind == kind)
    }

    pub fn count(&self, kind: DiagnosticKind) -> usize {
        self.of_kind(kind).count()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn summary(&self) -> DiagnosticSummary {
        DiagnosticSummary {
            total: self.entries.len(),
            invalid_identifiers: self.count(DiagnosticKind::InvalidIdentifier),
            conflicting_fields: self.count(DiagnosticKind::ConflictingField),
            unregistered_in_source: self.count(DiagnosticKind::UnregisteredInSource),
            inconsistent_markers: self.count(DiagnosticKind::InconsistentMigrationMarker),
            critical: self
                .entries
                .iter()
                .filter(|d| d.severity == Severity::Critical)
                .count(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagnosticSummary {
    pub total: usize,
    pub invalid_identifiers: usize,
    pub conflicting_fields: usize,
    pub unregistered_in_source: usize,
    pub inconsistent_markers: usize,
    pub critical: usize,
}

impl DiagnosticSummary {
    pub fn describe(&self) -> String {
        format!(
            "Diagnostics: {} ({} critical) | invalid ids {} | conflicts {} | unregistered {} | marker mismatches {}",
            self.total,
            self.critical,
            self.invalid_identifiers,
            self.conflicting_fields,
            self.unregistered_in_source,
            self.inconsistent_markers
        )
    }

    pub fn has_critical(&self) -> bool {
        self.critical > 0
    }
}

// ============================================================================
// TESTS
// ============================================================================
