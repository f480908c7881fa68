//! Maps raw driver failure text to a coarse error taxonomy used for retry and alerting.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;

/// Semantic category of a failed warehouse job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobErrorKind {
    ResourceNotFound,
    Permission,
    ColumnCount,
    Unknown,
}

impl JobErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobErrorKind::ResourceNotFound => "resource_not_found",
            JobErrorKind::Permission => "permission",
            JobErrorKind::ColumnCount => "column_count",
            JobErrorKind::Unknown => "unknown",
        }
    }
}

impl fmt::Display for JobErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failure-text pattern paired with the kind it classifies to.
#[derive(Debug)]
pub struct JobError {
    pub kind: JobErrorKind,
    pub pattern: Regex,
}

const PATTERNS: &[(JobErrorKind, &str)] = &[
    (
        JobErrorKind::ResourceNotFound,
        r"no such host|failed to lookup address information",
    ),
    (JobErrorKind::Permission, r"[Cc]onnection refused"),
    (JobErrorKind::ResourceNotFound, r"^database .* does not exist"),
    (
        JobErrorKind::ResourceNotFound,
        r"the database system is starting up",
    ),
    (
        JobErrorKind::ResourceNotFound,
        r"the database system is shutting down",
    ),
    (JobErrorKind::ResourceNotFound, r"^relation .* does not exist"),
    (
        JobErrorKind::ResourceNotFound,
        r"cannot set transaction read-write mode during recovery",
    ),
    (
        JobErrorKind::ColumnCount,
        r"tables can have at most 1600 columns",
    ),
    (
        JobErrorKind::Permission,
        r"password authentication failed for user",
    ),
    (JobErrorKind::Permission, r"permission denied"),
];

static ERROR_MAPPINGS: LazyLock<Vec<JobError>> = LazyLock::new(|| {
    PATTERNS
        .iter()
        .filter_map(|(kind, pattern)| {
            Regex::new(pattern).ok().map(|pattern| JobError {
                kind: *kind,
                pattern,
            })
        })
        .collect()
});

/// Returns the ordered classification table. Earlier entries take precedence.
pub fn error_mappings() -> &'static [JobError] {
    &ERROR_MAPPINGS
}

/// Classifies `text` with the first matching entry of [`error_mappings`].
pub fn classify(text: &str) -> JobErrorKind {
    error_mappings()
        .iter()
        .find(|mapping| mapping.pattern.is_match(text))
        .map(|mapping| mapping.kind)
        .unwrap_or(JobErrorKind::Unknown)
}
