//! Error types and result definitions for warehouse load operations.
//!
//! [`WarehouseError`] carries a classified [`ErrorKind`], a static description, optional
//! dynamic detail, the originating error, the callsite and a backtrace. Errors raised while
//! loading a table additionally carry the [`LoadStage`] at which the load failed.

use std::backtrace::Backtrace;
use std::borrow::Cow;
use std::error;
use std::fmt;
use std::panic::Location;
use std::sync::Arc;

/// Convenient result type for warehouse operations.
pub type WarehouseResult<T> = Result<T, WarehouseError>;

#[derive(Debug, Clone)]
struct ErrorPayload {
    kind: ErrorKind,
    description: Cow<'static, str>,
    detail: Option<Cow<'static, str>>,
    source: Option<Arc<dyn error::Error + Send + Sync>>,
    stage: Option<LoadStage>,
    location: &'static Location<'static>,
    backtrace: Arc<Backtrace>,
}

/// Main error type of the warehouse engine.
#[derive(Debug, Clone)]
pub struct WarehouseError {
    repr: ErrorRepr,
}

#[derive(Debug, Clone)]
enum ErrorRepr {
    Single(ErrorPayload),
    /// Multiple aggregated errors, e.g. one per table of a multi-table operation.
    Many {
        errors: Vec<WarehouseError>,
        location: &'static Location<'static>,
    },
}

/// Categories of failures raised by the engine.
#[derive(PartialEq, Eq, Copy, Clone, Debug, Hash)]
#[non_exhaustive]
pub enum ErrorKind {
    // Connectivity
    ConnectionFailed,

    // Authorization
    AuthenticationError,
    PermissionDenied,

    // Resource state
    DestinationUnavailable,
    DestinationTableMissing,

    // Schema limits
    ColumnLimitExceeded,

    // Data shape
    ColumnCountMismatch,
    InvalidData,
    DecompressionFailed,
    ConversionError,

    // Execution
    QueryFailed,
    IoError,
    ConfigError,
    InvalidState,

    Unknown,

    /// Raised by fault injection in tests.
    #[cfg(feature = "failpoints")]
    InjectedFault,
}

/// Step of a table load at which an error occurred.
///
/// Attached to load errors and to the rollback metrics of the failed load.
#[derive(PartialEq, Eq, Copy, Clone, Debug, Hash)]
pub enum LoadStage {
    StagingTableCreation,
    CopyInSchema,
    LoadFilesOpening,
    LoadFilesGzipReading,
    LoadFilesCsvReading,
    CsvColumnCountMismatch,
    StagingTableLoading,
    StagingTableLoadStage,
    DedupDeletion,
    DedupInsertion,
    DedupCommit,
}

impl LoadStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoadStage::StagingTableCreation => "staging_table_creation",
            LoadStage::CopyInSchema => "staging_table_copy_in_schema",
            LoadStage::LoadFilesOpening => "load_files_opening",
            LoadStage::LoadFilesGzipReading => "load_files_gzip_reading",
            LoadStage::LoadFilesCsvReading => "load_files_csv_reading",
            LoadStage::CsvColumnCountMismatch => "csv_column_count_mismatch",
            LoadStage::StagingTableLoading => "staging_table_loading",
            LoadStage::StagingTableLoadStage => "staging_table_load_stage",
            LoadStage::DedupDeletion => "dedup_deletion",
            LoadStage::DedupInsertion => "dedup_insertion",
            LoadStage::DedupCommit => "dedup_stage",
        }
    }
}

impl fmt::Display for LoadStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl WarehouseError {
    /// Returns the [`ErrorKind`] of this error.
    ///
    /// For aggregated errors, returns the kind of the first error or [`ErrorKind::Unknown`]
    /// when empty.
    pub fn kind(&self) -> ErrorKind {
        match self.repr {
            ErrorRepr::Single(ref payload) => payload.kind,
            ErrorRepr::Many { ref errors, .. } => errors
                .first()
                .map(|err| err.kind())
                .unwrap_or(ErrorKind::Unknown),
        }
    }

    /// Returns every [`ErrorKind`] contained in this error.
    pub fn kinds(&self) -> Vec<ErrorKind> {
        match self.repr {
            ErrorRepr::Single(ref payload) => vec![payload.kind],
            ErrorRepr::Many { ref errors, .. } => {
                errors.iter().flat_map(|err| err.kinds()).collect()
            }
        }
    }

    pub fn description(&self) -> &str {
        match self.repr {
            ErrorRepr::Single(ref payload) => &payload.description,
            ErrorRepr::Many { .. } => "multiple errors",
        }
    }

    /// Returns the dynamic detail, or the first available one for aggregated errors.
    pub fn detail(&self) -> Option<&str> {
        match self.repr {
            ErrorRepr::Single(ref payload) => payload.detail.as_deref(),
            ErrorRepr::Many { ref errors, .. } => errors.iter().find_map(|e| e.detail()),
        }
    }

    /// Returns the load stage at which the error occurred, if it was raised by a table load.
    pub fn stage(&self) -> Option<LoadStage> {
        match self.repr {
            ErrorRepr::Single(ref payload) => payload.stage,
            ErrorRepr::Many { ref errors, .. } => errors.iter().find_map(|e| e.stage()),
        }
    }

    pub fn backtrace(&self) -> Option<&Backtrace> {
        match self.repr {
            ErrorRepr::Single(ref payload) => Some(payload.backtrace.as_ref()),
            ErrorRepr::Many { .. } => None,
        }
    }

    pub fn location(&self) -> &'static Location<'static> {
        match self.repr {
            ErrorRepr::Single(ref payload) => payload.location,
            ErrorRepr::Many { location, .. } => location,
        }
    }

    /// Attaches an originating error and returns the modified instance.
    ///
    /// Has no effect on aggregated errors, which forward their first error as source.
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: error::Error + Send + Sync + 'static,
    {
        if let ErrorRepr::Single(ref mut payload) = self.repr {
            payload.source = Some(Arc::new(source));
        }
        self
    }

    /// Tags the error with the load stage at which it occurred.
    ///
    /// An already present stage is kept, so the innermost stage wins.
    pub fn with_stage(mut self, stage: LoadStage) -> Self {
        if let ErrorRepr::Single(ref mut payload) = self.repr {
            payload.stage.get_or_insert(stage);
        }
        self
    }

    /// Text used to classify the error.
    ///
    /// Database errors classify on the server message alone, so patterns can anchor to its
    /// start. Other errors combine the description with the detail.
    pub fn classification_text(&self) -> String {
        if let Some(message) = self.database_message() {
            return message.to_string();
        }

        match self.detail() {
            Some(detail) => format!("{}: {detail}", self.description()),
            None => self.description().to_string(),
        }
    }

    /// Message reported by the server when the source is a database error.
    fn database_message(&self) -> Option<&str> {
        let ErrorRepr::Single(payload) = &self.repr else {
            return None;
        };

        payload
            .source
            .as_ref()
            .and_then(|source| source.downcast_ref::<sqlx::Error>())
            .and_then(sqlx::Error::as_database_error)
            .map(|db_err| db_err.message())
    }

    #[track_caller]
    fn from_components(
        kind: ErrorKind,
        description: Cow<'static, str>,
        detail: Option<Cow<'static, str>>,
        source: Option<Arc<dyn error::Error + Send + Sync>>,
    ) -> Self {
        WarehouseError {
            repr: ErrorRepr::Single(ErrorPayload {
                kind,
                description,
                detail,
                source,
                stage: None,
                location: Location::caller(),
                backtrace: Arc::new(Backtrace::capture()),
            }),
        }
    }
}

impl PartialEq for WarehouseError {
    fn eq(&self, other: &WarehouseError) -> bool {
        match (&self.repr, &other.repr) {
            (ErrorRepr::Single(a), ErrorRepr::Single(b)) => a.kind == b.kind && a.stage == b.stage,
            (ErrorRepr::Many { errors: a, .. }, ErrorRepr::Many { errors: b, .. }) => a == b,
            _ => false,
        }
    }
}

impl fmt::Display for WarehouseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.repr {
            ErrorRepr::Single(payload) => {
                let location = payload.location;
                write!(f, "[{:?}] {}", payload.kind, payload.description)?;
                if let Some(stage) = payload.stage {
                    write!(f, " (stage: {stage})")?;
                }
                write!(
                    f,
                    " @ {}:{}:{}",
                    location.file(),
                    location.line(),
                    location.column()
                )?;

                write_detail(payload.detail.as_deref(), f)?;
                write_backtrace(payload.backtrace.as_ref(), f)?;

                Ok(())
            }
            ErrorRepr::Many { errors, location } => {
                let count = errors.len();
                write!(
                    f,
                    "[Many] {} error{} aggregated @ {}:{}:{}",
                    count,
                    if count == 1 { "" } else { "s" },
                    location.file(),
                    location.line(),
                    location.column()
                )?;

                for (index, error) in errors.iter().enumerate() {
                    let rendered = error.to_string();
                    let mut lines = rendered.lines();
                    write!(f, "\n  {}. {}", index + 1, lines.next().unwrap_or_default())?;
                    for line in lines {
                        write!(f, "\n     {line}")?;
                    }
                }

                Ok(())
            }
        }
    }
}

impl error::Error for WarehouseError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match &self.repr {
            ErrorRepr::Single(payload) => payload
                .source
                .as_ref()
                .map(|source| source as &(dyn error::Error + 'static)),
            ErrorRepr::Many { errors, .. } => errors
                .first()
                .map(|error| error as &(dyn error::Error + 'static)),
        }
    }
}

fn write_backtrace(backtrace: &Backtrace, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let rendered = backtrace.to_string();
    if rendered.trim().is_empty() {
        return Ok(());
    }

    write!(f, "\n  Backtrace:")?;
    for line in rendered.lines() {
        write!(f, "\n    {line}")?;
    }

    Ok(())
}

fn write_detail(detail: Option<&str>, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let Some(detail) = detail else {
        return Ok(());
    };

    write!(f, "\n  Detail:")?;
    for line in detail.lines() {
        write!(f, "\n    {line}")?;
    }

    Ok(())
}

impl From<(ErrorKind, &'static str)> for WarehouseError {
    #[track_caller]
    fn from((kind, desc): (ErrorKind, &'static str)) -> WarehouseError {
        WarehouseError::from_components(kind, Cow::Borrowed(desc), None, None)
    }
}

impl<D> From<(ErrorKind, &'static str, D)> for WarehouseError
where
    D: Into<Cow<'static, str>>,
{
    #[track_caller]
    fn from((kind, desc, detail): (ErrorKind, &'static str, D)) -> WarehouseError {
        WarehouseError::from_components(kind, Cow::Borrowed(desc), Some(detail.into()), None)
    }
}

/// Aggregates errors; a single error is returned unwrapped.
impl<E> From<Vec<E>> for WarehouseError
where
    E: Into<WarehouseError>,
{
    #[track_caller]
    fn from(errors: Vec<E>) -> WarehouseError {
        let location = Location::caller();

        let mut errors: Vec<WarehouseError> = errors.into_iter().map(Into::into).collect();
        if errors.len() == 1 {
            if let Some(error) = errors.pop() {
                return error;
            }
        }

        WarehouseError {
            repr: ErrorRepr::Many { errors, location },
        }
    }
}

impl From<std::io::Error> for WarehouseError {
    #[track_caller]
    fn from(err: std::io::Error) -> WarehouseError {
        let detail = err.to_string();
        WarehouseError::from_components(
            ErrorKind::IoError,
            Cow::Borrowed("I/O operation failed"),
            Some(Cow::Owned(detail)),
            Some(Arc::new(err)),
        )
    }
}

impl From<serde_json::Error> for WarehouseError {
    #[track_caller]
    fn from(err: serde_json::Error) -> WarehouseError {
        let (kind, description) = match err.classify() {
            serde_json::error::Category::Io => (ErrorKind::IoError, "JSON I/O operation failed"),
            _ => (ErrorKind::InvalidData, "JSON deserialization failed"),
        };

        let detail = err.to_string();
        WarehouseError::from_components(
            kind,
            Cow::Borrowed(description),
            Some(Cow::Owned(detail)),
            Some(Arc::new(err)),
        )
    }
}

/// Converts [`csv::Error`], mapping read failures of the underlying stream to
/// [`ErrorKind::DecompressionFailed`] and everything else to [`ErrorKind::InvalidData`].
impl From<csv::Error> for WarehouseError {
    #[track_caller]
    fn from(err: csv::Error) -> WarehouseError {
        let (kind, description) = match err.kind() {
            csv::ErrorKind::Io(_) => (
                ErrorKind::DecompressionFailed,
                "Load file decompression failed",
            ),
            _ => (ErrorKind::InvalidData, "Load file CSV decoding failed"),
        };

        let detail = err.to_string();
        WarehouseError::from_components(
            kind,
            Cow::Borrowed(description),
            Some(Cow::Owned(detail)),
            Some(Arc::new(err)),
        )
    }
}

/// Converts [`sqlx::Error`], classifying database errors by SQLSTATE.
impl From<sqlx::Error> for WarehouseError {
    #[track_caller]
    fn from(err: sqlx::Error) -> WarehouseError {
        let (kind, description) = match &err {
            sqlx::Error::Database(db_err) => match db_err.code() {
                Some(code) => classify_sqlstate(&code),
                None => (ErrorKind::QueryFailed, "Postgres statement failed"),
            },
            sqlx::Error::Io(_) => (ErrorKind::IoError, "Postgres connection I/O failed"),
            sqlx::Error::Tls(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => (
                ErrorKind::ConnectionFailed,
                "Postgres connection failed",
            ),
            sqlx::Error::Configuration(_) => {
                (ErrorKind::ConfigError, "Postgres connection is misconfigured")
            }
            sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
                (ErrorKind::ConversionError, "Postgres value decoding failed")
            }
            _ => (ErrorKind::QueryFailed, "Postgres operation failed"),
        };

        let detail = err.to_string();
        WarehouseError::from_components(
            kind,
            Cow::Borrowed(description),
            Some(Cow::Owned(detail)),
            Some(Arc::new(err)),
        )
    }
}

fn classify_sqlstate(code: &str) -> (ErrorKind, &'static str) {
    match code {
        // too_many_columns
        "54011" => (
            ErrorKind::ColumnLimitExceeded,
            "Postgres column limit exceeded",
        ),
        // invalid_authorization_specification, invalid_password
        "28000" | "28P01" => (
            ErrorKind::AuthenticationError,
            "Postgres authentication failed",
        ),
        // insufficient_privilege
        "42501" => (ErrorKind::PermissionDenied, "Postgres permission denied"),
        // undefined_table, invalid_schema_name, invalid_catalog_name
        "42P01" | "3F000" | "3D000" => (
            ErrorKind::DestinationTableMissing,
            "Postgres relation does not exist",
        ),
        // admin_shutdown, crash_shutdown, cannot_connect_now, read_only_sql_transaction
        "57P01" | "57P02" | "57P03" | "25006" => (
            ErrorKind::DestinationUnavailable,
            "Postgres is not accepting writes",
        ),
        code if code.starts_with("08") => {
            (ErrorKind::ConnectionFailed, "Postgres connection failed")
        }
        code if code.starts_with("22") => (
            ErrorKind::ConversionError,
            "Postgres data conversion failed",
        ),
        code if code.starts_with("23") => {
            (ErrorKind::InvalidData, "Postgres constraint violation")
        }
        _ => (ErrorKind::QueryFailed, "Postgres statement failed"),
    }
}
