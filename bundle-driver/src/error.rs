use std::backtrace::Backtrace;
use std::error::Error as StdError;
use std::fmt;

use tracing_error::SpanTrace;

/// Categorizes storage errors by their semantic meaning, independent of
/// the backend that produced them.
///
/// The registry engine relies on this to translate storage failures into
/// HTTP status codes without inspecting error messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageErrorKind {
    /// The requested path was not found in the backend.
    ///
    /// For overlay backends this means every configured source missed.
    NotFound,

    /// The operation is not supported by this backend.
    ///
    /// Bundle archives are immutable, so every mutating call fails with
    /// this kind, as does reading from a nonzero offset.
    Unsupported,

    /// The backend configuration was invalid at construction time.
    ///
    /// Fatal at startup; never produced by request-time operations. The
    /// message lists every violation found, not just the first.
    InvalidConfig,

    /// The operation failed due to I/O: an unreadable or corrupt archive,
    /// a decompression failure, or a filesystem error.
    ///
    /// Never retried automatically; a corrupt bundle will not become valid
    /// on a second read.
    Io,

    /// An unexpected or uncategorized error occurred.
    Other,
}

impl StorageErrorKind {
    /// Returns whether this error means the path simply does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageErrorKind::NotFound)
    }

    /// Returns whether this error indicates a caller fault (unsupported
    /// operation or invalid configuration) rather than a storage fault.
    pub fn is_client_fault(&self) -> bool {
        matches!(
            self,
            StorageErrorKind::Unsupported | StorageErrorKind::InvalidConfig
        )
    }
}

impl fmt::Display for StorageErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageErrorKind::NotFound => write!(f, "path not found"),
            StorageErrorKind::Unsupported => write!(f, "operation not supported"),
            StorageErrorKind::InvalidConfig => write!(f, "invalid configuration"),
            StorageErrorKind::Io => write!(f, "I/O error"),
            StorageErrorKind::Other => write!(f, "other error"),
        }
    }
}

#[derive(Debug)]
struct ErrorTrace {
    /// Captured backtrace. Capture is controlled by RUST_BACKTRACE.
    backtrace: Backtrace,

    /// Captured span trace, giving the logical async call stack at the
    /// point where the error was created.
    span_trace: SpanTrace,
}

impl ErrorTrace {
    #[track_caller]
    fn capture() -> Self {
        ErrorTrace {
            backtrace: Backtrace::capture(),
            span_trace: SpanTrace::capture(),
        }
    }
}

/// Storage error carrying semantic kind, originating engine, and path
/// context, with backtrace and span-trace capture for diagnostics.
///
/// # Example
///
/// ```rust
/// use bundle_driver::{StorageError, StorageErrorKind};
///
/// fn read_entry() -> Result<(), StorageError> {
///     let result = std::fs::File::open("missing.tar");
///
///     match result {
///         Err(err) => Err(StorageError::builder("bundle", StorageErrorKind::Io, err)
///             .path("docker/registry/v2/repositories/foo")
///             .build()),
///         Ok(_) => Ok(()),
///     }
/// }
/// ```
#[derive(Debug)]
pub struct StorageError {
    /// The semantic category of this error.
    kind: StorageErrorKind,

    /// The name of the storage engine that produced this error.
    engine: &'static str,

    /// The logical path involved, if applicable.
    path: Option<String>,

    /// Additional context about the error.
    context: Option<String>,

    /// The underlying error.
    source: Box<dyn StdError + Send + Sync + 'static>,

    /// Traces
    traces: Box<ErrorTrace>,
}

impl StdError for StorageError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        Some(self.source.as_ref())
    }
}

impl StorageError {
    /// Create a new storage error with the minimum required information.
    ///
    /// For more control, use `StorageError::builder()`.
    pub fn new<E>(engine: &'static str, kind: StorageErrorKind, error: E) -> Self
    where
        E: Into<Box<dyn StdError + Send + Sync + 'static>>,
    {
        Self {
            kind,
            engine,
            path: None,
            context: None,
            source: error.into(),
            traces: Box::new(ErrorTrace::capture()),
        }
    }

    /// Create a builder for constructing a storage error with full context.
    pub fn builder<E>(engine: &'static str, kind: StorageErrorKind, error: E) -> StorageErrorBuilder
    where
        E: Into<Box<dyn StdError + Send + Sync + 'static>>,
    {
        StorageErrorBuilder {
            engine,
            kind,
            source: error.into(),
            path: None,
            context: None,
        }
    }

    /// Returns a closure that creates a storage error from a downstream
    /// error, for use with `.map_err()`.
    ///
    /// # Example
    ///
    /// ```rust
    /// use bundle_driver::{StorageError, StorageErrorKind};
    ///
    /// fn operation() -> Result<(), StorageError> {
    ///     std::fs::File::open("bundle.tar")
    ///         .map_err(StorageError::with("bundle", StorageErrorKind::Io))?;
    ///     Ok(())
    /// }
    /// ```
    pub fn with<E>(
        engine: &'static str,
        kind: StorageErrorKind,
    ) -> Box<dyn FnOnce(E) -> StorageError + Send + Sync>
    where
        E: Into<Box<dyn StdError + Send + Sync + 'static>>,
    {
        Box::new(move |error: E| StorageError::new(engine, kind, error))
    }

    /// Create a not-found error for the given path.
    pub fn not_found(engine: &'static str, path: impl Into<String>) -> Self {
        let path = path.into();
        StorageError::builder(
            engine,
            StorageErrorKind::NotFound,
            std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("path not found: {path}"),
            ),
        )
        .path(path)
        .build()
    }

    /// Returns the error kind.
    pub fn kind(&self) -> StorageErrorKind {
        self.kind
    }

    /// Returns the storage engine name.
    pub fn engine(&self) -> &'static str {
        self.engine
    }

    /// Returns the logical path, if available.
    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    /// Returns additional context, if available.
    pub fn context(&self) -> Option<&str> {
        self.context.as_deref()
    }

    /// Returns whether this error means the path does not exist.
    pub fn is_not_found(&self) -> bool {
        self.kind.is_not_found()
    }

    /// Returns a reference to the captured backtrace.
    pub fn backtrace(&self) -> &Backtrace {
        &self.traces.backtrace
    }

    /// Returns a reference to the captured span trace.
    pub fn span_trace(&self) -> &SpanTrace {
        &self.traces.span_trace
    }
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Storage error [{}] from {}", self.kind, self.engine)?;

        if let Some(path) = &self.path {
            write!(f, " (path: {})", path)?;
        }

        if let Some(context) = &self.context {
            write!(f, " ({})", context)?;
        }

        write!(f, ": {}", self.source)
    }
}

/// Builder for constructing `StorageError` with optional context fields.
#[derive(Debug)]
pub struct StorageErrorBuilder {
    kind: StorageErrorKind,
    engine: &'static str,
    source: Box<dyn StdError + Send + Sync + 'static>,
    path: Option<String>,
    context: Option<String>,
}

impl StorageErrorBuilder {
    /// Set the logical path.
    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Set additional context.
    pub fn context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    /// Build the `StorageError`.
    pub fn build(self) -> StorageError {
        StorageError {
            kind: self.kind,
            engine: self.engine,
            path: self.path,
            context: self.context,
            source: self.source,
            traces: Box::new(ErrorTrace::capture()),
        }
    }
}
