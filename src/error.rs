//! Error handling for minim.
//!
//! Provides a unified error type for the whole media pipeline. Every error
//! carries:
//!
//! * a [`Category`] describing which layer failed (I/O, container format,
//!   memory, validation, or an unexpected internal fault),
//! * a [`Recovery`] hint telling the component closest to the failure what
//!   it may attempt before giving up,
//! * the file offset at which the failure was observed, when known.
//!
//! Components recover at the lowest layer that can: demuxers re-sync after
//! `SkipSection`, codecs insert silence and reset, the HTTP source retries
//! transient reads. Errors that exceed a component's threshold surface
//! through `Result` to the caller.
//!
//! # Example
//!
//! ```rust
//! use minim::error::{Error, Category, Result};
//!
//! fn parse_header(magic: &[u8]) -> Result<()> {
//!     if magic != b"fLaC" {
//!         return Err(Error::format("bad stream marker"));
//!     }
//!     Ok(())
//! }
//! ```

use std::fmt;
use thiserror::Error;

/// Main error type combining a pipeline category and details.
///
/// Provides:
/// * Categorized error types ([`Category`])
/// * A recovery hint for the component closest to the failure
/// * The byte offset at which the failure was observed, when known
/// * Conversion from common error types
#[derive(Debug)]
pub struct Error {
    /// Classification of the error
    pub category: Category,

    /// What the reporting component suggests trying before failing upward
    pub recovery: Recovery,

    /// Byte offset in the source at which the failure was observed
    pub file_offset: Option<u64>,

    /// Details of the underlying error
    pub error: Box<dyn std::error::Error + Send + Sync>,
}

/// Standard result type for minim operations.
///
/// Wraps the standard `Result` type with our custom [`struct@Error`] type.
pub type Result<T> = std::result::Result<T, Error>;

/// Pipeline failure categories.
///
/// Each variant names the layer that detected the failure, not the layer
/// that caused it: a truncated file surfaces as `Io` from the byte source
/// but as `Format` from a demuxer that got a short structure.
#[derive(Clone, Copy, Debug, Eq, Error, Hash, Ord, PartialEq, PartialOrd)]
pub enum Category {
    /// The byte source reported failure or EOF mid-unit.
    #[error("I/O failure")]
    Io,

    /// Structural violation: bad magic, bad CRC, reserved-bit violation,
    /// overrun.
    #[error("malformed container or bitstream")]
    Format,

    /// The buffer pool cap was hit and optimisation could not free room.
    #[error("buffer pool exhausted")]
    Memory,

    /// Checksum or consistency mismatch below the structural level.
    #[error("validation failed")]
    Validation,

    /// Any unexpected internal fault, captured so state stays usable.
    #[error("unexpected internal fault")]
    Exception,
}

/// Recovery strategy attached to an error.
///
/// The component closest to the failure interprets the hint; callers further
/// up only see errors whose recovery was exhausted.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub enum Recovery {
    /// Nothing to try; fail upward.
    #[default]
    None,

    /// Transient; the same operation may succeed if repeated.
    Retry,

    /// Re-sync forward to the next valid unit within a bounded window.
    SkipSection,

    /// Degrade to a reduced parsing mode (e.g. STREAMINFO-only decoding).
    FallbackMode,

    /// Reinitialise decoder state, then continue.
    Reset,
}

impl Error {
    /// Creates a new error with the given category and details.
    pub fn new<E>(category: Category, error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self {
            category,
            recovery: Recovery::None,
            file_offset: None,
            error: error.into(),
        }
    }

    /// Attaches a recovery hint.
    #[must_use]
    pub fn with_recovery(mut self, recovery: Recovery) -> Self {
        self.recovery = recovery;
        self
    }

    /// Attaches the byte offset at which the failure was observed.
    #[must_use]
    pub fn at_offset(mut self, offset: u64) -> Self {
        self.file_offset = Some(offset);
        self
    }

    /// Creates an I/O error.
    ///
    /// Use when the byte source failed or reported EOF in the middle of a
    /// unit the caller believed complete.
    pub fn io<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::new(Category::Io, error)
    }

    /// Creates a format error.
    ///
    /// Use for structural violations: bad magic, impossible field values,
    /// truncated structures, reserved bits set.
    pub fn format<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::new(Category::Format, error)
    }

    /// Creates a memory error.
    ///
    /// Use when the chunk pool refuses an allocation because the configured
    /// cap would be exceeded. Callers treat this as transient.
    pub fn memory<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::new(Category::Memory, error).with_recovery(Recovery::Retry)
    }

    /// Creates a validation error.
    ///
    /// Use for checksum mismatches and consistency failures that do not
    /// prevent further parsing.
    pub fn validation<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::new(Category::Validation, error)
    }

    /// Captures an unexpected internal fault.
    ///
    /// The capturing component stores the error, keeps its state valid and
    /// returns end-of-stream from subsequent calls.
    pub fn exception<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::new(Category::Exception, error)
    }

    /// Whether the attached recovery hint suggests the operation may still
    /// succeed without caller intervention.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        self.recovery != Recovery::None
    }

    /// Attempts to downcast the underlying error to a concrete type.
    #[must_use]
    pub fn downcast<E>(&self) -> Option<&E>
    where
        E: std::error::Error + 'static,
    {
        self.error.downcast_ref::<E>()
    }
}

impl std::error::Error for Error {
    /// Returns the underlying error source.
    ///
    /// This allows error chains to be examined for root causes.
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.error.source()
    }
}

impl fmt::Display for Error {
    /// Formats the error for display, showing category, details and offset.
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(fmt, "{}: {}", self.category, self.error)?;
        if let Some(offset) = self.file_offset {
            write!(fmt, " (at byte {offset})")?;
        }
        Ok(())
    }
}

impl From<std::io::Error> for Error {
    /// Converts I/O errors into pipeline errors.
    ///
    /// Interrupted and timed-out reads keep a `Retry` hint; everything else
    /// maps to a plain `Io` error.
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        let recovery = match err.kind() {
            ErrorKind::Interrupted | ErrorKind::TimedOut | ErrorKind::WouldBlock => Recovery::Retry,
            _ => Recovery::None,
        };
        Self::io(err).with_recovery(recovery)
    }
}

impl From<reqwest::Error> for Error {
    /// Converts HTTP client errors into pipeline errors.
    ///
    /// Connection and timeout failures are transient from the pipeline's
    /// point of view; the range reader retries them with backoff. Body and
    /// decode failures are not.
    fn from(err: reqwest::Error) -> Self {
        let recovery = if err.is_connect() || err.is_timeout() || err.is_request() {
            Recovery::Retry
        } else {
            Recovery::None
        };
        Self::io(err).with_recovery(recovery)
    }
}

impl From<url::ParseError> for Error {
    /// Converts URL parsing errors to `Format`.
    fn from(e: url::ParseError) -> Self {
        Self::format(e.to_string())
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    /// Converts mutex poisoning into a captured internal fault.
    fn from(e: std::sync::PoisonError<T>) -> Self {
        Self::exception(e.to_string())
    }
}
