//! Unified error types for mu-reader
//!
//! Only failures that abort a whole parse surface as `EpubError`. Everything
//! the pipeline can recover from is logged and absorbed by a fallback instead.

use std::path::PathBuf;

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = core::result::Result<T, EpubError>;

/// Top-level error type for mu-reader operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum EpubError {
    /// The archive could not be opened or is corrupt
    #[error("Archive error: {0}")]
    Archive(String),
    /// `META-INF/container.xml` is absent from the extracted tree
    #[error("container.xml not found under {}", .0.display())]
    ContainerNotFound(PathBuf),
    /// container.xml exists but names no usable rootfile
    #[error("Malformed container.xml: {0}")]
    MalformedContainer(String),
    /// The rootfile named by container.xml does not exist
    #[error("OPF package document not found at {}", .0.display())]
    OpfNotFound(PathBuf),
    /// XML parsing error
    #[error("Parse error: {0}")]
    Parse(String),
    /// I/O error (description only, since `std::io::Error` is not `Clone`)
    #[error("I/O error: {0}")]
    Io(String),
    /// The caller cancelled the parse
    #[error("Parse cancelled")]
    Cancelled,
    /// Chapter index requested is out of bounds
    #[error("Chapter index {index} out of bounds (chapter count: {chapter_count})")]
    ChapterOutOfBounds {
        /// Requested chapter index.
        index: usize,
        /// Total number of chapters available.
        chapter_count: usize,
    },
}

impl EpubError {
    /// Whether this error means the file could not be read as an EPUB at all.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            EpubError::Archive(_)
                | EpubError::ContainerNotFound(_)
                | EpubError::MalformedContainer(_)
                | EpubError::OpfNotFound(_)
        )
    }

    /// Message shown to the user when the whole parse failed.
    pub fn user_message(&self) -> String {
        if self.is_fatal() {
            "This file could not be opened. It is not a readable EPUB.".to_string()
        } else {
            self.to_string()
        }
    }
}

impl From<std::io::Error> for EpubError {
    fn from(err: std::io::Error) -> Self {
        EpubError::Io(err.to_string())
    }
}

impl From<zip::result::ZipError> for EpubError {
    fn from(err: zip::result::ZipError) -> Self {
        EpubError::Archive(err.to_string())
    }
}

impl From<quick_xml::Error> for EpubError {
    fn from(err: quick_xml::Error) -> Self {
        EpubError::Parse(format!("XML parse error: {:?}", err))
    }
}
