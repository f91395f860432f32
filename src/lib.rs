//! mu-reader -- EPUB package resolution and reading-content pipeline
//!
//! Turns an EPUB archive into an ordered, render-ready [`Book`]: the archive
//! is extracted, `container.xml` leads to the OPF package, the manifest and
//! spine give the reading order, and every content document becomes a
//! [`Chapter`] with plain text and image references. Chapters can then be
//! split into sentences and rendered to styled HTML by a [`ContentProcessor`].
//!
//! Real-world EPUBs are frequently incomplete, so the pipeline degrades
//! through fallbacks instead of failing: a missing spine falls back to the
//! manifest and then a directory scan, a missing NCX to spine-derived TOC
//! entries, and a book with no readable chapters still gets a placeholder.
//!
//! # Features
//!
//! - `async` -- [`async_api`] runs a parse on Tokio's blocking pool
//! - `cli` -- the `mu-reader` inspection binary
//!
//! # Example
//!
//! ```rust,no_run
//! use mu_reader::{parse_epub_file, ContentDisplayOptions, ContentProcessor};
//!
//! let book = parse_epub_file("book.epub")?;
//! let processor = ContentProcessor::new(ContentDisplayOptions::default());
//! let first = processor.process(&book.chapters[0]);
//! println!("{}: {} sentences", book.title, first.sentences.len());
//! # Ok::<(), mu_reader::EpubError>(())
//! ```

#![warn(missing_docs)]
#![deny(clippy::large_enum_variant, clippy::large_stack_arrays, clippy::redundant_clone)]
#![warn(
    clippy::box_collection,
    clippy::needless_collect,
    clippy::map_clone,
    clippy::implicit_clone,
    clippy::inefficient_to_string
)]

pub mod archive;
pub mod book;
pub mod chapter;
pub mod content;
pub mod error;
pub mod metadata;
pub mod navigation;
pub mod package;
pub mod resources;
pub mod spine;
pub mod text;

#[cfg(feature = "async")]
pub mod async_api;

mod xml;

// Re-export key types for convenience
pub use archive::{extract_epub, ArchiveExtractor, ZipExtractor};
#[cfg(feature = "async")]
pub use async_api::{parse_epub_file_async, parse_epub_file_async_with_options, ParseTask};
pub use book::{
    parse_epub_file, parse_epub_file_with_options, placeholder_chapter, Book, BookAssembler,
    CancelFlag, EpubParser, ParseOptions, ParseOptionsBuilder, ParseProgress, ReadingPosition,
    PLACEHOLDER_CHAPTER_ID,
};
pub use chapter::{Chapter, ChapterImage, ChapterLoader};
pub use content::{
    segment_sentences, ContentDisplayOptions, ContentProcessor, HighlightMode, ProcessedChapter,
    SentenceRange,
};
pub use error::{EpubError, Result};
pub use metadata::{BookMetadata, PackageMetadata};
pub use navigation::{nest_toc, TocItem};
pub use package::PackageLocator;
pub use resources::{ManifestEntry, ResourceRegistry};
pub use spine::{Spine, SpineItem, SpineResolver, SpineSource};
pub use text::{decode_text, strip_markup};
