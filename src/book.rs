//! High-level EPUB parsing pipeline and the assembled book model.
//!
//! This module wires the pieces together: extract the archive, locate the
//! package, resolve resources and reading order, read metadata and the TOC,
//! load chapters, and assemble a [`Book`]. Every recoverable problem along
//! the way is logged and absorbed, so a parse either fails fatally (the file
//! is not a readable EPUB) or produces a book with at least one chapter.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;

use encoding_rs::Encoding;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::archive::{ArchiveExtractor, ZipExtractor};
use crate::chapter::{Chapter, ChapterLoader};
use crate::error::{EpubError, Result};
use crate::metadata::{parse_metadata, BookMetadata, PackageMetadata};
use crate::navigation::{build_toc, nest_toc, TocItem};
use crate::package::PackageLocator;
use crate::resources::ResourceRegistry;
use crate::spine::SpineResolver;
use crate::text::{default_fallback_encodings, strip_markup};

/// Id of the chapter substituted when nothing could be loaded.
pub const PLACEHOLDER_CHAPTER_ID: &str = "placeholder";

const PLACEHOLDER_TITLE: &str = "No readable content";

const PLACEHOLDER_HTML: &str = "<html><body><h1>No readable content</h1>\
<p>The chapters of this book could not be read. The file may be damaged or use an unsupported layout.</p>\
</body></html>";

/// Where the reader left off in a book.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadingPosition {
    /// Index into [`Book::chapters`]
    pub chapter_index: usize,
    /// Id of that chapter, for restoring across re-parses
    pub chapter_id: String,
    /// Sentence index within the chapter's segmented text
    pub sentence_index: usize,
    /// Byte offset into the chapter's plain text
    pub char_offset: usize,
}

/// A parsed, render-ready book.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Book {
    /// Random identity assigned at parse time
    pub id: String,
    /// Book title
    pub title: String,
    /// Primary author
    pub author: String,
    /// Cover image in the extracted tree
    pub cover_image_path: Option<PathBuf>,
    /// Chapters in reading order; never empty
    pub chapters: Vec<Chapter>,
    /// Descriptive metadata
    pub metadata: BookMetadata,
    /// Archive the book was parsed from
    pub file_path: PathBuf,
    /// Last position reported by the reading UI
    pub last_read_position: Option<ReadingPosition>,
    /// Flat table of contents in document order
    pub toc_items: Vec<TocItem>,
}

impl Book {
    /// Number of chapters
    pub fn chapter_count(&self) -> usize {
        self.chapters.len()
    }

    /// Chapter by index.
    pub fn chapter(&self, index: usize) -> Result<&Chapter> {
        self.chapters.get(index).ok_or(EpubError::ChapterOutOfBounds {
            index,
            chapter_count: self.chapters.len(),
        })
    }

    /// Chapter by its stable id.
    pub fn chapter_by_id(&self, id: &str) -> Option<&Chapter> {
        self.chapters.iter().find(|chapter| chapter.id == id)
    }

    /// Whether the only chapter is the substituted placeholder.
    pub fn is_placeholder(&self) -> bool {
        self.chapters.len() == 1 && self.chapters[0].id == PLACEHOLDER_CHAPTER_ID
    }

    /// Index of the chapter a TOC entry points at.
    ///
    /// `chapter_index` is used when it is in range; otherwise the first
    /// chapter whose source path contains the entry's href.
    pub fn chapter_index_for_toc(&self, item: &TocItem) -> Option<usize> {
        item.chapter_index
            .filter(|&index| index < self.chapters.len())
            .or_else(|| {
                self.chapters
                    .iter()
                    .position(|chapter| item.href_matches(&chapter.source_path))
            })
    }

    /// Record the reader's position.
    ///
    /// The chapter id is filled in from the index when left empty.
    pub fn set_last_read_position(&mut self, mut position: ReadingPosition) -> Result<()> {
        let chapter = self.chapter(position.chapter_index)?;
        if position.chapter_id.is_empty() {
            position.chapter_id = chapter.id.clone();
        }
        self.last_read_position = Some(position);
        Ok(())
    }

    /// Table of contents rebuilt as a tree.
    pub fn toc_tree(&self) -> Vec<TocItem> {
        nest_toc(&self.toc_items)
    }
}

/// The chapter used when a book yields no readable content.
pub fn placeholder_chapter(source_path: &Path) -> Chapter {
    Chapter {
        id: PLACEHOLDER_CHAPTER_ID.to_string(),
        title: PLACEHOLDER_TITLE.to_string(),
        html_content: PLACEHOLDER_HTML.to_string(),
        plain_text_content: strip_markup(PLACEHOLDER_HTML),
        images: Vec::new(),
        source_path: source_path.to_path_buf(),
    }
}

/// Combines parsed components into a [`Book`].
#[derive(Clone, Copy, Debug, Default)]
pub struct BookAssembler;

impl BookAssembler {
    /// Assemble a book, substituting the placeholder chapter when
    /// `chapters` is empty. Never fails.
    pub fn assemble(
        chapters: Vec<Chapter>,
        package: PackageMetadata,
        toc_items: Vec<TocItem>,
        source_path: &Path,
    ) -> Book {
        let chapters = if chapters.is_empty() {
            log::warn!(
                "No readable chapters in {}, using placeholder",
                source_path.display()
            );
            vec![placeholder_chapter(source_path)]
        } else {
            chapters
        };

        Book {
            id: Uuid::new_v4().to_string(),
            title: package.title,
            author: package.author,
            cover_image_path: package.cover_path,
            chapters,
            metadata: package.metadata,
            file_path: source_path.to_path_buf(),
            last_read_position: None,
            toc_items,
        }
    }
}

/// Pipeline stage reported to progress observers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParseProgress {
    /// Unpacking the archive
    Extracting,
    /// Finding container.xml and the package document
    Locating,
    /// Reading manifest, spine, metadata and TOC
    ParsingPackage,
    /// Loading chapter documents
    LoadingChapters {
        /// Documents processed so far
        done: usize,
        /// Documents to process
        total: usize,
    },
    /// Building the final book
    Assembling,
}

/// Shared flag a caller sets to abandon a parse in progress.
#[derive(Clone, Debug, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    /// Create an unset flag
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation was requested
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(EpubError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Configuration for [`EpubParser`].
#[derive(Clone, Debug, PartialEq)]
pub struct ParseOptions {
    /// Directory archives are unpacked into.
    ///
    /// When `None`, each parse uses a fresh `mu-reader-<uuid>` directory
    /// under the system temp dir.
    pub extraction_root: Option<PathBuf>,
    /// Encodings tried, in order, when a document is not valid UTF-8.
    pub fallback_encodings: Vec<&'static Encoding>,
    /// Threads used to load chapters; 1 loads sequentially.
    pub chapter_workers: usize,
}

impl Default for ParseOptions {
    fn default() -> Self {
        Self {
            extraction_root: None,
            fallback_encodings: default_fallback_encodings(),
            chapter_workers: 1,
        }
    }
}

/// Builder for [`ParseOptions`] and one-shot parsing.
#[derive(Clone, Debug, Default)]
pub struct ParseOptionsBuilder {
    options: ParseOptions,
}

impl ParseOptionsBuilder {
    /// Create a builder with default options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Unpack archives into `root` instead of a temp directory.
    pub fn extraction_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.options.extraction_root = Some(root.into());
        self
    }

    /// Replace the legacy encoding list.
    pub fn fallback_encodings(mut self, encodings: Vec<&'static Encoding>) -> Self {
        self.options.fallback_encodings = encodings;
        self
    }

    /// Load chapters on `workers` threads (at least 1).
    pub fn chapter_workers(mut self, workers: usize) -> Self {
        self.options.chapter_workers = workers.max(1);
        self
    }

    /// Finish building.
    pub fn build(self) -> ParseOptions {
        self.options
    }

    /// Parse an EPUB file with the built options.
    pub fn parse_file<P: AsRef<Path>>(self, path: P) -> Result<Book> {
        EpubParser::new(self.options).parse_file(path.as_ref())
    }
}

/// Runs the full parse pipeline.
#[derive(Clone, Debug, Default)]
pub struct EpubParser<E: ArchiveExtractor = ZipExtractor> {
    extractor: E,
    options: ParseOptions,
    cancel: CancelFlag,
}

impl EpubParser<ZipExtractor> {
    /// Create a parser using the ZIP extractor.
    pub fn new(options: ParseOptions) -> Self {
        Self::with_extractor(ZipExtractor, options)
    }

    /// Shortcut for [`ParseOptionsBuilder::new`].
    pub fn builder() -> ParseOptionsBuilder {
        ParseOptionsBuilder::new()
    }
}

impl<E: ArchiveExtractor> EpubParser<E> {
    /// Create a parser with a custom archive extractor.
    pub fn with_extractor(extractor: E, options: ParseOptions) -> Self {
        Self {
            extractor,
            options,
            cancel: CancelFlag::new(),
        }
    }

    /// Use an externally owned cancel flag.
    pub fn with_cancel_flag(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    /// Handle for cancelling this parser's work from another thread.
    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    /// Options in effect
    pub fn options(&self) -> &ParseOptions {
        &self.options
    }

    /// Parse the EPUB archive at `path`.
    pub fn parse_file(&self, path: &Path) -> Result<Book> {
        self.parse_file_with_progress(path, &mut |_| {})
    }

    /// Parse the EPUB archive at `path`, reporting each stage to `progress`.
    pub fn parse_file_with_progress(
        &self,
        path: &Path,
        progress: &mut dyn FnMut(ParseProgress),
    ) -> Result<Book> {
        self.cancel.check()?;
        progress(ParseProgress::Extracting);
        let destination = self
            .options
            .extraction_root
            .clone()
            .unwrap_or_else(default_extraction_root);
        let root = self.extractor.extract(path, &destination)?;
        log::debug!("Extracted {} to {}", path.display(), root.display());
        self.parse_extracted(&root, path, progress)
    }

    /// Run the pipeline over an already extracted tree.
    ///
    /// `source_path` is recorded as the book's file path.
    pub fn parse_extracted(
        &self,
        root: &Path,
        source_path: &Path,
        progress: &mut dyn FnMut(ParseProgress),
    ) -> Result<Book> {
        self.cancel.check()?;
        progress(ParseProgress::Locating);
        let locator = PackageLocator::new(root);
        let container = locator.locate_container()?;
        let opf_path = locator.locate_opf(&container)?;
        log::debug!("Package document: {}", opf_path.display());

        self.cancel.check()?;
        progress(ParseProgress::ParsingPackage);
        let mut registry = ResourceRegistry::with_root(root);
        if let Err(err) = registry.resolve_manifest_resources(&opf_path) {
            log::warn!("Unreadable manifest in {}: {}", opf_path.display(), err);
        }
        let spine = SpineResolver::new(&registry).spine_items(&opf_path)?;
        log::debug!("Reading order: {} documents from {:?}", spine.paths.len(), spine.source);

        let package = parse_metadata(&opf_path, root).unwrap_or_else(|err| {
            log::warn!("Unreadable metadata in {}: {}", opf_path.display(), err);
            PackageMetadata::default()
        });

        let ncx_path = locator.locate_ncx(&opf_path);
        let nav_path = match ncx_path {
            Some(_) => None,
            None => locator.locate_nav(&opf_path),
        };
        let toc = build_toc(
            ncx_path.as_deref(),
            nav_path.as_deref(),
            &spine.paths,
            &self.options.fallback_encodings,
        );

        let loader = ChapterLoader::new(&registry, &self.options.fallback_encodings);
        let mut chapters = self.load_chapters(&loader, &spine.paths, &toc, progress)?;
        if chapters.is_empty() {
            let raw_paths = locator.raw_chapter_paths();
            if !raw_paths.is_empty() && raw_paths != spine.paths {
                log::warn!(
                    "Spine yielded no chapters, retrying with {} scanned documents",
                    raw_paths.len()
                );
                chapters = self.load_chapters(&loader, &raw_paths, &toc, progress)?;
            }
        }

        self.cancel.check()?;
        progress(ParseProgress::Assembling);
        Ok(BookAssembler::assemble(chapters, package, toc, source_path))
    }

    /// Load `paths` in order, possibly on several threads.
    ///
    /// Output order always matches `paths`, whatever order loads finish in.
    fn load_chapters(
        &self,
        loader: &ChapterLoader<'_>,
        paths: &[PathBuf],
        toc: &[TocItem],
        progress: &mut dyn FnMut(ParseProgress),
    ) -> Result<Vec<Chapter>> {
        let total = paths.len();
        progress(ParseProgress::LoadingChapters { done: 0, total });

        let workers = self.options.chapter_workers.min(total);
        if workers <= 1 {
            let mut chapters = Vec::with_capacity(total);
            for (index, path) in paths.iter().enumerate() {
                self.cancel.check()?;
                if let Some(chapter) = loader.load_chapter(path, index, toc) {
                    chapters.push(chapter);
                }
                progress(ParseProgress::LoadingChapters {
                    done: index + 1,
                    total,
                });
            }
            return Ok(chapters);
        }

        let next = AtomicUsize::new(0);
        let mut loaded: Vec<(usize, Chapter)> = Vec::with_capacity(total);
        thread::scope(|scope| {
            let (tx, rx) = mpsc::channel();
            for _ in 0..workers {
                let tx = tx.clone();
                let next = &next;
                let cancel = &self.cancel;
                let loader = *loader;
                scope.spawn(move || loop {
                    if cancel.is_cancelled() {
                        break;
                    }
                    let index = next.fetch_add(1, Ordering::Relaxed);
                    let Some(path) = paths.get(index) else {
                        break;
                    };
                    if tx.send((index, loader.load_chapter(path, index, toc))).is_err() {
                        break;
                    }
                });
            }
            drop(tx);

            for (done, (index, chapter)) in rx.iter().enumerate() {
                progress(ParseProgress::LoadingChapters {
                    done: done + 1,
                    total,
                });
                if let Some(chapter) = chapter {
                    loaded.push((index, chapter));
                }
            }
        });
        self.cancel.check()?;

        loaded.sort_by_key(|(index, _)| *index);
        Ok(loaded.into_iter().map(|(_, chapter)| chapter).collect())
    }
}

fn default_extraction_root() -> PathBuf {
    std::env::temp_dir().join(format!("mu-reader-{}", Uuid::new_v4()))
}

/// Parse an EPUB file with default options.
pub fn parse_epub_file<P: AsRef<Path>>(path: P) -> Result<Book> {
    parse_epub_file_with_options(path, ParseOptions::default())
}

/// Parse an EPUB file with explicit options.
pub fn parse_epub_file_with_options<P: AsRef<Path>>(path: P, options: ParseOptions) -> Result<Book> {
    EpubParser::new(options).parse_file(path.as_ref())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write_book(root: &Path, spine: &str, files: &[(&str, &str)]) {
        fs::create_dir_all(root.join("META-INF")).unwrap();
        fs::create_dir_all(root.join("OEBPS")).unwrap();
        fs::write(
            root.join("META-INF/container.xml"),
            r#"<?xml version="1.0"?>
<container version="1.0" xmlns="urn:oasis:names:tc:opendocument:xmlns:container">
  <rootfiles><rootfile full-path="OEBPS/content.opf" media-type="application/oebps-package+xml"/></rootfiles>
</container>"#,
        )
        .unwrap();
        let manifest: String = files
            .iter()
            .enumerate()
            .map(|(i, (name, _))| {
                format!(
                    r#"<item id="c{}" href="{}" media-type="application/xhtml+xml"/>"#,
                    i, name
                )
            })
            .collect();
        fs::write(
            root.join("OEBPS/content.opf"),
            format!(
                r#"<?xml version="1.0"?>
<package xmlns="http://www.idpf.org/2007/opf" version="2.0">
  <metadata xmlns:dc="http://purl.org/dc/elements/1.1/">
    <dc:title>Test Book</dc:title>
    <dc:creator>Test Author</dc:creator>
  </metadata>
  <manifest>{}</manifest>
  <spine>{}</spine>
</package>"#,
                manifest, spine
            ),
        )
        .unwrap();
        for (name, body) in files {
            fs::write(root.join("OEBPS").join(name), body).unwrap();
        }
    }

    fn chapter_doc(title: &str) -> String {
        format!(
            "<html><head><title>{0}</title></head><body><h1>{0}</h1><p>One. Two.</p></body></html>",
            title
        )
    }

    #[test]
    fn test_assemble_substitutes_placeholder() {
        let book = BookAssembler::assemble(
            Vec::new(),
            PackageMetadata::default(),
            Vec::new(),
            Path::new("/books/empty.epub"),
        );
        assert_eq!(book.chapters.len(), 1);
        assert_eq!(book.chapters[0].id, PLACEHOLDER_CHAPTER_ID);
        assert!(!book.chapters[0].plain_text_content.is_empty());
        assert!(book.is_placeholder());
        assert_eq!(book.title, "Unknown Title");
        assert!(Uuid::parse_str(&book.id).is_ok());
    }

    #[test]
    fn test_assemble_ids_are_unique() {
        let a = BookAssembler::assemble(Vec::new(), PackageMetadata::default(), Vec::new(), Path::new("a"));
        let b = BookAssembler::assemble(Vec::new(), PackageMetadata::default(), Vec::new(), Path::new("a"));
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_parse_extracted_spine_order() {
        let dir = tempfile::tempdir().unwrap();
        let one = chapter_doc("First");
        let two = chapter_doc("Second");
        write_book(
            dir.path(),
            r#"<itemref idref="c1"/><itemref idref="c0"/>"#,
            &[("a.xhtml", &one), ("b.xhtml", &two)],
        );

        let parser = EpubParser::new(ParseOptions::default());
        let mut stages = Vec::new();
        let book = parser
            .parse_extracted(dir.path(), Path::new("book.epub"), &mut |p| stages.push(p))
            .unwrap();

        assert_eq!(book.title, "Test Book");
        assert_eq!(book.author, "Test Author");
        assert_eq!(book.chapters.len(), 2);
        assert_eq!(book.chapters[0].title, "Second");
        assert_eq!(book.chapters[0].id, "chapter-0");
        assert_eq!(book.chapters[1].title, "First");
        assert_eq!(book.toc_items.len(), 2);
        assert_eq!(book.file_path, PathBuf::from("book.epub"));

        assert_eq!(stages.first(), Some(&ParseProgress::Locating));
        assert_eq!(stages.last(), Some(&ParseProgress::Assembling));
        assert!(stages.contains(&ParseProgress::LoadingChapters { done: 2, total: 2 }));
    }

    #[test]
    fn test_parallel_load_keeps_spine_order() {
        let dir = tempfile::tempdir().unwrap();
        let docs: Vec<(String, String)> = (0..12)
            .map(|i| (format!("ch{:02}.xhtml", i), chapter_doc(&format!("Title {}", i))))
            .collect();
        let files: Vec<(&str, &str)> = docs.iter().map(|(n, b)| (n.as_str(), b.as_str())).collect();
        let spine: String = (0..12).map(|i| format!(r#"<itemref idref="c{}"/>"#, i)).collect();
        write_book(dir.path(), &spine, &files);

        let options = ParseOptionsBuilder::new().chapter_workers(4).build();
        let book = EpubParser::new(options)
            .parse_extracted(dir.path(), Path::new("x.epub"), &mut |_| {})
            .unwrap();

        let titles: Vec<&str> = book.chapters.iter().map(|c| c.title.as_str()).collect();
        let expected: Vec<String> = (0..12).map(|i| format!("Title {}", i)).collect();
        assert_eq!(titles, expected);
    }

    #[test]
    fn test_unloadable_chapters_fall_back_to_placeholder() {
        let dir = tempfile::tempdir().unwrap();
        write_book(dir.path(), r#"<itemref idref="missing"/>"#, &[]);

        let book = EpubParser::new(ParseOptions::default())
            .parse_extracted(dir.path(), Path::new("x.epub"), &mut |_| {})
            .unwrap();
        assert!(book.is_placeholder());
    }

    #[test]
    fn test_missing_container_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let err = EpubParser::new(ParseOptions::default())
            .parse_extracted(dir.path(), Path::new("x.epub"), &mut |_| {})
            .unwrap_err();
        assert!(matches!(err, EpubError::ContainerNotFound(_)));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_cancelled_parse() {
        let dir = tempfile::tempdir().unwrap();
        let doc = chapter_doc("A");
        write_book(dir.path(), r#"<itemref idref="c0"/>"#, &[("a.xhtml", &doc)]);

        let parser = EpubParser::new(ParseOptions::default());
        let cancel = parser.cancel_flag();
        let err = parser
            .parse_extracted(dir.path(), Path::new("x.epub"), &mut |stage| {
                if stage == ParseProgress::ParsingPackage {
                    cancel.cancel();
                }
            })
            .unwrap_err();
        assert_eq!(err, EpubError::Cancelled);
    }

    #[test]
    fn test_reading_position_and_toc_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let one = chapter_doc("First");
        let two = chapter_doc("Second");
        write_book(
            dir.path(),
            r#"<itemref idref="c0"/><itemref idref="c1"/>"#,
            &[("a.xhtml", &one), ("b.xhtml", &two)],
        );
        let mut book = EpubParser::new(ParseOptions::default())
            .parse_extracted(dir.path(), Path::new("x.epub"), &mut |_| {})
            .unwrap();

        let by_href = TocItem {
            id: "x".to_string(),
            title: "B".to_string(),
            href: Some("b.xhtml".to_string()),
            level: 0,
            children: Vec::new(),
            chapter_index: Some(42),
        };
        assert_eq!(book.chapter_index_for_toc(&by_href), Some(1));

        book.set_last_read_position(ReadingPosition {
            chapter_index: 1,
            sentence_index: 1,
            ..ReadingPosition::default()
        })
        .unwrap();
        let position = book.last_read_position.clone().unwrap();
        assert_eq!(position.chapter_id, "chapter-1");

        let err = book
            .set_last_read_position(ReadingPosition {
                chapter_index: 5,
                ..ReadingPosition::default()
            })
            .unwrap_err();
        assert_eq!(
            err,
            EpubError::ChapterOutOfBounds {
                index: 5,
                chapter_count: 2
            }
        );
    }

    #[test]
    fn test_builder_clamps_workers() {
        let options = EpubParser::builder()
            .chapter_workers(0)
            .extraction_root("/tmp/somewhere")
            .build();
        assert_eq!(options.chapter_workers, 1);
        assert_eq!(options.extraction_root, Some(PathBuf::from("/tmp/somewhere")));
        assert!(!options.fallback_encodings.is_empty());
    }
}
