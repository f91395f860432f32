//! Optional async wrapper around the parse pipeline.
//!
//! This module is available with the `async` feature. Parsing is blocking
//! filesystem work, so it runs on Tokio's blocking pool; the returned
//! [`ParseTask`] exposes progress, cancellation and the final result.

use std::future::{Future, IntoFuture};
use std::path::PathBuf;
use std::pin::Pin;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::book::{Book, CancelFlag, EpubParser, ParseOptions, ParseProgress};
use crate::error::{EpubError, Result};

/// A parse running on the blocking pool.
///
/// Await the task (or call [`ParseTask::join`]) for the book.
pub struct ParseTask {
    progress: watch::Receiver<Option<ParseProgress>>,
    cancel: CancelFlag,
    handle: JoinHandle<Result<Book>>,
}

impl ParseTask {
    /// Receiver for the latest pipeline stage; `None` until the parse starts.
    pub fn progress(&self) -> watch::Receiver<Option<ParseProgress>> {
        self.progress.clone()
    }

    /// Ask the parse to stop at its next checkpoint.
    ///
    /// The task then resolves to [`EpubError::Cancelled`].
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Flag shared with the running parse
    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    /// Wait for the parse to finish.
    pub async fn join(self) -> Result<Book> {
        match self.handle.await {
            Ok(result) => result,
            Err(err) if err.is_cancelled() => Err(EpubError::Cancelled),
            Err(err) => Err(EpubError::Io(format!("parse task failed: {}", err))),
        }
    }
}

impl IntoFuture for ParseTask {
    type Output = Result<Book>;
    type IntoFuture = Pin<Box<dyn Future<Output = Result<Book>> + Send>>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(self.join())
    }
}

/// Start parsing the EPUB at `path` with default options.
///
/// Must be called from within a Tokio runtime.
pub fn parse_epub_file_async(path: impl Into<PathBuf>) -> ParseTask {
    parse_epub_file_async_with_options(path, ParseOptions::default())
}

/// Start parsing the EPUB at `path` with explicit options.
///
/// Must be called from within a Tokio runtime.
pub fn parse_epub_file_async_with_options(
    path: impl Into<PathBuf>,
    options: ParseOptions,
) -> ParseTask {
    let path = path.into();
    let parser = EpubParser::new(options);
    let cancel = parser.cancel_flag();
    let (tx, rx) = watch::channel(None);

    let handle = tokio::task::spawn_blocking(move || {
        parser.parse_file_with_progress(&path, &mut |stage| {
            // No receivers left is fine: nobody is watching
            let _ = tx.send(Some(stage));
        })
    });

    ParseTask {
        progress: rx,
        cancel,
        handle,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Write;
    use std::path::Path;
    use zip::write::SimpleFileOptions;
    use zip::ZipWriter;

    fn write_epub(path: &Path) {
        let mut zip = ZipWriter::new(File::create(path).unwrap());
        let options = SimpleFileOptions::default();
        let entries: [(&str, &str); 3] = [
            (
                "META-INF/container.xml",
                r#"<container><rootfiles><rootfile full-path="content.opf"/></rootfiles></container>"#,
            ),
            (
                "content.opf",
                r#"<package><metadata><dc:title xmlns:dc="http://purl.org/dc/elements/1.1/">Async</dc:title></metadata>
<manifest><item id="c" href="c.xhtml" media-type="application/xhtml+xml"/></manifest>
<spine><itemref idref="c"/></spine></package>"#,
            ),
            ("c.xhtml", "<html><body><p>Hello async world.</p></body></html>"),
        ];
        for (name, content) in entries {
            zip.start_file(name, options).unwrap();
            zip.write_all(content.as_bytes()).unwrap();
        }
        zip.finish().unwrap();
    }

    #[tokio::test]
    async fn test_parse_epub_file_async() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("book.epub");
        write_epub(&source);

        let options = crate::book::ParseOptionsBuilder::new()
            .extraction_root(dir.path().join("out"))
            .build();
        let task = parse_epub_file_async_with_options(&source, options);
        let progress = task.progress();
        let book = task.await.unwrap();

        assert_eq!(book.title, "Async");
        assert_eq!(book.chapters.len(), 1);
        assert_eq!(*progress.borrow(), Some(ParseProgress::Assembling));
    }

    #[tokio::test]
    async fn test_cancel_before_start() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("book.epub");
        write_epub(&source);

        let options = crate::book::ParseOptionsBuilder::new()
            .extraction_root(dir.path().join("out"))
            .build();
        let parser_task = parse_epub_file_async_with_options(&source, options);
        parser_task.cancel();
        // The flag may be observed at any checkpoint, or the parse may
        // already have finished before it was set.
        match parser_task.join().await {
            Err(EpubError::Cancelled) | Ok(_) => {}
            Err(other) => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_missing_file_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let err = parse_epub_file_async(dir.path().join("absent.epub"))
            .await
            .unwrap_err();
        assert!(err.is_fatal());
    }
}
