//! Chapter loading: decode a content document and derive its text and images.

use std::fs;
use std::path::{Path, PathBuf};

use encoding_rs::Encoding;
use serde::{Deserialize, Serialize};

use crate::navigation::TocItem;
use crate::resources::ResourceRegistry;
use crate::text::{decode_text, document_title, element_attributes, strip_markup};

/// An image referenced from chapter markup that exists on disk.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChapterImage {
    /// Identifier unique within the book
    pub id: String,
    /// Reference exactly as written in the markup
    pub href: String,
    /// Resolved location in the extracted tree
    pub path: PathBuf,
    /// Alt text, when the markup provides one
    pub alt: Option<String>,
}

/// One loaded content document.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chapter {
    /// Stable id derived from spine position (`chapter-{index}`)
    pub id: String,
    /// Title from the TOC, the document `<title>`, or synthesized
    pub title: String,
    /// Decoded document markup
    pub html_content: String,
    /// Markup-stripped text
    pub plain_text_content: String,
    /// Images in document order
    pub images: Vec<ChapterImage>,
    /// Document this chapter was read from
    pub source_path: PathBuf,
}

impl Chapter {
    /// Stable chapter id for a spine position.
    pub fn id_for_index(index: usize) -> String {
        format!("chapter-{}", index)
    }
}

/// Reads spine documents into [`Chapter`] values.
///
/// Loads are independent of each other, so one loader can be shared across
/// worker threads.
#[derive(Clone, Copy, Debug)]
pub struct ChapterLoader<'a> {
    registry: &'a ResourceRegistry,
    fallback_encodings: &'a [&'static Encoding],
}

impl<'a> ChapterLoader<'a> {
    /// Create a loader resolving image references through `registry`.
    pub fn new(registry: &'a ResourceRegistry, fallback_encodings: &'a [&'static Encoding]) -> Self {
        Self {
            registry,
            fallback_encodings,
        }
    }

    /// Load the document at `path` as the chapter at spine position `index`.
    ///
    /// Returns `None` (after logging a warning) when the file cannot be read
    /// or does not decode in any configured encoding. A single bad chapter
    /// never fails the book.
    pub fn load_chapter(&self, path: &Path, index: usize, toc: &[TocItem]) -> Option<Chapter> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(err) => {
                log::warn!("Skipping chapter {}: {}", path.display(), err);
                return None;
            }
        };
        let Some(html) = decode_text(&bytes, self.fallback_encodings) else {
            log::warn!(
                "Skipping chapter {}: no supported encoding decodes it",
                path.display()
            );
            return None;
        };

        let id = Chapter::id_for_index(index);
        let title = chapter_title(toc, index, path)
            .or_else(|| document_title(&html))
            .unwrap_or_else(|| format!("Chapter {}", index + 1));
        let plain_text_content = strip_markup(&html);
        let images = self.extract_images(&html, path, &id);

        log::debug!(
            "Loaded {} '{}' ({} chars, {} images)",
            id,
            title,
            plain_text_content.len(),
            images.len()
        );

        Some(Chapter {
            id,
            title,
            html_content: html,
            plain_text_content,
            images,
            source_path: path.to_path_buf(),
        })
    }

    /// `<img src>` and SVG `<image href>` references that resolve to files.
    fn extract_images(&self, html: &str, chapter_path: &Path, chapter_id: &str) -> Vec<ChapterImage> {
        let base = chapter_path.parent().unwrap_or_else(|| Path::new(""));
        let references = element_attributes(html, "img")
            .into_iter()
            .filter_map(|attrs| attr(&attrs, "src").map(|src| (src, attr(&attrs, "alt"))))
            .chain(element_attributes(html, "image").into_iter().filter_map(|attrs| {
                attr(&attrs, "href")
                    .or_else(|| attr(&attrs, "xlink:href"))
                    .map(|href| (href, None))
            }));

        let mut images = Vec::new();
        for (href, alt) in references {
            if href.is_empty() || href.starts_with("data:") || href.contains("://") {
                continue;
            }
            let Some(path) = self.registry.resolve_href(&href, base) else {
                continue;
            };
            if !path.is_file() {
                log::warn!("Dropping missing image '{}' in {}", href, chapter_path.display());
                continue;
            }
            images.push(ChapterImage {
                id: format!("{}-image-{}", chapter_id, images.len()),
                href,
                path,
                alt: alt.filter(|alt| !alt.trim().is_empty()),
            });
        }
        images
    }
}

/// Title of the TOC entry for a chapter.
///
/// An entry whose `chapter_index` equals `index` wins; otherwise the first
/// entry whose href is contained in the chapter's path.
pub fn chapter_title(toc: &[TocItem], index: usize, path: &Path) -> Option<String> {
    toc.iter()
        .find(|item| item.chapter_index == Some(index))
        .or_else(|| toc.iter().find(|item| item.href_matches(path)))
        .map(|item| item.title.clone())
        .filter(|title| !title.is_empty())
}

fn attr(attrs: &[(String, String)], key: &str) -> Option<String> {
    attrs
        .iter()
        .find(|(name, _)| name == key)
        .map(|(_, value)| value.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::text::default_fallback_encodings;

    fn toc_item(title: &str, href: &str, chapter_index: Option<usize>) -> TocItem {
        TocItem {
            id: title.to_lowercase(),
            title: title.to_string(),
            href: Some(href.to_string()),
            level: 0,
            children: Vec::new(),
            chapter_index,
        }
    }

    #[test]
    fn test_load_chapter_text_and_images() {
        let dir = tempfile::tempdir().unwrap();
        let text_dir = dir.path().join("text");
        let image_dir = dir.path().join("images");
        fs::create_dir_all(&text_dir).unwrap();
        fs::create_dir_all(&image_dir).unwrap();
        fs::write(image_dir.join("fig.png"), b"png").unwrap();

        let chapter_path = text_dir.join("ch1.xhtml");
        fs::write(
            &chapter_path,
            r#"<html><head><title>Doc Title</title></head><body>
<h1>Heading</h1>
<p>First sentence. Second one.</p>
<img src="../images/fig.png" alt="A figure"/>
<img src="../images/missing.png"/>
<img src="data:image/png;base64,AAAA"/>
</body></html>"#,
        )
        .unwrap();

        let registry = ResourceRegistry::new();
        let encodings = default_fallback_encodings();
        let loader = ChapterLoader::new(&registry, &encodings);
        let chapter = loader.load_chapter(&chapter_path, 0, &[]).unwrap();

        assert_eq!(chapter.id, "chapter-0");
        assert_eq!(chapter.title, "Doc Title");
        assert_eq!(chapter.plain_text_content, "Heading\nFirst sentence. Second one.");
        assert_eq!(chapter.images.len(), 1);
        assert_eq!(chapter.images[0].id, "chapter-0-image-0");
        assert_eq!(chapter.images[0].href, "../images/fig.png");
        assert_eq!(chapter.images[0].path, image_dir.join("fig.png"));
        assert_eq!(chapter.images[0].alt.as_deref(), Some("A figure"));
        assert_eq!(chapter.source_path, chapter_path);
    }

    #[test]
    fn test_images_outside_root_are_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("book");
        fs::create_dir_all(root.join("images")).unwrap();
        fs::write(root.join("images/in.png"), b"png").unwrap();
        fs::write(dir.path().join("out.png"), b"png").unwrap();

        let chapter_path = root.join("ch.xhtml");
        fs::write(
            &chapter_path,
            r#"<html><body><img src="images/in.png"/><img src="../out.png"/></body></html>"#,
        )
        .unwrap();

        let registry = ResourceRegistry::with_root(&root);
        let loader = ChapterLoader::new(&registry, &[]);
        let chapter = loader.load_chapter(&chapter_path, 0, &[]).unwrap();
        assert_eq!(chapter.images.len(), 1);
        assert_eq!(chapter.images[0].path, root.join("images/in.png"));
    }

    #[test]
    fn test_load_chapter_title_from_toc() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ch2.xhtml");
        fs::write(&path, "<html><body><p>x</p></body></html>").unwrap();

        let registry = ResourceRegistry::new();
        let loader = ChapterLoader::new(&registry, &[]);

        let toc = vec![toc_item("First", "ch1.xhtml", Some(0)), toc_item("Second", "ch2.xhtml", Some(1))];
        assert_eq!(loader.load_chapter(&path, 1, &toc).unwrap().title, "Second");

        // no index match, href containment still finds it
        let toc = vec![toc_item("By Href", "ch2.xhtml#top", Some(9))];
        assert_eq!(loader.load_chapter(&path, 1, &toc).unwrap().title, "By Href");

        assert_eq!(loader.load_chapter(&path, 4, &[]).unwrap().title, "Chapter 5");
    }

    #[test]
    fn test_load_chapter_legacy_encoding() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("latin.html");
        fs::write(&path, b"<p>Caf\xE9 au lait.</p>").unwrap();

        let registry = ResourceRegistry::new();
        let encodings = default_fallback_encodings();
        let loader = ChapterLoader::new(&registry, &encodings);
        let chapter = loader.load_chapter(&path, 0, &[]).unwrap();
        assert_eq!(chapter.plain_text_content, "Café au lait.");
    }

    #[test]
    fn test_load_chapter_undecodable_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.html");
        fs::write(&path, b"\xFF\xFE\xFD").unwrap();

        let registry = ResourceRegistry::new();
        let loader = ChapterLoader::new(&registry, &[]);
        assert!(loader.load_chapter(&path, 0, &[]).is_none());
    }

    #[test]
    fn test_load_chapter_missing_file_is_skipped() {
        let registry = ResourceRegistry::new();
        let loader = ChapterLoader::new(&registry, &[]);
        assert!(loader
            .load_chapter(Path::new("/nonexistent/ch.xhtml"), 0, &[])
            .is_none());
    }

    #[test]
    fn test_svg_cover_image() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("cover.jpg"), b"jpg").unwrap();
        let path = dir.path().join("cover.xhtml");
        fs::write(
            &path,
            r#"<html><body><svg><image width="600" xlink:href="cover.jpg"/></svg></body></html>"#,
        )
        .unwrap();

        let registry = ResourceRegistry::new();
        let loader = ChapterLoader::new(&registry, &[]);
        let chapter = loader.load_chapter(&path, 0, &[]).unwrap();
        assert_eq!(chapter.images.len(), 1);
        assert_eq!(chapter.images[0].path, dir.path().join("cover.jpg"));
        assert!(chapter.plain_text_content.is_empty());
    }
}
