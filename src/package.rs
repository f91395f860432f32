//! Package locator: container.xml -> OPF -> NCX/nav
//!
//! Walks the fixed entry points of an extracted EPUB tree. A missing
//! container or OPF is fatal; a missing navigation document is not.

use std::fs;
use std::path::{Path, PathBuf};

use quick_xml::events::Event;

use crate::error::{EpubError, Result};
use crate::resources::{normalize_path, parse_manifest, resolve_href, ManifestItem};
use crate::spine::{parse_spine, sort_paths};
use crate::xml;

/// Location of the container document inside the extracted tree.
pub const CONTAINER_PATH: &str = "META-INF/container.xml";

/// Media type of an EPUB 2 navigation control file.
pub const NCX_MEDIA_TYPE: &str = "application/x-dtbncx+xml";

/// File extensions treated as content documents by directory scans.
const CONTENT_EXTENSIONS: &[&str] = &["html", "xhtml", "htm"];

/// Maximum directory depth walked by content scans.
const MAX_SCAN_DEPTH: usize = 16;

/// Finds the package documents of one extracted book.
#[derive(Clone, Debug)]
pub struct PackageLocator {
    root: PathBuf,
}

impl PackageLocator {
    /// Locator over the extraction root.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Extraction root this locator works on.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of `META-INF/container.xml`, which must exist.
    pub fn locate_container(&self) -> Result<PathBuf> {
        let path = self.root.join(CONTAINER_PATH);
        if path.is_file() {
            Ok(path)
        } else {
            Err(EpubError::ContainerNotFound(self.root.clone()))
        }
    }

    /// Path of the OPF named by the first `<rootfile full-path>`.
    ///
    /// The attribute is resolved against the extraction root, two levels up
    /// from the container document.
    pub fn locate_opf(&self, container_path: &Path) -> Result<PathBuf> {
        let content = fs::read(container_path)?;
        let full_path = parse_container_xml(&content)?;

        let root = container_path
            .parent()
            .and_then(Path::parent)
            .unwrap_or(self.root.as_path());
        let opf_path = resolve_href(&full_path, root);
        if !self.contains(&opf_path) {
            log::warn!("Rootfile '{}' points outside the book", full_path);
            return Err(EpubError::OpfNotFound(opf_path));
        }
        if opf_path.is_file() {
            log::debug!("OPF package document at {}", opf_path.display());
            Ok(opf_path)
        } else {
            Err(EpubError::OpfNotFound(opf_path))
        }
    }

    /// Path of the NCX, if the package declares one that exists.
    ///
    /// Looks for a manifest item with the NCX media type first and the item
    /// named by `<spine toc="...">` second.
    pub fn locate_ncx(&self, opf_path: &Path) -> Option<PathBuf> {
        let content = fs::read(opf_path).ok()?;
        let base = opf_path.parent().unwrap_or(self.root.as_path());
        let manifest = parse_manifest(&content).unwrap_or_default();

        let by_media_type = manifest.iter().find(|item| item.media_type == NCX_MEDIA_TYPE);
        let by_spine_toc = || {
            let toc_id = parse_spine(&content).ok()?.toc_id()?.to_string();
            manifest.iter().find(|item| item.id == toc_id)
        };

        let item = by_media_type.or_else(by_spine_toc)?;
        self.existing(resolve_href(&item.href, base), "NCX")
    }

    /// Path of the EPUB 3 navigation document (`properties="nav"`), if any.
    pub fn locate_nav(&self, opf_path: &Path) -> Option<PathBuf> {
        let content = fs::read(opf_path).ok()?;
        let base = opf_path.parent().unwrap_or(self.root.as_path());
        let manifest = parse_manifest(&content).unwrap_or_default();
        let item: &ManifestItem = manifest.iter().find(|item| item.has_property("nav"))?;
        self.existing(resolve_href(&item.href, base), "nav document")
    }

    /// Every content document under the extraction root, in path order.
    ///
    /// Used as the alternate chapter source when the package yields nothing.
    pub fn raw_chapter_paths(&self) -> Vec<PathBuf> {
        scan_content_documents(&self.root)
    }

    fn contains(&self, path: &Path) -> bool {
        path.starts_with(normalize_path(&self.root))
    }

    fn existing(&self, path: PathBuf, what: &str) -> Option<PathBuf> {
        if !self.contains(&path) {
            log::warn!("{} points outside the book: {}", what, path.display());
            None
        } else if path.is_file() {
            Some(path)
        } else {
            log::warn!("{} declared but missing: {}", what, path.display());
            None
        }
    }
}

/// Parse container.xml and return the `full-path` of the first rootfile.
pub fn parse_container_xml(content: &[u8]) -> Result<String> {
    let mut reader = xml::reader(content);
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) => {
                if xml::start_name(&e) == "rootfile" {
                    return xml::attribute(&e, "full-path")
                        .map(|path| path.trim().to_string())
                        .filter(|path| !path.is_empty())
                        .ok_or_else(|| {
                            EpubError::MalformedContainer(
                                "rootfile has no full-path attribute".into(),
                            )
                        });
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(EpubError::MalformedContainer(format!(
                    "XML parse error: {:?}",
                    e
                )))
            }
            _ => {}
        }
        buf.clear();
    }

    Err(EpubError::MalformedContainer(
        "No rootfile found in container.xml".into(),
    ))
}

/// Recursively collect `html`/`xhtml`/`htm` files under `dir`, sorted by
/// byte-wise path order.
pub fn scan_content_documents(dir: &Path) -> Vec<PathBuf> {
    let mut found = Vec::new();
    walk(dir, 0, &mut found);
    sort_paths(&mut found);
    found
}

fn walk(dir: &Path, depth: usize, found: &mut Vec<PathBuf>) {
    if depth > MAX_SCAN_DEPTH {
        return;
    }
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let Ok(file_type) = entry.file_type() else {
            continue;
        };
        if file_type.is_dir() {
            walk(&path, depth + 1, found);
        } else if file_type.is_file() && is_content_document(&path) {
            found.push(path);
        }
    }
}

fn is_content_document(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| {
            CONTENT_EXTENSIONS
                .iter()
                .any(|known| ext.eq_ignore_ascii_case(known))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONTAINER: &str = r#"<?xml version="1.0"?>
<container xmlns="urn:oasis:names:tc:opendocument:xmlns:container" version="1.0">
   <rootfiles>
      <rootfile full-path="OEBPS/content.opf" media-type="application/oebps-package+xml"/>
      <rootfile full-path="OEBPS/other.opf" media-type="application/oebps-package+xml"/>
   </rootfiles>
</container>"#;

    #[test]
    fn test_parse_container_xml_first_rootfile() {
        let result = parse_container_xml(CONTAINER.as_bytes()).unwrap();
        assert_eq!(result, "OEBPS/content.opf");
    }

    #[test]
    fn test_parse_container_xml_missing_attribute() {
        let container = br#"<container><rootfiles><rootfile media-type="x"/></rootfiles></container>"#;
        let err = parse_container_xml(container).unwrap_err();
        assert!(matches!(err, EpubError::MalformedContainer(_)));
    }

    #[test]
    fn test_parse_container_xml_no_rootfile() {
        let err = parse_container_xml(b"<container/>").unwrap_err();
        assert!(matches!(err, EpubError::MalformedContainer(_)));
    }

    #[test]
    fn test_parse_container_xml_garbage() {
        let err = parse_container_xml(b"<container><rootfiles></container>").unwrap_err();
        assert!(matches!(err, EpubError::MalformedContainer(_)));
    }

    fn layout(dir: &Path, opf: &str) -> PackageLocator {
        fs::create_dir_all(dir.join("META-INF")).unwrap();
        fs::create_dir_all(dir.join("OEBPS")).unwrap();
        fs::write(dir.join(CONTAINER_PATH), CONTAINER).unwrap();
        fs::write(dir.join("OEBPS/content.opf"), opf).unwrap();
        PackageLocator::new(dir)
    }

    #[test]
    fn test_locate_container_and_opf() {
        let dir = tempfile::tempdir().unwrap();
        let locator = layout(dir.path(), "<package/>");

        let container = locator.locate_container().unwrap();
        assert!(container.ends_with(CONTAINER_PATH));
        let opf = locator.locate_opf(&container).unwrap();
        assert_eq!(opf, dir.path().join("OEBPS/content.opf"));
    }

    #[test]
    fn test_locate_container_missing() {
        let dir = tempfile::tempdir().unwrap();
        let locator = PackageLocator::new(dir.path());
        let err = locator.locate_container().unwrap_err();
        assert!(matches!(err, EpubError::ContainerNotFound(_)));
    }

    #[test]
    fn test_locate_opf_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("META-INF")).unwrap();
        fs::write(dir.path().join(CONTAINER_PATH), CONTAINER).unwrap();
        let locator = PackageLocator::new(dir.path());
        let container = locator.locate_container().unwrap();
        let err = locator.locate_opf(&container).unwrap_err();
        assert!(matches!(err, EpubError::OpfNotFound(_)));
    }

    #[test]
    fn test_locate_ncx_by_media_type() {
        let dir = tempfile::tempdir().unwrap();
        let locator = layout(
            dir.path(),
            r#"<package><manifest>
  <item id="toc" href="nav/toc.ncx" media-type="application/x-dtbncx+xml"/>
</manifest></package>"#,
        );
        fs::create_dir_all(dir.path().join("OEBPS/nav")).unwrap();
        fs::write(dir.path().join("OEBPS/nav/toc.ncx"), "<ncx/>").unwrap();

        let opf = dir.path().join("OEBPS/content.opf");
        assert_eq!(
            locator.locate_ncx(&opf),
            Some(dir.path().join("OEBPS/nav/toc.ncx"))
        );
    }

    #[test]
    fn test_locate_ncx_by_spine_toc() {
        let dir = tempfile::tempdir().unwrap();
        let locator = layout(
            dir.path(),
            r#"<package><manifest>
  <item id="navmap" href="navmap.xml" media-type="text/xml"/>
</manifest><spine toc="navmap"/></package>"#,
        );
        fs::write(dir.path().join("OEBPS/navmap.xml"), "<ncx/>").unwrap();

        let opf = dir.path().join("OEBPS/content.opf");
        assert_eq!(
            locator.locate_ncx(&opf),
            Some(dir.path().join("OEBPS/navmap.xml"))
        );
    }

    #[test]
    fn test_locate_ncx_absent_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let locator = layout(
            dir.path(),
            r#"<package><manifest>
  <item id="toc" href="toc.ncx" media-type="application/x-dtbncx+xml"/>
</manifest></package>"#,
        );
        let opf = dir.path().join("OEBPS/content.opf");
        // declared but the file was never written
        assert_eq!(locator.locate_ncx(&opf), None);
    }

    #[test]
    fn test_locate_nav_document() {
        let dir = tempfile::tempdir().unwrap();
        let locator = layout(
            dir.path(),
            r#"<package><manifest>
  <item id="nav" href="nav.xhtml" media-type="application/xhtml+xml" properties="nav"/>
</manifest></package>"#,
        );
        fs::write(dir.path().join("OEBPS/nav.xhtml"), "<html/>").unwrap();
        let opf = dir.path().join("OEBPS/content.opf");
        assert_eq!(
            locator.locate_nav(&opf),
            Some(dir.path().join("OEBPS/nav.xhtml"))
        );
    }

    #[test]
    fn test_rootfile_outside_root_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("book");
        fs::create_dir_all(root.join("META-INF")).unwrap();
        fs::write(dir.path().join("stray.opf"), "<package/>").unwrap();
        fs::write(
            root.join(CONTAINER_PATH),
            r#"<container><rootfiles><rootfile full-path="../stray.opf"/></rootfiles></container>"#,
        )
        .unwrap();

        let locator = PackageLocator::new(&root);
        let container = locator.locate_container().unwrap();
        let err = locator.locate_opf(&container).unwrap_err();
        assert!(matches!(err, EpubError::OpfNotFound(_)));
    }

    #[test]
    fn test_navigation_outside_root_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("book");
        let locator = layout(
            &root,
            r#"<package><manifest>
  <item id="nav" href="../../nav.xhtml" media-type="application/xhtml+xml" properties="nav"/>
  <item id="toc" href="../../toc.ncx" media-type="application/x-dtbncx+xml"/>
</manifest></package>"#,
        );
        fs::write(dir.path().join("nav.xhtml"), "<html/>").unwrap();
        fs::write(dir.path().join("toc.ncx"), "<ncx/>").unwrap();

        let opf = root.join("OEBPS/content.opf");
        assert_eq!(locator.locate_nav(&opf), None);
        assert_eq!(locator.locate_ncx(&opf), None);
    }

    #[test]
    fn test_raw_chapter_paths_sorted() {
        let dir = tempfile::tempdir().unwrap();
        let locator = layout(dir.path(), "<package/>");
        fs::write(dir.path().join("OEBPS/b.XHTML"), "x").unwrap();
        fs::write(dir.path().join("OEBPS/a.htm"), "x").unwrap();
        fs::write(dir.path().join("OEBPS/style.css"), "x").unwrap();

        let paths = locator.raw_chapter_paths();
        assert_eq!(paths.len(), 2);
        assert!(paths[0].ends_with("OEBPS/a.htm"));
        assert!(paths[1].ends_with("OEBPS/b.XHTML"));
    }
}
