//! Table of contents: NCX / nav document parsing with spine fallback
//!
//! Supports EPUB 2.0 NCX (`toc.ncx`) and the EPUB 3.x XHTML navigation
//! document (`epub:type="toc"`). Both are read as a flat list in document
//! order with the nesting depth recorded on each entry. When neither yields
//! anything, one synthetic entry per spine document is produced instead.
//!
//! # Usage
//!
//! ```rust
//! use mu_reader::navigation::parse_ncx;
//!
//! let ncx = br#"<ncx><navMap>
//!   <navPoint id="n1"><navLabel><text>One</text></navLabel><content src="one.xhtml"/></navPoint>
//! </navMap></ncx>"#;
//! let toc = parse_ncx(ncx).unwrap();
//! assert_eq!(toc[0].title, "One");
//! assert_eq!(toc[0].chapter_index, Some(0));
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use encoding_rs::Encoding;
use percent_encoding::percent_decode_str;
use quick_xml::events::{BytesStart, Event};
use serde::{Deserialize, Serialize};

use crate::error::{EpubError, Result};
use crate::text::{decode_text, document_title};
use crate::xml;

/// A single table-of-contents entry
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TocItem {
    /// Entry id (navPoint id, or a synthesized one)
    pub id: String,
    /// Display label
    pub title: String,
    /// Source document reference, possibly with a fragment
    pub href: Option<String>,
    /// Nesting depth in the source document, 0 for top level
    pub level: usize,
    /// Child entries; empty in the flat list, filled by [`nest_toc`]
    pub children: Vec<TocItem>,
    /// Chapter this entry links to, when known
    pub chapter_index: Option<usize>,
}

impl TocItem {
    /// Href with any `#fragment` removed and percent-escapes decoded.
    pub fn document_href(&self) -> Option<String> {
        let href = self.href.as_deref()?;
        let path = href.split('#').next().unwrap_or(href);
        if path.is_empty() {
            return None;
        }
        Some(percent_decode_str(path).decode_utf8_lossy().into_owned())
    }

    /// Whether this entry points at the chapter at `index` loaded from `source`.
    ///
    /// `chapter_index` equality wins; otherwise the chapter's source path must
    /// contain the entry's document href.
    pub fn matches_chapter(&self, index: usize, source: &Path) -> bool {
        self.chapter_index == Some(index) || self.href_matches(source)
    }

    /// Whether `source` contains this entry's document href.
    pub fn href_matches(&self, source: &Path) -> bool {
        match self.document_href() {
            Some(href) => source.to_string_lossy().contains(href.trim_start_matches("./")),
            None => false,
        }
    }
}

/// Build the table of contents for one book.
///
/// Uses the NCX when present, then the EPUB 3 nav document, and finally one
/// synthetic entry per content document in `spine_paths`, decoded with
/// `fallback_encodings` after UTF-8.
pub fn build_toc(
    ncx_path: Option<&Path>,
    nav_path: Option<&Path>,
    spine_paths: &[PathBuf],
    fallback_encodings: &[&'static Encoding],
) -> Vec<TocItem> {
    if let Some(path) = ncx_path {
        match fs::read(path).map_err(EpubError::from).and_then(|c| parse_ncx(&c)) {
            Ok(items) if !items.is_empty() => return items,
            Ok(_) => log::warn!("NCX {} has no navPoints", path.display()),
            Err(err) => log::warn!("Failed to read NCX '{}': {}", path.display(), err),
        }
    }

    if let Some(path) = nav_path {
        match fs::read(path).map_err(EpubError::from).and_then(|c| parse_nav_xhtml(&c)) {
            Ok(items) if !items.is_empty() => return items,
            Ok(_) => log::warn!("Nav document {} has no toc entries", path.display()),
            Err(err) => log::warn!("Failed to read nav document '{}': {}", path.display(), err),
        }
    }

    if ncx_path.is_none() && nav_path.is_none() {
        log::debug!("No navigation document, deriving TOC from spine");
    }
    synthesize_toc(spine_paths, fallback_encodings)
}

/// One entry per spine document, titled from its `<title>` when present.
pub fn synthesize_toc(
    spine_paths: &[PathBuf],
    fallback_encodings: &[&'static Encoding],
) -> Vec<TocItem> {
    spine_paths
        .iter()
        .enumerate()
        .map(|(index, path)| {
            let title = fs::read(path)
                .ok()
                .and_then(|bytes| decode_text(&bytes, fallback_encodings))
                .and_then(|html| document_title(&html))
                .unwrap_or_else(|| format!("Chapter {}", index + 1));
            TocItem {
                id: format!("toc-{}", index),
                title,
                href: path
                    .file_name()
                    .map(|name| name.to_string_lossy().into_owned()),
                level: 0,
                children: Vec::new(),
                chapter_index: Some(index),
            }
        })
        .collect()
}

/// Rebuild the tree from a flat, level-annotated list.
pub fn nest_toc(flat: &[TocItem]) -> Vec<TocItem> {
    let mut roots: Vec<TocItem> = Vec::new();
    // Open ancestors of the current entry
    let mut stack: Vec<TocItem> = Vec::new();

    for item in flat {
        while stack.last().is_some_and(|open| open.level >= item.level) {
            close_top(&mut stack, &mut roots);
        }
        let mut node = item.clone();
        node.children.clear();
        stack.push(node);
    }
    while !stack.is_empty() {
        close_top(&mut stack, &mut roots);
    }
    roots
}

fn close_top(stack: &mut Vec<TocItem>, roots: &mut Vec<TocItem>) {
    if let Some(done) = stack.pop() {
        match stack.last_mut() {
            Some(parent) => parent.children.push(done),
            None => roots.push(done),
        }
    }
}

/// Partial navPoint being built during parsing
struct PartialNavPoint {
    id: Option<String>,
    label: String,
    src: Option<String>,
    level: usize,
    /// Position reserved in the output list
    slot: usize,
}

/// Parse an EPUB 2.0 NCX navigation document
///
/// Every `<navPoint>` in the `<navMap>` becomes one entry, in document order
/// (a parent precedes its children). `chapter_index` is the entry's position
/// in the returned list.
pub fn parse_ncx(content: &[u8]) -> Result<Vec<TocItem>> {
    let mut reader = xml::text_reader(content);
    let mut buf = Vec::new();

    let mut slots: Vec<Option<TocItem>> = Vec::new();
    let mut stack: Vec<PartialNavPoint> = Vec::new();
    let mut in_nav_map = false;
    let mut in_text = false;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match xml::start_name(&e).as_str() {
                "navMap" => in_nav_map = true,
                "navPoint" if in_nav_map => {
                    stack.push(PartialNavPoint {
                        id: xml::attribute(&e, "id"),
                        label: String::new(),
                        src: None,
                        level: stack.len(),
                        slot: slots.len(),
                    });
                    slots.push(None);
                }
                "text" => in_text = true,
                "content" => set_content_src(&mut stack, &e),
                _ => {}
            },
            Ok(Event::Empty(e)) => {
                if xml::start_name(&e) == "content" {
                    set_content_src(&mut stack, &e);
                }
            }
            Ok(Event::Text(e)) => {
                if in_text {
                    if let Some(point) = stack.last_mut() {
                        point.label.push_str(&xml::text(&e));
                    }
                }
            }
            Ok(Event::GeneralRef(e)) => {
                if in_text {
                    if let Some(point) = stack.last_mut() {
                        point.label.push_str(&xml::entity(&e));
                    }
                }
            }
            Ok(Event::End(e)) => match xml::end_name(&e).as_str() {
                "text" => in_text = false,
                "navPoint" => {
                    if let Some(point) = stack.pop() {
                        let slot = point.slot;
                        slots[slot] = Some(TocItem {
                            id: point.id.unwrap_or_else(|| format!("toc-{}", slot)),
                            title: point.label.trim().to_string(),
                            href: point.src,
                            level: point.level,
                            children: Vec::new(),
                            chapter_index: None,
                        });
                    }
                }
                "navMap" => in_nav_map = false,
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(EpubError::Parse(format!("NCX parse error: {:?}", e))),
            _ => {}
        }
        buf.clear();
    }

    Ok(index_entries(slots.into_iter().flatten()))
}

/// First `<content src>` wins for the innermost open navPoint.
fn set_content_src(stack: &mut [PartialNavPoint], e: &BytesStart<'_>) {
    if let (Some(point), Some(src)) = (stack.last_mut(), xml::attribute(e, "src")) {
        point.src.get_or_insert(src);
    }
}

/// Parse the `epub:type="toc"` list of an EPUB 3.x XHTML navigation document
///
/// Only the TOC nav is read; page lists and landmarks are ignored. Entries
/// come back flat in document order with their `<ol>` depth as `level`.
pub fn parse_nav_xhtml(content: &[u8]) -> Result<Vec<TocItem>> {
    let mut reader = xml::text_reader(content);
    let mut buf = Vec::new();

    let mut entries: Vec<TocItem> = Vec::new();
    let mut in_toc = false;
    let mut nav_depth = 0usize;
    let mut list_depth = 0usize;
    let mut anchor: Option<OpenLabel> = None;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match xml::start_name(&e).as_str() {
                "nav" => {
                    if in_toc {
                        nav_depth += 1;
                    } else if xml::attribute(&e, "epub:type")
                        .or_else(|| xml::attribute(&e, "role"))
                        .is_some_and(|t| t.split_whitespace().any(|t| t == "toc" || t == "doc-toc"))
                    {
                        in_toc = true;
                        nav_depth = 0;
                    }
                }
                name if anchor.is_some() => {
                    if let Some(open) = anchor.as_mut().filter(|open| open.element == name) {
                        open.nested += 1;
                    }
                }
                "ol" | "ul" if in_toc => list_depth += 1,
                name @ ("a" | "span") if in_toc => {
                    anchor = Some(OpenLabel {
                        element: name.to_string(),
                        nested: 0,
                        href: xml::attribute(&e, "href"),
                        label: String::new(),
                    });
                }
                _ => {}
            },
            Ok(Event::Text(e)) => {
                if let Some(open) = anchor.as_mut() {
                    open.label.push_str(&xml::text(&e));
                }
            }
            Ok(Event::GeneralRef(e)) => {
                if let Some(open) = anchor.as_mut() {
                    open.label.push_str(&xml::entity(&e));
                }
            }
            Ok(Event::End(e)) => match xml::end_name(&e).as_str() {
                name if anchor.as_ref().is_some_and(|open| open.element == name) => {
                    match anchor.as_mut() {
                        Some(open) if open.nested > 0 => open.nested -= 1,
                        _ => {
                            if let Some(open) = anchor.take() {
                                let title = normalize_label(&open.label);
                                if !title.is_empty() {
                                    entries.push(TocItem {
                                        id: format!("nav-{}", entries.len()),
                                        title,
                                        href: open.href,
                                        level: list_depth.saturating_sub(1),
                                        children: Vec::new(),
                                        chapter_index: None,
                                    });
                                }
                            }
                        }
                    }
                }
                "ol" | "ul" if in_toc => list_depth = list_depth.saturating_sub(1),
                "nav" if in_toc => {
                    if nav_depth == 0 {
                        break;
                    }
                    nav_depth -= 1;
                }
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(EpubError::Parse(format!("Nav XML parse error: {:?}", e))),
            _ => {}
        }
        buf.clear();
    }

    Ok(index_entries(entries.into_iter()))
}

/// Label element (`<a>` or `<span>`) currently collecting text.
struct OpenLabel {
    element: String,
    /// Same-name elements opened inside the label and not yet closed
    nested: usize,
    href: Option<String>,
    label: String,
}

/// Assign `chapter_index` as the position in the flat list.
fn index_entries(items: impl Iterator<Item = TocItem>) -> Vec<TocItem> {
    items
        .enumerate()
        .map(|(index, mut item)| {
            item.chapter_index = Some(index);
            item
        })
        .collect()
}

fn normalize_label(label: &str) -> String {
    label.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::text::default_fallback_encodings;

    const NCX: &[u8] = br#"<?xml version="1.0" encoding="UTF-8"?>
<ncx xmlns="http://www.daisy.org/z3986/2005/ncx/" version="2005-1">
  <head><meta name="dtb:uid" content="x"/></head>
  <docTitle><text>Book Title</text></docTitle>
  <navMap>
    <navPoint id="np1" playOrder="1">
      <navLabel><text>  Chapter 1  </text></navLabel>
      <content src="text/ch1.xhtml"/>
      <navPoint id="np1-1" playOrder="2">
        <navLabel><text>Section 1.1</text></navLabel>
        <content src="text/ch1.xhtml#s1"/>
      </navPoint>
    </navPoint>
    <navPoint id="np2" playOrder="3">
      <navLabel><text>Tom &amp; Jerry</text></navLabel>
      <content src="text/ch2.xhtml"/>
    </navPoint>
  </navMap>
</ncx>"#;

    #[test]
    fn test_parse_ncx_document_order() {
        let toc = parse_ncx(NCX).unwrap();
        assert_eq!(toc.len(), 3);

        assert_eq!(toc[0].id, "np1");
        assert_eq!(toc[0].title, "Chapter 1");
        assert_eq!(toc[0].href.as_deref(), Some("text/ch1.xhtml"));
        assert_eq!(toc[0].level, 0);
        assert_eq!(toc[0].chapter_index, Some(0));

        assert_eq!(toc[1].id, "np1-1");
        assert_eq!(toc[1].level, 1);
        assert_eq!(toc[1].chapter_index, Some(1));

        assert_eq!(toc[2].title, "Tom & Jerry");
        assert_eq!(toc[2].chapter_index, Some(2));
    }

    #[test]
    fn test_parse_ncx_ignores_doc_title() {
        let toc = parse_ncx(NCX).unwrap();
        assert!(toc.iter().all(|item| item.title != "Book Title"));
    }

    #[test]
    fn test_parse_ncx_without_nav_points() {
        let toc = parse_ncx(br#"<ncx><navMap/></ncx>"#).unwrap();
        assert!(toc.is_empty());
    }

    #[test]
    fn test_parse_ncx_missing_id_is_synthesized() {
        let ncx = br#"<ncx><navMap><navPoint><navLabel><text>A</text></navLabel><content src="a.xhtml"/></navPoint></navMap></ncx>"#;
        let toc = parse_ncx(ncx).unwrap();
        assert_eq!(toc[0].id, "toc-0");
    }

    #[test]
    fn test_parse_nav_xhtml_toc_only() {
        let nav = br#"<?xml version="1.0" encoding="UTF-8"?>
<html xmlns="http://www.w3.org/1999/xhtml" xmlns:epub="http://www.idpf.org/2007/ops">
<body>
<nav epub:type="toc">
  <h1>Contents</h1>
  <ol>
    <li><a href="chapter1.xhtml">Chapter <em>One</em></a>
      <ol><li><a href="chapter1.xhtml#p2">Part 2</a></li></ol>
    </li>
    <li><a href="chapter2.xhtml">Chapter 2</a></li>
  </ol>
</nav>
<nav epub:type="landmarks">
  <ol><li><a href="cover.xhtml">Cover</a></li></ol>
</nav>
</body>
</html>"#;

        let toc = parse_nav_xhtml(nav).unwrap();
        assert_eq!(toc.len(), 3);
        assert_eq!(toc[0].title, "Chapter One");
        assert_eq!(toc[0].level, 0);
        assert_eq!(toc[1].title, "Part 2");
        assert_eq!(toc[1].level, 1);
        assert_eq!(toc[2].href.as_deref(), Some("chapter2.xhtml"));
        assert_eq!(toc[2].chapter_index, Some(2));
    }

    #[test]
    fn test_parse_nav_xhtml_span_inside_anchor() {
        let nav = br#"<html><body><nav epub:type="toc"><ol>
<li><a href="c1.xhtml"><span class="num">1</span> The Beginning</a></li>
<li><span>Part <span>II</span> Heading</span>
  <ol><li><a href="c2.xhtml"><span>2</span> <span>Onward</span></a></li></ol>
</li>
</ol></nav></body></html>"#;

        let toc = parse_nav_xhtml(nav).unwrap();
        let titles: Vec<&str> = toc.iter().map(|t| t.title.as_str()).collect();
        assert_eq!(titles, vec!["1 The Beginning", "Part II Heading", "2 Onward"]);
        assert_eq!(toc[0].href.as_deref(), Some("c1.xhtml"));
        assert_eq!(toc[1].href, None);
        assert_eq!(toc[2].level, 1);
    }

    #[test]
    fn test_nest_toc_rebuilds_tree() {
        let toc = parse_ncx(NCX).unwrap();
        let tree = nest_toc(&toc);
        assert_eq!(tree.len(), 2);
        assert_eq!(tree[0].children.len(), 1);
        assert_eq!(tree[0].children[0].title, "Section 1.1");
        assert!(tree[1].children.is_empty());
    }

    #[test]
    fn test_matches_chapter() {
        let toc = parse_ncx(NCX).unwrap();
        let ch2 = Path::new("/book/OEBPS/text/ch2.xhtml");
        assert!(toc[2].matches_chapter(2, ch2));
        // by href containment even when the index differs
        assert!(toc[2].matches_chapter(7, ch2));
        assert!(!toc[0].matches_chapter(5, ch2));
    }

    #[test]
    fn test_build_toc_falls_back_to_spine_titles() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.xhtml");
        let b = dir.path().join("b.xhtml");
        fs::write(&a, "<html><head><title>Opening</title></head><body/></html>").unwrap();
        fs::write(&b, "<html><body><p>no title</p></body></html>").unwrap();

        let toc = build_toc(None, None, &[a, b], &default_fallback_encodings());
        assert_eq!(toc.len(), 2);
        assert_eq!(toc[0].title, "Opening");
        assert_eq!(toc[1].title, "Chapter 2");
        assert_eq!(toc[1].chapter_index, Some(1));
        assert_eq!(toc[1].href.as_deref(), Some("b.xhtml"));
    }

    #[test]
    fn test_build_toc_empty_ncx_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let ncx = dir.path().join("toc.ncx");
        fs::write(&ncx, "<ncx><navMap></navMap></ncx>").unwrap();
        let a = dir.path().join("a.xhtml");
        fs::write(&a, "<html/>").unwrap();

        let toc = build_toc(Some(&ncx), None, &[a], &[]);
        assert_eq!(toc.len(), 1);
        assert_eq!(toc[0].title, "Chapter 1");
    }

    #[test]
    fn test_build_toc_prefers_ncx() {
        let dir = tempfile::tempdir().unwrap();
        let ncx = dir.path().join("toc.ncx");
        fs::write(&ncx, NCX).unwrap();
        let toc = build_toc(Some(&ncx), None, &[], &[]);
        assert_eq!(toc.len(), 3);
    }
}
