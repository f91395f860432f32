//! EPUB spine parser and reading-order resolution
//!
//! The spine defines the reading order of chapters. This module parses
//! the spine from the OPF and turns it into an ordered list of content
//! document paths, falling back to the manifest or a directory scan when the
//! spine is missing or unusable.

use std::fs;
use std::path::{Path, PathBuf};

use quick_xml::events::Event;

use crate::error::Result;
use crate::package::scan_content_documents;
use crate::resources::{parse_manifest, ResourceRegistry};
use crate::xml;

/// Maximum number of spine items (fixed-size constraint)
const MAX_SPINE_ITEMS: usize = 4096;

/// A single item in the EPUB spine (chapter reference)
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SpineItem {
    /// Manifest item this spine entry references
    pub idref: String,
    /// Optional spine-level ID
    pub id: Option<String>,
    /// Whether this item is part of the linear reading order
    pub linear: bool,
    /// Optional properties (e.g. "rendition:layout-pre-paginated")
    pub properties: Option<String>,
}

/// Spine represents the declared reading order of an EPUB
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Spine {
    /// Ordered spine entries
    items: Vec<SpineItem>,
    /// Optional TOC item id (EPUB 2.0 NCX reference)
    toc_id: Option<String>,
    /// Whether a `<spine>` element was present at all
    declared: bool,
}

impl Spine {
    /// Create a new empty spine
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a reference to the ordered spine entries
    pub fn items(&self) -> &[SpineItem] {
        &self.items
    }

    /// Get optional TOC item id from `<spine toc="...">` (EPUB 2.0).
    pub fn toc_id(&self) -> Option<&str> {
        self.toc_id.as_deref()
    }

    /// Whether the OPF contained a `<spine>` element.
    pub fn is_declared(&self) -> bool {
        self.declared
    }

    /// Get total number of entries
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Check if spine is empty
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Get idref at specific index
    pub fn get_id(&self, index: usize) -> Option<&str> {
        self.items.get(index).map(|item| item.idref.as_str())
    }

    /// Get spine item at specific index
    pub fn get_item(&self, index: usize) -> Option<&SpineItem> {
        self.items.get(index)
    }
}

/// Parse spine from OPF content
///
/// Extracts the ordered list of itemrefs from the spine element.
pub fn parse_spine(content: &[u8]) -> Result<Spine> {
    let mut reader = xml::reader(content);
    let mut buf = Vec::new();
    let mut spine = Spine::new();
    let mut in_spine = false;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) => {
                let name = xml::start_name(&e);

                if name == "spine" {
                    in_spine = true;
                    spine.declared = true;
                    if let Some(toc) = xml::attribute(&e, "toc").filter(|v| !v.is_empty()) {
                        spine.toc_id = Some(toc);
                    }
                }

                if in_spine && name == "itemref" && spine.items.len() < MAX_SPINE_ITEMS {
                    if let Some(item) = parse_spine_item(&e) {
                        spine.items.push(item);
                    }
                }
            }
            Ok(Event::End(e)) => {
                if xml::end_name(&e) == "spine" {
                    in_spine = false;
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                log::warn!(
                    "Spine XML error at byte {}, keeping {} itemrefs read so far: {:?}",
                    reader.buffer_position(),
                    spine.items.len(),
                    e
                );
                break;
            }
            _ => {}
        }
        buf.clear();
    }

    Ok(spine)
}

/// Parse a spine itemref from XML element attributes
fn parse_spine_item(e: &quick_xml::events::BytesStart<'_>) -> Option<SpineItem> {
    let idref = xml::attribute(e, "idref").filter(|v| !v.is_empty())?;
    let linear = xml::attribute(e, "linear").is_none_or(|v| v.trim() != "no");
    Some(SpineItem {
        idref,
        id: xml::attribute(e, "id"),
        linear,
        properties: xml::attribute(e, "properties"),
    })
}

/// Which strategy produced the reading order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SpineSource {
    /// `<spine>` itemrefs resolved through the manifest
    Spine,
    /// HTML manifest items in path order
    Manifest,
    /// HTML files found under the OPF directory
    DirectoryScan,
    /// Nothing usable was found
    Empty,
}

/// Ordered content documents plus the tier that produced them.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SpineItems {
    /// Absolute paths in reading order
    pub paths: Vec<PathBuf>,
    /// Strategy that produced `paths`
    pub source: SpineSource,
}

/// Resolves the reading order of one package document.
pub struct SpineResolver<'a> {
    registry: &'a ResourceRegistry,
}

impl<'a> SpineResolver<'a> {
    /// Create a resolver over an already-populated registry.
    pub fn new(registry: &'a ResourceRegistry) -> Self {
        Self { registry }
    }

    /// Best-effort reading order for the OPF at `opf_path`.
    ///
    /// Tries, in order: spine itemrefs that resolve to existing files, HTML
    /// manifest items sorted by path, and HTML files under the OPF
    /// directory sorted by path. Never fails on a bad spine; an empty result
    /// is left for the assembler to handle.
    pub fn spine_items(&self, opf_path: &Path) -> Result<SpineItems> {
        let content = fs::read(opf_path)?;
        let base = opf_path.parent().unwrap_or_else(|| Path::new(""));

        let spine = match parse_spine(&content) {
            Ok(spine) => spine,
            Err(err) => {
                log::warn!("Unreadable spine in {}: {}", opf_path.display(), err);
                Spine::new()
            }
        };

        let from_spine = self.resolve_itemrefs(&spine);
        if !from_spine.is_empty() {
            return Ok(SpineItems {
                paths: from_spine,
                source: SpineSource::Spine,
            });
        }
        if spine.is_declared() {
            log::warn!("Spine yielded no readable documents, falling back to manifest order");
        } else {
            log::warn!("OPF has no <spine>, falling back to manifest order");
        }

        let from_manifest = self.manifest_documents(&content, base);
        if !from_manifest.is_empty() {
            return Ok(SpineItems {
                paths: from_manifest,
                source: SpineSource::Manifest,
            });
        }

        log::warn!("Manifest lists no HTML documents, scanning {}", base.display());
        let mut scanned = scan_content_documents(base);
        scanned.retain(|path| self.registry.contains_path(path));
        let source = if scanned.is_empty() {
            SpineSource::Empty
        } else {
            SpineSource::DirectoryScan
        };
        Ok(SpineItems {
            paths: scanned,
            source,
        })
    }

    fn resolve_itemrefs(&self, spine: &Spine) -> Vec<PathBuf> {
        let mut paths = Vec::with_capacity(spine.len());
        for item in spine.items() {
            let Some(path) = self.registry.resource_url(&item.idref) else {
                log::warn!("Spine item '{}' does not exist in manifest", item.idref);
                continue;
            };
            if !self.registry.contains_path(path) {
                log::warn!(
                    "Spine item '{}' points outside the book: {}",
                    item.idref,
                    path.display()
                );
                continue;
            }
            if !path.is_file() {
                log::warn!(
                    "Spine item '{}' points at missing file {}",
                    item.idref,
                    path.display()
                );
                continue;
            }
            paths.push(path.to_path_buf());
        }
        paths
    }

    fn manifest_documents(&self, content: &[u8], base: &Path) -> Vec<PathBuf> {
        let mut paths: Vec<PathBuf> = if self.registry.is_empty() {
            parse_manifest(content)
                .unwrap_or_default()
                .into_iter()
                .filter(|item| item.is_html())
                .filter_map(|item| self.registry.resolve_href(&item.href, base))
                .collect()
        } else {
            self.registry
                .entries()
                .filter(|(_, entry)| entry.media_type.contains("html"))
                .map(|(_, entry)| entry.path.clone())
                .collect()
        };
        paths.retain(|path| self.registry.contains_path(path) && path.is_file());
        sort_paths(&mut paths);
        paths.dedup();
        paths
    }
}

/// Locale-independent ordering: plain byte-wise comparison of the full path.
pub fn sort_paths(paths: &mut [PathBuf]) {
    paths.sort_by(|a, b| a.as_os_str().as_encoded_bytes().cmp(b.as_os_str().as_encoded_bytes()));
}
