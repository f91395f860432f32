//! Resource registry: manifest id -> absolute path resolution
//!
//! The OPF `<manifest>` declares every resource bundled in the book. The
//! registry built from it is the single place the rest of the pipeline asks
//! "where is resource X". It is scoped to one parse and owns no global state.

use std::collections::HashMap;
use std::fs;
use std::path::{Component, Path, PathBuf};

use percent_encoding::percent_decode_str;
use quick_xml::events::Event;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::xml;

/// Maximum number of manifest items (fixed-size constraint)
const MAX_MANIFEST_ITEMS: usize = 4096;

/// A single `<item>` of the OPF manifest, as declared.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ManifestItem {
    /// Resource identifier
    pub id: String,
    /// Path relative to the OPF
    pub href: String,
    /// MIME type
    pub media_type: String,
    /// Optional properties (e.g. "cover-image", "nav")
    pub properties: Option<String>,
}

impl ManifestItem {
    /// Whether the declared media type is an (X)HTML content document.
    pub fn is_html(&self) -> bool {
        self.media_type.contains("html")
    }

    /// Whether `properties` contains the given space-separated token.
    pub fn has_property(&self, property: &str) -> bool {
        self.properties
            .as_deref()
            .is_some_and(|p| p.split_whitespace().any(|token| token == property))
    }
}

/// Registry entry: resolved location plus declared media type.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// Absolute path of the resource in the extracted tree
    pub path: PathBuf,
    /// Declared MIME type
    pub media_type: String,
}

/// Maps manifest ids to resolved resource locations for one parse.
///
/// A registry created with [`ResourceRegistry::with_root`] refuses any
/// resolved path outside that directory.
#[derive(Clone, Debug, Default)]
pub struct ResourceRegistry {
    entries: HashMap<String, ManifestEntry>,
    /// Manifest ids in declaration order
    order: Vec<String>,
    root: Option<PathBuf>,
}

impl ResourceRegistry {
    /// Create an empty, unconfined registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty registry confined to the extraction root `root`.
    pub fn with_root(root: impl AsRef<Path>) -> Self {
        Self {
            root: Some(normalize_path(root.as_ref())),
            ..Self::default()
        }
    }

    /// Extraction root resolved paths must stay under, if any.
    pub fn root(&self) -> Option<&Path> {
        self.root.as_deref()
    }

    /// Whether `path` lies under the extraction root (always true when
    /// unconfined).
    pub fn contains_path(&self, path: &Path) -> bool {
        self.root.as_deref().is_none_or(|root| path.starts_with(root))
    }

    /// Insert or overwrite an entry.
    pub fn register_resource(
        &mut self,
        id: impl Into<String>,
        path: impl Into<PathBuf>,
        media_type: impl Into<String>,
    ) {
        let id = id.into();
        let entry = ManifestEntry {
            path: path.into(),
            media_type: media_type.into(),
        };
        if self.entries.insert(id.clone(), entry).is_none() {
            self.order.push(id);
        }
    }

    /// Read the OPF at `opf_path` and register every well-formed manifest item.
    ///
    /// Returns the id -> path map of everything registered by this call.
    pub fn resolve_manifest_resources(&mut self, opf_path: &Path) -> Result<HashMap<String, PathBuf>> {
        let content = fs::read(opf_path)?;
        let base = opf_path.parent().unwrap_or_else(|| Path::new(""));
        let items = parse_manifest(&content)?;

        let mut resolved = HashMap::with_capacity(items.len());
        for item in items {
            let path = resolve_href(&item.href, base);
            if !self.contains_path(&path) {
                log::warn!(
                    "Skipping manifest item '{}': href '{}' leaves the book",
                    item.id,
                    item.href
                );
                continue;
            }
            resolved.insert(item.id.clone(), path.clone());
            self.register_resource(item.id, path, item.media_type);
        }
        log::debug!(
            "Registered {} manifest resources from {}",
            resolved.len(),
            opf_path.display()
        );
        Ok(resolved)
    }

    /// Resolved path for a manifest id.
    pub fn resource_url(&self, id: &str) -> Option<&Path> {
        self.entries.get(id).map(|entry| entry.path.as_path())
    }

    /// Declared media type for a manifest id.
    pub fn resource_media_type(&self, id: &str) -> Option<&str> {
        self.entries.get(id).map(|entry| entry.media_type.as_str())
    }

    /// Path-based resolution for references that are not manifest ids,
    /// such as `<img src>` inside chapter markup.
    ///
    /// `None` when the reference escapes the extraction root.
    pub fn resolve_href(&self, href: &str, relative_to: &Path) -> Option<PathBuf> {
        let path = resolve_href(href, relative_to);
        if self.contains_path(&path) {
            Some(path)
        } else {
            log::warn!("Ignoring reference '{}' outside the book: {}", href, path.display());
            None
        }
    }

    /// Entries in manifest declaration order.
    pub fn entries(&self) -> impl Iterator<Item = (&str, &ManifestEntry)> + '_ {
        self.order
            .iter()
            .filter_map(|id| self.entries.get(id).map(|entry| (id.as_str(), entry)))
    }

    /// Number of registered resources
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if nothing is registered
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Parse every `<item>` inside `<manifest>` in document order.
///
/// Items missing any of `id`, `href` or `media-type` are skipped.
pub fn parse_manifest(content: &[u8]) -> Result<Vec<ManifestItem>> {
    let mut reader = xml::reader(content);
    let mut buf = Vec::new();
    let mut items = Vec::new();
    let mut in_manifest = false;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) => {
                let name = xml::start_name(&e);
                if name == "manifest" {
                    in_manifest = true;
                } else if in_manifest && name == "item" && items.len() < MAX_MANIFEST_ITEMS {
                    match parse_manifest_item(&e) {
                        Some(item) => items.push(item),
                        None => log::warn!("Skipping manifest item with missing attributes"),
                    }
                }
            }
            Ok(Event::End(e)) => {
                if xml::end_name(&e) == "manifest" {
                    in_manifest = false;
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                log::warn!(
                    "Manifest XML error at byte {}, keeping {} items read so far: {:?}",
                    reader.buffer_position(),
                    items.len(),
                    e
                );
                break;
            }
            _ => {}
        }
        buf.clear();
    }

    Ok(items)
}

/// Parse a manifest item from XML element attributes
fn parse_manifest_item(e: &quick_xml::events::BytesStart<'_>) -> Option<ManifestItem> {
    let id = xml::attribute(e, "id")?;
    let href = xml::attribute(e, "href")?;
    let media_type = xml::attribute(e, "media-type")?;
    if id.is_empty() || href.is_empty() {
        return None;
    }
    Some(ManifestItem {
        id,
        href,
        media_type,
        properties: xml::attribute(e, "properties"),
    })
}

/// Resolve an href against a base directory.
///
/// The fragment is dropped, percent-escapes are decoded, and `.`/`..`
/// segments are folded. A leading `/` anchors the href at `base` rather than
/// the filesystem root, since hrefs never leave the extracted book.
pub fn resolve_href(href: &str, base: &Path) -> PathBuf {
    let href = href.split('#').next().unwrap_or(href);
    let decoded = percent_decode_str(href).decode_utf8_lossy();
    let relative = decoded.trim_start_matches('/');
    normalize_path(&base.join(relative))
}

/// Fold `.` and `..` components without touching the filesystem.
pub fn normalize_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}
