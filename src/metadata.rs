//! EPUB metadata parser using quick-xml pull parsing
//!
//! Extracts Dublin Core fields, EPUB 3 `<meta property>` values and the
//! cover image reference from the OPF `<metadata>` block. Missing fields
//! never fail the parse: title and author fall back to fixed defaults and
//! everything else is optional.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use quick_xml::events::Event;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::resources::{normalize_path, parse_manifest, resolve_href};
use crate::xml;

/// Title used when the OPF declares none.
pub const UNKNOWN_TITLE: &str = "Unknown Title";

/// Author used when the OPF declares none.
pub const UNKNOWN_AUTHOR: &str = "Unknown Author";

/// Maximum number of subject tags
const MAX_SUBJECTS: usize = 64;

/// Maximum number of extra metadata entries
const MAX_EXTRA: usize = 256;

/// Descriptive book metadata beyond title and author.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookMetadata {
    /// Publisher (dc:publisher)
    pub publisher: Option<String>,
    /// Language code (dc:language)
    pub language: Option<String>,
    /// Unique identifier (dc:identifier), such as an ISBN or UUID
    pub identifier: Option<String>,
    /// Book description / blurb (dc:description)
    pub description: Option<String>,
    /// Rights statement (dc:rights)
    pub rights: Option<String>,
    /// Source publication (dc:source)
    pub source: Option<String>,
    /// Last modified date (dcterms:modified)
    pub modified: Option<String>,
    /// Subject tags (dc:subject) in document order
    pub subjects: Vec<String>,
    /// Everything else: `dc:date`, `dc:contributor`, `<meta>` name/property pairs
    pub extra: BTreeMap<String, String>,
}

/// Result of parsing the OPF `<metadata>` block.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PackageMetadata {
    /// First `dc:title`, or [`UNKNOWN_TITLE`]
    pub title: String,
    /// First `dc:creator`, or [`UNKNOWN_AUTHOR`]
    pub author: String,
    /// Remaining descriptive fields
    pub metadata: BookMetadata,
    /// Manifest id of the cover image, if declared
    pub cover_id: Option<String>,
    /// Resolved cover image path, if it exists on disk
    pub cover_path: Option<PathBuf>,
}

impl Default for PackageMetadata {
    fn default() -> Self {
        Self {
            title: UNKNOWN_TITLE.to_string(),
            author: UNKNOWN_AUTHOR.to_string(),
            metadata: BookMetadata::default(),
            cover_id: None,
            cover_path: None,
        }
    }
}

/// Read the OPF at `opf_path` and extract its metadata.
///
/// The cover is resolved through the manifest of the same OPF and must lie
/// under the extraction root `root`; any failed step leaves `cover_path`
/// empty.
pub fn parse_metadata(opf_path: &Path, root: &Path) -> Result<PackageMetadata> {
    let content = fs::read(opf_path)?;
    let mut parsed = parse_metadata_bytes(&content)?;

    let base = opf_path.parent().unwrap_or_else(|| Path::new(""));
    parsed.cover_path = resolve_cover(&content, parsed.cover_id.as_deref(), base, root);
    Ok(parsed)
}

/// Extract metadata from OPF bytes without touching the filesystem.
///
/// `cover_path` is always `None` here; see [`parse_metadata`].
pub fn parse_metadata_bytes(content: &[u8]) -> Result<PackageMetadata> {
    let mut reader = xml::text_reader(content);
    let mut buf = Vec::new();

    let mut title: Option<String> = None;
    let mut author: Option<String> = None;
    let mut metadata = BookMetadata::default();
    let mut cover_id: Option<String> = None;

    // State tracking
    let mut in_metadata = false;
    let mut current: Option<OpenElement> = None;
    let mut text = String::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                let name = xml::start_name(&e);
                // OPF 2.0 files may wrap Dublin Core in <dc-metadata>/<x-metadata>
                if matches!(name.as_str(), "metadata" | "dc-metadata" | "x-metadata") {
                    in_metadata = true;
                } else if in_metadata && current.is_none() {
                    current = Some(OpenElement::from_start(&e, &name));
                    text.clear();
                }
            }
            Ok(Event::Empty(e)) => {
                if in_metadata && xml::start_name(&e) == "meta" {
                    let meta = MetaAttrs::from_start(&e);
                    if meta.is_cover() {
                        cover_id = meta.content.clone();
                    } else if let Some(content) = meta.content.clone() {
                        if let Some(key) = meta.key() {
                            store_meta(&mut metadata, key, content);
                        }
                    }
                }
            }
            Ok(Event::Text(e)) => {
                if current.is_some() {
                    text.push_str(&xml::text(&e));
                }
            }
            Ok(Event::CData(e)) => {
                if current.is_some() {
                    text.push_str(&String::from_utf8_lossy(&e));
                }
            }
            Ok(Event::GeneralRef(e)) => {
                if current.is_some() {
                    text.push_str(&xml::entity(&e));
                }
            }
            Ok(Event::End(e)) => {
                let name = xml::end_name(&e);
                if name.eq_ignore_ascii_case("metadata") {
                    in_metadata = false;
                    current = None;
                } else if current
                    .as_ref()
                    .is_some_and(|open| open.local.eq_ignore_ascii_case(&name))
                {
                    if let Some(open) = current.take() {
                        let value = text.trim().to_string();
                        match open.local.to_ascii_lowercase().as_str() {
                            "meta" => {
                                if open.meta.is_cover() {
                                    cover_id = open.meta.content.clone();
                                } else if let Some(key) = open.meta.key() {
                                    let value = open.meta.content.clone().unwrap_or(value);
                                    store_meta(&mut metadata, key, value);
                                }
                            }
                            _ if value.is_empty() => {}
                            "title" => {
                                title.get_or_insert(value);
                            }
                            "creator" => {
                                author.get_or_insert(value);
                            }
                            "subject" => {
                                if metadata.subjects.len() < MAX_SUBJECTS {
                                    metadata.subjects.push(value);
                                }
                            }
                            other => store_dc(&mut metadata, other, &open.qualified, value),
                        }
                    }
                    text.clear();
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                log::warn!(
                    "Metadata XML error at byte {}, keeping fields read so far: {:?}",
                    reader.buffer_position(),
                    e
                );
                break;
            }
            _ => {}
        }
        buf.clear();
    }

    // EPUB 3: cover flagged on the manifest item itself
    if cover_id.is_none() {
        cover_id = parse_manifest(content)
            .unwrap_or_default()
            .into_iter()
            .find(|item| item.has_property("cover-image"))
            .map(|item| item.id);
    }

    Ok(PackageMetadata {
        title: title.unwrap_or_else(|| UNKNOWN_TITLE.to_string()),
        author: author.unwrap_or_else(|| UNKNOWN_AUTHOR.to_string()),
        metadata,
        cover_id,
        cover_path: None,
    })
}

/// Metadata child element currently collecting text
struct OpenElement {
    local: String,
    qualified: String,
    meta: MetaAttrs,
}

impl OpenElement {
    fn from_start(e: &quick_xml::events::BytesStart<'_>, local: &str) -> Self {
        let meta = if local == "meta" {
            MetaAttrs::from_start(e)
        } else {
            MetaAttrs::default()
        };
        Self {
            local: local.to_string(),
            qualified: xml::qualified_name(e),
            meta,
        }
    }
}

/// Attributes of a `<meta>` element
#[derive(Default)]
struct MetaAttrs {
    name: Option<String>,
    property: Option<String>,
    content: Option<String>,
    refines: bool,
}

impl MetaAttrs {
    fn from_start(e: &quick_xml::events::BytesStart<'_>) -> Self {
        Self {
            name: xml::attribute(e, "name"),
            property: xml::attribute(e, "property"),
            content: xml::attribute(e, "content"),
            refines: xml::attribute(e, "refines").is_some(),
        }
    }

    fn is_cover(&self) -> bool {
        self.name.as_deref() == Some("cover") && self.content.is_some()
    }

    /// Key under which a non-cover meta is stored; refinements are ignored.
    fn key(&self) -> Option<&str> {
        if self.refines {
            return None;
        }
        self.property.as_deref().or(self.name.as_deref())
    }
}

fn store_meta(metadata: &mut BookMetadata, key: &str, value: String) {
    if value.is_empty() {
        return;
    }
    if key == "dcterms:modified" {
        metadata.modified = Some(value);
    } else if metadata.extra.len() < MAX_EXTRA {
        metadata.extra.entry(key.to_string()).or_insert(value);
    }
}

fn store_dc(metadata: &mut BookMetadata, local: &str, qualified: &str, value: String) {
    let slot = match local {
        "publisher" => &mut metadata.publisher,
        "language" => &mut metadata.language,
        "identifier" => &mut metadata.identifier,
        "description" => &mut metadata.description,
        "rights" => &mut metadata.rights,
        "source" => &mut metadata.source,
        _ => {
            if metadata.extra.len() < MAX_EXTRA {
                metadata.extra.entry(qualified.to_string()).or_insert(value);
            }
            return;
        }
    };
    if slot.is_none() {
        *slot = Some(value);
    }
}

fn resolve_cover(
    content: &[u8],
    cover_id: Option<&str>,
    base: &Path,
    root: &Path,
) -> Option<PathBuf> {
    let cover_id = cover_id?;
    let manifest = parse_manifest(content).ok()?;
    let Some(item) = manifest.iter().find(|item| item.id == cover_id) else {
        log::warn!("Cover id '{}' not found in manifest", cover_id);
        return None;
    };
    let path = resolve_href(&item.href, base);
    if !path.starts_with(normalize_path(root)) {
        log::warn!("Cover image '{}' lies outside the book", item.href);
        return None;
    }
    if path.is_file() {
        Some(path)
    } else {
        log::warn!("Cover image missing: {}", path.display());
        None
    }
}
