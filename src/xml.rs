//! Small quick-xml helpers shared by the package parsers.
//!
//! OPF, NCX and container documents are read with quick-xml's pull reader.
//! Element and attribute names are compared by local name so prefixed
//! variants (`opf:item`, `dc:title`) match their unprefixed forms.

use quick_xml::escape::unescape;
use quick_xml::events::{BytesEnd, BytesRef, BytesStart, BytesText};
use quick_xml::reader::Reader;

/// Build a pull reader over raw XML bytes with whitespace trimming enabled.
///
/// A leading UTF-8 byte order mark is skipped. Package documents in the
/// wild carry bare `&` and end tags with the wrong case or name, so both
/// are accepted instead of aborting the read.
pub(crate) fn reader(content: &[u8]) -> Reader<&[u8]> {
    let content = content.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(content);
    let mut reader = Reader::from_reader(content);
    let config = reader.config_mut();
    config.trim_text(true);
    config.allow_dangling_amp = true;
    config.check_end_names = false;
    reader
}

/// Pull reader that keeps text untouched.
///
/// Text split by entity references arrives as several events; trimming each
/// piece would eat the spaces around `&amp;`, so callers collecting text
/// content use this reader and trim the joined value themselves.
pub(crate) fn text_reader(content: &[u8]) -> Reader<&[u8]> {
    let mut reader = reader(content);
    reader.config_mut().trim_text(false);
    reader
}

/// Local (unprefixed) name of a start tag.
pub(crate) fn start_name(e: &BytesStart<'_>) -> String {
    String::from_utf8_lossy(e.local_name().as_ref()).into_owned()
}

/// Local (unprefixed) name of an end tag.
pub(crate) fn end_name(e: &BytesEnd<'_>) -> String {
    String::from_utf8_lossy(e.local_name().as_ref()).into_owned()
}

/// Qualified name of a start tag, prefix included (`dc:title`).
pub(crate) fn qualified_name(e: &BytesStart<'_>) -> String {
    String::from_utf8_lossy(e.name().as_ref()).into_owned()
}

/// Look up an attribute by qualified or local name and unescape its value.
///
/// Malformed attributes are ignored rather than failing the element.
pub(crate) fn attribute(e: &BytesStart<'_>, key: &str) -> Option<String> {
    for attr in e.attributes().flatten() {
        let full = attr.key.as_ref();
        let local = attr.key.local_name();
        if full == key.as_bytes() || local.as_ref() == key.as_bytes() {
            return Some(unescape_lossy(&attr.value));
        }
    }
    None
}

/// Decode a text node.
pub(crate) fn text(e: &BytesText<'_>) -> String {
    match e.decode() {
        Ok(text) => text.into_owned(),
        Err(_) => String::from_utf8_lossy(e).into_owned(),
    }
}

/// Resolve a general entity reference (`&amp;`, `&#8220;`).
///
/// Entities XML does not predefine (HTML's `&nbsp;` and friends) come back
/// as their literal source text.
pub(crate) fn entity(e: &BytesRef<'_>) -> String {
    let name = match e.decode() {
        Ok(name) => name.into_owned(),
        Err(_) => String::from_utf8_lossy(e).into_owned(),
    };
    if name == "nbsp" {
        return "\u{a0}".to_string();
    }
    let source = format!("&{};", name);
    let resolved = match unescape(&source) {
        Ok(value) => Some(value.into_owned()),
        Err(_) => None,
    };
    resolved.unwrap_or(source)
}

fn unescape_lossy(raw: &[u8]) -> String {
    let decoded = String::from_utf8_lossy(raw).into_owned();
    let unescaped = unescape(&decoded).ok().map(|value| value.into_owned());
    unescaped.unwrap_or(decoded)
}
