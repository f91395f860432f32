//! Text decoding and lightweight markup stripping for chapter documents.
//!
//! Chapter files are not parsed as XML here. Real-world content documents are
//! often not well-formed, so plain text comes from a single forward scan that
//! drops `<...>` constructs and decodes common entities.

use encoding_rs::Encoding;

/// Elements whose content never contributes to plain text.
const SKIPPED_ELEMENTS: &[&str] = &["head", "script", "style", "title", "noscript"];

/// Legacy encodings tried after UTF-8, in priority order.
///
/// The ISO-8859-1 label maps onto windows-1252 in `encoding_rs`, so it is
/// covered by the first entry.
pub fn default_fallback_encodings() -> Vec<&'static Encoding> {
    vec![
        encoding_rs::WINDOWS_1252,
        encoding_rs::ISO_8859_2,
        encoding_rs::ISO_8859_15,
        encoding_rs::WINDOWS_1251,
        encoding_rs::KOI8_R,
        encoding_rs::SHIFT_JIS,
        encoding_rs::GBK,
        encoding_rs::EUC_KR,
        encoding_rs::MACINTOSH,
    ]
}

/// Decode document bytes, trying UTF-8 first and then each fallback.
///
/// A UTF-8 byte order mark is removed. Fallbacks are tried without
/// replacement characters, so an encoding that cannot represent the input is
/// skipped. Returns `None` when nothing decodes cleanly.
pub fn decode_text(bytes: &[u8], fallbacks: &[&'static Encoding]) -> Option<String> {
    let (text, had_errors) = encoding_rs::UTF_8.decode_with_bom_removal(bytes);
    if !had_errors {
        return Some(text.into_owned());
    }

    for encoding in fallbacks {
        if let Some(text) = encoding.decode_without_bom_handling_and_without_replacement(bytes) {
            log::debug!("Decoded document as {}", encoding.name());
            return Some(text.into_owned());
        }
    }
    None
}

/// Strip markup from an HTML/XHTML document, leaving readable text.
///
/// Tags and comments are removed, `head`/`script`/`style` content is dropped,
/// block-level tags become line breaks, and entities are decoded. Each line
/// has its whitespace collapsed and blank lines are removed.
pub fn strip_markup(html: &str) -> String {
    let mut raw = String::with_capacity(html.len());
    let mut pos = 0;

    while pos < html.len() {
        let Some(offset) = html[pos..].find('<') else {
            raw.push_str(&html[pos..]);
            break;
        };
        raw.push_str(&html[pos..pos + offset]);
        let start = pos + offset;

        if html[start..].starts_with("<!--") {
            pos = match html[start + 4..].find("-->") {
                Some(end) => start + 4 + end + 3,
                None => html.len(),
            };
            continue;
        }

        let Some(close) = html[start..].find('>') else {
            // Unterminated tag swallows the rest of the document
            break;
        };
        let tag = &html[start + 1..start + close];
        pos = start + close + 1;

        let (name, closing) = tag_name(tag);
        if is_block_tag(&name) {
            raw.push('\n');
        }
        if !closing && !tag.ends_with('/') && SKIPPED_ELEMENTS.contains(&name.as_str()) {
            pos = skip_element(html, pos, &name);
        }
    }

    normalize_lines(&decode_entities(&raw))
}

/// Text of the document's `<title>` element, if present and non-blank.
pub fn document_title(html: &str) -> Option<String> {
    let mut search = 0;
    while let Some(found) = find_ignore_case(&html[search..], "<title") {
        let open = search + found;
        let after_name = open + "<title".len();
        search = after_name;
        if !html[after_name..].starts_with(|c: char| c == '>' || c.is_whitespace()) {
            continue;
        }
        let body_start = after_name + html[after_name..].find('>')? + 1;
        let body_len = find_ignore_case(&html[body_start..], "</title")?;
        let title = normalize_plain_text_whitespace(&decode_entities(&strip_tags(
            &html[body_start..body_start + body_len],
        )));
        return (!title.is_empty()).then_some(title);
    }
    None
}

/// Attributes of every start tag named `element`, in document order.
///
/// Attribute names are lowercased and values are entity-decoded.
pub fn element_attributes(html: &str, element: &str) -> Vec<Vec<(String, String)>> {
    let mut found = Vec::new();
    let mut pos = 0;
    while let Some(offset) = html[pos..].find('<') {
        let start = pos + offset;
        let Some(close) = html[start..].find('>') else {
            break;
        };
        let tag = &html[start + 1..start + close];
        pos = start + close + 1;

        let (name, closing) = tag_name(tag);
        if !closing && name == element {
            found.push(parse_attributes(tag));
        }
    }
    found
}

/// Collapse whitespace runs to single spaces and trim both ends.
pub fn normalize_plain_text_whitespace(text: &str) -> String {
    let mut result = String::with_capacity(text.len());
    let mut prev_was_space = true;
    for ch in text.chars() {
        if ch.is_whitespace() {
            if !prev_was_space {
                result.push(' ');
                prev_was_space = true;
            }
        } else {
            result.push(ch);
            prev_was_space = false;
        }
    }
    if result.ends_with(' ') {
        result.pop();
    }
    result
}

/// Decode named and numeric character references.
///
/// Unknown names are left as written.
pub fn decode_entities(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        rest = &rest[amp..];
        let decoded = rest[1..]
            .char_indices()
            .take(12)
            .find(|&(_, c)| c == ';')
            .and_then(|(semi, _)| entity_char(&rest[1..semi + 1]).map(|ch| (ch, semi + 2)));
        match decoded {
            Some((ch, consumed)) => {
                out.push(ch);
                rest = &rest[consumed..];
            }
            None => {
                out.push('&');
                rest = &rest[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

fn entity_char(name: &str) -> Option<char> {
    if let Some(numeric) = name.strip_prefix('#') {
        let code = match numeric.strip_prefix(['x', 'X']) {
            Some(hex) => u32::from_str_radix(hex, 16).ok()?,
            None => numeric.parse().ok()?,
        };
        return char::from_u32(code);
    }
    let ch = match name {
        "amp" => '&',
        "lt" => '<',
        "gt" => '>',
        "quot" => '"',
        "apos" => '\'',
        "nbsp" => '\u{a0}',
        "ndash" => '\u{2013}',
        "mdash" => '\u{2014}',
        "hellip" => '\u{2026}',
        "lsquo" => '\u{2018}',
        "rsquo" => '\u{2019}',
        "ldquo" => '\u{201c}',
        "rdquo" => '\u{201d}',
        "copy" => '\u{a9}',
        _ => return None,
    };
    Some(ch)
}

/// Lowercased local name of a tag body, and whether it is a closing tag.
pub(crate) fn tag_name(tag: &str) -> (String, bool) {
    let (closing, body) = match tag.strip_prefix('/') {
        Some(body) => (true, body),
        None => (false, tag),
    };
    let name: String = body
        .chars()
        .take_while(|c| c.is_ascii_alphanumeric() || matches!(c, ':' | '-' | '_'))
        .collect();
    let local = name.rsplit(':').next().unwrap_or(name.as_str());
    (local.to_ascii_lowercase(), closing)
}

fn is_block_tag(name: &str) -> bool {
    matches!(
        name,
        "p" | "div"
            | "br"
            | "hr"
            | "h1"
            | "h2"
            | "h3"
            | "h4"
            | "h5"
            | "h6"
            | "li"
            | "ul"
            | "ol"
            | "dt"
            | "dd"
            | "tr"
            | "table"
            | "blockquote"
            | "pre"
            | "section"
            | "article"
            | "figure"
            | "figcaption"
            | "body"
    )
}

/// Position just past the end tag of `name`, or the end of input.
fn skip_element(html: &str, from: usize, name: &str) -> usize {
    let end_tag = format!("</{}", name);
    match find_ignore_case(&html[from..], &end_tag) {
        Some(offset) => {
            let tag_start = from + offset;
            html[tag_start..]
                .find('>')
                .map(|close| tag_start + close + 1)
                .unwrap_or(html.len())
        }
        None => html.len(),
    }
}

fn strip_tags(fragment: &str) -> String {
    let mut out = String::with_capacity(fragment.len());
    let mut in_tag = false;
    for ch in fragment.chars() {
        match ch {
            '<' => in_tag = true,
            '>' if in_tag => in_tag = false,
            _ if !in_tag => out.push(ch),
            _ => {}
        }
    }
    out
}

fn normalize_lines(text: &str) -> String {
    text.lines()
        .map(normalize_plain_text_whitespace)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

/// ASCII case-insensitive substring search.
pub(crate) fn find_ignore_case(haystack: &str, needle: &str) -> Option<usize> {
    let needle = needle.as_bytes();
    if needle.is_empty() {
        return Some(0);
    }
    haystack
        .as_bytes()
        .windows(needle.len())
        .position(|window| window.eq_ignore_ascii_case(needle))
}

fn parse_attributes(tag: &str) -> Vec<(String, String)> {
    let body = tag.trim_end_matches('/');
    let name_len = body
        .find(|c: char| c.is_whitespace())
        .unwrap_or(body.len());
    let mut rest = &body[name_len..];
    let mut attrs = Vec::new();

    loop {
        rest = rest.trim_start();
        if rest.is_empty() {
            break;
        }
        let key_len = rest
            .find(|c: char| c.is_whitespace() || c == '=')
            .unwrap_or(rest.len());
        let key = rest[..key_len].to_ascii_lowercase();
        rest = rest[key_len..].trim_start();

        let value = match rest.strip_prefix('=') {
            Some(after_eq) => {
                let after_eq = after_eq.trim_start();
                match after_eq.chars().next() {
                    Some(quote @ ('"' | '\'')) => {
                        let inner = &after_eq[1..];
                        let end = inner.find(quote).unwrap_or(inner.len());
                        rest = inner.get(end + 1..).unwrap_or("");
                        &inner[..end]
                    }
                    _ => {
                        let end = after_eq
                            .find(|c: char| c.is_whitespace())
                            .unwrap_or(after_eq.len());
                        rest = &after_eq[end..];
                        &after_eq[..end]
                    }
                }
            }
            None => "",
        };
        if !key.is_empty() {
            attrs.push((key, decode_entities(value)));
        }
    }
    attrs
}
