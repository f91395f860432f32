//! Content processing: sentence segmentation and render-document generation
//!
//! A [`ContentProcessor`] turns a loaded [`Chapter`] plus display options into
//! a [`ProcessedChapter`]: plain text split into sentences with byte ranges,
//! and a self-contained HTML document carrying a generated stylesheet.
//! Everything here is a pure function of its inputs, so results can be cached
//! by `(chapter id, options fingerprint)` and computed on any thread.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;
use serde::{Deserialize, Serialize};

use crate::chapter::Chapter;
use crate::error::{EpubError, Result};
use crate::xml;

/// Shown in place of a chapter with no markup at all.
const EMPTY_CHAPTER_HTML: &str = r#"<p class="placeholder">No content available</p>"#;

/// Heading font-size multipliers relative to the base font size, h1..h6.
const HEADING_SCALE: [f32; 6] = [1.8, 1.6, 1.4, 1.2, 1.1, 1.0];

/// Byte range of one sentence within the chapter's plain text.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SentenceRange {
    /// Offset of the first byte
    pub start: usize,
    /// Offset one past the last byte
    pub end: usize,
}

impl SentenceRange {
    /// Length in bytes
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    /// Check if the range is empty
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// How the highlighted sentence is marked.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HighlightMode {
    /// Tinted background behind the sentence
    #[default]
    Background,
    /// Underline below the sentence
    Underline,
}

/// Display configuration for rendering a chapter.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ContentDisplayOptions {
    /// Base font size in CSS pixels
    pub font_size: f32,
    /// Line height multiplier
    pub line_spacing: f32,
    /// Left and right page padding in CSS pixels
    pub horizontal_padding: f32,
    /// Dark palette instead of light
    pub dark_mode: bool,
    /// Sentence to highlight, by index into the segmented sentences
    pub highlighted_sentence: Option<usize>,
    /// Highlight style; background when unset
    pub highlight_mode: Option<HighlightMode>,
}

impl Default for ContentDisplayOptions {
    fn default() -> Self {
        Self {
            font_size: 18.0,
            line_spacing: 1.6,
            horizontal_padding: 20.0,
            dark_mode: false,
            highlighted_sentence: None,
            highlight_mode: None,
        }
    }
}

impl ContentDisplayOptions {
    /// Hash of every option, for use next to a chapter id as a cache key.
    pub fn fingerprint(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.font_size.to_bits().hash(&mut hasher);
        self.line_spacing.to_bits().hash(&mut hasher);
        self.horizontal_padding.to_bits().hash(&mut hasher);
        self.dark_mode.hash(&mut hasher);
        self.highlighted_sentence.hash(&mut hasher);
        self.highlight_mode.hash(&mut hasher);
        hasher.finish()
    }
}

/// A chapter ready for display.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessedChapter {
    /// Id of the chapter this was produced from
    pub chapter_id: String,
    /// Title of that chapter
    pub chapter_title: String,
    /// Plain text the sentence ranges index into
    pub plain_text: String,
    /// Sentences in reading order
    pub sentences: Vec<String>,
    /// Byte range of each sentence, parallel to `sentences`
    pub sentence_ranges: Vec<SentenceRange>,
    /// Complete HTML document with stylesheet
    pub html: String,
}

/// Split text into sentences.
///
/// A boundary is a `.`, `!` or `?` immediately followed by whitespace or the
/// end of the text. Leading whitespace is skipped before each sentence; text
/// left over without terminal punctuation forms a final sentence. Ranges are
/// byte offsets into `text`, strictly increasing and non-overlapping.
///
/// Abbreviations followed by a space ("Dr. Smith") are split.
pub fn segment_sentences(text: &str) -> (Vec<String>, Vec<SentenceRange>) {
    let mut sentences = Vec::new();
    let mut ranges = Vec::new();
    let mut start: Option<usize> = None;
    let mut chars = text.char_indices().peekable();

    while let Some((i, c)) = chars.next() {
        if start.is_none() && c.is_whitespace() {
            continue;
        }
        let begin = *start.get_or_insert(i);

        if matches!(c, '.' | '!' | '?') {
            let at_boundary = chars.peek().is_none_or(|&(_, next)| next.is_whitespace());
            if at_boundary {
                let end = i + c.len_utf8();
                sentences.push(text[begin..end].to_string());
                ranges.push(SentenceRange { start: begin, end });
                start = None;
            }
        }
    }

    if let Some(begin) = start {
        let end = begin + text[begin..].trim_end().len();
        if end > begin {
            sentences.push(text[begin..end].to_string());
            ranges.push(SentenceRange { start: begin, end });
        }
    }

    (sentences, ranges)
}

/// Builds render documents for chapters under one set of display options.
#[derive(Clone, Debug, Default)]
pub struct ContentProcessor {
    options: ContentDisplayOptions,
}

impl ContentProcessor {
    /// Create a processor for the given options
    pub fn new(options: ContentDisplayOptions) -> Self {
        Self { options }
    }

    /// Display options in effect
    pub fn options(&self) -> &ContentDisplayOptions {
        &self.options
    }

    /// Cache key for the processed form of `chapter` under these options.
    pub fn cache_key(&self, chapter: &Chapter) -> (String, u64) {
        (chapter.id.clone(), self.options.fingerprint())
    }

    /// Segment and render one chapter.
    ///
    /// When `highlighted_sentence` is set, the highlight script is injected
    /// into the rendered document.
    pub fn process(&self, chapter: &Chapter) -> ProcessedChapter {
        let (sentences, sentence_ranges) = segment_sentences(&chapter.plain_text_content);
        let mut html = self.render_html(chapter);
        if let Some(index) = self.options.highlighted_sentence {
            html = self.highlight_sentence(&html, index, &sentences);
        }

        ProcessedChapter {
            chapter_id: chapter.id.clone(),
            chapter_title: chapter.title.clone(),
            plain_text: chapter.plain_text_content.clone(),
            sentences,
            sentence_ranges,
            html,
        }
    }

    /// Render the chapter as a complete, styled HTML document.
    ///
    /// Headings, images and blockquotes get style classes, images without alt
    /// text get a default one, and empty paragraphs get a non-breaking space
    /// so they keep their height. Markup that does not parse is embedded
    /// unmodified.
    pub fn render_html(&self, chapter: &Chapter) -> String {
        let body = if chapter.html_content.trim().is_empty() {
            EMPTY_CHAPTER_HTML.to_string()
        } else {
            match annotate_markup(&chapter.html_content) {
                Ok(body) => body,
                Err(err) => {
                    log::warn!("Rendering {} without annotation: {}", chapter.id, err);
                    chapter.html_content.clone()
                }
            }
        };
        wrap_document(&body, &stylesheet(&self.options))
    }

    /// Inject a script that highlights sentence `index` once the document
    /// has loaded and scrolls it into view.
    ///
    /// An index outside `sentences` returns `html` unchanged.
    pub fn highlight_sentence(&self, html: &str, index: usize, sentences: &[String]) -> String {
        let Some(sentence) = sentences.get(index) else {
            return html.to_string();
        };

        let script = format!(
            r#"<script>
document.addEventListener('DOMContentLoaded', function () {{
  var target = {target};
  var walker = document.createTreeWalker(document.body, NodeFilter.SHOW_TEXT, null);
  var node;
  while ((node = walker.nextNode())) {{
    var at = node.nodeValue.indexOf(target);
    if (at === -1) {{ continue; }}
    var range = document.createRange();
    range.setStart(node, at);
    range.setEnd(node, at + target.length);
    var mark = document.createElement('mark');
    mark.className = 'sentence-highlight';
    mark.setAttribute('data-sentence', '{index}');
    range.surroundContents(mark);
    mark.scrollIntoView({{ behavior: 'smooth', block: 'center' }});
    break;
  }}
}});
</script>
"#,
            target = js_string(sentence),
            index = index,
        );

        match html.to_ascii_lowercase().rfind("</body>") {
            Some(at) => {
                let mut out = String::with_capacity(html.len() + script.len());
                out.push_str(&html[..at]);
                out.push_str(&script);
                out.push_str(&html[at..]);
                out
            }
            None => format!("{}{}", html, script),
        }
    }
}

/// Re-serialize the body of a chapter document with style annotations.
fn annotate_markup(html: &str) -> Result<String> {
    let mut reader = xml::text_reader(html.as_bytes());
    let mut writer = Writer::new(Vec::with_capacity(html.len()));
    let mut buf = Vec::new();
    let mut head_depth = 0usize;
    // A `<p>` start held back until we know whether the paragraph is empty
    let mut pending_paragraph: Option<(BytesStart<'static>, String)> = None;

    loop {
        buf.clear();
        let event = reader
            .read_event_into(&mut buf)
            .map_err(|e| EpubError::Parse(format!("Chapter markup error: {:?}", e)))?;

        if head_depth > 0 {
            match &event {
                Event::Start(e) if !is_void_element(&xml::start_name(e)) => head_depth += 1,
                Event::End(e) if xml::end_name(e).eq_ignore_ascii_case("head") => head_depth = 0,
                Event::End(_) => head_depth = (head_depth - 1).max(1),
                Event::Eof => break,
                _ => {}
            }
            continue;
        }

        if let Some((start, whitespace)) = pending_paragraph.take() {
            match &event {
                Event::End(e) if xml::end_name(e).eq_ignore_ascii_case("p") => {
                    write_empty_paragraph(&mut writer, start)?;
                    continue;
                }
                Event::Text(e) if xml::text(e).trim().is_empty() => {
                    let whitespace = whitespace + &xml::text(e);
                    pending_paragraph = Some((start, whitespace));
                    continue;
                }
                _ => {
                    write(&mut writer, Event::Start(start))?;
                    if !whitespace.is_empty() {
                        write(&mut writer, Event::Text(BytesText::from_escaped(whitespace)))?;
                    }
                }
            }
        }

        match event {
            Event::Eof => break,
            Event::Decl(_) | Event::PI(_) | Event::DocType(_) => {}
            Event::Start(e) => {
                let name = xml::start_name(&e).to_ascii_lowercase();
                match name.as_str() {
                    "html" | "body" => {}
                    "head" => head_depth = 1,
                    "p" => pending_paragraph = Some((e.into_owned(), String::new())),
                    _ => write(&mut writer, Event::Start(annotate(e, &name)))?,
                }
            }
            Event::Empty(e) => {
                let name = xml::start_name(&e).to_ascii_lowercase();
                match name.as_str() {
                    "html" | "head" | "body" => {}
                    "p" => write_empty_paragraph(&mut writer, e.into_owned())?,
                    _ => write(&mut writer, Event::Empty(annotate(e, &name)))?,
                }
            }
            Event::End(e) => {
                let name = xml::end_name(&e).to_ascii_lowercase();
                if !matches!(name.as_str(), "html" | "body") {
                    write(&mut writer, Event::End(e))?;
                }
            }
            other => write(&mut writer, other)?,
        }
    }

    String::from_utf8(writer.into_inner())
        .map_err(|e| EpubError::Parse(format!("Chapter markup is not UTF-8: {}", e)))
}

/// HTML elements that never take an end tag.
fn is_void_element(name: &str) -> bool {
    const VOID: &[&str] = &[
        "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "param",
        "source", "track", "wbr",
    ];
    VOID.iter().any(|void| name.eq_ignore_ascii_case(void))
}

/// Add the style class for headings, images and blockquotes.
fn annotate<'a>(e: BytesStart<'a>, name: &str) -> BytesStart<'a> {
    let class = match name {
        "h1" | "h2" | "h3" | "h4" | "h5" | "h6" => "heading",
        "img" => "chapter-image",
        "blockquote" => "blockquote",
        _ => return e,
    };

    let mut out = BytesStart::new(xml::qualified_name(&e));
    for attr in e.attributes().flatten() {
        if attr.key.as_ref() != b"class" {
            out.push_attribute(attr);
        }
    }
    let classes = match xml::attribute(&e, "class") {
        Some(existing) if !existing.trim().is_empty() => format!("{} {}", existing.trim(), class),
        _ => class.to_string(),
    };
    out.push_attribute(("class", classes.as_str()));
    if name == "img" && xml::attribute(&e, "alt").is_none() {
        out.push_attribute(("alt", "Image"));
    }
    out
}

fn write_empty_paragraph(writer: &mut Writer<Vec<u8>>, start: BytesStart<'static>) -> Result<()> {
    let name = xml::qualified_name(&start);
    write(writer, Event::Start(start))?;
    write(writer, Event::Text(BytesText::from_escaped("&nbsp;")))?;
    write(writer, Event::End(BytesEnd::new(name)))
}

fn write(writer: &mut Writer<Vec<u8>>, event: Event<'_>) -> Result<()> {
    writer
        .write_event(event)
        .map_err(|e| EpubError::Parse(format!("Chapter markup write error: {}", e)))
}

fn wrap_document(body: &str, css: &str) -> String {
    format!(
        r#"<!DOCTYPE html>
<html>
<head>
<meta charset="utf-8"/>
<meta name="viewport" content="width=device-width, initial-scale=1.0"/>
<style>
{css}</style>
</head>
<body>
{body}
</body>
</html>
"#
    )
}

/// Colors for one theme
struct Palette {
    background: &'static str,
    text: &'static str,
    accent: &'static str,
    highlight: &'static str,
}

const LIGHT: Palette = Palette {
    background: "#ffffff",
    text: "#1c1c1e",
    accent: "#8e8e93",
    highlight: "#fff3a3",
};

const DARK: Palette = Palette {
    background: "#1c1c1e",
    text: "#e5e5ea",
    accent: "#636366",
    highlight: "#5c4d00",
};

fn stylesheet(options: &ContentDisplayOptions) -> String {
    let palette = if options.dark_mode { &DARK } else { &LIGHT };
    let mut css = format!(
        "body {{\n  margin: 0;\n  padding: 0 {padding:.1}px;\n  font-size: {size:.1}px;\n  line-height: {spacing:.2};\n  background-color: {bg};\n  color: {fg};\n  word-wrap: break-word;\n}}\n",
        padding = options.horizontal_padding,
        size = options.font_size,
        spacing = options.line_spacing,
        bg = palette.background,
        fg = palette.text,
    );

    for (level, scale) in HEADING_SCALE.iter().enumerate() {
        let weight = if level == 5 { "font-weight: bold; " } else { "" };
        css.push_str(&format!(
            "h{n}, h{n}.heading {{ font-size: {size:.1}px; {weight}line-height: 1.3; }}\n",
            n = level + 1,
            size = options.font_size * scale,
        ));
    }

    css.push_str(
        "img.chapter-image { display: block; max-width: 100%; height: auto; margin: 1em auto; }\n",
    );
    css.push_str(&format!(
        "blockquote.blockquote {{ margin: 1em 0; padding-left: 1em; border-left: 3px solid {}; font-style: italic; }}\n",
        palette.accent
    ));
    css.push_str(&format!(
        "p.placeholder {{ color: {}; text-align: center; }}\n",
        palette.accent
    ));
    let mark = match options.highlight_mode.unwrap_or_default() {
        HighlightMode::Background => format!(
            "mark.sentence-highlight {{ background-color: {}; color: inherit; }}\n",
            palette.highlight
        ),
        HighlightMode::Underline => format!(
            "mark.sentence-highlight {{ background: none; color: inherit; text-decoration: underline 2px {}; }}\n",
            palette.accent
        ),
    };
    css.push_str(&mark);
    css
}

/// JavaScript string literal for `value`, safe inside a `<script>` element.
fn js_string(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    for c in value.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '<' => out.push_str("\\u003c"),
            '\u{2028}' => out.push_str("\\u2028"),
            '\u{2029}' => out.push_str("\\u2029"),
            c if c.is_control() => out.push_str(&format!("\\u{:04x}", c as u32)),
            c => out.push(c),
        }
    }
    out.push('"');
    out
}
