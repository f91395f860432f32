//! mu-reader -- inspect how an EPUB resolves into a readable book

use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use uuid::Uuid;

use mu_reader::spine::parse_spine;
use mu_reader::{
    extract_epub, segment_sentences, Book, ContentDisplayOptions, ContentProcessor, EpubError,
    HighlightMode, PackageLocator, ParseOptionsBuilder, ResourceRegistry, Spine, SpineResolver,
};

#[derive(Parser)]
#[command(name = "mu-reader")]
#[command(version, about = "Inspect EPUB package resolution and reading content", long_about = None)]
#[command(after_help = "EXAMPLES:
    mu-reader metadata book.epub --pretty
    mu-reader sentences book.epub 0
    mu-reader render book.epub 2 --dark --highlight 3 --raw > chapter.html")]
struct Cli {
    /// Pretty-print JSON output
    #[arg(long, global = true)]
    pretty: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Title, author, cover and descriptive metadata
    Metadata {
        /// EPUB file
        epub: PathBuf,
    },
    /// Declared spine and the resolved reading order
    Spine {
        /// EPUB file
        epub: PathBuf,
    },
    /// Table of contents entries
    Toc {
        /// EPUB file
        epub: PathBuf,
        /// Nest entries by level instead of the flat list
        #[arg(long)]
        tree: bool,
    },
    /// Loaded chapters with text sizes and images
    Chapters {
        /// EPUB file
        epub: PathBuf,
    },
    /// Sentences of one chapter with their byte ranges
    Sentences {
        /// EPUB file
        epub: PathBuf,
        /// Chapter index
        chapter: usize,
    },
    /// Styled HTML document for one chapter
    Render {
        /// EPUB file
        epub: PathBuf,
        /// Chapter index
        chapter: usize,
        /// Use the dark palette
        #[arg(long)]
        dark: bool,
        /// Base font size in pixels
        #[arg(long, default_value_t = 18.0)]
        font_size: f32,
        /// Sentence index to highlight
        #[arg(long)]
        highlight: Option<usize>,
        /// Underline the highlighted sentence instead of tinting it
        #[arg(long)]
        underline: bool,
        /// Print the HTML document instead of JSON
        #[arg(long)]
        raw: bool,
    },
}

enum Output {
    Json(Value),
    Raw(String),
}

/// Scratch extraction directory removed when the command finishes.
struct Workspace {
    root: PathBuf,
}

impl Workspace {
    fn new() -> Self {
        Self {
            root: std::env::temp_dir().join(format!("mu-reader-cli-{}", Uuid::new_v4())),
        }
    }

    fn cleanup(&self) {
        if self.root.exists() {
            if let Err(err) = fs::remove_dir_all(&self.root) {
                log::warn!("Could not remove {}: {}", self.root.display(), err);
            }
        }
    }
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let cli = Cli::parse();

    let workspace = Workspace::new();
    let result = run(&cli.command, &workspace);
    workspace.cleanup();

    match result.and_then(|output| render_output(output, cli.pretty)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(msg) => {
            eprintln!("error: {msg}");
            ExitCode::FAILURE
        }
    }
}

fn run(command: &Command, workspace: &Workspace) -> Result<Output, String> {
    match command {
        Command::Metadata { epub } => {
            let book = parse_book(epub, workspace)?;
            Ok(Output::Json(json!({
                "epub": epub,
                "id": book.id,
                "title": book.title,
                "author": book.author,
                "cover_image": book.cover_image_path.as_deref().map(|p| relative(p, &workspace.root)),
                "metadata": book.metadata,
            })))
        }
        Command::Spine { epub } => spine(epub, workspace),
        Command::Toc { epub, tree } => {
            let book = parse_book(epub, workspace)?;
            let toc = if *tree { book.toc_tree() } else { book.toc_items.clone() };
            Ok(Output::Json(json!({
                "epub": epub,
                "count": book.toc_items.len(),
                "toc": toc,
            })))
        }
        Command::Chapters { epub } => {
            let book = parse_book(epub, workspace)?;
            let chapters: Vec<Value> = book
                .chapters
                .iter()
                .enumerate()
                .map(|(index, chapter)| {
                    let (sentences, _) = segment_sentences(&chapter.plain_text_content);
                    json!({
                        "index": index,
                        "id": chapter.id,
                        "title": chapter.title,
                        "source": relative(&chapter.source_path, &workspace.root),
                        "text_bytes": chapter.plain_text_content.len(),
                        "sentences": sentences.len(),
                        "images": chapter
                            .images
                            .iter()
                            .map(|image| relative(&image.path, &workspace.root))
                            .collect::<Vec<_>>(),
                    })
                })
                .collect();
            Ok(Output::Json(json!({
                "epub": epub,
                "placeholder": book.is_placeholder(),
                "count": chapters.len(),
                "chapters": chapters,
            })))
        }
        Command::Sentences { epub, chapter } => {
            let book = parse_book(epub, workspace)?;
            let chapter = book.chapter(*chapter).map_err(display_err)?;
            let (sentences, ranges) = segment_sentences(&chapter.plain_text_content);
            let items: Vec<Value> = sentences
                .iter()
                .zip(&ranges)
                .enumerate()
                .map(|(index, (text, range))| {
                    json!({ "index": index, "start": range.start, "end": range.end, "text": text })
                })
                .collect();
            Ok(Output::Json(json!({
                "epub": epub,
                "chapter_id": chapter.id,
                "title": chapter.title,
                "count": items.len(),
                "sentences": items,
            })))
        }
        Command::Render {
            epub,
            chapter,
            dark,
            font_size,
            highlight,
            underline,
            raw,
        } => {
            let book = parse_book(epub, workspace)?;
            let chapter = book.chapter(*chapter).map_err(display_err)?;
            let options = ContentDisplayOptions {
                font_size: *font_size,
                dark_mode: *dark,
                highlighted_sentence: *highlight,
                highlight_mode: underline.then_some(HighlightMode::Underline),
                ..ContentDisplayOptions::default()
            };
            let fingerprint = options.fingerprint();
            let processed = ContentProcessor::new(options).process(chapter);
            if *raw {
                return Ok(Output::Raw(processed.html));
            }
            Ok(Output::Json(json!({
                "epub": epub,
                "chapter_id": processed.chapter_id,
                "options_fingerprint": format!("{fingerprint:016x}"),
                "sentence_count": processed.sentences.len(),
                "html": processed.html,
            })))
        }
    }
}

fn spine(epub: &Path, workspace: &Workspace) -> Result<Output, String> {
    let root = extract_epub(epub, &workspace.root).map_err(display_err)?;
    let locator = PackageLocator::new(&root);
    let opf_path = locator
        .locate_container()
        .and_then(|container| locator.locate_opf(&container))
        .map_err(display_err)?;

    let mut registry = ResourceRegistry::with_root(&root);
    if let Err(err) = registry.resolve_manifest_resources(&opf_path) {
        log::warn!("Unreadable manifest in {}: {}", opf_path.display(), err);
    }
    let content = fs::read(&opf_path).map_err(|e| e.to_string())?;
    let declared = parse_spine(&content).unwrap_or_else(|err| {
        log::warn!("Unreadable spine in {}: {}", opf_path.display(), err);
        Spine::new()
    });
    let resolved = SpineResolver::new(&registry)
        .spine_items(&opf_path)
        .map_err(display_err)?;

    let itemrefs: Vec<Value> = declared
        .items()
        .iter()
        .enumerate()
        .map(|(index, item)| {
            let path = registry.resource_url(&item.idref);
            json!({
                "index": index,
                "idref": item.idref,
                "linear": item.linear,
                "properties": item.properties,
                "path": path.map(|p| relative(p, &root)),
                "exists": path.is_some_and(Path::is_file),
            })
        })
        .collect();
    let reading_order: Vec<String> = resolved.paths.iter().map(|p| relative(p, &root)).collect();

    Ok(Output::Json(json!({
        "epub": epub,
        "package": relative(&opf_path, &root),
        "toc_id": declared.toc_id(),
        "itemrefs": itemrefs,
        "source": format!("{:?}", resolved.source),
        "reading_order": reading_order,
    })))
}

fn parse_book(epub: &Path, workspace: &Workspace) -> Result<Book, String> {
    ParseOptionsBuilder::new()
        .extraction_root(&workspace.root)
        .parse_file(epub)
        .map_err(display_err)
}

fn render_output(output: Output, pretty: bool) -> Result<(), String> {
    match output {
        Output::Raw(text) => print!("{text}"),
        Output::Json(value) => {
            let text = if pretty {
                serde_json::to_string_pretty(&value)
            } else {
                serde_json::to_string(&value)
            }
            .map_err(|e| e.to_string())?;
            println!("{text}");
        }
    }
    Ok(())
}

fn relative(path: &Path, root: &Path) -> String {
    path.strip_prefix(root).unwrap_or(path).display().to_string()
}

fn display_err(err: EpubError) -> String {
    if err.is_fatal() {
        format!("{} ({})", err.user_message(), err)
    } else {
        err.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::SimpleFileOptions;

    fn write_epub(path: &Path, opf: &str) {
        let mut zip = zip::ZipWriter::new(fs::File::create(path).unwrap());
        let options = SimpleFileOptions::default();
        let entries: [(&str, &str); 4] = [
            (
                "META-INF/container.xml",
                r#"<container><rootfiles><rootfile full-path="OEBPS/content.opf"/></rootfiles></container>"#,
            ),
            ("OEBPS/content.opf", opf),
            ("OEBPS/a.xhtml", "<html><body><p>A.</p></body></html>"),
            ("OEBPS/c.xhtml", "<html><body><p>C.</p></body></html>"),
        ];
        for (name, content) in entries {
            zip.start_file(name, options).unwrap();
            zip.write_all(content.as_bytes()).unwrap();
        }
        zip.finish().unwrap();
    }

    #[test]
    fn test_spine_command_tolerates_malformed_package() {
        let dir = tempfile::tempdir().unwrap();
        let epub = dir.path().join("book.epub");
        write_epub(
            &epub,
            r#"<package><metadata><dc:description>Salt & pepper</dc:Description></metadata>
<manifest>
  <item id="a" href="a.xhtml" media-type="application/xhtml+xml"/>
  <item id="c" href="c.xhtml" media-type="application/xhtml+xml"/>
</manifest><spine><itemref idref="c"/><itemref idref="a"/></spine>
<!-- cut off"#,
        );
        let workspace = Workspace {
            root: dir.path().join("work"),
        };

        let Ok(Output::Json(value)) = spine(&epub, &workspace) else {
            panic!("spine command failed");
        };
        assert_eq!(value["source"], "Spine");
        assert_eq!(value["itemrefs"].as_array().unwrap().len(), 2);
        let order: Vec<&str> = value["reading_order"]
            .as_array()
            .unwrap()
            .iter()
            .filter_map(Value::as_str)
            .collect();
        assert_eq!(order.len(), 2);
        assert!(order[0].ends_with("c.xhtml"));
        assert!(order[1].ends_with("a.xhtml"));
    }
}
