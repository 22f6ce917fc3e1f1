//! Multi-format text extraction for course documents (HTML, PDF, PPTX).
//!
//! Extraction failures are expected: every public entry point returns
//! `Option<String>` and a parse failure yields `None`, never an error the
//! walk has to handle.

use std::io::Read;

use scraper::{ElementRef, Html, Selector};

/// Supported MIME types for extraction.
pub const MIME_HTML: &str = "text/html";
pub const MIME_PDF: &str = "application/pdf";
pub const MIME_PPTX: &str =
    "application/vnd.openxmlformats-officedocument.presentationml.presentation";

/// HTML extractions shorter than this are treated as noise and discarded.
const MIN_HTML_TEXT_CHARS: usize = 50;
/// Maximum PDF input size.
const MAX_PDF_BYTES: usize = 50 * 1024 * 1024;
/// Maximum extracted PDF text length.
const MAX_PDF_TEXT_CHARS: usize = 150_000;
/// Maximum decompressed bytes read from a single ZIP entry (zip-bomb protection).
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

/// Elements whose subtrees carry no course content.
const SKIP_TAGS: &[&str] = &["head", "script", "style", "nav", "footer", "header", "noscript"];

#[derive(Debug)]
pub enum ExtractError {
    UnsupportedContentType(String),
    Pdf(String),
    Pptx(String),
}

impl std::fmt::Display for ExtractError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExtractError::UnsupportedContentType(ct) => {
                write!(f, "unsupported content-type: {}", ct)
            }
            ExtractError::Pdf(e) => write!(f, "PDF extraction failed: {}", e),
            ExtractError::Pptx(e) => write!(f, "PPTX extraction failed: {}", e),
        }
    }
}

impl std::error::Error for ExtractError {}

/// Extracts plain text from fetched content.
///
/// `content_type` may carry parameters (`text/html; charset=utf-8`); the
/// source URL's extension is consulted when the content type is missing or
/// generic. Returns `None` for unsupported types, parse failures, and
/// under-length HTML noise.
pub fn extract(bytes: &[u8], content_type: &str, source_url: &str) -> Option<String> {
    let kind = classify(content_type, source_url)?;
    let result = match kind {
        MIME_HTML => Ok(html_to_text(&String::from_utf8_lossy(bytes))),
        MIME_PDF => extract_pdf(bytes),
        MIME_PPTX => extract_pptx(bytes),
        _ => Err(ExtractError::UnsupportedContentType(kind.to_string())),
    };
    match result {
        Ok(text) if !text.is_empty() => Some(text),
        Ok(_) => None,
        Err(e) => {
            eprintln!("Warning: extraction failed for {}: {}", source_url, e);
            None
        }
    }
}

/// Maps a content-type header (plus URL extension fallback) to one of the
/// supported MIME types.
pub fn classify(content_type: &str, source_url: &str) -> Option<&'static str> {
    let ct = content_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase();
    match ct.as_str() {
        MIME_HTML | "application/xhtml+xml" => return Some(MIME_HTML),
        MIME_PDF => return Some(MIME_PDF),
        MIME_PPTX => return Some(MIME_PPTX),
        _ => {}
    }
    let path = source_url.split(['?', '#']).next().unwrap_or("");
    if path.ends_with(".pdf") {
        Some(MIME_PDF)
    } else if path.ends_with(".pptx") {
        Some(MIME_PPTX)
    } else if path.ends_with(".html") || path.ends_with(".htm") || ct.is_empty() {
        Some(MIME_HTML)
    } else {
        None
    }
}

/// Strips an HTML document down to its visible text.
///
/// Script/style/nav/footer subtrees are dropped, entity decoding comes with
/// the parser, and whitespace is collapsed. Returns an empty string when
/// the remaining text is too short to be real content.
pub fn html_to_text(html: &str) -> String {
    let doc = Html::parse_document(html);
    let mut out = String::new();
    collect_text(doc.root_element(), &mut out);
    let collapsed = collapse_whitespace(&out);
    if collapsed.chars().count() < MIN_HTML_TEXT_CHARS {
        return String::new();
    }
    collapsed
}

fn collect_text(el: ElementRef, out: &mut String) {
    if SKIP_TAGS.contains(&el.value().name()) {
        return;
    }
    for child in el.children() {
        if let Some(text) = child.value().as_text() {
            out.push_str(text);
            out.push(' ');
        } else if let Some(child_el) = ElementRef::wrap(child) {
            collect_text(child_el, out);
        }
    }
}

/// The document's `<title>` text, if present.
pub fn html_title(html: &str) -> Option<String> {
    let doc = Html::parse_document(html);
    let sel = Selector::parse("title").ok()?;
    let title = doc
        .select(&sel)
        .next()
        .map(|el| collapse_whitespace(&el.text().collect::<String>()))?;
    if title.is_empty() {
        None
    } else {
        Some(title)
    }
}

/// All `href` targets of anchor elements, in document order, duplicates
/// preserved (the crawler dedupes after normalization).
pub fn html_links(html: &str) -> Vec<String> {
    let doc = Html::parse_document(html);
    let sel = match Selector::parse("a[href]") {
        Ok(s) => s,
        Err(_) => return Vec::new(),
    };
    doc.select(&sel)
        .filter_map(|el| el.value().attr("href"))
        .map(|href| href.to_string())
        .collect()
}

fn collapse_whitespace(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut last_was_space = true;
    for c in text.chars() {
        if c.is_whitespace() {
            if !last_was_space {
                out.push(' ');
                last_was_space = true;
            }
        } else {
            out.push(c);
            last_was_space = false;
        }
    }
    out.trim_end().to_string()
}

fn extract_pdf(bytes: &[u8]) -> Result<String, ExtractError> {
    if bytes.len() > MAX_PDF_BYTES {
        return Err(ExtractError::Pdf(format!(
            "input exceeds size limit ({} bytes)",
            MAX_PDF_BYTES
        )));
    }
    let mut text = pdf_extract::extract_text_from_mem(bytes)
        .map_err(|e| ExtractError::Pdf(e.to_string()))?;
    if text.len() > MAX_PDF_TEXT_CHARS {
        let cut = floor_char_boundary(&text, MAX_PDF_TEXT_CHARS);
        text.truncate(cut);
    }
    Ok(collapse_whitespace(&text))
}

fn extract_pptx(bytes: &[u8]) -> Result<String, ExtractError> {
    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes))
        .map_err(|e| ExtractError::Pptx(e.to_string()))?;
    let mut slide_names: Vec<String> = archive
        .file_names()
        .filter(|n| n.starts_with("ppt/slides/slide") && n.ends_with(".xml"))
        .map(|s| s.to_string())
        .collect();
    slide_names.sort_by_key(|name| {
        name.trim_start_matches("ppt/slides/slide")
            .trim_end_matches(".xml")
            .parse::<u32>()
            .unwrap_or(u32::MAX)
    });
    let mut slides = Vec::new();
    for name in slide_names {
        let xml = read_zip_entry_bounded(&mut archive, &name, MAX_XML_ENTRY_BYTES)?;
        let text = extract_a_t_elements(&xml)?;
        let text = collapse_whitespace(&text);
        if !text.is_empty() {
            slides.push(text);
        }
    }
    Ok(slides.join("\n\n"))
}

fn read_zip_entry_bounded(
    archive: &mut zip::ZipArchive<std::io::Cursor<&[u8]>>,
    name: &str,
    max_bytes: u64,
) -> Result<Vec<u8>, ExtractError> {
    let entry = archive
        .by_name(name)
        .map_err(|e| ExtractError::Pptx(e.to_string()))?;
    let mut out = Vec::new();
    entry
        .take(max_bytes)
        .read_to_end(&mut out)
        .map_err(|e| ExtractError::Pptx(e.to_string()))?;
    if out.len() as u64 >= max_bytes {
        return Err(ExtractError::Pptx(format!(
            "ZIP entry {} exceeds size limit ({} bytes)",
            name, max_bytes
        )));
    }
    Ok(out)
}

fn extract_a_t_elements(xml: &[u8]) -> Result<String, ExtractError> {
    let mut out = String::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(quick_xml::events::Event::Start(e)) => {
                if e.local_name().as_ref() == b"t" {
                    if let Ok(quick_xml::events::Event::Text(te)) = reader.read_event_into(&mut buf)
                    {
                        if !out.is_empty() {
                            out.push(' ');
                        }
                        out.push_str(te.unescape().unwrap_or_default().as_ref());
                    }
                }
            }
            Ok(quick_xml::events::Event::Eof) => break,
            Err(e) => return Err(ExtractError::Pptx(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    Ok(out)
}

fn floor_char_boundary(s: &str, index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    let mut i = index;
    while !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn pptx_with_slides(slides: &[(&str, &str)]) -> Vec<u8> {
        let mut buf = Vec::new();
        {
            let mut zip = zip::ZipWriter::new(std::io::Cursor::new(&mut buf));
            for (name, text) in slides {
                zip.start_file(*name, zip::write::SimpleFileOptions::default())
                    .unwrap();
                let xml = format!(
                    "<?xml version=\"1.0\"?><p:sld xmlns:a=\"http://schemas.openxmlformats.org/drawingml/2006/main\"><p:txBody><a:p><a:r><a:t>{}</a:t></a:r></a:p></p:txBody></p:sld>",
                    text
                );
                zip.write_all(xml.as_bytes()).unwrap();
            }
            zip.finish().unwrap();
        }
        buf
    }

    #[test]
    fn html_strips_script_and_nav() {
        let html = r#"<html><head><title>Syllabus</title><script>var x = 1;</script></head>
            <body><nav>Home | Courses</nav>
            <p>Week one covers the foundations of supervised learning and the
            bias-variance tradeoff in detail.</p>
            <footer>Copyright 2024</footer></body></html>"#;
        let text = html_to_text(html);
        assert!(text.contains("supervised learning"));
        assert!(!text.contains("var x"));
        assert!(!text.contains("Home | Courses"));
        assert!(!text.contains("Copyright"));
    }

    #[test]
    fn html_under_length_is_noise() {
        let html = "<html><body><p>Too short.</p></body></html>";
        assert_eq!(html_to_text(html), "");
        assert!(extract(html.as_bytes(), "text/html", "https://x.test/p").is_none());
    }

    #[test]
    fn html_entities_are_decoded() {
        let html = format!(
            "<html><body><p>Fees &amp; deadlines are listed under &quot;policies&quot;. {}</p></body></html>",
            "Padding text so the extraction clears the noise floor easily."
        );
        let text = html_to_text(&html);
        assert!(text.contains("Fees & deadlines"));
        assert!(text.contains("\"policies\""));
    }

    #[test]
    fn html_title_and_links() {
        let html = r#"<html><head><title> Course  Home </title></head>
            <body><a href="https://a.test/x">x</a><a href="/rel">r</a><a name="no-href">n</a></body></html>"#;
        assert_eq!(html_title(html).as_deref(), Some("Course Home"));
        assert_eq!(html_links(html), vec!["https://a.test/x", "/rel"]);
    }

    #[test]
    fn pptx_slides_in_numeric_order_with_blank_line() {
        let bytes = pptx_with_slides(&[
            ("ppt/slides/slide10.xml", "tenth slide content"),
            ("ppt/slides/slide2.xml", "second slide content"),
            ("ppt/slides/slide1.xml", "first slide content"),
        ]);
        let text = extract(&bytes, MIME_PPTX, "https://x.test/deck.pptx").unwrap();
        assert_eq!(
            text,
            "first slide content\n\nsecond slide content\n\ntenth slide content"
        );
    }

    #[test]
    fn invalid_pdf_yields_none() {
        assert!(extract(b"not a pdf", MIME_PDF, "https://x.test/f.pdf").is_none());
    }

    #[test]
    fn invalid_zip_yields_none_for_pptx() {
        assert!(extract(b"not a zip", MIME_PPTX, "https://x.test/f.pptx").is_none());
    }

    #[test]
    fn classify_falls_back_to_extension() {
        assert_eq!(
            classify("application/octet-stream", "https://x.test/slides.pptx"),
            Some(MIME_PPTX)
        );
        assert_eq!(
            classify("binary/octet-stream", "https://x.test/notes.pdf?download=1"),
            Some(MIME_PDF)
        );
        assert_eq!(classify("text/html; charset=utf-8", ""), Some(MIME_HTML));
        assert_eq!(classify("image/png", "https://x.test/logo.png"), None);
    }
}
