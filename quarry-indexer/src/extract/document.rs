//! Decoders for rich document formats.
//!
//! PDF goes through `pdf-extract`. DOCX, PPTX and XLSX are ZIP containers of
//! XML parts; each part is read with a hard cap on its decompressed size and
//! scanned with `quick-xml` for text runs. Paragraph ends become newlines so
//! the chunker can still find natural boundaries.

use std::io::{Cursor, Read};

pub const MIME_PDF: &str = "application/pdf";
pub const MIME_DOCX: &str =
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document";
pub const MIME_PPTX: &str =
    "application/vnd.openxmlformats-officedocument.presentationml.presentation";
pub const MIME_XLSX: &str = "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet";

/// Decompressed size cap for a single archive part.
const MAX_PART_BYTES: u64 = 32 * 1024 * 1024;
const MAX_SHEETS: usize = 64;
const MAX_CELLS_PER_SHEET: usize = 100_000;

#[derive(Debug, thiserror::Error)]
pub enum DocumentError {
    #[error("PDF decoding failed: {0}")]
    Pdf(String),

    #[error("Not a valid OOXML archive: {0}")]
    Archive(String),

    #[error("Archive has no {0} part")]
    MissingPart(String),

    #[error("Archive part {name} exceeds {limit} bytes")]
    PartTooLarge { name: String, limit: u64 },

    #[error("XML parse error: {0}")]
    Xml(String),
}

type Archive<'a> = zip::ZipArchive<Cursor<&'a [u8]>>;

pub fn extract_pdf(bytes: &[u8]) -> Result<String, DocumentError> {
    // pdf-extract panics on some malformed inputs
    match std::panic::catch_unwind(|| pdf_extract::extract_text_from_mem(bytes)) {
        Ok(Ok(text)) => Ok(text),
        Ok(Err(e)) => Err(DocumentError::Pdf(e.to_string())),
        Err(_) => Err(DocumentError::Pdf("decoder panicked".to_string())),
    }
}

pub fn extract_docx(bytes: &[u8]) -> Result<String, DocumentError> {
    let mut archive = open_archive(bytes)?;
    let xml = read_part(&mut archive, "word/document.xml")?;
    collect_text_runs(&xml, b"p")
}

pub fn extract_pptx(bytes: &[u8]) -> Result<String, DocumentError> {
    let mut archive = open_archive(bytes)?;
    let slides = numbered_parts(&archive, "ppt/slides/slide", ".xml");
    if slides.is_empty() {
        return Err(DocumentError::MissingPart("ppt/slides".to_string()));
    }

    let mut texts = Vec::with_capacity(slides.len());
    for name in slides {
        let xml = read_part(&mut archive, &name)?;
        let text = collect_text_runs(&xml, b"p")?;
        if !text.is_empty() {
            texts.push(text);
        }
    }
    Ok(texts.join("\n\n"))
}

pub fn extract_xlsx(bytes: &[u8]) -> Result<String, DocumentError> {
    let mut archive = open_archive(bytes)?;
    // Workbooks with only numbers have no shared strings part
    let shared = match read_part(&mut archive, "xl/sharedStrings.xml") {
        Ok(xml) => shared_strings(&xml)?,
        Err(DocumentError::MissingPart(_)) => Vec::new(),
        Err(e) => return Err(e),
    };

    let sheets = numbered_parts(&archive, "xl/worksheets/sheet", ".xml");
    let mut texts = Vec::new();
    for name in sheets.into_iter().take(MAX_SHEETS) {
        let xml = read_part(&mut archive, &name)?;
        let text = sheet_rows(&xml, &shared)?;
        if !text.is_empty() {
            texts.push(text);
        }
    }
    Ok(texts.join("\n\n"))
}

fn open_archive(bytes: &[u8]) -> Result<Archive<'_>, DocumentError> {
    zip::ZipArchive::new(Cursor::new(bytes)).map_err(|e| DocumentError::Archive(e.to_string()))
}

fn read_part(archive: &mut Archive<'_>, name: &str) -> Result<Vec<u8>, DocumentError> {
    let entry = match archive.by_name(name) {
        Ok(entry) => entry,
        Err(zip::result::ZipError::FileNotFound) => {
            return Err(DocumentError::MissingPart(name.to_string()));
        }
        Err(e) => return Err(DocumentError::Archive(e.to_string())),
    };

    let mut out = Vec::new();
    entry
        .take(MAX_PART_BYTES + 1)
        .read_to_end(&mut out)
        .map_err(|e| DocumentError::Archive(e.to_string()))?;
    if out.len() as u64 > MAX_PART_BYTES {
        return Err(DocumentError::PartTooLarge {
            name: name.to_string(),
            limit: MAX_PART_BYTES,
        });
    }
    Ok(out)
}

/// Part names like `prefix<N>suffix`, ordered by N.
fn numbered_parts(archive: &Archive<'_>, prefix: &str, suffix: &str) -> Vec<String> {
    let mut parts: Vec<(u32, String)> = archive
        .file_names()
        .filter_map(|name| {
            let n = name.strip_prefix(prefix)?.strip_suffix(suffix)?.parse().ok()?;
            Some((n, name.to_string()))
        })
        .collect();
    parts.sort();
    parts.into_iter().map(|(_, name)| name).collect()
}

/// Concatenate the text of every `t` element, ending a line at each
/// `paragraph` element close.
fn collect_text_runs(xml: &[u8], paragraph: &[u8]) -> Result<String, DocumentError> {
    use quick_xml::events::Event;

    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut out = String::new();
    let mut line = String::new();
    let mut in_text = false;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) if e.local_name().as_ref() == b"t" => in_text = true,
            Ok(Event::Text(te)) if in_text => {
                let text = te.unescape().map_err(|e| DocumentError::Xml(e.to_string()))?;
                line.push_str(&text);
            }
            Ok(Event::End(e)) => {
                let name = e.local_name();
                if name.as_ref() == b"t" {
                    in_text = false;
                } else if name.as_ref() == paragraph {
                    push_line(&mut out, &mut line);
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(DocumentError::Xml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    push_line(&mut out, &mut line);
    Ok(out)
}

fn push_line(out: &mut String, line: &mut String) {
    let trimmed = line.trim();
    if !trimmed.is_empty() {
        if !out.is_empty() {
            out.push('\n');
        }
        out.push_str(trimmed);
    }
    line.clear();
}

/// The shared string table, one entry per `si` (rich-text runs joined).
fn shared_strings(xml: &[u8]) -> Result<Vec<String>, DocumentError> {
    use quick_xml::events::Event;

    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut strings = Vec::new();
    let mut current: Option<String> = None;
    let mut in_text = false;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"si" => current = Some(String::new()),
                b"t" => in_text = true,
                _ => {}
            },
            Ok(Event::Text(te)) if in_text => {
                if let Some(s) = current.as_mut() {
                    let text = te.unescape().map_err(|e| DocumentError::Xml(e.to_string()))?;
                    s.push_str(&text);
                }
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"si" => strings.extend(current.take()),
                b"t" => in_text = false,
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(DocumentError::Xml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    Ok(strings)
}

/// One line per spreadsheet row, cells separated by tabs. Shared-string cells
/// are resolved, inline strings and plain values are kept as written.
fn sheet_rows(xml: &[u8], shared: &[String]) -> Result<String, DocumentError> {
    use quick_xml::events::Event;

    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut rows: Vec<String> = Vec::new();
    let mut row: Vec<String> = Vec::new();
    let mut shared_cell = false;
    let mut in_value = false;
    let mut cells = 0usize;

    loop {
        if cells >= MAX_CELLS_PER_SHEET {
            break;
        }
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"c" => {
                    shared_cell = e.attributes().flatten().any(|a| {
                        a.key.local_name().as_ref() == b"t" && a.value.as_ref() == b"s"
                    });
                }
                b"v" | b"t" => in_value = true,
                _ => {}
            },
            Ok(Event::Text(te)) if in_value => {
                let raw = te.unescape().map_err(|e| DocumentError::Xml(e.to_string()))?;
                let value = raw.trim();
                let cell = if shared_cell {
                    value
                        .parse::<usize>()
                        .ok()
                        .and_then(|i| shared.get(i))
                        .cloned()
                } else {
                    Some(value.to_string())
                };
                if let Some(cell) = cell.filter(|c| !c.is_empty()) {
                    row.push(cell);
                    cells += 1;
                }
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"v" | b"t" => in_value = false,
                b"c" => shared_cell = false,
                b"row" if !row.is_empty() => rows.push(std::mem::take(&mut row).join("\t")),
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(DocumentError::Xml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    if !row.is_empty() {
        rows.push(row.join("\t"));
    }
    Ok(rows.join("\n"))
}
