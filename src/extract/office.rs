use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use log::debug;
use quick_xml::events::Event;
use quick_xml::name::QName;
use quick_xml::Reader;
use zip::result::ZipError;
use zip::ZipArchive;

use crate::config::ExtractionConfig;
use crate::extract::document::Extracted;
use crate::try_failed;

/// Compound File Binary header: legacy .doc/.ppt, or an encrypted OOXML package
const OLE_MAGIC: [u8; 8] = [0xD0, 0xCF, 0x11, 0xE0, 0xA1, 0xB1, 0x1A, 0xE1];

type Archive = ZipArchive<BufReader<File>>;

#[derive(Debug, PartialEq)]
enum XmlEvent {
    Start(String),
    End(String),
    Empty(String),
    Text(String),
}

/// Pull reader over OOXML part markup. Yields qualified element names and
/// unescaped text (CDATA included); declarations and comments are dropped.
/// Iteration ends at the first malformed construct.
struct XmlEvents<'a> {
    reader: Reader<&'a [u8]>,
    done: bool,
}

impl<'a> XmlEvents<'a> {
    fn new(xml: &'a str) -> Self {
        let mut reader = Reader::from_str(xml);
        reader.check_end_names(false);
        XmlEvents {
            reader,
            done: false,
        }
    }
}

fn element_name(name: QName) -> String {
    String::from_utf8_lossy(name.as_ref()).into_owned()
}

impl<'a> Iterator for XmlEvents<'a> {
    type Item = XmlEvent;

    fn next(&mut self) -> Option<XmlEvent> {
        while !self.done {
            match self.reader.read_event() {
                Ok(Event::Start(e)) => return Some(XmlEvent::Start(element_name(e.name()))),
                Ok(Event::End(e)) => return Some(XmlEvent::End(element_name(e.name()))),
                Ok(Event::Empty(e)) => return Some(XmlEvent::Empty(element_name(e.name()))),
                Ok(Event::Text(t)) => {
                    let text = match t.unescape() {
                        Ok(text) => text.into_owned(),
                        Err(_) => String::from_utf8_lossy(&t).into_owned(),
                    };
                    return Some(XmlEvent::Text(text));
                }
                Ok(Event::CData(c)) => {
                    return Some(XmlEvent::Text(
                        String::from_utf8_lossy(&c.into_inner()).into_owned(),
                    ));
                }
                Ok(Event::Eof) => self.done = true,
                Ok(_) => {}
                Err(e) => {
                    debug!(
                        "Stopping at malformed markup near byte {}: {}",
                        self.reader.buffer_position(),
                        e
                    );
                    self.done = true;
                }
            }
        }
        None
    }
}

/// Text of one OOXML part, grouped the way a reader sees it: one entry per
/// non-empty paragraph, table rows flattened to cells joined by ` | `.
#[derive(Debug, Default)]
struct PartText {
    lines: Vec<String>,
    paragraph_count: usize,
    table_count: usize,
}

/// `ns` is the markup prefix: `w` for word processing, `a` for DrawingML.
fn collect_part_text(xml: &str, ns: &str) -> PartText {
    let para = format!("{}:p", ns);
    let run_text = format!("{}:t", ns);
    let tab = format!("{}:tab", ns);
    let brk = format!("{}:br", ns);
    let table = format!("{}:tbl", ns);
    let row = format!("{}:tr", ns);
    let cell = format!("{}:tc", ns);
    // Slide number fields would otherwise leak into speaker notes
    let field = format!("{}:fld", ns);

    let mut out = PartText::default();
    let mut paragraph = String::new();
    let mut in_text = false;
    let mut in_field = 0usize;
    let mut rows: Vec<Vec<String>> = Vec::new();
    let mut cells: Vec<String> = Vec::new();

    for event in XmlEvents::new(xml) {
        match event {
            XmlEvent::Start(name) if name == run_text => in_text = true,
            XmlEvent::End(name) if name == run_text => in_text = false,
            XmlEvent::Start(name) if name == field => in_field += 1,
            XmlEvent::End(name) if name == field => in_field = in_field.saturating_sub(1),
            XmlEvent::Text(text) if in_text && in_field == 0 => paragraph.push_str(&text),
            XmlEvent::Empty(name) if name == tab => paragraph.push('\t'),
            XmlEvent::Empty(name) if name == brk => paragraph.push(' '),
            XmlEvent::Start(name) if name == para => paragraph.clear(),
            XmlEvent::End(name) if name == para => {
                out.paragraph_count += 1;
                let text = paragraph.trim();
                if text.is_empty() {
                    continue;
                }
                match cells.last_mut() {
                    Some(cell_text) => {
                        if !cell_text.is_empty() {
                            cell_text.push(' ');
                        }
                        cell_text.push_str(text);
                    }
                    None => out.lines.push(text.to_owned()),
                }
                paragraph.clear();
            }
            XmlEvent::Start(name) if name == table => {}
            XmlEvent::End(name) if name == table => out.table_count += 1,
            XmlEvent::Start(name) if name == row => rows.push(Vec::new()),
            XmlEvent::End(name) if name == row => {
                if let Some(row_cells) = rows.pop() {
                    if !row_cells.is_empty() {
                        out.lines.push(row_cells.join(" | "));
                    }
                }
            }
            XmlEvent::Start(name) if name == cell => cells.push(String::new()),
            XmlEvent::End(name) if name == cell => {
                if let Some(cell_text) = cells.pop() {
                    let cell_text = cell_text.trim();
                    match rows.last_mut() {
                        Some(current_row) if !cell_text.is_empty() => {
                            current_row.push(cell_text.to_owned())
                        }
                        _ => {}
                    }
                }
            }
            _ => {}
        }
    }

    out
}

/// Encrypted OOXML packages are wrapped in a compound file instead of a zip
pub(crate) fn is_ole_container(path: &Path) -> bool {
    let mut header = [0u8; 8];
    match File::open(path) {
        Ok(mut file) => file.read_exact(&mut header).is_ok() && header == OLE_MAGIC,
        Err(_) => false,
    }
}

fn open_package(path: &Path) -> Result<Archive, String> {
    if is_ole_container(path) {
        return Err("File is password-protected or legacy format".to_owned());
    }

    let file = try_failed!(File::open(path), "Cannot open file");
    match ZipArchive::new(BufReader::new(file)) {
        Ok(archive) => Ok(archive),
        Err(e) => Err(format!("File corrupted or invalid format: {}", e)),
    }
}

fn read_part(archive: &mut Archive, name: &str) -> Result<Option<String>, String> {
    let mut part = match archive.by_name(name) {
        Ok(part) => part,
        Err(ZipError::FileNotFound) => return Ok(None),
        Err(e) => return Err(format!("Cannot read '{}': {}", name, e)),
    };
    let mut bytes = Vec::new();
    try_failed!(part.read_to_end(&mut bytes), format!("Cannot read '{}'", name));
    Ok(Some(String::from_utf8_lossy(&bytes).into_owned()))
}

/// Title, author, subject and keywords from `docProps/core.xml`
fn read_core_properties(archive: &mut Archive, extracted: &mut Extracted) {
    let xml = match read_part(archive, "docProps/core.xml") {
        Ok(Some(xml)) => xml,
        Ok(None) => return,
        Err(e) => {
            debug!("Ignoring core properties: {}", e);
            return;
        }
    };

    let wanted = [
        ("dc:title", "title"),
        ("dc:creator", "author"),
        ("dc:subject", "subject"),
        ("cp:keywords", "keywords"),
    ];
    let mut current: Option<&str> = None;
    for event in XmlEvents::new(&xml) {
        match event {
            XmlEvent::Start(name) => {
                current = wanted.iter().find(|(tag, _)| *tag == name).map(|(_, key)| *key);
            }
            XmlEvent::Text(text) => {
                if let Some(key) = current {
                    extracted.insert_nonempty(key, Some(text));
                }
            }
            _ => current = None,
        }
    }
}

fn finish(extracted: &mut Extracted, lines: Vec<String>, warning: &str) {
    extracted.content = lines.join("\n");
    extracted.insert("extracted_text_length", extracted.content.chars().count());
    if extracted.content.trim().is_empty() {
        extracted.insert("extraction_warning", warning);
    }
    extracted.title = extracted.metadata_str("title").map(str::to_owned);
}

pub fn extract_docx(path: &Path, _config: &ExtractionConfig) -> Result<Extracted, String> {
    let mut archive = open_package(path)?;
    let body = match read_part(&mut archive, "word/document.xml")? {
        Some(xml) => xml,
        None => return Err("File corrupted or invalid format: missing word/document.xml".to_owned()),
    };

    let mut extracted = Extracted::default();
    read_core_properties(&mut archive, &mut extracted);

    let text = collect_part_text(&body, "w");
    extracted.insert("paragraph_count", text.paragraph_count);
    extracted.insert("table_count", text.table_count);
    finish(
        &mut extracted,
        text.lines,
        "No text extracted (document may be empty or image-based)",
    );

    Ok(extracted)
}

/// Slide number from a part name like `ppt/slides/slide12.xml`
fn slide_number(name: &str, dir: &str, stem: &str) -> Option<u32> {
    name.strip_prefix(dir)?
        .strip_prefix(stem)?
        .strip_suffix(".xml")?
        .parse()
        .ok()
}

/// The notes part a slide links to, from the slide's relationships
fn notes_part_for(archive: &mut Archive, slide: u32) -> Option<String> {
    let rels_name = format!("ppt/slides/_rels/slide{}.xml.rels", slide);
    let rels = read_part(archive, &rels_name).ok()??;
    let target_at = rels.find("notesSlides/")?;
    let target = &rels[target_at..];
    let end = target.find('"')?;
    Some(format!("ppt/{}", &target[..end]))
}

pub fn extract_pptx(path: &Path, _config: &ExtractionConfig) -> Result<Extracted, String> {
    let mut archive = open_package(path)?;

    let slides: BTreeMap<u32, String> = archive
        .file_names()
        .filter_map(|name| {
            slide_number(name, "ppt/slides/", "slide").map(|n| (n, name.to_owned()))
        })
        .collect();
    if slides.is_empty() && archive.by_name("ppt/presentation.xml").is_err() {
        return Err("File corrupted or invalid format: missing ppt/presentation.xml".to_owned());
    }

    let mut extracted = Extracted::default();
    read_core_properties(&mut archive, &mut extracted);

    let mut lines = Vec::new();
    let mut slides_with_text = 0;
    let mut slides_with_notes = 0;

    // Slides are numbered by position; part names may have gaps
    for (position, (number, part)) in slides.iter().enumerate() {
        let position = position + 1;
        if let Some(xml) = read_part(&mut archive, part)? {
            let text = collect_part_text(&xml, "a");
            if !text.lines.is_empty() {
                lines.push(format!("=== Slide {} ===", position));
                lines.extend(text.lines);
                slides_with_text += 1;
            }
        }

        let notes = notes_part_for(&mut archive, *number)
            .and_then(|name| read_part(&mut archive, &name).ok().flatten())
            .map(|xml| collect_part_text(&xml, "a").lines.join("\n"))
            .filter(|notes| !notes.trim().is_empty());
        if let Some(notes) = notes {
            lines.push(format!("[Notes for Slide {}]", position));
            lines.push(notes);
            slides_with_notes += 1;
        }
    }

    extracted.insert("slide_count", slides.len());
    extracted.insert("slides_with_text", slides_with_text);
    extracted.insert("slides_with_notes", slides_with_notes);
    finish(
        &mut extracted,
        lines,
        "No text extracted (presentation may be empty or image-based)",
    );

    Ok(extracted)
}
