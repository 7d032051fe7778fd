//! PDF text extraction with an unconditional OCR fallback for low-yield documents.
//!
//! [`TextExtractor::extract`] is pure with respect to storage: callers decide
//! whether and where to cache what it returns.

use crate::error::ExtractError;
use crate::models::IngestionOptions;
use crate::ocr::OcrEngine;
use lopdf::Document;
use regex::Regex;
use std::path::Path;
use std::sync::{Arc, OnceLock};
use tracing::{info, warn};

/// Raw content of a page that starts a structured table block.
pub const TABLE_MARKER: &str = "<table";

/// One page as seen by a [`PdfReader`]: its plain-text layer plus raw blocks.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PageContent {
    pub text: String,
    pub blocks: Vec<String>,
}

impl PageContent {
    /// Plain text followed by any table-like blocks.
    pub fn render(&self) -> String {
        let mut rendered = format!("{}\n", self.text);
        for block in self.blocks.iter().filter(|block| block.starts_with(TABLE_MARKER)) {
            rendered.push_str(block);
            rendered.push('\n');
        }
        rendered
    }
}

pub trait PdfReader: Send + Sync {
    fn read_pages(&self, path: &Path) -> Result<Vec<PageContent>, ExtractError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LopdfReader;

impl PdfReader for LopdfReader {
    fn read_pages(&self, path: &Path) -> Result<Vec<PageContent>, ExtractError> {
        let document =
            Document::load(path).map_err(|error| ExtractError::PdfParse(error.to_string()))?;

        let mut pages = Vec::new();
        for (page_no, _page_id) in document.get_pages() {
            let text = document
                .extract_text(&[page_no])
                .map_err(|error| ExtractError::PdfParse(error.to_string()))?;

            let blocks = text
                .split("\n\n")
                .map(str::trim)
                .filter(|block| !block.is_empty())
                .map(str::to_string)
                .collect();

            pages.push(PageContent { text, blocks });
        }

        Ok(pages)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractionMethod {
    Native,
    Ocr,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Extraction {
    pub text: String,
    pub method: ExtractionMethod,
}

#[derive(Clone)]
pub struct TextExtractor {
    reader: Arc<dyn PdfReader>,
    ocr: Arc<dyn OcrEngine>,
    min_chars: usize,
    dpi: u32,
}

impl TextExtractor {
    pub fn new(reader: Arc<dyn PdfReader>, ocr: Arc<dyn OcrEngine>) -> Self {
        let defaults = IngestionOptions::default();
        Self {
            reader,
            ocr,
            min_chars: defaults.ocr_min_chars,
            dpi: defaults.ocr_dpi,
        }
    }

    pub fn with_options(mut self, options: &IngestionOptions) -> Self {
        self.min_chars = options.ocr_min_chars;
        self.dpi = options.ocr_dpi;
        self
    }

    pub fn extract(&self, path: &Path) -> Result<Extraction, ExtractError> {
        let pages = self.reader.read_pages(path)?;
        if pages.is_empty() {
            warn!(path = %path.display(), "pdf has no pages");
            return Ok(Extraction {
                text: String::new(),
                method: ExtractionMethod::Native,
            });
        }

        let native = normalize_text(&pages.iter().map(PageContent::render).collect::<String>());
        let native_chars = native.chars().count();
        if native_chars >= self.min_chars {
            info!(path = %path.display(), chars = native_chars, "extracted native text");
            return Ok(Extraction {
                text: native,
                method: ExtractionMethod::Native,
            });
        }

        warn!(
            path = %path.display(),
            chars = native_chars,
            "text extraction yielded insufficient content, using OCR fallback"
        );

        let recognized = self.ocr.recognize_pages(path, self.dpi)?;
        let joined = recognized
            .iter()
            .map(|page| format!("{page}\n"))
            .collect::<String>();
        let text = normalize_text(&joined);

        if text.is_empty() {
            warn!(path = %path.display(), "no text extracted even after OCR");
        } else {
            info!(path = %path.display(), chars = text.chars().count(), "extracted text via OCR");
        }

        Ok(Extraction {
            text,
            method: ExtractionMethod::Ocr,
        })
    }
}

fn blank_lines() -> &'static Regex {
    static BLANK_LINES: OnceLock<Regex> = OnceLock::new();
    BLANK_LINES.get_or_init(|| Regex::new(r"\n\s*\n").expect("blank-line pattern is valid"))
}

/// Collapses whitespace-only lines, turns tabs into spaces and trims.
pub fn normalize_text(text: &str) -> String {
    blank_lines()
        .replace_all(text, "\n")
        .replace('\t', " ")
        .trim()
        .to_string()
}
