use crate::error::ExtractError;
use base64::{engine::general_purpose::STANDARD, Engine};
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::debug;

/// Page-segmentation mode for a single uniform block of text.
pub const UNIFORM_BLOCK_PSM: u8 = 6;

/// Rasterizes every page of a PDF and returns the recognized text per page.
pub trait OcrEngine: Send + Sync {
    fn recognize_pages(&self, path: &Path, dpi: u32) -> Result<Vec<String>, ExtractError>;
}

/// Renders pages with `pdftoppm` and recognizes them with `tesseract`.
#[derive(Debug, Clone)]
pub struct TesseractOcr {
    pub pdftoppm: PathBuf,
    pub tesseract: PathBuf,
    pub page_segmentation_mode: u8,
}

impl Default for TesseractOcr {
    fn default() -> Self {
        Self {
            pdftoppm: PathBuf::from("pdftoppm"),
            tesseract: PathBuf::from("tesseract"),
            page_segmentation_mode: UNIFORM_BLOCK_PSM,
        }
    }
}

impl TesseractOcr {
    fn rasterize(&self, path: &Path, dpi: u32, out_dir: &Path) -> Result<Vec<PathBuf>, ExtractError> {
        let output = Command::new(&self.pdftoppm)
            .arg("-r")
            .arg(dpi.to_string())
            .arg("-png")
            .arg(path)
            .arg(out_dir.join("page"))
            .output()?;

        if !output.status.success() {
            return Err(ExtractError::OcrFailed(format!(
                "pdftoppm exited with {} for {}: {}",
                output.status,
                path.display(),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        // pdftoppm zero-pads page numbers to a common width, so name order is page order.
        let mut images = fs::read_dir(out_dir)?
            .filter_map(|entry| entry.ok().map(|entry| entry.path()))
            .filter(|image| image.extension().is_some_and(|ext| ext == "png"))
            .collect::<Vec<_>>();
        images.sort();
        Ok(images)
    }

    fn recognize_image(&self, image: &Path) -> Result<String, ExtractError> {
        let output = Command::new(&self.tesseract)
            .arg(image)
            .arg("stdout")
            .arg("--psm")
            .arg(self.page_segmentation_mode.to_string())
            .output()?;

        if !output.status.success() {
            return Err(ExtractError::OcrFailed(format!(
                "tesseract exited with {} for {}: {}",
                output.status,
                image.display(),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

impl OcrEngine for TesseractOcr {
    fn recognize_pages(&self, path: &Path, dpi: u32) -> Result<Vec<String>, ExtractError> {
        let scratch = tempfile::tempdir()?;
        let images = self.rasterize(path, dpi, scratch.path())?;
        debug!(path = %path.display(), pages = images.len(), dpi, "rasterized pdf for OCR");

        images
            .iter()
            .map(|image| self.recognize_image(image))
            .collect()
    }
}

#[derive(Debug, Clone, Serialize)]
struct LlmOcrRequest {
    pdf_base64: String,
    source_path: String,
    dpi: u32,
}

#[derive(Debug, Clone, Deserialize)]
struct LlmOcrResponse {
    pages: Option<Vec<LlmOcrPage>>,
    text: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct LlmOcrPage {
    #[serde(default)]
    page: Option<u32>,
    #[serde(default)]
    text: Option<String>,
}

/// Posts the whole PDF to a multimodal OCR service.
#[derive(Debug, Clone)]
pub struct HttpOcr {
    pub endpoint: String,
    pub api_key: Option<String>,
}

impl HttpOcr {
    pub fn new(endpoint: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            api_key: api_key.filter(|key| !key.trim().is_empty()),
        }
    }
}

impl OcrEngine for HttpOcr {
    fn recognize_pages(&self, path: &Path, dpi: u32) -> Result<Vec<String>, ExtractError> {
        let pdf = fs::read(path)?;
        let payload = LlmOcrRequest {
            pdf_base64: STANDARD.encode(pdf),
            source_path: path.to_string_lossy().to_string(),
            dpi,
        };

        // Built per call: the blocking client must live on the extraction thread.
        let mut request = Client::new()
            .post(&self.endpoint)
            .header("content-type", "application/json")
            .json(&payload);

        if let Some(api_key) = &self.api_key {
            request = request.bearer_auth(api_key);
        }

        let response = request.send()?;

        if !response.status().is_success() {
            return Err(ExtractError::OcrFailed(format!(
                "multimodal OCR request to {} returned {}",
                self.endpoint,
                response.status()
            )));
        }

        let payload: LlmOcrResponse = response.json()?;
        Ok(payload_to_pages(&payload))
    }
}

/// Prefers the per-page listing (ordered by page number), falling back to
/// form-feed separated text. Empty pages are kept so page order survives.
fn payload_to_pages(payload: &LlmOcrResponse) -> Vec<String> {
    if let Some(listed) = &payload.pages {
        let mut numbered = listed
            .iter()
            .enumerate()
            .map(|(index, page)| {
                let number = page.page.unwrap_or(index as u32 + 1);
                let text = page.text.as_deref().unwrap_or_default().trim().to_string();
                (number, text)
            })
            .collect::<Vec<_>>();
        numbered.sort_by_key(|(number, _)| *number);

        if numbered.iter().any(|(_, text)| !text.is_empty()) {
            return numbered.into_iter().map(|(_, text)| text).collect();
        }
    }

    payload
        .text
        .as_deref()
        .map(|raw| {
            raw.split('\u{000c}')
                .map(|chunk| chunk.trim().to_string())
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::{payload_to_pages, LlmOcrPage, LlmOcrResponse, OcrEngine, TesseractOcr};
    use std::path::{Path, PathBuf};

    #[test]
    fn ocr_payload_pages_are_ordered_by_number() {
        let response = LlmOcrResponse {
            pages: Some(vec![
                LlmOcrPage {
                    page: Some(3),
                    text: Some("Page 3".to_string()),
                },
                LlmOcrPage {
                    page: Some(2),
                    text: Some("  ".to_string()),
                },
                LlmOcrPage {
                    page: Some(1),
                    text: Some(" Page 1 ".to_string()),
                },
            ]),
            text: Some("ignored".to_string()),
        };

        assert_eq!(payload_to_pages(&response), vec!["Page 1", "", "Page 3"]);
    }

    #[test]
    fn ocr_payload_fallback_text_split_by_form_feed() {
        let response = LlmOcrResponse {
            pages: Some(vec![LlmOcrPage {
                page: None,
                text: None,
            }]),
            text: Some("First\u{000C}Second\n".to_string()),
        };

        assert_eq!(payload_to_pages(&response), vec!["First", "Second"]);
    }

    #[test]
    fn empty_payload_has_no_pages() {
        let response = LlmOcrResponse {
            pages: None,
            text: None,
        };
        assert!(payload_to_pages(&response).is_empty());
    }

    #[test]
    fn missing_rasterizer_is_reported() {
        let engine = TesseractOcr {
            pdftoppm: PathBuf::from("/nonexistent/pdftoppm-binary"),
            ..TesseractOcr::default()
        };
        assert!(engine.recognize_pages(Path::new("/tmp/a.pdf"), 300).is_err());
    }
}
