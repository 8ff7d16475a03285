//! Text extraction from documents using pdftotext and Tesseract.

use std::path::{Path, PathBuf};
use std::process::Command;

use tempfile::TempDir;
use thiserror::Error;
use tracing::debug;

/// Tools the extractor shells out to.
pub const REQUIRED_TOOLS: [&str; 4] = ["pdftotext", "pdftoppm", "pdfinfo", "tesseract"];

/// Handle command output, extracting stdout on success or returning appropriate error.
fn handle_cmd_output(
    result: std::io::Result<std::process::Output>,
    tool_name: &str,
    error_prefix: &str,
) -> Result<String, ExtractionError> {
    match result {
        Ok(output) if output.status.success() => {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        }
        Ok(output) => Err(ExtractionError::ExtractionFailed(format!(
            "{}: {}",
            error_prefix,
            String::from_utf8_lossy(&output.stderr).trim()
        ))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Err(ExtractionError::ToolNotFound(tool_name.to_string()))
        }
        Err(e) => Err(ExtractionError::Io(e)),
    }
}

fn check_cmd_status(
    result: std::io::Result<std::process::ExitStatus>,
    tool_name: &str,
    error_msg: &str,
) -> Result<(), ExtractionError> {
    match result {
        Ok(s) if s.success() => Ok(()),
        Ok(_) => Err(ExtractionError::ExtractionFailed(error_msg.to_string())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Err(ExtractionError::ToolNotFound(tool_name.to_string()))
        }
        Err(e) => Err(ExtractionError::Io(e)),
    }
}

/// Non-whitespace character count, the measure used to compare extractions.
pub fn content_chars(text: &str) -> usize {
    text.chars().filter(|c| !c.is_whitespace()).count()
}

/// Whether OCR output beats the text layer by more than 20%.
pub fn prefer_ocr(text_layer: &str, ocr: &str) -> bool {
    let pdf_chars = content_chars(text_layer);
    content_chars(ocr) > pdf_chars + pdf_chars / 5
}

#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("Unsupported file type: {0}")]
    UnsupportedFileType(String),

    #[error("External tool not found: {0}")]
    ToolNotFound(String),

    #[error("Extraction failed: {0}")]
    ExtractionFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractionMethod {
    /// Text file read as-is.
    Direct,
    /// PDF text layer.
    PdfToText,
    /// Tesseract over rendered pages or an image.
    TesseractOcr,
    /// Per page, whichever of the two yielded more.
    Hybrid,
}

impl ExtractionMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::PdfToText => "pdftotext",
            Self::TesseractOcr => "tesseract",
            Self::Hybrid => "hybrid",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExtractionResult {
    pub text: String,
    pub method: ExtractionMethod,
    /// Pages processed, for PDFs.
    pub page_count: Option<u32>,
}

/// What kind of input a raw artifact is, by content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputKind {
    Pdf,
    Image,
    Text,
}

/// Sniff the file's content. Unknown binary content is an error.
pub fn detect_input(path: &Path) -> Result<InputKind, ExtractionError> {
    let bytes = std::fs::read(path)?;
    if let Some(kind) = infer::get(&bytes) {
        return match kind.mime_type() {
            "application/pdf" => Ok(InputKind::Pdf),
            mime if mime.starts_with("image/") => Ok(InputKind::Image),
            mime => Err(ExtractionError::UnsupportedFileType(mime.to_string())),
        };
    }
    if std::str::from_utf8(&bytes).is_ok() {
        return Ok(InputKind::Text);
    }
    Err(ExtractionError::UnsupportedFileType(format!(
        "unrecognised content in {}",
        path.display()
    )))
}

/// Text extractor that uses external tools.
#[derive(Debug, Clone)]
pub struct TextExtractor {
    /// Pages whose text layer has fewer content characters than this are OCR'd.
    min_chars_per_page: usize,
    tesseract_lang: String,
    dpi: u32,
}

impl Default for TextExtractor {
    fn default() -> Self {
        Self {
            min_chars_per_page: 100,
            tesseract_lang: "eng".to_string(),
            dpi: 300,
        }
    }
}

impl TextExtractor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_min_chars(mut self, min_chars: usize) -> Self {
        self.min_chars_per_page = min_chars;
        self
    }

    pub fn with_language(mut self, lang: &str) -> Self {
        self.tesseract_lang = lang.to_string();
        self
    }

    pub fn with_dpi(mut self, dpi: u32) -> Self {
        self.dpi = dpi;
        self
    }

    /// Extract text from a file, choosing the method by its content.
    pub fn extract(&self, file_path: &Path) -> Result<ExtractionResult, ExtractionError> {
        match detect_input(file_path)? {
            InputKind::Pdf => self.extract_pdf(file_path),
            InputKind::Image => Ok(ExtractionResult {
                text: self.run_tesseract(file_path)?,
                method: ExtractionMethod::TesseractOcr,
                page_count: Some(1),
            }),
            InputKind::Text => Ok(ExtractionResult {
                text: std::fs::read_to_string(file_path)?,
                method: ExtractionMethod::Direct,
                page_count: None,
            }),
        }
    }

    /// Per page: take the text layer, and OCR the page when the layer is
    /// sparse, keeping the OCR text only if it is meaningfully longer.
    fn extract_pdf(&self, file_path: &Path) -> Result<ExtractionResult, ExtractionError> {
        let page_count = self.get_pdf_page_count(file_path).unwrap_or(1);

        if page_count <= 1 {
            return self.extract_pdf_simple(file_path, page_count);
        }

        let mut page_texts = Vec::with_capacity(page_count as usize);
        let mut used_ocr = false;
        for page in 1..=page_count {
            let layer = self.extract_pdf_page_text(file_path, page).unwrap_or_default();
            if content_chars(&layer) >= self.min_chars_per_page {
                page_texts.push(layer);
                continue;
            }
            match self.ocr_pdf_page(file_path, page) {
                Ok(ocr) if prefer_ocr(&layer, &ocr) => {
                    used_ocr = true;
                    page_texts.push(ocr);
                }
                Ok(_) => page_texts.push(layer),
                Err(e @ ExtractionError::ToolNotFound(_)) => return Err(e),
                Err(e) => {
                    debug!("OCR failed for page {}: {}, keeping text layer", page, e);
                    page_texts.push(layer);
                }
            }
        }

        Ok(ExtractionResult {
            text: page_texts.join("\n\n"),
            method: if used_ocr {
                ExtractionMethod::Hybrid
            } else {
                ExtractionMethod::PdfToText
            },
            page_count: Some(page_count),
        })
    }

    fn extract_pdf_simple(
        &self,
        file_path: &Path,
        page_count: u32,
    ) -> Result<ExtractionResult, ExtractionError> {
        let layer = self.run_pdftotext(file_path)?;
        if content_chars(&layer) >= self.min_chars_per_page {
            return Ok(ExtractionResult {
                text: layer,
                method: ExtractionMethod::PdfToText,
                page_count: Some(page_count),
            });
        }

        match self.ocr_pdf(file_path) {
            Ok(ocr) if prefer_ocr(&layer, &ocr) => Ok(ExtractionResult {
                text: ocr,
                method: ExtractionMethod::TesseractOcr,
                page_count: Some(page_count),
            }),
            Ok(_) => Ok(ExtractionResult {
                text: layer,
                method: ExtractionMethod::PdfToText,
                page_count: Some(page_count),
            }),
            Err(e @ ExtractionError::ToolNotFound(_)) => Err(e),
            Err(e) => {
                debug!("OCR failed: {}, using pdftotext result", e);
                Ok(ExtractionResult {
                    text: layer,
                    method: ExtractionMethod::PdfToText,
                    page_count: Some(page_count),
                })
            }
        }
    }

    fn find_page_image(&self, temp_path: &Path, page_num: u32) -> Option<PathBuf> {
        // pdftoppm pads page numbers to the width of the page count
        for digits in 1..=4 {
            let path = temp_path.join(format!("page-{:0width$}.png", page_num, width = digits));
            if path.exists() {
                return Some(path);
            }
        }
        None
    }

    fn run_pdftotext(&self, file_path: &Path) -> Result<String, ExtractionError> {
        let output = Command::new("pdftotext")
            .args(["-layout", "-enc", "UTF-8"])
            .arg(file_path)
            .arg("-")
            .output();

        handle_cmd_output(output, "pdftotext (install poppler-utils)", "pdftotext failed")
    }

    pub fn extract_pdf_page_text(&self, file_path: &Path, page: u32) -> Result<String, ExtractionError> {
        let page_str = page.to_string();
        let output = Command::new("pdftotext")
            .args(["-layout", "-enc", "UTF-8", "-f", &page_str, "-l", &page_str])
            .arg(file_path)
            .arg("-")
            .output();

        handle_cmd_output(
            output,
            "pdftotext (install poppler-utils)",
            &format!("pdftotext failed on page {}", page),
        )
    }

    pub fn get_pdf_page_count(&self, file_path: &Path) -> Option<u32> {
        let output = Command::new("pdfinfo").arg(file_path).output().ok()?;
        if !output.status.success() {
            return None;
        }
        parse_page_count(&String::from_utf8_lossy(&output.stdout))
    }

    /// Render every page and OCR it.
    fn ocr_pdf(&self, file_path: &Path) -> Result<String, ExtractionError> {
        let temp_dir = TempDir::new()?;
        let temp_path = temp_dir.path();
        let dpi = self.dpi.to_string();

        let status = Command::new("pdftoppm")
            .args(["-png", "-r", &dpi])
            .arg(file_path)
            .arg(temp_path.join("page"))
            .status();
        check_cmd_status(
            status,
            "pdftoppm (install poppler-utils)",
            "pdftoppm failed to convert PDF",
        )?;

        let mut images: Vec<_> = std::fs::read_dir(temp_path)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|ext| ext == "png"))
            .collect();
        images.sort();

        if images.is_empty() {
            return Err(ExtractionError::ExtractionFailed(
                "No images generated from PDF".to_string(),
            ));
        }

        let mut pages = Vec::with_capacity(images.len());
        for (i, image_path) in images.iter().enumerate() {
            match self.run_tesseract(image_path) {
                Ok(text) => pages.push(text),
                Err(e @ ExtractionError::ToolNotFound(_)) => return Err(e),
                Err(e) => tracing::warn!("OCR failed for page {}: {}", i + 1, e),
            }
        }
        Ok(pages.join("\n\n"))
    }

    pub fn ocr_pdf_page(&self, file_path: &Path, page: u32) -> Result<String, ExtractionError> {
        let temp_dir = TempDir::new()?;
        let temp_path = temp_dir.path();
        let page_str = page.to_string();
        let dpi = self.dpi.to_string();

        let status = Command::new("pdftoppm")
            .args(["-png", "-r", &dpi, "-f", &page_str, "-l", &page_str])
            .arg(file_path)
            .arg(temp_path.join("page"))
            .status();
        check_cmd_status(
            status,
            "pdftoppm (install poppler-utils)",
            &format!("pdftoppm failed to convert page {}", page),
        )?;

        match self.find_page_image(temp_path, page) {
            Some(image_path) => self.run_tesseract(&image_path),
            None => Err(ExtractionError::ExtractionFailed(format!(
                "No image generated for page {}",
                page
            ))),
        }
    }

    fn run_tesseract(&self, image_path: &Path) -> Result<String, ExtractionError> {
        let output = Command::new("tesseract")
            .arg(image_path)
            .arg("stdout")
            .args(["-l", &self.tesseract_lang])
            .output();

        handle_cmd_output(output, "tesseract (install tesseract-ocr)", "tesseract failed")
    }

    /// Each tool with whether it is on PATH.
    pub fn check_tools() -> Vec<(&'static str, bool)> {
        REQUIRED_TOOLS
            .iter()
            .map(|tool| (*tool, which::which(tool).is_ok()))
            .collect()
    }

    pub fn missing_tools() -> Vec<&'static str> {
        Self::check_tools()
            .into_iter()
            .filter(|(_, found)| !found)
            .map(|(tool, _)| tool)
            .collect()
    }
}

fn parse_page_count(pdfinfo: &str) -> Option<u32> {
    pdfinfo
        .lines()
        .find(|line| line.starts_with("Pages:"))
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|s| s.parse().ok())
}
