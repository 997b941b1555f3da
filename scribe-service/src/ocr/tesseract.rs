//! Local Tesseract OCR through the `tesseract` command line tool.
//!
//! Each page is written to a temporary PNG that is removed when the call
//! returns, whatever the outcome. Output is requested as TSV so word
//! confidences are available. A non-zero exit is treated as the provider
//! being unusable, not as a bad page.

use std::io::Write;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::config::TesseractConfig;
use crate::error::OcrError;
use crate::rasterize::PageImage;

use super::{PageText, TextProvider};

const PROVIDER: &str = "tesseract";

/// Local lower-accuracy OCR provider
pub struct TesseractProvider {
    config: TesseractConfig,
}

impl TesseractProvider {
    pub fn new(config: TesseractConfig) -> Self {
        Self { config }
    }

    fn write_page(&self, page: &PageImage) -> Result<tempfile::NamedTempFile, OcrError> {
        let png = page.to_png().map_err(|e| OcrError::Page {
            page: page.index + 1,
            message: e.to_string(),
        })?;

        let mut file = tempfile::Builder::new()
            .prefix("scribe-page-")
            .suffix(".png")
            .tempfile()
            .map_err(|e| OcrError::Unavailable {
                provider: PROVIDER.to_string(),
                message: format!("cannot create temp file: {}", e),
            })?;
        file.write_all(&png)
            .and_then(|_| file.flush())
            .map_err(|e| OcrError::Unavailable {
                provider: PROVIDER.to_string(),
                message: format!("cannot write temp file: {}", e),
            })?;
        Ok(file)
    }
}

#[async_trait]
impl TextProvider for TesseractProvider {
    fn name(&self) -> &str {
        PROVIDER
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(self.config.timeout_secs)
    }

    async fn health_check(&self) -> bool {
        Command::new(&self.config.binary)
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|status| status.success())
            .unwrap_or(false)
    }

    async fn recognize(&self, page: &PageImage) -> Result<PageText, OcrError> {
        let image_file = self.write_page(page)?;

        let output = Command::new(&self.config.binary)
            .arg(image_file.path())
            .arg("stdout")
            .arg("--oem")
            .arg(self.config.oem.to_string())
            .arg("--psm")
            .arg(self.config.psm.to_string())
            .arg("-l")
            .arg(&self.config.language)
            .arg("tsv")
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| OcrError::Unavailable {
                provider: PROVIDER.to_string(),
                message: format!("cannot run {}: {}", self.config.binary, e),
            })?;

        // Tesseract exits non-zero for setup faults (language data, bad options),
        // which would fail every page alike
        if !output.status.success() {
            return Err(OcrError::Unavailable {
                provider: PROVIDER.to_string(),
                message: format!(
                    "{} exited with {}: {}",
                    self.config.binary,
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }

        let tsv = String::from_utf8_lossy(&output.stdout);
        let recognized = parse_tsv(&tsv);
        debug!(
            page = page.index + 1,
            chars = recognized.text.len(),
            confidence = recognized.confidence,
            "Tesseract recognized page"
        );
        Ok(recognized)
    }
}

/// Rebuild line-structured text and the mean word confidence from TSV output.
///
/// Columns: level, page_num, block_num, par_num, line_num, word_num,
/// left, top, width, height, conf, text.
pub fn parse_tsv(tsv: &str) -> PageText {
    let mut lines: Vec<String> = Vec::new();
    let mut current_line: Option<(u32, u32, u32)> = None;
    let mut confidences = Vec::new();

    for row in tsv.lines().skip(1) {
        let columns: Vec<&str> = row.splitn(12, '\t').collect();
        if columns.len() < 12 {
            continue;
        }
        let word = columns[11].trim();
        if word.is_empty() {
            continue;
        }

        let key = (
            columns[2].parse().unwrap_or(0),
            columns[3].parse().unwrap_or(0),
            columns[4].parse().unwrap_or(0),
        );
        if current_line != Some(key) || lines.is_empty() {
            lines.push(String::new());
            current_line = Some(key);
        }
        if let Some(line) = lines.last_mut() {
            if !line.is_empty() {
                line.push(' ');
            }
            line.push_str(word);
        }

        if let Ok(conf) = columns[10].trim().parse::<f32>() {
            if conf >= 0.0 {
                confidences.push(conf);
            }
        }
    }

    let confidence = if confidences.is_empty() {
        0.0
    } else {
        confidences.iter().sum::<f32>() / confidences.len() as f32 / 100.0
    };

    PageText {
        text: lines.join("\n"),
        confidence,
    }
}
