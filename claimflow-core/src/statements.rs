//! Batch OCR of accident statements into Markdown files.

use crate::error::ClaimflowError;
use crate::ocr::OcrEngine;
use std::path::{Path, PathBuf};
use tracing::info;

const IMAGE_EXTENSIONS: &[&str] = &["jpeg", "jpg", "png"];

/// Statement images in `dir`, sorted by file name.
pub fn list_statement_images(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut images: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.is_file())
        .filter(|path| {
            path.extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        })
        .collect();
    images.sort();
    Ok(images)
}

/// OCR every statement image in `input_dir` and write `<stem>.md` into `output_dir`.
///
/// Stops at the first OCR failure. Returns the processed file names.
pub async fn process_statements(
    engine: &dyn OcrEngine,
    input_dir: &Path,
    output_dir: &Path,
) -> Result<Vec<String>, ClaimflowError> {
    let images = list_statement_images(input_dir)?;
    std::fs::create_dir_all(output_dir)?;

    let mut processed = Vec::with_capacity(images.len());
    for image in &images {
        let name = image
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        info!(image = %name, "Processing statement with Mistral Document AI");

        let output = engine.extract(image).await?;
        let stem = image
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| name.clone());
        let md_path = output_dir.join(format!("{stem}.md"));
        tokio::fs::write(&md_path, &output.text).await?;
        info!(path = %md_path.display(), characters = output.text.chars().count(), "Markdown saved");

        processed.push(name);
    }
    info!(count = processed.len(), "Processed statements");
    Ok(processed)
}
