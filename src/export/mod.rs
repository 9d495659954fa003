//! CSV export of extraction results.

use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use serde::Serialize;
use std::fs::OpenOptions;
use std::path::Path;
use tracing::info;

use crate::models::ExtractionResult;

#[derive(Serialize)]
struct ExportRow<'a> {
    timestamp: String,
    url: &'a str,
    name: &'a str,
    current_price: &'a str,
    previous_price: &'a str,
    discount: &'a str,
    description: &'a str,
}

/// Append one result to `path`. The header is written only when the file is
/// new or empty.
pub fn append_extraction(path: &Path, result: &ExtractionResult, at: NaiveDateTime) -> Result<()> {
    let write_header = std::fs::metadata(path).map(|m| m.len() == 0).unwrap_or(true);

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Could not create dir {:?}", parent))?;
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Could not open {:?}", path))?;

    let mut writer = csv::WriterBuilder::new()
        .has_headers(write_header)
        .from_writer(file);
    writer.serialize(ExportRow {
        timestamp: at.format("%Y-%m-%d %H:%M:%S").to_string(),
        url: &result.url,
        name: result.name.as_str(),
        current_price: result.price.as_str(),
        previous_price: result.previous_price.as_str(),
        discount: result.discount.as_str(),
        description: result.description.as_str(),
    })?;
    writer.flush()?;

    info!("Appended {} to {:?}", result.url, path);
    Ok(())
}
