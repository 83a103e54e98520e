use std::io::{Cursor, Write};
use std::path::PathBuf;
use anyhow::{Context, Result};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

/// Packs `files` into an in-memory zip, each entry under its base name.
pub fn build_archive(files: &[PathBuf]) -> Result<Vec<u8>> {
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
    let mut zip = ZipWriter::new(Cursor::new(Vec::new()));

    for path in files {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .with_context(|| format!("artifact {} has no usable file name", path.display()))?;
        let contents = std::fs::read(path)
            .with_context(|| format!("failed to read artifact {}", path.display()))?;

        zip.start_file(name, options)?;
        zip.write_all(&contents)?;
    }

    Ok(zip.finish()?.into_inner())
}

/// Archive key for a task, named after the file the controller sent.
pub fn archive_name(original_filename: &str) -> String {
    let stem = std::path::Path::new(original_filename)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(original_filename);
    format!("{}.zip", stem)
}
