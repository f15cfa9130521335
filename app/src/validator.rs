// ==============================================================================
// validator.rs - Upload Input Validation
// ==============================================================================
// Description: Filename checks and chunk metadata checks
// Author: Matt Barham
// Created: 2026-10-12
// Modified: 2026-10-19
// Version: 1.0.0
// Security: Client names are checked, never rewritten; paths use derived ids
// ==============================================================================

use tracing::debug;

use crate::error::{IngestError, Result};

/// Upper bound on declared chunk counts (keeps bitmap allocation bounded)
pub const MAX_TOTAL_CHUNKS: u32 = 100_000;

const MAX_NAME_LEN: usize = 255;
const MAX_EXTENSION_LEN: usize = 16;

/// Compound suffixes kept whole when deriving the published extension
const COMPOUND_EXTENSIONS: &[&str] = &[
    ".mtx.gz",
    ".tsv.gz",
    ".csv.gz",
    ".vcf.gz",
    ".txt.gz",
    ".tar.gz",
];

/// Check a client file name and return it with surrounding whitespace
/// trimmed. Names are never rewritten: one that is empty, hidden, too long
/// or carries a path separator or control character is rejected, so two
/// distinct names always stay distinct. Unicode is allowed; the name never
/// becomes a path component on its own.
pub fn validate_filename(name: &str) -> Result<String> {
    let trimmed = name.trim();

    let reason = if trimmed.is_empty() {
        Some("is empty")
    } else if trimmed.starts_with('.') {
        Some("starts with a dot")
    } else if trimmed.chars().count() > MAX_NAME_LEN {
        Some("is too long")
    } else if trimmed.chars().any(|c| c == '/' || c == '\\' || c.is_control()) {
        Some("contains a path separator or control character")
    } else {
        None
    };

    if let Some(reason) = reason {
        return Err(IngestError::InvalidChunkMetadata(format!(
            "file name '{}' {}",
            name.escape_debug(),
            reason
        )));
    }

    debug!("Accepted filename: {}", trimmed);
    Ok(trimmed.to_string())
}

/// Extension with leading dot, keeping known compound suffixes together
pub fn file_extension(name: &str) -> String {
    let lower = name.to_lowercase();
    if let Some(compound) = COMPOUND_EXTENSIONS.iter().find(|ext| lower.ends_with(*ext)) {
        return compound.to_string();
    }

    match lower.rfind('.') {
        Some(pos) if pos > 0 && pos + 1 < lower.len() => lower[pos..].to_string(),
        _ => String::new(),
    }
}

/// Normalize a client supplied extension to `.ext` form (or empty)
pub fn normalize_extension(ext: &str) -> Result<String> {
    let ext = ext.trim().trim_start_matches('.');
    if ext.is_empty() {
        return Ok(String::new());
    }

    if ext.len() > MAX_EXTENSION_LEN
        || !ext.chars().all(|c| c.is_ascii_alphanumeric() || c == '.')
        || ext.contains("..")
    {
        return Err(IngestError::InvalidChunkMetadata(format!(
            "invalid file extension '{}'",
            ext
        )));
    }

    Ok(format!(".{}", ext.to_lowercase()))
}

/// Chunk metadata check, performed before any state is touched
pub fn validate_chunk(index: u32, total: u32, len: usize, max_chunk_bytes: usize) -> Result<()> {
    if total == 0 {
        return Err(IngestError::InvalidChunkMetadata(
            "total chunk count must be at least 1".to_string(),
        ));
    }

    if total > MAX_TOTAL_CHUNKS {
        return Err(IngestError::InvalidChunkMetadata(format!(
            "too many chunks: {} (max: {})",
            total, MAX_TOTAL_CHUNKS
        )));
    }

    if index >= total {
        return Err(IngestError::InvalidChunkMetadata(format!(
            "chunk index {} out of range (total chunks: {})",
            index, total
        )));
    }

    if len > max_chunk_bytes {
        return Err(IngestError::InvalidChunkMetadata(format!(
            "chunk too large: {} bytes (max: {} bytes)",
            len, max_chunk_bytes
        )));
    }

    Ok(())
}
