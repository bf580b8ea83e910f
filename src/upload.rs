//! Upload validation: filename presence, extension allow-list and byte sampling.

use crate::detect::ClassificationInput;
use crate::error::DetectError;

/// Extensions accepted by the detection endpoints (compared lower-cased).
pub const ALLOWED_EXTENSIONS: [&str; 5] = ["png", "jpg", "jpeg", "bmp", "gif"];

/// Only the first KiB of an upload is read as a validity sample.
pub const SAMPLE_BYTES: usize = 1024;

/// Maximum accepted request body (16 MiB).
pub const MAX_CONTENT_LENGTH: usize = 16 * 1024 * 1024;

/// Extension after the last `.`, if there is one.
pub fn extension(filename: &str) -> Option<&str> {
    filename.rsplit_once('.').map(|(_, ext)| ext)
}

pub fn is_allowed(filename: &str) -> bool {
    extension(filename)
        .map(|ext| ALLOWED_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// Check an uploaded filename before anything is simulated.
pub fn validate_filename(filename: &str) -> Result<(), DetectError> {
    if filename.is_empty() {
        return Err(DetectError::no_filename());
    }
    if !is_allowed(filename) {
        let ext = extension(filename).unwrap_or("<none>");
        return Err(DetectError::UnsupportedFormat(ext.to_string()));
    }
    Ok(())
}

/// Validate an upload and build the simulator input from it.
pub fn classification_input(filename: &str, bytes: &[u8]) -> Result<ClassificationInput, DetectError> {
    validate_filename(filename)?;
    Ok(ClassificationInput {
        filename: filename.to_string(),
        byte_length: bytes.len().min(SAMPLE_BYTES),
    })
}
