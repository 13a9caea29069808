use crate::error::SessionError;

/// Default maximum text length for synthesis requests
pub const MAX_TEXT_LENGTH: usize = 5000;

/// Validate text for a synthesize command. Length is counted in characters.
pub fn validate_synthesis_text(text: &str, max_length: usize) -> Result<(), SessionError> {
    if text.trim().is_empty() {
        return Err(SessionError::Validation("No text provided".to_string()));
    }
    if text.chars().count() > max_length {
        return Err(SessionError::Validation(format!(
            "Text too long (max {} characters)",
            max_length
        )));
    }
    Ok(())
}
