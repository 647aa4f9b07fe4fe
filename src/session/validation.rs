//! Validation helpers for user-entered session codes.

use validator::ValidationError;

use crate::session::ids::{SESSION_CODE_ALPHABET, SESSION_CODE_LENGTH};

/// Trim surrounding whitespace and uppercase a code typed by a user.
pub fn normalize_session_code(input: &str) -> String {
    input.trim().to_ascii_uppercase()
}

/// Validates that a private session code is exactly 6 characters of `A-Z0-9`.
///
/// # Examples
///
/// ```ignore
/// validate_session_code("ABC123") // Ok
/// validate_session_code("abc123") // Err - lowercase
/// validate_session_code("ABC12")  // Err - too short
/// ```
pub fn validate_session_code(code: &str) -> Result<(), ValidationError> {
    if code.chars().count() != SESSION_CODE_LENGTH {
        let mut err = ValidationError::new("session_code_length");
        err.message = Some(
            format!(
                "Session code must be exactly {SESSION_CODE_LENGTH} characters (got {})",
                code.chars().count()
            )
            .into(),
        );
        return Err(err);
    }

    if !code.bytes().all(|byte| SESSION_CODE_ALPHABET.contains(&byte)) {
        let mut err = ValidationError::new("session_code_format");
        err.message =
            Some("Session code must contain only uppercase letters and digits".into());
        return Err(err);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_session_code_valid() {
        assert!(validate_session_code("ABC123").is_ok());
        assert!(validate_session_code("ZZZZZZ").is_ok());
        assert!(validate_session_code("000000").is_ok());
    }

    #[test]
    fn test_validate_session_code_invalid_length() {
        assert!(validate_session_code("ABC12").is_err());
        assert!(validate_session_code("ABC1234").is_err());
        assert!(validate_session_code("").is_err());
    }

    #[test]
    fn test_validate_session_code_invalid_format() {
        assert!(validate_session_code("abc123").is_err());
        assert!(validate_session_code("ABC 12").is_err());
        assert!(validate_session_code("ABC-12").is_err());
        assert!(validate_session_code("ÄBC123").is_err());
    }

    #[test]
    fn normalization_accepts_sloppy_input() {
        let code = normalize_session_code("  abc123\n");
        assert_eq!(code, "ABC123");
        assert!(validate_session_code(&code).is_ok());
    }
}
