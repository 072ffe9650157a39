use crate::error::{ThrottlerError, ThrottlerResult};
use crate::key_generator::MAX_KEY_LENGTH;

/// Longest identifier the admin surface accepts: a key plus its prefix.
const MAX_IDENTIFIER_LENGTH: usize = MAX_KEY_LENGTH + 8;

const KNOWN_PREFIXES: [&str; 2] = ["ip:", "key:"];

/// Request validation utilities
pub struct RequestValidator;

impl RequestValidator {
    /// Validates an identifier passed to the admin endpoints
    pub fn validate_identifier(identifier: &str) -> ThrottlerResult<String> {
        let identifier = identifier.trim();

        if identifier.is_empty() {
            return Err(ThrottlerError::ValidationError(
                "Identifier cannot be empty".to_string(),
            ));
        }

        if identifier.len() > MAX_IDENTIFIER_LENGTH {
            return Err(ThrottlerError::ValidationError(format!(
                "Identifier cannot exceed {} characters",
                MAX_IDENTIFIER_LENGTH
            )));
        }

        let Some(value) = KNOWN_PREFIXES
            .iter()
            .find_map(|prefix| identifier.strip_prefix(prefix))
        else {
            return Err(ThrottlerError::ValidationError(
                "Identifier must start with 'ip:' or 'key:'".to_string(),
            ));
        };

        if value.is_empty() {
            return Err(ThrottlerError::ValidationError(
                "Identifier value cannot be empty".to_string(),
            ));
        }

        if value.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(ThrottlerError::ValidationError(
                "Identifier contains invalid characters".to_string(),
            ));
        }

        Ok(identifier.to_string())
    }
}
