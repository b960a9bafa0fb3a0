use serde::{Deserialize, Serialize};

use crate::DecisionError;

/// Identity values fixed for the lifetime of one operator session.
///
/// Built once at startup and handed to each component explicitly.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct SessionConfig {
    matrix_id: String,
    collaborator_email: String,
}

impl SessionConfig {
    /// Validates and builds a session configuration.
    ///
    /// # Errors
    /// Returns [`DecisionError::Configuration`] when the matrix id is blank or
    /// the collaborator email is blank or lacks an `@`.
    pub fn new(
        matrix_id: impl Into<String>,
        collaborator_email: impl Into<String>,
    ) -> Result<Self, DecisionError> {
        let matrix_id = matrix_id.into().trim().to_string();
        let collaborator_email = collaborator_email.into().trim().to_string();

        if matrix_id.is_empty() {
            return Err(DecisionError::Configuration(
                "matrix_id MUST be provided".to_string(),
            ));
        }

        if collaborator_email.is_empty() {
            return Err(DecisionError::Configuration(
                "collaborator_email MUST be provided".to_string(),
            ));
        }

        if !collaborator_email.contains('@') {
            return Err(DecisionError::Configuration(format!(
                "collaborator_email is not an email address: {collaborator_email}"
            )));
        }

        Ok(Self {
            matrix_id,
            collaborator_email,
        })
    }

    #[must_use]
    pub fn matrix_id(&self) -> &str {
        &self.matrix_id
    }

    #[must_use]
    pub fn collaborator_email(&self) -> &str {
        &self.collaborator_email
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trims_and_accepts_valid_identity() {
        let config = match SessionConfig::new(" M1 ", "alice@x.com\n") {
            Ok(value) => value,
            Err(err) => panic!("expected valid config: {err}"),
        };
        assert_eq!(config.matrix_id(), "M1");
        assert_eq!(config.collaborator_email(), "alice@x.com");
    }

    #[test]
    fn rejects_blank_or_malformed_values() {
        assert!(matches!(
            SessionConfig::new("", "alice@x.com"),
            Err(DecisionError::Configuration(_))
        ));
        assert!(matches!(
            SessionConfig::new("M1", "   "),
            Err(DecisionError::Configuration(_))
        ));
        assert!(matches!(
            SessionConfig::new("M1", "alice"),
            Err(DecisionError::Configuration(_))
        ));
    }
}
