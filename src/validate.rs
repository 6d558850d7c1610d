//! Validation helpers shared by session and manager configuration.
//!
//! Validation collects every problem in one pass so callers see the full
//! list instead of fixing issues one at a time.

use crate::error::{Error, Result};

/// Validation result containing all found issues.
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    /// List of validation errors (fatal).
    pub errors: Vec<String>,
    /// List of validation warnings (non-fatal).
    pub warnings: Vec<String>,
}

impl ValidationResult {
    /// Returns true if validation passed (no errors).
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Adds an error to the result.
    pub fn add_error(&mut self, msg: impl Into<String>) {
        self.errors.push(msg.into());
    }

    /// Adds a warning to the result.
    pub fn add_warning(&mut self, msg: impl Into<String>) {
        self.warnings.push(msg.into());
    }

    /// Merges another validation result into this one.
    pub fn merge(&mut self, other: ValidationResult) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }

    /// Converts to a Result, failing with `InvalidConfig` if there are errors.
    ///
    /// Warnings are logged and returned on success.
    pub fn into_result(self) -> Result<Vec<String>> {
        if self.is_valid() {
            for warning in &self.warnings {
                tracing::warn!(warning = %warning, "configuration warning");
            }
            Ok(self.warnings)
        } else {
            Err(Error::InvalidConfig(self.errors.join("; ")))
        }
    }
}

/// Trait for validatable configuration types.
pub trait Validate {
    /// Validates the configuration and returns any issues found.
    fn validate(&self) -> ValidationResult;
}
