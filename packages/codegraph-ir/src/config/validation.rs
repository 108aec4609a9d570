//! Configuration validation.
//!
//! - **D (Dependency Inversion)**: Code depends on `Validatable`, not a concrete config type.
//! - **I (Interface Segregation)**: Minimal interface — only `validate()` is required.

use super::error::ConfigResult;

pub trait Validatable {
    fn validate(&self) -> ConfigResult<()>;

    fn config_name(&self) -> &'static str {
        "Config"
    }
}

/// Extension trait for validating collections of configs
pub trait ValidatableCollection {
    fn validate_all(&self) -> ConfigResult<()>;
}

impl<T: Validatable> ValidatableCollection for Vec<T> {
    fn validate_all(&self) -> ConfigResult<()> {
        for config in self {
            config.validate()?;
        }
        Ok(())
    }
}

impl<T: Validatable> ValidatableCollection for Option<T> {
    fn validate_all(&self) -> ConfigResult<()> {
        if let Some(config) = self {
            config.validate()?;
        }
        Ok(())
    }
}
