//! Configuration error types

use thiserror::Error;

/// Configuration error type
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Range validation error
    #[error("Invalid range for field '{field}': {value} not in {min}..={max}. {hint}")]
    Range {
        field: String,
        value: String,
        min: String,
        max: String,
        hint: String,
    },

    /// Unknown field in a TOML file
    #[error("Unknown field '{field}' in section '{section}'. {suggestion}")]
    UnknownField {
        field: String,
        section: String,
        suggestion: String,
        valid_fields: Vec<String>,
    },

    /// Missing version field in a config file
    #[error("Missing 'version' field in configuration file. Add 'version = 1' to the top of your TOML file.")]
    MissingVersion,

    /// Unsupported version
    #[error("Unsupported configuration version {found}. Supported versions: {}", supported.iter().map(|v| v.to_string()).collect::<Vec<_>>().join(", "))]
    UnsupportedVersion { found: u32, supported: Vec<u32> },

    /// Unknown preset name
    #[error("Unknown preset '{0}'. Valid presets: fast, balanced, thorough")]
    UnknownPreset(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing error
    #[error("TOML parsing error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// Custom error
    #[error("{0}")]
    Custom(String),
}

/// Configuration result type
pub type ConfigResult<T> = Result<T, ConfigError>;

impl ConfigError {
    /// Create a range error with a hint
    pub fn range_with_hint(
        field: impl Into<String>,
        value: impl ToString,
        min: impl ToString,
        max: impl ToString,
        hint: impl Into<String>,
    ) -> Self {
        Self::Range {
            field: field.into(),
            value: value.to_string(),
            min: min.to_string(),
            max: max.to_string(),
            hint: hint.into(),
        }
    }

    /// Create an unknown field error with suggestion
    pub fn unknown_field_with_suggestion(
        field: impl Into<String>,
        section: impl Into<String>,
        valid_fields: Vec<String>,
    ) -> Self {
        let field = field.into();
        let suggestion = find_closest_match(&field, &valid_fields);

        Self::UnknownField {
            field,
            section: section.into(),
            suggestion,
            valid_fields,
        }
    }
}

/// Find closest match using simple edit distance
fn find_closest_match(target: &str, candidates: &[String]) -> String {
    if candidates.is_empty() {
        return "No valid fields available".to_string();
    }

    let closest = candidates
        .iter()
        .min_by_key(|candidate| levenshtein_distance(target, candidate))
        .unwrap();

    format!("Did you mean '{}'?", closest)
}

/// Simple Levenshtein distance implementation
fn levenshtein_distance(s1: &str, s2: &str) -> usize {
    let len1 = s1.len();
    let len2 = s2.len();
    let mut matrix = vec![vec![0; len2 + 1]; len1 + 1];

    for i in 0..=len1 {
        matrix[i][0] = i;
    }
    for j in 0..=len2 {
        matrix[0][j] = j;
    }

    for (i, c1) in s1.chars().enumerate() {
        for (j, c2) in s2.chars().enumerate() {
            let cost = if c1 == c2 { 0 } else { 1 };
            matrix[i + 1][j + 1] = *[
                matrix[i][j + 1] + 1, // deletion
                matrix[i + 1][j] + 1, // insertion
                matrix[i][j] + cost,  // substitution
            ]
            .iter()
            .min()
            .unwrap();
        }
    }

    matrix[len1][len2]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_levenshtein_distance() {
        assert_eq!(levenshtein_distance("kitten", "sitting"), 3);
        assert_eq!(levenshtein_distance("max_chunk_size", "max_chunk_size"), 0);
    }

    #[test]
    fn test_closest_match() {
        let valid_fields = vec!["max_chunk_size".to_string(), "chunk_tolerance".to_string()];
        let suggestion = find_closest_match("max_chnk_size", &valid_fields);
        assert!(suggestion.contains("max_chunk_size"));
    }

    #[test]
    fn test_error_formatting() {
        let err = ConfigError::range_with_hint("max_chunk_size", 0, 1, 10000, "must be positive");
        let msg = err.to_string();
        assert!(msg.contains("max_chunk_size"));
        assert!(msg.contains("1..=10000"));
    }

    #[test]
    fn test_unknown_field_error() {
        let valid = vec!["max_chunk_size".to_string(), "chunk_tolerance".to_string()];
        let err = ConfigError::unknown_field_with_suggestion("max_chnk_size", "chunking", valid);
        let msg = err.to_string();
        assert!(msg.contains("chunking"));
        assert!(msg.contains("Did you mean"));
    }

    #[test]
    fn test_unsupported_version_error() {
        let err = ConfigError::UnsupportedVersion {
            found: 2,
            supported: vec![1],
        };
        assert!(err.to_string().contains("version 2"));
    }

    #[test]
    fn test_unknown_preset_error() {
        let err = ConfigError::UnknownPreset("ultra_fast".to_string());
        assert!(err.to_string().contains("ultra_fast"));
    }

    #[test]
    fn test_validation_and_custom_error() {
        assert!(ConfigError::Validation("bad".into()).to_string().contains("Validation error"));
        assert_eq!(ConfigError::Custom("oops".into()).to_string(), "oops");
    }
}
