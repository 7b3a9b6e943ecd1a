//! Persister configuration and its YAML loader.
//!
//! All settings have defaults suited to a current store; the toggles exist
//! for stores that still speak the older update dialect.
//!
//! ```yaml
//! identifier_field: _id
//! default_database: docmap
//! each_wrapping: when_multiple
//! legacy_push_all: false
//! upsert_empty_set_fallback: true
//! ```

use std::path::Path;

use serde::Deserialize;

use docmap_types::MappingError;

/// Errors that can occur when loading configuration or mapping files.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the file from disk.
    #[error("failed to read config file: {source}")]
    Io {
        /// The underlying I/O error.
        #[from]
        source: std::io::Error,
    },

    /// Failed to parse YAML content.
    #[error("failed to parse config YAML: {source}")]
    Yaml {
        /// The underlying YAML parse error.
        source: serde_yml::Error,
    },

    /// The YAML parsed but describes invalid mapping metadata.
    #[error("invalid mapping: {source}")]
    Mapping {
        /// The underlying mapping error.
        #[from]
        source: MappingError,
    },
}

impl From<serde_yml::Error> for ConfigError {
    fn from(source: serde_yml::Error) -> Self {
        Self::Yaml { source }
    }
}

/// When appended collection elements are wrapped in `$each`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EachWrapping {
    /// A single element is appended bare; several are wrapped.
    #[default]
    WhenMultiple,
    /// Elements are always wrapped, even a single one.
    Always,
}

/// Settings of the update compiler and document persister.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PersisterConfig {
    /// Stored identifier field used when a class maps none explicitly.
    #[serde(default = "default_identifier_field")]
    pub identifier_field: String,

    /// Database named in references when a class declares none.
    #[serde(default = "default_database")]
    pub default_database: String,

    /// `$each` wrapping of appended collection elements.
    #[serde(default)]
    pub each_wrapping: EachWrapping,

    /// Emit `$pushAll` for the `pushAll` strategy instead of `$push`.
    #[serde(default)]
    pub legacy_push_all: bool,

    /// Retry a rejected identifier-only upsert with an empty `$set`.
    #[serde(default = "default_true")]
    pub upsert_empty_set_fallback: bool,
}

impl Default for PersisterConfig {
    fn default() -> Self {
        Self {
            identifier_field: default_identifier_field(),
            default_database: default_database(),
            each_wrapping: EachWrapping::default(),
            legacy_push_all: false,
            upsert_empty_set_fallback: true,
        }
    }
}

impl PersisterConfig {
    /// Load configuration from a YAML file at the given path.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] if the file cannot be read, or
    /// [`ConfigError::Yaml`] if the content is not valid YAML.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    /// Parse configuration from a YAML string.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Yaml`] if the string is not valid YAML.
    pub fn parse(yaml: &str) -> Result<Self, ConfigError> {
        Ok(serde_yml::from_str(yaml)?)
    }
}

fn default_identifier_field() -> String {
    "_id".to_owned()
}

fn default_database() -> String {
    "docmap".to_owned()
}

const fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = PersisterConfig::default();
        assert_eq!(config.identifier_field, "_id");
        assert_eq!(config.default_database, "docmap");
        assert_eq!(config.each_wrapping, EachWrapping::WhenMultiple);
        assert!(!config.legacy_push_all);
        assert!(config.upsert_empty_set_fallback);
    }

    #[test]
    fn parse_partial_yaml_keeps_defaults() {
        let yaml = r"
default_database: shop
each_wrapping: always
legacy_push_all: true
";
        let config = PersisterConfig::parse(yaml);
        assert!(config.is_ok());
        let config = config.unwrap_or_default();
        assert_eq!(config.default_database, "shop");
        assert_eq!(config.each_wrapping, EachWrapping::Always);
        assert!(config.legacy_push_all);
        assert_eq!(config.identifier_field, "_id");
    }

    #[test]
    fn parse_invalid_yaml() {
        let result = PersisterConfig::parse("each_wrapping: [");
        assert!(matches!(result, Err(ConfigError::Yaml { .. })));
    }

    #[test]
    fn unknown_wrapping_is_rejected() {
        let result = PersisterConfig::parse("each_wrapping: sometimes");
        assert!(result.is_err());
    }

    #[test]
    fn missing_file_is_io_error() {
        let result = PersisterConfig::from_file(Path::new("/nonexistent/docmap.yaml"));
        assert!(matches!(result, Err(ConfigError::Io { .. })));
    }
}
