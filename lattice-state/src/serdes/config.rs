//! Serializer configuration.

use serde::{Deserialize, Serialize};

fn default_min_shared_string_len() -> usize {
    8
}

fn default_max_inline_depth() -> usize {
    16
}

/// Tuning knobs for the encoder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerdesConfig {
    /// Strings shorter than this are always inlined, never deduplicated.
    #[serde(default = "default_min_shared_string_len")]
    pub min_shared_string_len: usize,

    /// Composite values nested deeper than this are promoted to roots so
    /// decoding never recurses past it.
    #[serde(default = "default_max_inline_depth")]
    pub max_inline_depth: usize,
}

impl Default for SerdesConfig {
    fn default() -> Self {
        Self {
            min_shared_string_len: default_min_shared_string_len(),
            max_inline_depth: default_max_inline_depth(),
        }
    }
}

impl SerdesConfig {
    /// Load from JSON. Missing fields take their defaults.
    pub fn from_json(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_use_defaults() {
        let config = SerdesConfig::from_json(r#"{"max_inline_depth": 4}"#).unwrap();
        assert_eq!(config.max_inline_depth, 4);
        assert_eq!(config.min_shared_string_len, 8);
        assert_eq!(SerdesConfig::from_json("{}").unwrap(), SerdesConfig::default());
    }
}
