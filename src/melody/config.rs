//! Model configuration: encoder/decoder sizes and hyperparameters.

use super::ConfigurationError;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::path::Path;

/// Sizes fixed by the event encoding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncoderDecoderSpec {
    /// Width of one input step.
    pub input_size: usize,
    /// Number of label classes.
    pub num_classes: usize,
    /// Label meaning "nothing happens at this step".
    pub default_event_label: usize,
}

impl EncoderDecoderSpec {
    /// One-hot melody encoding over 36 pitches plus note-off and no-event.
    pub fn melody_one_hot() -> Self {
        Self { input_size: 38, num_classes: 38, default_event_label: 0 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HParams {
    pub batch_size: usize,
    pub window_size: usize,
    pub encoding_size: usize,
    pub rnn_layer_sizes: Vec<usize>,
    pub dropout_keep_prob: f32,
    /// `0` disables the attention wrapper on the first layer.
    pub attn_length: usize,
    pub learning_rate: f32,
    pub clip_norm: f32,
}

impl Default for HParams {
    fn default() -> Self {
        Self {
            batch_size: 64,
            window_size: 8,
            encoding_size: 32,
            rnn_layer_sizes: vec![128, 128],
            dropout_keep_prob: 1.0,
            attn_length: 0,
            learning_rate: 0.001,
            clip_norm: 3.0,
        }
    }
}

impl HParams {
    /// Applies comma-separated `name=value` overrides, e.g.
    /// `"batch_size=16,rnn_layer_sizes=[64,64],dropout_keep_prob=0.5"`.
    ///
    /// Values are JSON literals. Commas inside brackets belong to the value.
    pub fn parse(self, overrides: &str) -> Result<Self, ConfigurationError> {
        let mut fields = match serde_json::to_value(&self) {
            Ok(JsonValue::Object(map)) => map,
            _ => return Err(ConfigurationError::InvalidConfig("hparams are not a JSON object".into())),
        };

        for assignment in split_top_level(overrides) {
            let (name, raw) = assignment.split_once('=').ok_or_else(|| ConfigurationError::InvalidHParam {
                name: assignment.to_string(),
                reason: "expected name=value".into(),
            })?;
            let name = name.trim();
            if !fields.contains_key(name) {
                return Err(ConfigurationError::InvalidHParam { name: name.into(), reason: "unknown hparam".into() });
            }
            let value: JsonValue = serde_json::from_str(raw.trim())
                .map_err(|e| ConfigurationError::InvalidHParam { name: name.into(), reason: e.to_string() })?;
            fields.insert(name.to_string(), value);
        }

        serde_json::from_value(JsonValue::Object(fields))
            .map_err(|e| ConfigurationError::InvalidHParam { name: overrides.to_string(), reason: e.to_string() })
    }

    /// Checks the invariants every graph mode relies on.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.window_size == 0 {
            return Err(ConfigurationError::NonPositiveWindowSize(self.window_size));
        }
        if self.rnn_layer_sizes.is_empty() || self.rnn_layer_sizes.contains(&0) {
            return Err(ConfigurationError::EmptyLayerSizes);
        }
        if !(self.dropout_keep_prob > 0.0 && self.dropout_keep_prob <= 1.0) {
            return Err(ConfigurationError::InvalidHParam {
                name: "dropout_keep_prob".into(),
                reason: format!("must be in (0, 1], got {}", self.dropout_keep_prob),
            });
        }
        if self.batch_size == 0 {
            return Err(ConfigurationError::InvalidHParam { name: "batch_size".into(), reason: "must be positive".into() });
        }
        if self.encoding_size == 0 {
            return Err(ConfigurationError::InvalidHParam {
                name: "encoding_size".into(),
                reason: "must be positive".into(),
            });
        }
        Ok(())
    }
}

/// Splits on commas that are not nested inside `[...]`.
fn split_top_level(s: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut start = 0;
    for (i, ch) in s.char_indices() {
        match ch {
            '[' => depth += 1,
            ']' => depth -= 1,
            ',' if depth == 0 => {
                parts.push(&s[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&s[start..]);
    parts.into_iter().map(str::trim).filter(|p| !p.is_empty()).collect()
}

/// Everything needed to build one graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MelodyRnnConfig {
    pub encoder_decoder: EncoderDecoderSpec,
    #[serde(default)]
    pub hparams: HParams,
}

impl MelodyRnnConfig {
    pub fn new(encoder_decoder: EncoderDecoderSpec, hparams: HParams) -> Self {
        Self { encoder_decoder, hparams }
    }

    pub fn from_json_str(json: &str) -> Result<Self, ConfigurationError> {
        serde_json::from_str(json).map_err(|e| ConfigurationError::InvalidConfig(e.to_string()))
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigurationError> {
        let text = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigurationError::InvalidConfig(format!("{}: {}", path.as_ref().display(), e)))?;
        Self::from_json_str(&text)
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        self.hparams.validate()?;
        let spec = &self.encoder_decoder;
        if spec.input_size == 0 || spec.num_classes == 0 {
            return Err(ConfigurationError::InvalidConfig("input_size and num_classes must be positive".into()));
        }
        if spec.default_event_label >= spec.num_classes {
            return Err(ConfigurationError::InvalidConfig(format!(
                "default_event_label {} is not a class below {}",
                spec.default_event_label, spec.num_classes
            )));
        }
        Ok(())
    }
}

impl Default for MelodyRnnConfig {
    fn default() -> Self {
        Self::new(EncoderDecoderSpec::melody_one_hot(), HParams::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_overrides_with_nested_list() {
        let hparams = HParams::default()
            .parse("batch_size=16, rnn_layer_sizes=[64,32],dropout_keep_prob=0.5")
            .unwrap();
        assert_eq!(hparams.batch_size, 16);
        assert_eq!(hparams.rnn_layer_sizes, vec![64, 32]);
        assert_eq!(hparams.dropout_keep_prob, 0.5);
        assert_eq!(hparams.window_size, HParams::default().window_size);
    }

    #[test]
    fn test_parse_rejects_unknown_and_malformed() {
        assert!(matches!(
            HParams::default().parse("no_such=1"),
            Err(ConfigurationError::InvalidHParam { name, .. }) if name == "no_such"
        ));
        assert!(HParams::default().parse("batch_size").is_err());
        assert!(HParams::default().parse("batch_size=abc").is_err());
        assert!(HParams::default().parse("batch_size=-3").is_err());
    }

    #[test]
    fn test_validate() {
        let mut hparams = HParams::default();
        assert!(hparams.validate().is_ok());
        hparams.window_size = 0;
        assert_eq!(hparams.validate(), Err(ConfigurationError::NonPositiveWindowSize(0)));
        hparams.window_size = 2;
        hparams.rnn_layer_sizes.clear();
        assert_eq!(hparams.validate(), Err(ConfigurationError::EmptyLayerSizes));
        hparams.rnn_layer_sizes = vec![4];
        hparams.dropout_keep_prob = 0.0;
        assert!(hparams.validate().is_err());
    }

    #[test]
    fn test_config_json() {
        let json = r#"{
            "encoder_decoder": {"input_size": 3, "num_classes": 5, "default_event_label": 0},
            "hparams": {"batch_size": 2, "window_size": 3}
        }"#;
        let config = MelodyRnnConfig::from_json_str(json).unwrap();
        assert_eq!(config.hparams.batch_size, 2);
        assert_eq!(config.hparams.encoding_size, HParams::default().encoding_size);
        assert!(config.validate().is_ok());
        assert!(MelodyRnnConfig::from_json_str("{}").is_err());
    }
}
