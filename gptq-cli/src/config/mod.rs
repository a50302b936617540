//! Quantize command configuration.

use std::collections::BTreeSet;

use gptq_engine::{LayerQuantConfig, RunConfig, StackedModelOptions, WeightConfig};
use serde::{Deserialize, Serialize};

/// File name written by `--generate-config`.
pub const QUANTIZE_CONFIG_NAME: &str = "quantize_config.json";

/// Contents of `quantize_config.json`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuantizeConfig {
    /// How the stacked model is assembled
    pub model: StackedModelOptions,
    /// Orchestrator settings and per-layer quantization
    pub run: RunConfig,
}

impl QuantizeConfig {
    /// Template with one `blocks.{N}.<layer>` entry per distinct block layer.
    pub fn template<'a>(weight_names: impl IntoIterator<Item = &'a str>) -> Self {
        let patterns: BTreeSet<String> = weight_names
            .into_iter()
            .filter_map(|name| name.strip_suffix(".weight"))
            .filter_map(|prefix| prefix.strip_prefix("blocks."))
            .filter_map(|rest| rest.split_once('.'))
            .filter(|(index, _)| index.parse::<usize>().is_ok())
            .map(|(_, local)| format!("blocks.{{N}}.{local}"))
            .collect();

        let mut weight_config = WeightConfig::new();
        for pattern in patterns {
            weight_config.insert(pattern, LayerQuantConfig::default());
        }

        Self {
            model: StackedModelOptions::default(),
            run: RunConfig {
                weight_config,
                ..Default::default()
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gptq_engine::FallbackPolicy;

    #[test]
    fn test_template_collapses_block_indices() {
        let names = [
            "embed.proj.weight",
            "blocks.0.fc1.weight",
            "blocks.0.fc1.bias",
            "blocks.0.fc2.weight",
            "blocks.1.fc1.weight",
            "blocks.x.fc1.weight",
        ];
        let config = QuantizeConfig::template(names);

        let keys: Vec<&String> = config.run.weight_config.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["blocks.{N}.fc1", "blocks.{N}.fc2"]);
        assert!(config.run.weight_config.lookup("blocks.7.fc2").is_some());
        assert!(config.run.weight_config.lookup("embed.proj").is_none());
    }

    #[test]
    fn test_template_round_trips_through_json() {
        let config = QuantizeConfig::template(["blocks.0.attn.weight"]);
        let json = serde_json::to_string_pretty(&config).unwrap();
        let parsed: QuantizeConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let json = r#"{ "run": { "layer_wise": true, "fallback": "round_to_nearest" } }"#;
        let config: QuantizeConfig = serde_json::from_str(json).unwrap();
        assert!(config.run.layer_wise);
        assert_eq!(config.run.fallback, FallbackPolicy::RoundToNearest);
        assert_eq!(config.run.nsamples, 128);
        assert!(config.model.residual);
        // no weight_config key: every layer gets the default settings
        assert!(config.run.weight_config.lookup("blocks.0.fc1").is_some());
    }
}
