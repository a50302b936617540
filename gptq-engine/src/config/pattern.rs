//! Layer name patterns for per-layer config lookup.
//!
//! Patterns are plain strings with two kinds of placeholders:
//! - `{N}` (any name between braces) matches one or more ASCII digits
//! - `*` matches any run of characters, including an empty one
//!
//! `blocks.{N}.fc1` matches `blocks.0.fc1` and `blocks.17.fc1`, `*` matches everything.

use std::fmt;

use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use super::LayerQuantConfig;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Literal(String),
    Digits,
    Any,
}

/// Compiled layer-name pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerPattern {
    tokens: Vec<Token>,
}

impl LayerPattern {
    /// Compile a pattern string. An unclosed `{` is taken literally.
    pub fn compile(pattern: &str) -> Self {
        let mut tokens = Vec::new();
        let mut literal = String::new();
        let mut rest = pattern;

        while let Some(c) = rest.chars().next() {
            match c {
                '{' => {
                    if let Some(close) = rest.find('}') {
                        if !literal.is_empty() {
                            tokens.push(Token::Literal(std::mem::take(&mut literal)));
                        }
                        tokens.push(Token::Digits);
                        rest = &rest[close + 1..];
                        continue;
                    }
                    literal.push(c);
                }
                '*' => {
                    if !literal.is_empty() {
                        tokens.push(Token::Literal(std::mem::take(&mut literal)));
                    }
                    tokens.push(Token::Any);
                }
                _ => literal.push(c),
            }
            rest = &rest[c.len_utf8()..];
        }
        if !literal.is_empty() {
            tokens.push(Token::Literal(literal));
        }

        Self { tokens }
    }

    /// Whether the pattern has no placeholders.
    pub fn is_literal(&self) -> bool {
        self.tokens.iter().all(|t| matches!(t, Token::Literal(_)))
    }

    /// Match a full layer name.
    pub fn matches(&self, name: &str) -> bool {
        match_tokens(&self.tokens, name)
    }

    /// Number of literal bytes; a higher count is a narrower pattern.
    pub fn specificity(&self) -> usize {
        self.tokens
            .iter()
            .map(|t| match t {
                Token::Literal(lit) => lit.len(),
                _ => 0,
            })
            .sum()
    }
}

fn match_tokens(tokens: &[Token], input: &str) -> bool {
    match tokens.split_first() {
        None => input.is_empty(),
        Some((Token::Literal(lit), rest)) => input
            .strip_prefix(lit.as_str())
            .is_some_and(|remaining| match_tokens(rest, remaining)),
        Some((Token::Digits, rest)) => {
            let run = input.bytes().take_while(|b| b.is_ascii_digit()).count();
            (1..=run).any(|k| match_tokens(rest, &input[k..]))
        }
        Some((Token::Any, rest)) => (0..=input.len())
            .filter(|&k| input.is_char_boundary(k))
            .any(|k| match_tokens(rest, &input[k..])),
    }
}

/// Layer name (or pattern) to quantization settings, in the order written.
///
/// Lookup tries the exact name first, then the matching pattern with the most
/// literal text. Equally specific patterns resolve to the one written first.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WeightConfig {
    entries: Vec<(String, LayerQuantConfig)>,
}

impl WeightConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Config that applies `config` to every layer.
    pub fn all(config: LayerQuantConfig) -> Self {
        let mut weight_config = Self::new();
        weight_config.insert("*", config);
        weight_config
    }

    /// Add an entry, replacing an existing one with the same key in place.
    pub fn insert(&mut self, key: impl Into<String>, config: LayerQuantConfig) {
        let key = key.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some((_, existing)) => *existing = config,
            None => self.entries.push((key, config)),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &LayerQuantConfig)> {
        self.entries.iter().map(|(k, v)| (k, v))
    }

    /// Find the config for a fully qualified layer name.
    pub fn lookup(&self, layer_name: &str) -> Option<&LayerQuantConfig> {
        if let Some((_, config)) = self.entries.iter().find(|(key, _)| key == layer_name) {
            return Some(config);
        }

        let mut best: Option<(usize, &LayerQuantConfig)> = None;
        for (key, config) in &self.entries {
            let pattern = LayerPattern::compile(key);
            if pattern.is_literal() || !pattern.matches(layer_name) {
                continue;
            }
            let specificity = pattern.specificity();
            if best.map_or(true, |(current, _)| specificity > current) {
                best = Some((specificity, config));
            }
        }
        best.map(|(_, config)| config)
    }
}

impl Serialize for WeightConfig {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (key, config) in &self.entries {
            map.serialize_entry(key, config)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for WeightConfig {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct EntriesVisitor;

        impl<'de> Visitor<'de> for EntriesVisitor {
            type Value = WeightConfig;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a map of layer names or patterns to quantization settings")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> std::result::Result<WeightConfig, A::Error> {
                let mut weight_config = WeightConfig::new();
                while let Some((key, config)) = access.next_entry::<String, LayerQuantConfig>()? {
                    weight_config.insert(key, config);
                }
                Ok(weight_config)
            }
        }

        deserializer.deserialize_map(EntriesVisitor)
    }
}
