use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

pub const DEFAULT_MODEL: &str = "claude-sonnet-4-5";

#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModelId(pub String);

impl fmt::Display for ModelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ModelId {
    fn from(s: &str) -> Self {
        ModelId(s.to_string())
    }
}

/// USD per 1K tokens.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelPricing {
    pub input_per_1k: f64,
    pub output_per_1k: f64,
}

pub type PricingTable = HashMap<ModelId, ModelPricing>;

pub fn builtin_pricing() -> PricingTable {
    let mut m = HashMap::new();

    m.insert(
        ModelId::from("claude-sonnet-4-5"),
        ModelPricing {
            input_per_1k: 0.003,
            output_per_1k: 0.015,
        },
    );

    m.insert(
        ModelId::from("claude-opus-4-1"),
        ModelPricing {
            input_per_1k: 0.015,
            output_per_1k: 0.075,
        },
    );

    m.insert(
        ModelId::from("claude-haiku-4-5"),
        ModelPricing {
            input_per_1k: 0.001,
            output_per_1k: 0.005,
        },
    );

    // Older, cheaper haiku alias
    m.insert(
        ModelId::from("claude-3-5-haiku-latest"),
        ModelPricing {
            input_per_1k: 0.0008,
            output_per_1k: 0.004,
        },
    );

    m
}

pub fn default_model() -> ModelId {
    ModelId::from(DEFAULT_MODEL)
}
