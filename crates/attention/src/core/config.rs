//! Configuration options shared by all attention implementations.
//!
//! The [`Config`] struct captures run-time knobs that callers can tune without
//! swapping implementations. [`Config::from_env`] honours
//! `ATTENTION_PRECISION=inherit|f32` so precision can be forced from the shell.

use std::str::FromStr;

use serde::Deserialize;

/// Dtype policy for score and softmax computation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrecisionPolicy {
    /// Compute in the dtype of the incoming tensors.
    Inherit,
    /// Promote `f16`/`bf16` inputs to `f32` and cast the result back.
    #[default]
    ForceF32,
}

impl FromStr for PrecisionPolicy {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "inherit" => Ok(Self::Inherit),
            "f32" | "force_f32" | "forcef32" => Ok(Self::ForceF32),
            other => Err(format!("unknown precision policy '{other}'")),
        }
    }
}

/// Configuration driving attention behaviour.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct Config {
    /// Dtype used for the score matmul and softmax.
    #[serde(default)]
    pub precision: PrecisionPolicy,
    /// Overrides the `1 / sqrt(head_dim)` score scale when set.
    #[serde(default)]
    pub scale: Option<f32>,
}

impl Config {
    /// Default configuration with environment overrides applied.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    /// Applies `ATTENTION_PRECISION` when present and parseable.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(value) = std::env::var("ATTENTION_PRECISION") {
            match value.parse() {
                Ok(policy) => self.precision = policy,
                Err(err) => log::warn!("ignoring ATTENTION_PRECISION: {err}"),
            }
        }
    }
}
