//! Runtime settings for region coupling.
//!
//! Settings are plain values handed to the assembler, installer and node
//! adapters; nothing here is global. [`CoupleSettings::from_path`] reads TOML
//! or JSON (chosen by extension) and [`CoupleSettings::apply_env_overrides`]
//! honours `COUPLE_MAX_RESOLUTION`, `COUPLE_MASK_RESAMPLE`,
//! `COUPLE_LEFTOVER_POLICY` and `ATTENTION_PRECISION`.

use std::{fs, path::Path};

use attention::masks::MaskResample;
use attention::Config as AttentionConfig;
use serde::Deserialize;

use crate::error::{CoupleError, Result};
use crate::regions::{LeftoverMaskPolicy, MIN_DIMENSION};

/// Largest canvas edge accepted by the node adapters unless configured.
pub const DEFAULT_MAX_RESOLUTION: usize = 16384;

fn default_max_resolution() -> usize {
    DEFAULT_MAX_RESOLUTION
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CoupleSettings {
    /// Upper bound for `width`/`height` node inputs.
    #[serde(default = "default_max_resolution")]
    pub max_resolution: usize,
    /// Interpolation used when resizing region masks per attention layer.
    #[serde(default)]
    pub mask_resample: MaskResample,
    /// Treatment of negative values in the leftover mask of the region list.
    #[serde(default)]
    pub leftover_policy: LeftoverMaskPolicy,
    /// Kernel configuration used for every per-region attention call.
    #[serde(default)]
    pub attention: AttentionConfig,
}

impl Default for CoupleSettings {
    fn default() -> Self {
        Self {
            max_resolution: DEFAULT_MAX_RESOLUTION,
            mask_resample: MaskResample::default(),
            leftover_policy: LeftoverMaskPolicy::default(),
            attention: AttentionConfig::default(),
        }
    }
}

impl CoupleSettings {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let settings: CoupleSettings = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&contents)
                .map_err(|err| CoupleError::Config(err.to_string()))?,
            Some("toml") | None => {
                toml::from_str(&contents).map_err(|err| CoupleError::Config(err.to_string()))?
            }
            Some(other) => {
                return Err(CoupleError::Config(format!(
                    "unsupported configuration extension '{}'",
                    other
                )))
            }
        };
        settings.validate()?;
        Ok(settings)
    }

    /// Defaults with environment overrides applied.
    pub fn from_env() -> Result<Self> {
        let mut settings = Self::default();
        settings.apply_env_overrides()?;
        Ok(settings)
    }

    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(value) = std::env::var("COUPLE_MAX_RESOLUTION") {
            self.max_resolution = value.trim().parse().map_err(|_| {
                CoupleError::Config(format!("COUPLE_MAX_RESOLUTION must be an integer, got '{value}'"))
            })?;
        }
        if let Ok(value) = std::env::var("COUPLE_MASK_RESAMPLE") {
            self.mask_resample = value.parse().map_err(CoupleError::Config)?;
        }
        if let Ok(value) = std::env::var("COUPLE_LEFTOVER_POLICY") {
            self.leftover_policy = value.parse().map_err(CoupleError::Config)?;
        }
        self.attention.apply_env_overrides();
        self.validate()
    }

    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();
        if self.max_resolution < MIN_DIMENSION {
            errors.push(format!(
                "max_resolution must be at least {MIN_DIMENSION}, got {}",
                self.max_resolution
            ));
        }
        if let Some(scale) = self.attention.scale {
            if !(scale.is_finite() && scale > 0.0) {
                errors.push(format!("attention.scale must be positive, got {scale}"));
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(CoupleError::Config(errors.join("; ")))
        }
    }
}
