//! Compositor configuration.
//!
//! Loaded from TOML; every field has a default so partial files are accepted.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Constraint on the sizes of textures handed to the GPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum TextureSizePolicy {
    /// Every texture dimension is a power of two
    #[default]
    PowerOf2,
    /// Any size, if the context supports non-power-of-two textures
    AnySize,
}

/// Configuration of a [`LayeredTexture`](crate::LayeredTexture).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompositorConfig {
    /// Texture size policy (default: PowerOf2)
    #[serde(default)]
    pub texture_size_policy: TextureSizePolicy,
    /// Largest padded width x height a layer image may be resampled to (default: 32x32)
    #[serde(default = "default_max_texture_copy_size")]
    pub max_texture_copy_size: u32,
    /// Number of seam width doublings per axis (default: [0, 0])
    #[serde(default)]
    pub seam_power: [u32; 2],
    /// Whether the shader path may be used (default: true)
    #[serde(default = "default_true")]
    pub allow_shaders: bool,
    /// Keep shading when lower processes do not fit the texture units (default: false)
    #[serde(default)]
    pub may_skip_early_processes: bool,
    /// Upper bound on the maximum texture size reported by the context
    #[serde(default)]
    pub max_texture_size_override: Option<u32>,
    /// Ratio between texel sizes along both axes of the geometry (default: 1.0)
    #[serde(default = "default_texel_size_ratio")]
    pub external_texel_size_ratio: f32,
}

fn default_true() -> bool {
    true
}
fn default_max_texture_copy_size() -> u32 {
    32 * 32
}
fn default_texel_size_ratio() -> f32 {
    1.0
}

impl Default for CompositorConfig {
    fn default() -> Self {
        Self {
            texture_size_policy: TextureSizePolicy::default(),
            max_texture_copy_size: default_max_texture_copy_size(),
            seam_power: [0, 0],
            allow_shaders: default_true(),
            may_skip_early_processes: false,
            max_texture_size_override: None,
            external_texel_size_ratio: default_texel_size_ratio(),
        }
    }
}

impl CompositorConfig {
    /// Parse a configuration from TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Load a configuration file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is not valid TOML.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Serialize to pretty TOML.
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }
}
