use crate::layer::LayerId;

/// Error type for rejected layer operations.
///
/// A rejected operation leaves the compositor unchanged.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum LayerError {
    #[error("Unknown data layer: {0}")]
    UnknownLayer(LayerId),

    #[error("Data layer {0} is reserved and cannot be removed")]
    ReservedLayer(LayerId),

    #[error("Invalid layer scale ({x}, {y}): x must be >= 0 and y > 0")]
    InvalidScale { x: f32, y: f32 },

    #[error("Invalid channel index: {0} (must be 0-3)")]
    InvalidChannel(usize),

    #[error("Data layer image cannot be set before allocation")]
    UnallocatedImage,

    #[error("Data layer {id} is still used as undefined mask on channel {channel} ({count} references)")]
    StillReferenced { id: LayerId, channel: usize, count: u32 },
}

/// Error type for configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read configuration: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// Error returned by a [`ShaderCompiler`](crate::state::ShaderCompiler).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Shader compilation failed: {0}")]
pub struct ShaderCompileError(pub String);
