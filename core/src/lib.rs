//! Strata Core - multi-layer texture compositor
//!
//! Composites any number of placed 2D data layers through an ordered stack of
//! layer processes, either per fragment in a generated WGSL shader or on the
//! CPU into a flat composite texture when shading is unavailable.
//!
//! # Architecture
//!
//! - [`LayeredTexture`] - Data layers, process stack and lazily rebuilt render state
//! - [`LayerProcess`] - Pluggable compositing stage (shader code + per-pixel routine)
//! - [`TilingInfo`] / [`TilingPlan`] - Envelope of all layers and its division into bricks
//! - [`CutoutState`] - Per-tile textures and texture coordinates for one brick
//! - [`SetupState`] - Shader program, samplers and blending shared by all tiles

pub mod capabilities;
mod composite;
pub mod config;
pub mod cutout;
pub mod error;
#[cfg(feature = "wgpu")]
pub mod gpu;
pub mod layer;
pub mod layered_texture;
pub mod process;
pub mod registry;
pub mod shader;
pub mod state;
pub mod tiling;

pub use capabilities::{CapabilityProvider, StaticCapabilities, TextureCapabilities};
pub use config::{CompositorConfig, TextureSizePolicy};
pub use cutout::{CutoutState, MinFilter, TextureCoordData, TileImage, TileTexture, WrapMode};
pub use error::{ConfigError, LayerError, ShaderCompileError};
#[cfg(feature = "wgpu")]
pub use gpu::{CompiledProgram, WgpuCapabilities, WgpuShaderCompiler};
pub use layer::{DataLayer, FilterType, LayerId, UNSET_COLOR};
pub use layered_texture::LayeredTexture;
pub use process::{
    COLOR_SEQUENCE_LEN, ColorMapProcess, IdentityProcess, LayerProcess, ProcessContext,
    ProcessStack, ShaderContext, apply_undef, blend_under,
};
pub use registry::{LayerRegistry, START_RECYCLING_ID};
pub use shader::ProcessInfo;
pub use state::{
    BlendMode, ProgramHandle, RenderBin, SamplerBinding, SetupState, ShaderCompiler, ShaderSource,
};
pub use tiling::{TilingInfo, TilingPlan};

// Re-export the raster model for convenience
pub use strata_shared::{
    DataType, PixelFormat, Raster, RasterError, RasterView, TransparencyType, power_of_2_ceil,
};
