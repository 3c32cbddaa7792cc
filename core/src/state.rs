//! Render setup handed to the renderer: shader program, sampler bindings,
//! blending and render bin.

use std::sync::Arc;

use strata_shared::Raster;

use crate::error::ShaderCompileError;

/// WGSL sources of a generated program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShaderSource {
    pub vertex: String,
    pub fragment: String,
}

/// Opaque handle of a compiled program, issued by a [`ShaderCompiler`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProgramHandle(pub u64);

/// Service turning generated WGSL into a program.
pub trait ShaderCompiler: Send + Sync {
    fn compile(&self, source: &ShaderSource) -> Result<ProgramHandle, ShaderCompileError>;
}

/// Draw order bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum RenderBin {
    #[default]
    Opaque,
    /// Drawn after opaque geometry, back to front
    Transparent,
}

/// Framebuffer blending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlendMode {
    /// `src * src.a + dst * (1 - src.a)`
    SrcAlphaOneMinusSrcAlpha,
}

/// Texture bound under a sampler name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SamplerBinding {
    pub name: String,
    pub unit: u32,
}

/// Everything the renderer needs besides the per-tile textures.
#[derive(Debug, Clone, Default)]
pub struct SetupState {
    pub shader: Option<ShaderSource>,
    pub program: Option<ProgramHandle>,
    pub samplers: Vec<SamplerBinding>,
    /// Bound to unit 0, nearest filtering
    pub color_sequence: Option<Arc<Raster>>,
    pub blend: Option<BlendMode>,
    pub render_bin: RenderBin,
}

impl SetupState {
    pub fn clear(&mut self) {
        *self = Self::default();
    }

    /// Pick the render bin and blending for an opaque or translucent stack
    pub(crate) fn set_rendering_hint(&mut self, stack_is_opaque: bool) {
        if stack_is_opaque {
            self.render_bin = RenderBin::Opaque;
        } else {
            self.blend = Some(BlendMode::SrcAlphaOneMinusSrcAlpha);
            self.render_bin = RenderBin::Transparent;
        }
    }

    pub fn uses_shaders(&self) -> bool {
        self.shader.is_some()
    }
}
