//! wgpu backend: texture capabilities of an adapter and a shader compiler
//! that turns generated WGSL into shader modules on a device.

use std::sync::{Arc, Mutex};

use crate::capabilities::{CapabilityProvider, TextureCapabilities};
use crate::error::ShaderCompileError;
use crate::state::{ProgramHandle, ShaderCompiler, ShaderSource};

impl TextureCapabilities {
    /// Capabilities implied by device limits.
    ///
    /// Each unit needs a sampled texture and a sampler binding.
    pub fn from_wgpu(limits: &wgpu::Limits, downlevel: &wgpu::DownlevelCapabilities) -> Self {
        let nr_units = limits
            .max_sampled_textures_per_shader_stage
            .min(limits.max_samplers_per_shader_stage);

        Self {
            nr_units,
            max_size: limits.max_texture_dimension_2d,
            non_power_of_2_support: downlevel
                .flags
                .contains(wgpu::DownlevelFlags::NON_POWER_OF_TWO_MIPMAPPED_TEXTURES),
            shading_support: nr_units > 0,
        }
    }
}

/// Capabilities of a single wgpu adapter, reported as context 0.
#[derive(Debug, Clone, Copy)]
pub struct WgpuCapabilities {
    caps: TextureCapabilities,
}

impl WgpuCapabilities {
    pub fn new(adapter: &wgpu::Adapter) -> Self {
        Self {
            caps: TextureCapabilities::from_wgpu(&adapter.limits(), &adapter.get_downlevel_capabilities()),
        }
    }
}

impl CapabilityProvider for WgpuCapabilities {
    fn max_context_id(&self) -> u32 {
        0
    }

    fn capabilities(&self, context_id: u32) -> Option<TextureCapabilities> {
        (context_id == 0).then_some(self.caps)
    }
}

/// Vertex and fragment modules of a compiled program.
#[derive(Debug)]
pub struct CompiledProgram {
    pub vertex: wgpu::ShaderModule,
    pub fragment: wgpu::ShaderModule,
}

/// Compiles generated programs on a wgpu device.
///
/// Programs are kept until [`clear`](Self::clear); handles index into them.
#[derive(Debug)]
pub struct WgpuShaderCompiler {
    device: Arc<wgpu::Device>,
    programs: Mutex<Vec<Arc<CompiledProgram>>>,
}

impl WgpuShaderCompiler {
    pub fn new(device: Arc<wgpu::Device>) -> Self {
        Self {
            device,
            programs: Mutex::new(Vec::new()),
        }
    }

    pub fn program(&self, handle: ProgramHandle) -> Option<Arc<CompiledProgram>> {
        let programs = self.programs.lock().ok()?;
        programs.get(handle.0 as usize).cloned()
    }

    /// Drop all compiled programs; earlier handles become invalid.
    pub fn clear(&self) {
        if let Ok(mut programs) = self.programs.lock() {
            programs.clear();
        }
    }

    fn create_module(&self, label: &str, code: &str) -> Result<wgpu::ShaderModule, ShaderCompileError> {
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let module = self.device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(label),
            source: wgpu::ShaderSource::Wgsl(code.into()),
        });

        match pollster::block_on(self.device.pop_error_scope()) {
            Some(err) => Err(ShaderCompileError(format!("{label}: {err}"))),
            None => Ok(module),
        }
    }
}

impl ShaderCompiler for WgpuShaderCompiler {
    fn compile(&self, source: &ShaderSource) -> Result<ProgramHandle, ShaderCompileError> {
        let vertex = self.create_module("Layered Texture Vertex Shader", &source.vertex)?;
        let fragment = self.create_module("Layered Texture Fragment Shader", &source.fragment)?;

        let mut programs = self
            .programs
            .lock()
            .map_err(|_| ShaderCompileError("program table poisoned".to_string()))?;
        programs.push(Arc::new(CompiledProgram { vertex, fragment }));

        tracing::debug!("Compiled layered texture program {}", programs.len() - 1);
        Ok(ProgramHandle(programs.len() as u64 - 1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capabilities_from_default_limits() {
        let limits = wgpu::Limits::default();
        let caps = TextureCapabilities::from_wgpu(&limits, &wgpu::DownlevelCapabilities::default());
        assert_eq!(caps.max_size, limits.max_texture_dimension_2d);
        assert_eq!(
            caps.nr_units,
            limits
                .max_sampled_textures_per_shader_stage
                .min(limits.max_samplers_per_shader_stage)
        );
        assert!(caps.shading_support);
        assert!(caps.non_power_of_2_support);
    }

    #[test]
    fn test_downlevel_without_npot_mipmaps() {
        let downlevel = wgpu::DownlevelCapabilities {
            flags: wgpu::DownlevelFlags::empty(),
            ..Default::default()
        };
        let caps = TextureCapabilities::from_wgpu(&wgpu::Limits::downlevel_webgl2_defaults(), &downlevel);
        assert!(!caps.non_power_of_2_support);
    }
}
