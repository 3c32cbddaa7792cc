//! Shader assembly: which layers the GPU path needs, which texture unit each
//! gets, and the WGSL that composites them.
//!
//! Bindings used by the generated modules:
//! - group 0, binding 0: `Material` uniform (fragment), `diffuse.a` scales the output alpha
//! - group 0, binding 1: `Transform` uniform (vertex)
//! - group 1, binding `2u` / `2u + 1`: texture and sampler of unit `u`
//!
//! Unit 0 is reserved for the color-sequence texture when a process needs one.

use smallvec::SmallVec;
use strata_shared::{DataType, PixelFormat, Raster, TransparencyType, power_of_2_ceil};

use crate::layer::LayerId;
use crate::process::{
    MIN_SCANNED_SLOTS, ProcessContext, ProcessStack, ShaderContext, WGSL_HELPERS, channel_name,
    vec4_literal,
};
use crate::registry::LayerRegistry;

/// Layers the shader path needs, front to back.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ProcessInfo {
    /// Ordered layer IDs; [`LayerId::COLOR_SEQUENCE`] stands for the lookup texture.
    /// Entries past `nr_used_layers` are skipped ones.
    pub layer_ids: SmallVec<[LayerId; 8]>,
    pub nr_used_layers: usize,
    /// Number of processes folded into the shader, counted from the top
    pub nr_proc: usize,
    pub use_shaders: bool,
    /// True if a fully opaque process ends the folded stack
    pub stack_is_opaque: bool,
}

impl ProcessInfo {
    pub fn used_layers(&self) -> &[LayerId] {
        &self.layer_ids[..self.nr_used_layers]
    }

    pub fn needs_color_sequence(&self) -> bool {
        self.used_layers().contains(&LayerId::COLOR_SEQUENCE)
    }
}

/// Walk the process stack from the top, collecting the layers each process
/// reads until one is opaque or the texture units run out.
pub(crate) fn process_info(
    layers: &LayerRegistry,
    processes: &ProcessStack,
    is_on: bool,
    nr_units: u32,
    may_skip_early_processes: bool,
) -> ProcessInfo {
    let ctx = ProcessContext::new(layers);
    let mut ids: SmallVec<[LayerId; 8]> = SmallVec::new();
    let mut skipped: SmallVec<[LayerId; 8]> = SmallVec::new();
    let mut nr_used: Option<usize> = None;
    let mut info = ProcessInfo {
        use_shaders: true,
        ..Default::default()
    };

    let stack_undef = layers.stack_undef_layer;
    if layers.is_layer_ok(stack_undef) {
        ids.extend(stack_undef);
    } else {
        skipped.extend(stack_undef);
    }

    let processes: Vec<_> = if is_on { processes.iter().rev().collect() } else { Vec::new() };

    for process in processes {
        let transparency = process.transparency_type(&ctx);
        let mut nr_pushed = 0;

        for idx in -1i32.. {
            let mut skip = transparency == TransparencyType::FullyTransparent;

            let id = if idx >= 0 {
                let slot = (idx / 2) as usize;
                let layer_id = process.data_layer_id(slot);
                if !process.is_on(slot) || !layers.is_layer_ok(layer_id) {
                    skip = true;
                }

                if idx % 2 == 1 {
                    let undef = layer_id
                        .and_then(|id| layers.get(id))
                        .and_then(|layer| layer.undef_layer());
                    if !layers.is_layer_ok(undef) {
                        skip = true;
                    }
                    undef
                } else {
                    if idx >= MIN_SCANNED_SLOTS && layer_id.is_none() {
                        break;
                    }
                    layer_id
                }
            } else if process.needs_color_sequence() {
                Some(LayerId::COLOR_SEQUENCE)
            } else {
                None
            };

            let Some(id) = id else {
                continue;
            };

            let listed = ids.contains(&id);
            let skipped_at = skipped.iter().position(|s| *s == id);

            match nr_used {
                None => {
                    if !skip {
                        if let Some(pos) = skipped_at {
                            skipped.remove(pos);
                        }
                        if !listed {
                            ids.push(id);
                            nr_pushed += 1;
                        }
                    } else if !listed && skipped_at.is_none() {
                        skipped.push(id);
                    }
                }
                Some(_) => {
                    if !listed && skipped_at.is_none() {
                        ids.push(id);
                    }
                }
            }
        }

        if nr_used.is_none() {
            // Unit 0 only ever holds the color sequence
            let budget = nr_units.saturating_sub(1) as usize
                + usize::from(ids.contains(&LayerId::COLOR_SEQUENCE));
            if ids.len() > budget {
                nr_used = Some(ids.len() - nr_pushed);
                if info.nr_proc == 0 || !may_skip_early_processes {
                    info.use_shaders = false;
                }
            } else {
                info.nr_proc += 1;
                if transparency == TransparencyType::Opaque {
                    nr_used = Some(ids.len());
                    info.stack_is_opaque = true;
                }
            }
        }
    }

    info.nr_used_layers = nr_used.unwrap_or(ids.len());
    ids.insert_many(info.nr_used_layers, skipped);
    info.layer_ids = ids;
    info
}

/// Hand out texture units in order from unit 1 to the used layers, or
/// unit 0 to the composite layer when shaders are off.
pub(crate) fn assign_texture_units(
    layers: &mut LayerRegistry,
    info: &ProcessInfo,
    nr_units: u32,
    composite: LayerId,
) {
    for layer in layers.iter_mut() {
        layer.texture_unit = None;
    }

    if info.use_shaders {
        let mut unit = 0;
        for id in info.used_layers() {
            if id.is_color_sequence() {
                continue;
            }
            unit += 1;
            if unit >= nr_units {
                tracing::warn!("No texture unit left for layer {}", id);
                break;
            }
            if let Some(layer) = layers.get_mut(*id) {
                layer.texture_unit = Some(unit);
            }
        }
    } else if let Some(layer) = layers.get_mut(composite) {
        layer.texture_unit = Some(0);
    }
}

/// Color-sequence lookup texture: one 256-entry row per process.
pub(crate) fn color_sequence_raster(processes: &ProcessStack) -> Raster {
    let height = power_of_2_ceil((processes.len() as u32).max(1));
    let mut raster = Raster::new(256, height, 1, PixelFormat::Rgba, DataType::U8);
    let row_size = raster.row_size();
    let data = raster.data_mut();

    for (row, process) in processes.iter().enumerate() {
        if let Some(colors) = process.color_sequence() {
            let len = colors.len().min(row_size);
            data[row * row_size..row * row_size + len].copy_from_slice(&colors[..len]);
        }
    }
    raster
}

/// Row coordinate of process `index` in the color-sequence texture
pub(crate) fn color_sequence_coord(index: usize, nr_processes: usize) -> f32 {
    let height = power_of_2_ceil((nr_processes as u32).max(1));
    (index as f32 + 0.5) / height as f32
}

fn tex_coord_fields(out: &mut String, units: &[u32], location_offset: u32) {
    for unit in units {
        out.push_str(&format!(
            "    @location({}) tex_coord{unit}: vec2<f32>,\n",
            unit + location_offset
        ));
    }
}

fn vertex_output_struct(out: &mut String, units: &[u32]) {
    out.push_str("struct VertexOutput {\n");
    out.push_str("    @builtin(position) clip_position: vec4<f32>,\n");
    out.push_str("    @location(0) color: vec4<f32>,\n");
    tex_coord_fields(out, units, 1);
    out.push_str("};\n");
}

/// Vertex stage forwarding one texture coordinate per textured unit.
pub(crate) fn vertex_shader_code(units: &[u32]) -> String {
    let mut code = String::from(
        "struct Transform {\n    model_view_projection: mat4x4<f32>,\n};\n\n\
         @group(0) @binding(1)\nvar<uniform> transform: Transform;\n\n\
         struct VertexInput {\n    @location(0) position: vec3<f32>,\n    @location(1) color: vec4<f32>,\n",
    );
    tex_coord_fields(&mut code, units, 2);
    code.push_str("};\n\n");
    vertex_output_struct(&mut code, units);

    code.push_str(
        "\n@vertex\nfn vs_main(in: VertexInput) -> VertexOutput {\n    var out: VertexOutput;\n    \
         out.clip_position = transform.model_view_projection * vec4<f32>(in.position, 1.0);\n    \
         out.color = in.color;\n",
    );
    for unit in units {
        code.push_str(&format!("    out.tex_coord{unit} = in.tex_coord{unit};\n"));
    }
    code.push_str("    return out;\n}\n");
    code
}

fn indent(code: &str, out: &mut String) {
    for line in code.lines() {
        if !line.is_empty() {
            out.push_str("    ");
        }
        out.push_str(line);
        out.push('\n');
    }
}

/// Inputs of the fragment stage.
pub(crate) struct FragmentShader<'a> {
    pub layers: &'a LayerRegistry,
    pub processes: &'a ProcessStack,
    pub is_on: bool,
    /// Units with texture coordinates (excludes the color-sequence unit)
    pub units: &'a [u32],
    pub color_sequence: bool,
    pub nr_proc: usize,
    pub stack_is_opaque: bool,
}

impl FragmentShader<'_> {
    /// Stages of the folded processes, top first, each blending under `frag`.
    fn stages(&self) -> String {
        let ctx = ProcessContext::new(self.layers);
        let nr_processes = self.processes.len();
        let mut code = String::new();
        let mut stage = 0;
        let mut min_opacity = 1.0f32;

        let folded = self.processes.iter().enumerate().rev().take(if self.is_on { self.nr_proc } else { 0 });
        for (index, process) in folded {
            min_opacity = min_opacity.min(process.opacity());
            if process.transparency_type(&ctx) == TransparencyType::FullyTransparent {
                continue;
            }

            let shader_ctx = ShaderContext::new(self.layers, color_sequence_coord(index, nr_processes));
            let mut stage_code = String::new();
            process.shader_code(&shader_ctx, &mut stage_code, stage);

            if stage > 0 {
                code.push_str("\n    if frag.a < 1.0 {\n");
                indent(&stage_code, &mut code);
                code.push_str("    }\n");
            } else {
                code.push_str(&stage_code);
            }
            stage += 1;
        }

        code.push_str(&format!(
            "\n    if frag.a < 0.0 {{\n        frag = vec4<f32>(1.0, 1.0, 1.0, {min_opacity:.6});\n    }}\n"
        ));
        code
    }

    pub fn code(&self) -> String {
        let mut code = String::from(WGSL_HELPERS);
        code.push_str("\nstruct Material {\n    diffuse: vec4<f32>,\n};\n\n@group(0) @binding(0)\nvar<uniform> material: Material;\n\n");

        let mut bound: SmallVec<[u32; 8]> = SmallVec::from_slice(self.units);
        if self.color_sequence {
            bound.push(0);
        }
        for unit in &bound {
            code.push_str(&format!(
                "@group(1) @binding({}) var texture{unit}: texture_2d<f32>;\n@group(1) @binding({}) var sampler{unit}: sampler;\n",
                2 * unit,
                2 * unit + 1
            ));
        }
        code.push('\n');
        vertex_output_struct(&mut code, self.units);

        code.push_str("\n@fragment\nfn fs_main(in: VertexOutput) -> @location(0) vec4<f32> {\n");
        for unit in self.units {
            code.push_str(&format!(
                "    let texel{unit} = textureSample(texture{unit}, sampler{unit}, in.tex_coord{unit});\n"
            ));
        }
        code.push_str("\n    if material.diffuse.a <= 0.0 {\n        discard;\n    }\n\n    var frag = vec4<f32>(-1.0);\n");

        let stack_undef = self
            .layers
            .stack_undef_layer
            .filter(|id| self.layers.is_layer_ok(Some(*id)))
            .and_then(|id| self.layers.get(id))
            .and_then(|layer| layer.texture_unit());

        let stages = self.stages();
        match stack_undef {
            Some(unit) => {
                let color = self.layers.stack_undef_color;
                code.push_str(&format!(
                    "    let udf = texel{unit}.{};\n    let udfcol = {};\n\n    if udf < 1.0 {{\n",
                    channel_name(self.layers.stack_undef_channel),
                    vec4_literal(color)
                ));
                indent(&stages, &mut code);
                code.push_str("    }\n\n    if udf >= 1.0 {\n        frag = udfcol;\n    } else if udf > 0.0 {\n");

                if color.w <= 0.0 {
                    code.push_str("        frag.a *= 1.0 - udf;\n");
                } else if color.w >= 1.0 && self.stack_is_opaque {
                    code.push_str("        frag = mix(frag, udfcol, vec4<f32>(udf));\n");
                } else {
                    code.push_str(
                        "        if frag.a > 0.0 {\n            \
                         let a = frag.a * (1.0 - udf);\n            \
                         let b = udfcol.a * udf;\n            \
                         frag = vec4<f32>((frag.rgb * a + udfcol.rgb * b) / (a + b), a + b);\n        \
                         } else {\n            \
                         frag = vec4<f32>(udfcol.rgb, udf * udfcol.a);\n        \
                         }\n",
                    );
                }
                code.push_str("    }\n");
            }
            None => code.push_str(&stages),
        }

        code.push_str(
            "\n    frag.a *= material.diffuse.a;\n    return vec4<f32>(frag.rgb * in.color.rgb, frag.a);\n}\n",
        );
        code
    }
}

#[cfg(test)]
mod tests;
