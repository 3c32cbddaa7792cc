//! Software compositing: evaluates the process stack per pixel on the CPU
//! when shaders are unavailable.
//!
//! Pixels are split into contiguous ranges, one rayon task each. When the
//! composite layer has a border color, one extra virtual pixel past the image
//! is evaluated at a point outside every layer; it becomes the border color of
//! the composite and always belongs to the last task.

use std::sync::Arc;

use glam::{Vec2, Vec4};
use strata_shared::{Raster, RasterError};

use crate::layer::DataLayer;
use crate::process::{LayerProcess, ProcessContext};
use crate::registry::LayerRegistry;

/// Alpha below which a composited pixel is written as fully transparent
const MIN_ALPHA: f32 = 0.5 / 255.0;

/// Result of one compositing pass.
#[derive(Debug)]
pub(crate) struct CompositeOutput {
    pub raster: Raster,
    /// Color of the virtual border pixel, if one was requested
    pub border_color: Option<Vec4>,
}

/// Inputs shared read-only by all compositing tasks.
pub(crate) struct CompositeJob<'a> {
    pub layers: &'a LayerRegistry,
    /// Contributing processes, bottom first
    pub processes: Vec<&'a Arc<dyn LayerProcess>>,
    pub min_opacity: f32,
    /// Composite a placeholder instead of the stack
    pub dummy: bool,
    /// Global coordinate of the composite's lower-left corner
    pub origin: Vec2,
    /// Global size of one composite pixel
    pub scale: Vec2,
    pub width: u32,
    pub height: u32,
    /// Evaluate the virtual border pixel
    pub border_pixel: bool,
}

impl CompositeJob<'_> {
    pub fn run(&self) -> Result<CompositeOutput, RasterError> {
        let nr_image_pixels = self.width as usize * self.height as usize;
        let nr_pixels = nr_image_pixels + usize::from(self.border_pixel);
        let nr_tasks = rayon::current_num_threads().clamp(1, nr_pixels.max(1));
        let base = nr_pixels / nr_tasks;
        let remainder = nr_pixels % nr_tasks;

        let stack_undef = self.stack_undef_layer();
        let mut bytes = vec![0u8; nr_image_pixels * 4];
        let mut border_color = None;

        tracing::debug!(
            "Compositing {}x{} pixels with {} processes in {} tasks",
            self.width,
            self.height,
            self.processes.len(),
            nr_tasks
        );

        rayon::scope(|scope| {
            let mut rest: &mut [u8] = &mut bytes;
            let mut border_slot = Some(&mut border_color);
            let mut start = 0;

            for task in 0..nr_tasks {
                let stop = start + base + usize::from(task < remainder);
                let image_stop = stop.min(nr_image_pixels);
                let owned = image_stop.saturating_sub(start);
                let (chunk, tail) = std::mem::take(&mut rest).split_at_mut(owned * 4);
                rest = tail;

                let slot = if stop > nr_image_pixels {
                    border_slot.take()
                } else {
                    None
                };

                scope.spawn(move |_| {
                    for (pixel, out) in (start..image_stop).zip(chunk.chunks_exact_mut(4)) {
                        out.copy_from_slice(&to_bytes(self.composite_pixel(pixel, stack_undef)));
                    }
                    if let Some(slot) = slot {
                        *slot = Some(self.composite_pixel(nr_image_pixels, stack_undef));
                    }
                });

                start = stop;
            }
        });

        let raster = Raster::from_rgba8(self.width, self.height, bytes)?;
        Ok(CompositeOutput {
            raster,
            border_color,
        })
    }

    fn stack_undef_layer(&self) -> Option<&DataLayer> {
        let id = self.layers.stack_undef_layer;
        if !self.layers.is_layer_ok(id) {
            return None;
        }
        id.and_then(|id| self.layers.get(id))
    }

    /// Composite color of pixel `pixel` (row-major, may be the virtual pixel).
    fn composite_pixel(&self, pixel: usize, stack_undef: Option<&DataLayer>) -> Vec4 {
        let width = self.width.max(1) as usize;
        let cell = Vec2::new((pixel % width) as f32 + 0.5, (pixel / width) as f32 + 0.5);
        let global = self.origin + self.scale * cell;
        let ctx = ProcessContext::new(self.layers);

        let mut frag = Vec4::splat(-1.0);
        let udf = match stack_undef {
            Some(layer) if !self.dummy => layer.texture_vec(global)[self.layers.stack_undef_channel],
            _ => 0.0,
        };

        if udf < 1.0 {
            for process in self.processes.iter().rev() {
                process.do_process(&ctx, &mut frag, udf, global);
                if frag.w >= 1.0 {
                    break;
                }
            }

            if self.dummy {
                frag = Vec4::ZERO;
            } else if frag.w < 0.0 {
                frag = Vec4::new(1.0, 1.0, 1.0, self.min_opacity);
            }
        }

        frag = mix_stack_undef(frag, udf, self.layers.stack_undef_color);

        if frag.w < MIN_ALPHA {
            return Vec4::ZERO;
        }
        frag
    }
}

/// Blend a composited color toward the stack undefined color.
pub(crate) fn mix_stack_undef(frag: Vec4, udf: f32, udf_color: Vec4) -> Vec4 {
    if udf >= 1.0 {
        return udf_color;
    }
    if udf <= 0.0 {
        return frag;
    }

    if udf_color.w <= 0.0 {
        return frag.truncate().extend(frag.w * (1.0 - udf));
    }
    if udf_color.w >= 1.0 && frag.w >= 1.0 {
        return frag * (1.0 - udf) + udf_color * udf;
    }
    if frag.w > 0.0 {
        let a = frag.w * (1.0 - udf);
        let b = udf_color.w * udf;
        let rgb = (frag.truncate() * a + udf_color.truncate() * b) / (a + b);
        return rgb.extend(a + b);
    }
    udf_color.truncate().extend(udf_color.w * udf)
}

/// Round a color to RGBA8, clamping each channel.
fn to_bytes(color: Vec4) -> [u8; 4] {
    color
        .to_array()
        .map(|v| (v * 255.0 + 0.5).floor().clamp(0.0, 255.0) as u8)
}
