//! Global envelope of all layers and the tile planning derived from it.

use glam::{IVec2, Vec2};
use strata_shared::power_of_2_ceil;

use crate::config::TextureSizePolicy;
use crate::layer::{DataLayer, LayerId};
use crate::registry::LayerRegistry;

/// Slack used when comparing tick marks against axis lengths.
pub(crate) const EPS: f32 = 1e-5;

/// Envelope of all layers with an image, excluding the composite layer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TilingInfo {
    pub envelope_origin: Vec2,
    pub envelope_size: Vec2,
    /// Finest effective pixel size over all layers
    pub smallest_scale: Vec2,
    /// Largest tile extent in smallest-scale pixels
    pub max_tile_size: Vec2,
}

impl Default for TilingInfo {
    fn default() -> Self {
        Self {
            envelope_origin: Vec2::ZERO,
            envelope_size: Vec2::ZERO,
            smallest_scale: Vec2::ONE,
            max_tile_size: Vec2::ZERO,
        }
    }
}

/// Parameters that determine seam widths.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SeamParams {
    pub max_texture_size: u32,
    pub seam_power: [u32; 2],
    pub external_texel_size_ratio: f32,
}

/// Tick marks dividing the envelope into tiles, in smallest-scale pixels.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TilingPlan {
    pub x_tick_marks: Vec<f32>,
    pub y_tick_marks: Vec<f32>,
    /// Brick size actually used per axis
    pub tile_size: IVec2,
    /// True if the requested brick size could be used unchanged on both axes
    pub is_exact: bool,
}

impl TilingInfo {
    /// Recompute the envelope from scratch.
    pub fn compute(layers: &LayerRegistry, composite: LayerId) -> Self {
        let mut info = Self::default();

        let mut min_bound = Vec2::ZERO;
        let mut max_bound = Vec2::ZERO;
        let mut min_scale = Vec2::splat(f32::INFINITY);
        let mut min_npot_size = Vec2::ZERO;
        let mut valid_layer_found = false;

        for layer in layers.iter() {
            let Some(image) = layer.working_image() else {
                continue;
            };
            if layer.id() == composite {
                continue;
            }

            let scale = layer.effective_scale();
            let image_size = Vec2::new(image.width() as f32, image.height() as f32);
            let layer_size = image_size * scale;
            let bound = layer_size + layer.origin();

            if !valid_layer_found {
                min_bound = layer.origin();
                max_bound = bound;
            } else {
                min_bound = min_bound.min(layer.origin());
                max_bound = max_bound.max(bound);
            }

            // Zero-extent axes do not define the grid
            for axis in 0..2 {
                if scale[axis] > 0.0 && scale[axis] < min_scale[axis] {
                    min_scale[axis] = scale[axis];
                }
            }

            let npot = [
                image.width() != power_of_2_ceil(image.width()),
                image.height() != power_of_2_ceil(image.height()),
            ];
            for axis in 0..2 {
                if npot[axis]
                    && layer_size[axis] > 0.0
                    && (min_npot_size[axis] <= 0.0 || layer_size[axis] < min_npot_size[axis])
                {
                    min_npot_size[axis] = layer_size[axis];
                }
            }

            valid_layer_found = true;
        }

        if !valid_layer_found || !min_scale.is_finite() {
            return info;
        }

        info.envelope_size = max_bound - min_bound;
        info.envelope_origin = min_bound;
        info.smallest_scale = min_scale;

        for axis in 0..2 {
            info.max_tile_size[axis] = (info.envelope_size[axis] / min_scale[axis]).ceil();
            if min_npot_size[axis] > 0.0 {
                info.max_tile_size[axis] = min_npot_size[axis] / min_scale[axis];
            }
        }

        info
    }

    pub fn is_envelope_defined(&self) -> bool {
        self.envelope_size.x > 0.0 && self.envelope_size.y > 0.0
    }

    /// Envelope size minus one smallest-scale pixel
    pub fn texture_envelope_size(&self) -> Vec2 {
        self.envelope_size - self.smallest_scale
    }

    pub fn envelope_center(&self) -> Vec2 {
        self.envelope_origin + self.texture_envelope_size() * 0.5
    }

    /// Tiling-plan pixels per global unit
    pub fn plan_resolution(&self) -> Vec2 {
        Vec2::ONE / self.smallest_scale
    }

    /// Seam width (in layer pixels) for `layer` along `axis`.
    pub(crate) fn seam_width(&self, layer: &DataLayer, axis: usize, params: &SeamParams) -> u32 {
        if axis > 1 {
            return 1;
        }

        let mut ratio = 1.0;
        if params.external_texel_size_ratio != 0.0 {
            ratio = params.external_texel_size_ratio.abs();
        }
        if axis == 1 {
            ratio = 1.0 / ratio;
        }
        ratio *= self.smallest_scale[axis] / layer.scale()[1 - axis];

        let quarter = params.max_texture_size / 4;
        let rounded = (ratio + 0.5).floor();
        let mut seam = if rounded >= quarter as f32 {
            quarter as i64
        } else {
            rounded as i64
        };
        if seam < 1 {
            seam = 1;
        }

        let mut seam = power_of_2_ceil(seam as u32);
        let mut power = params.seam_power[axis];
        while power > 0 && seam < quarter {
            seam *= 2;
            power -= 1;
        }
        seam
    }

    /// Upper bound on the overlap between adjacent tiles, in smallest-scale pixels.
    pub(crate) fn tile_overlap_upper_bound(
        &self,
        layers: &LayerRegistry,
        composite: LayerId,
        axis: usize,
        params: &SeamParams,
    ) -> u32 {
        let mut max_scaled_width = 1.0f32;
        for layer in layers.iter() {
            if layer.working_image().is_none() || layer.id() == composite {
                continue;
            }
            let scaled_width = layer.scale()[axis] * self.seam_width(layer, axis, params) as f32;
            max_scaled_width = max_scaled_width.max(scaled_width);
        }

        3 * (max_scaled_width / self.smallest_scale[axis]).ceil() as u32
    }

    /// Divide the envelope into tiles of roughly `brick_size` pixels.
    ///
    /// Unless `strict` is set (or any texture size is allowed), the brick is
    /// widened to a power of two that leaves room for the seam overlap and is
    /// bounded by the maximum tile size.
    pub(crate) fn plan_tiling(
        &self,
        brick_size: u16,
        strict: bool,
        policy: TextureSizePolicy,
        layers: &LayerRegistry,
        composite: LayerId,
        params: &SeamParams,
    ) -> TilingPlan {
        let brick = brick_size as i32;
        let mut actual = IVec2::splat(brick);

        if !strict && policy != TextureSizePolicy::AnySize {
            for axis in 0..2 {
                let overlap = self.tile_overlap_upper_bound(layers, composite, axis, params) as i32;
                let size = &mut actual[axis];

                *size = power_of_2_ceil((brick + overlap).max(0) as u32) as i32;
                if (brick as f32) < 0.75 * *size as f32 - overlap as f32 && brick < *size - 2 * overlap {
                    *size /= 2;
                }

                let max_tile = self.max_tile_size[axis];
                let mut reduced = false;
                while *size as f32 > max_tile && max_tile > 0.0 {
                    *size /= 2;
                    reduced = true;
                }

                if reduced && overlap as f32 > 0.75 * *size as f32 {
                    *size /= 4;
                    if *size > brick {
                        *size = brick;
                    }
                } else {
                    *size -= overlap;
                }
            }
        }

        let mut plan = TilingPlan {
            tile_size: actual,
            ..Default::default()
        };

        let total = self.envelope_size / self.smallest_scale;
        let max_size = params.max_texture_size as i32;
        let x_exact = divide_axis(total.x, actual.x, max_size, &mut plan.x_tick_marks);
        let y_exact = divide_axis(total.y, actual.y, max_size, &mut plan.y_tick_marks);
        plan.is_exact = x_exact && y_exact && actual == IVec2::splat(brick);
        plan
    }
}

/// Emit tick marks `0, step, 2*step, .. , total-1` along one axis.
///
/// Returns true when the step equals the requested brick size.
pub(crate) fn divide_axis(total: f32, brick: i32, max_size: i32, ticks: &mut Vec<f32>) -> bool {
    ticks.push(0.0);

    if total <= 1.0 || !total.is_finite() {
        ticks.push(1.0);
        return false;
    }

    let step = if brick < max_size { brick.max(1) } else { max_size.max(1) };
    let last = f64::from(total) - 1.0;

    for i in 1u64.. {
        let f = i as f64 * f64::from(step);
        if f + f64::from(EPS) >= last {
            break;
        }
        ticks.push(f as f32);
    }
    ticks.push(total - 1.0);

    step == brick
}
