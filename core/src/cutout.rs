//! Cut-outs: the per-layer tile textures and texture coordinates that cover
//! one rectangle of the tiling plan.

use std::sync::Arc;

use glam::{IVec2, Vec2, Vec4};
use strata_shared::{Raster, RasterView, power_of_2_ceil};

use crate::config::TextureSizePolicy;
use crate::layer::{FilterType, LayerId};
use crate::registry::LayerRegistry;
use crate::tiling::{EPS, SeamParams, TilingInfo};

/// Texture wrap mode along one axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WrapMode {
    ClampToEdge,
    ClampToBorder,
}

/// Minification filter of a tile texture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MinFilter {
    NearestMipmapNearest,
    LinearMipmapLinear,
}

/// Pixels of one tile texture.
#[derive(Debug, Clone)]
pub enum TileImage {
    /// Window into the layer's working image
    View(RasterView),
    /// Copied region, handed to a backend that resamples it
    Copy(Arc<Raster>),
}

impl TileImage {
    pub fn width(&self) -> u32 {
        match self {
            TileImage::View(view) => view.width(),
            TileImage::Copy(raster) => raster.width(),
        }
    }

    pub fn height(&self) -> u32 {
        match self {
            TileImage::View(view) => view.height(),
            TileImage::Copy(raster) => raster.height(),
        }
    }
}

/// Texture bound to one unit for a cut-out.
#[derive(Debug, Clone)]
pub struct TileTexture {
    pub layer: LayerId,
    pub unit: u32,
    pub image: TileImage,
    /// Tile origin in working-image pixels
    pub origin: IVec2,
    /// Tile extent in working-image pixels
    pub size: IVec2,
    /// Wrap mode along s and t
    pub wrap: [WrapMode; 2],
    pub mag_filter: FilterType,
    pub min_filter: MinFilter,
    pub border_color: Vec4,
    /// The tile is not power-of-two sized and must be resampled by the backend
    pub resize_hint: bool,
}

/// Texture coordinates of the cut-out corners for one unit.
///
/// `tc00` is the origin corner, `tc11` the opposite corner, `tc01` and `tc10`
/// the mixed ones.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TextureCoordData {
    pub unit: u32,
    pub tc00: Vec2,
    pub tc01: Vec2,
    pub tc10: Vec2,
    pub tc11: Vec2,
}

/// Tile textures and corner coordinates of a cut-out, last-added layer last.
#[derive(Debug, Clone, Default)]
pub struct CutoutState {
    pub textures: Vec<TileTexture>,
    pub tex_coords: Vec<TextureCoordData>,
}

impl CutoutState {
    pub fn texture(&self, unit: u32) -> Option<&TileTexture> {
        self.textures.iter().find(|texture| texture.unit == unit)
    }

    pub fn tex_coords(&self, unit: u32) -> Option<&TextureCoordData> {
        self.tex_coords.iter().find(|tc| tc.unit == unit)
    }
}

/// Everything the cut-out builder reads.
pub(crate) struct CutoutRequest<'a> {
    pub layers: &'a LayerRegistry,
    pub tiling: &'a TilingInfo,
    pub seam: &'a SeamParams,
    /// Configured policy, for reporting
    pub policy: TextureSizePolicy,
    /// Policy after capability degradation
    pub used_policy: TextureSizePolicy,
}

#[derive(Debug, Clone, Copy, Default)]
struct AxisTile {
    origin: i32,
    size: i32,
    border_area: bool,
}

impl CutoutRequest<'_> {
    /// Build the tiles covering `[origin, opposite]`, given in tiling-plan pixels.
    pub fn build(&self, origin: Vec2, opposite: Vec2) -> CutoutState {
        let scale = self.tiling.smallest_scale;
        let global_origin = scale * (origin + Vec2::splat(0.5)) + self.tiling.envelope_origin;
        let global_opposite = scale * (opposite + Vec2::splat(0.5)) + self.tiling.envelope_origin;

        let mut state = CutoutState::default();
        let mut overflow_reported = false;
        let mut resize_reported = false;

        for layer in self.layers.layers().iter().rev() {
            let Some(unit) = layer.texture_unit() else {
                continue;
            };
            let Some(image) = layer.working_image() else {
                continue;
            };
            if !image.is_allocated() {
                continue;
            }

            let local_origin = layer.layer_coord(global_origin);
            let local_opposite = layer.layer_coord(global_opposite);
            let image_size = IVec2::new(image.width() as i32, image.height() as i32);

            let mut resize_hint = false;
            let mut axes = [AxisTile::default(); 2];
            for (axis, tile) in axes.iter_mut().enumerate() {
                *tile = self.axis_tile(
                    local_origin[axis],
                    local_opposite[axis],
                    image_size[axis],
                    self.tiling.seam_width(layer, axis, self.seam) as i32,
                    &mut overflow_reported,
                    &mut resize_hint,
                );
            }

            if resize_hint && !resize_reported {
                resize_reported = true;
                if self.policy != TextureSizePolicy::AnySize {
                    tracing::warn!(
                        "Cut-out of layer {} needs resampling; increase the maximum texture size",
                        layer.id()
                    );
                }
            }

            let tile_origin = IVec2::new(axes[0].origin, axes[1].origin);
            let tile_size = IVec2::new(axes[0].size, axes[1].size);

            let image = if resize_hint {
                let (copy, truncated) =
                    image.copy_region(tile_origin.x, tile_origin.y, tile_size.x as u32, tile_size.y as u32);
                if truncated {
                    tracing::warn!("Tile copy of layer {} was truncated at the image bounds", layer.id());
                }
                TileImage::Copy(Arc::new(copy))
            } else {
                TileImage::View(RasterView::new(
                    image.clone(),
                    tile_origin.x as u32,
                    tile_origin.y as u32,
                    tile_size.x as u32,
                    tile_size.y as u32,
                ))
            };

            let wrap = axes.map(|axis| {
                if layer.has_border_color() && axis.border_area {
                    WrapMode::ClampToBorder
                } else {
                    WrapMode::ClampToEdge
                }
            });

            let min_filter = match layer.filter_type() {
                FilterType::Nearest => MinFilter::NearestMipmapNearest,
                FilterType::Linear => MinFilter::LinearMipmapLinear,
            };

            state.textures.push(TileTexture {
                layer: layer.id(),
                unit,
                image,
                origin: tile_origin,
                size: tile_size,
                wrap,
                mag_filter: layer.filter_type(),
                min_filter,
                border_color: layer.border_color(),
                resize_hint,
            });

            let tile_origin = tile_origin.as_vec2();
            let tile_size = tile_size.as_vec2();
            let tc00 = (local_origin - tile_origin) / tile_size;
            let tc11 = (local_opposite - tile_origin) / tile_size;
            state.tex_coords.push(TextureCoordData {
                unit,
                tc00,
                tc01: Vec2::new(tc11.x, tc00.y),
                tc10: Vec2::new(tc00.x, tc11.y),
                tc11,
            });
        }

        state
    }

    /// Tile extent along one axis for the local range `[lo, hi]`.
    fn axis_tile(
        &self,
        lo: f32,
        hi: f32,
        image_size: i32,
        org_seam: i32,
        overflow_reported: &mut bool,
        resize_hint: &mut bool,
    ) -> AxisTile {
        let mut tile = AxisTile {
            origin: 0,
            size: 1,
            border_area: lo < -EPS || hi > image_size as f32 + EPS,
        };

        if hi < EPS || lo > image_size as f32 - EPS {
            tile.origin = if hi < EPS { 0 } else { image_size - 1 };
            return tile;
        }

        let max_size = self.seam.max_texture_size as i32;
        let mut width = org_seam;

        loop {
            let seam = if width > 0 { width } else { org_seam };

            tile.origin = (lo - 0.5).floor() as i32 - seam / 2;
            if tile.origin <= 0 {
                tile.origin = 0;
            } else {
                tile.origin -= tile.origin % seam;
            }

            let mut opposite = (hi + 0.5).ceil() as i32 + (3 * seam) / 2 - 1;
            opposite -= opposite % seam;
            opposite = opposite.min(image_size);
            tile.size = opposite - tile.origin;

            if tile.size > max_size {
                if seam > 1 && width > 0 {
                    width /= 2;
                    continue;
                }
                if !*overflow_reported {
                    *overflow_reported = true;
                    tracing::warn!("Cut-out exceeds the maximum texture size {}", max_size);
                }
                tile.size = max_size;
                tile.border_area = true;
                return tile;
            }

            if seam == org_seam && self.used_policy == TextureSizePolicy::AnySize {
                return tile;
            }

            let pow2 = power_of_2_ceil(tile.size.max(1) as u32) as i32;
            if pow2 > image_size {
                if org_seam > 1 && width > 0 {
                    width /= 2;
                    continue;
                }
                *resize_hint = true;
                return tile;
            }

            let extra = (pow2 - tile.size) / 2;
            tile.origin -= seam * (extra / seam);
            tile.size = pow2;
            if tile.origin < 0 {
                tile.origin = 0;
            }
            if tile.origin + tile.size > image_size {
                tile.origin = image_size - tile.size;
            }
            return tile;
        }
    }
}
