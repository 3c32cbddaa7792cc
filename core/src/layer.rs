//! Data layers: one externally supplied raster placed in the global frame.

use std::fmt;
use std::sync::{Arc, OnceLock};

use glam::{Vec2, Vec4};
use serde::{Deserialize, Serialize};
use strata_shared::{
    ChannelSource, Raster, TransparencyType, add_opacity, classify_transparency,
    image_channel_for_texture_channel, power_of_2_ceil, texture_channel_for_image_channel,
};

use crate::error::LayerError;

/// Stable identifier of a data layer.
///
/// ID 0 never names a data layer; it stands for the synthesized color-sequence
/// texture in ordered layer lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LayerId(pub u32);

impl LayerId {
    /// Placeholder for the color-sequence lookup texture
    pub const COLOR_SEQUENCE: LayerId = LayerId(0);

    pub fn is_color_sequence(self) -> bool {
        self == Self::COLOR_SEQUENCE
    }
}

impl fmt::Display for LayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Texture sampling filter of a data layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum FilterType {
    Nearest,
    #[default]
    Linear,
}

/// Sentinel for an unset color (all components negative).
pub const UNSET_COLOR: Vec4 = Vec4::splat(-1.0);

/// How a layer image is prepared when it is set.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ImagePreparation {
    /// Resample non-power-of-two images up to the next power of two
    pub pad_to_power_of_2: bool,
    /// Largest padded width x height that may be resampled
    pub max_copy_size: u32,
}

/// Outcome of setting a layer image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ImageChange {
    /// Size, buffer or raster changed: tiling must be recomputed
    Relayout,
    /// Same raster with unchanged layout: only tile textures are stale
    SameLayout,
    /// Image removed
    Cleared,
    /// Nothing to do
    Unchanged,
}

/// One externally supplied raster with placement, sampling and masking properties.
#[derive(Debug)]
pub struct DataLayer {
    id: LayerId,
    pub(crate) origin: Vec2,
    pub(crate) scale: Vec2,
    /// Working image (possibly resampled to power-of-two size)
    pub(crate) image: Option<Arc<Raster>>,
    /// Image as handed in by the owner
    pub(crate) image_source: Option<Arc<Raster>>,
    image_source_modified: u64,
    pub(crate) image_scale: Vec2,
    pub(crate) image_modified_flag: bool,
    pub(crate) tile_images_dirty: bool,
    pub(crate) freeze_display: bool,
    pub(crate) texture_unit: Option<u32>,
    pub(crate) filter_type: FilterType,
    pub(crate) border_color: Vec4,
    border_color_source: Vec4,
    pub(crate) undef_layer: Option<LayerId>,
    pub(crate) undef_channel: usize,
    pub(crate) undef_color: Vec4,
    undef_color_source: Vec4,
    pub(crate) undef_channel_ref_count: [u32; 4],
    transparency: [OnceLock<TransparencyType>; 4],
}

impl DataLayer {
    pub(crate) fn new(id: LayerId) -> Self {
        Self {
            id,
            origin: Vec2::ZERO,
            scale: Vec2::ONE,
            image: None,
            image_source: None,
            image_source_modified: 0,
            image_scale: Vec2::ONE,
            image_modified_flag: false,
            tile_images_dirty: false,
            freeze_display: false,
            texture_unit: None,
            filter_type: FilterType::Linear,
            border_color: Vec4::ONE,
            border_color_source: Vec4::ONE,
            undef_layer: None,
            undef_channel: 0,
            undef_color: UNSET_COLOR,
            undef_color_source: UNSET_COLOR,
            undef_channel_ref_count: [0; 4],
            transparency: Default::default(),
        }
    }

    pub fn id(&self) -> LayerId {
        self.id
    }

    pub fn origin(&self) -> Vec2 {
        self.origin
    }

    pub fn scale(&self) -> Vec2 {
        self.scale
    }

    /// Image as handed in by the owner
    pub fn image(&self) -> Option<&Arc<Raster>> {
        self.image_source.as_ref()
    }

    /// Image used for sampling and tiling
    pub fn working_image(&self) -> Option<&Arc<Raster>> {
        self.image.as_ref()
    }

    /// Ratio between source and working image size (1.0 unless resampled)
    pub fn image_scale(&self) -> Vec2 {
        self.image_scale
    }

    /// Global size of one working-image pixel
    pub fn effective_scale(&self) -> Vec2 {
        self.scale * self.image_scale
    }

    pub fn texture_unit(&self) -> Option<u32> {
        self.texture_unit
    }

    pub fn filter_type(&self) -> FilterType {
        self.filter_type
    }

    pub fn border_color(&self) -> Vec4 {
        self.border_color
    }

    /// Whether out-of-image samples read the border color instead of the edge pixel
    pub fn has_border_color(&self) -> bool {
        self.border_color.w >= 0.0
    }

    pub fn undef_layer(&self) -> Option<LayerId> {
        self.undef_layer
    }

    pub fn undef_channel(&self) -> usize {
        self.undef_channel
    }

    pub fn image_undef_color(&self) -> Vec4 {
        self.undef_color
    }

    pub fn undef_channel_ref_count(&self, channel: usize) -> u32 {
        self.undef_channel_ref_count.get(channel).copied().unwrap_or(0)
    }

    pub fn is_display_frozen(&self) -> bool {
        self.freeze_display
    }

    /// Whether the last setup pass re-applied a modified image
    pub fn is_image_modified(&self) -> bool {
        self.image_modified_flag
    }

    /// Map a global coordinate into this layer's working-image pixel frame.
    pub fn layer_coord(&self, global: Vec2) -> Vec2 {
        (global - self.origin) / self.effective_scale()
    }

    /// Sample the layer at a global coordinate, honoring filter and border settings.
    ///
    /// Returns the border color when no image is set.
    pub fn texture_vec(&self, global: Vec2) -> Vec4 {
        let Some(image) = self.image.as_deref() else {
            return self.border_color;
        };
        if !image.is_allocated() {
            return self.border_color;
        }

        let mut local = self.layer_coord(global);
        if self.filter_type == FilterType::Linear {
            local -= Vec2::splat(0.5);
        }

        let s = local.x.floor();
        let t = local.y.floor();
        let (si, ti) = (s as i64, t as i64);
        let col00 = self.pixel_or_border(image, si, ti);

        // Zero-extent axes have no neighbors to blend
        if self.filter_type == FilterType::Nearest || !local.is_finite() {
            return col00;
        }

        let s_frac = local.x - s;
        let t_frac = local.y - t;

        if t_frac == 0.0 {
            if s_frac == 0.0 {
                return col00;
            }
            let col10 = self.pixel_or_border(image, si.saturating_add(1), ti);
            return col00 * (1.0 - s_frac) + col10 * s_frac;
        }

        let col01 = self.pixel_or_border(image, si, ti.saturating_add(1));
        let left = col00 * (1.0 - t_frac) + col01 * t_frac;
        if s_frac == 0.0 {
            return left;
        }

        let col11 = self.pixel_or_border(image, si.saturating_add(1), ti.saturating_add(1));
        let col10 = self.pixel_or_border(image, si.saturating_add(1), ti);
        let right = col10 * (1.0 - t_frac) + col11 * t_frac;
        left * (1.0 - s_frac) + right * s_frac
    }

    fn pixel_or_border(&self, image: &Raster, s: i64, t: i64) -> Vec4 {
        let (width, height) = (image.width() as i64, image.height() as i64);
        if (0..width).contains(&s) && (0..height).contains(&t) {
            return image.color_at(s as u32, t as u32);
        }
        if self.has_border_color() {
            return self.border_color;
        }
        image.color_at(s.clamp(0, width - 1) as u32, t.clamp(0, height - 1) as u32)
    }

    /// Transparency of one RGBA channel including the border color.
    ///
    /// The image scan is cached until the image changes.
    pub fn transparency_type(&self, channel: usize) -> TransparencyType {
        let Some(image) = self.image.as_deref() else {
            return TransparencyType::FullyTransparent;
        };
        if channel > 3 {
            return TransparencyType::FullyTransparent;
        }
        let tt = *self.transparency[channel].get_or_init(|| classify_transparency(image, channel));
        add_opacity(tt, self.border_color[channel])
    }

    pub(crate) fn clear_transparency_type(&mut self) {
        self.transparency = Default::default();
    }

    /// Re-derive effective border and undefined colors for the current pixel format.
    pub(crate) fn adapt_colors(&mut self) {
        self.undef_color = self.undef_color_source;
        self.border_color = self.border_color_source;

        let Some(format) = self.image.as_deref().map(Raster::pixel_format) else {
            return;
        };

        for channel in 0..4 {
            match image_channel_for_texture_channel(channel, format) {
                Some(ChannelSource::Zero) => {
                    self.undef_color[channel] = constant_or_unset(self.undef_color[channel], 0.0);
                    self.border_color[channel] = constant_or_unset(self.border_color[channel], 0.0);
                }
                Some(ChannelSource::One) => {
                    self.undef_color[channel] = constant_or_unset(self.undef_color[channel], 1.0);
                    self.border_color[channel] = constant_or_unset(self.border_color[channel], 1.0);
                }
                Some(ChannelSource::Image(ic)) => {
                    if let Some(tc) = texture_channel_for_image_channel(ic, format) {
                        self.undef_color[channel] = self.undef_color_source[tc];
                        self.border_color[channel] = self.border_color_source[tc];
                    }
                }
                None => {}
            }
        }
    }

    pub(crate) fn set_border_color_source(&mut self, color: Option<Vec4>) {
        self.border_color_source = match color {
            Some(col) if col.cmpge(Vec4::ZERO).all() => col.min(Vec4::ONE),
            _ => UNSET_COLOR,
        };
        self.adapt_colors();
    }

    pub(crate) fn set_undef_color_source(&mut self, color: Vec4) {
        self.undef_color_source = Vec4::from_array(
            color
                .to_array()
                .map(|c| if c < 0.0 { -1.0 } else { c.min(1.0) }),
        );
        self.adapt_colors();
    }

    /// Install a new source image, resampling it when preparation asks for it.
    pub(crate) fn set_image(
        &mut self,
        image: Option<Arc<Raster>>,
        freeze_while_empty: bool,
        preparation: ImagePreparation,
    ) -> Result<ImageChange, LayerError> {
        let Some(image) = image else {
            if freeze_while_empty && self.image_source.is_some() {
                self.freeze_display = true;
            }
            if self.image.is_none() {
                return Ok(ImageChange::Unchanged);
            }
            self.image = None;
            self.image_source = None;
            self.border_color_source = UNSET_COLOR;
            self.undef_color_source = UNSET_COLOR;
            self.clear_transparency_type();
            self.adapt_colors();
            return Ok(ImageChange::Cleared);
        };

        self.freeze_display = false;
        if !image.is_allocated() {
            return Err(LayerError::UnallocatedImage);
        }

        let relayout = match (&self.image_source, &self.image) {
            (Some(previous), Some(_)) => {
                !Arc::ptr_eq(previous, &image)
                    || !previous.shares_data_with(&image)
                    || (previous.width(), previous.height()) != (image.width(), image.height())
            }
            _ => true,
        };

        let (width, height) = (image.width(), image.height());
        let s = power_of_2_ceil(width);
        let t = power_of_2_ceil(height);

        let mut scale_image = s > width || t > height;
        if width >= 8 && height >= 8 && s as u64 * t as u64 > preparation.max_copy_size as u64 {
            scale_image = false;
        }

        if scale_image && preparation.pad_to_power_of_2 {
            match image.scaled(s, t) {
                Ok(padded) => {
                    self.image = Some(Arc::new(padded));
                    self.image_scale = Vec2::new(width as f32 / s as f32, height as f32 / t as f32);
                }
                Err(err) => {
                    tracing::warn!("Layer {} keeps its image unresampled: {}", self.id, err);
                    self.image = Some(image.clone());
                    self.image_scale = Vec2::ONE;
                }
            }
        } else {
            self.image = Some(image.clone());
            self.image_scale = Vec2::ONE;
        }

        self.image_source_modified = image.modified_count();
        self.image_source = Some(image);
        self.clear_transparency_type();

        if relayout {
            self.adapt_colors();
            Ok(ImageChange::Relayout)
        } else {
            self.tile_images_dirty = true;
            Ok(ImageChange::SameLayout)
        }
    }

    /// Edit the source image in place. The working image is refreshed on the
    /// next setup pass.
    pub(crate) fn modify_source(&mut self, edit: impl FnOnce(&mut Raster)) -> Result<(), LayerError> {
        let image = self.image_source.as_mut().ok_or(LayerError::UnallocatedImage)?;
        let image = Arc::make_mut(image);
        edit(image);
        image.dirty();
        Ok(())
    }

    /// Whether the source image changed since it was last set.
    pub(crate) fn source_modified(&self) -> bool {
        self.image_source
            .as_ref()
            .is_some_and(|image| image.modified_count() != self.image_source_modified)
    }

    /// Install a freshly composited image. Returns true if its size changed.
    pub(crate) fn set_composite_image(&mut self, image: Arc<Raster>) -> bool {
        let resized = self
            .image
            .as_deref()
            .is_none_or(|previous| (previous.width(), previous.height()) != (image.width(), image.height()));

        self.image_source_modified = image.modified_count();
        self.image = Some(image.clone());
        self.image_source = Some(image);
        self.image_scale = Vec2::ONE;
        self.freeze_display = false;
        self.clear_transparency_type();
        self.adapt_colors();
        if !resized {
            self.tile_images_dirty = true;
        }
        resized
    }

    /// Force the next modification check to re-set the image.
    pub(crate) fn invalidate_resampled_image(&mut self) {
        let resampled = match (&self.image, &self.image_source) {
            (Some(image), Some(source)) => !Arc::ptr_eq(image, source),
            _ => false,
        };
        if resampled {
            self.image_source_modified = u64::MAX;
        }
    }
}

fn constant_or_unset(value: f32, constant: f32) -> f32 {
    if value < 0.0 { -1.0 } else { constant }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_shared::{DataType, PixelFormat};

    fn preparation() -> ImagePreparation {
        ImagePreparation {
            pad_to_power_of_2: true,
            max_copy_size: 32 * 32,
        }
    }

    fn checker(width: u32, height: u32) -> Arc<Raster> {
        let mut bytes = Vec::new();
        for t in 0..height {
            for s in 0..width {
                let v = if (s + t) % 2 == 0 { 255 } else { 0 };
                bytes.extend_from_slice(&[v, v, v, 255]);
            }
        }
        Arc::new(Raster::from_rgba8(width, height, bytes).unwrap())
    }

    #[test]
    fn test_nearest_sample_hits_pixel_center() {
        let mut layer = DataLayer::new(LayerId(1));
        layer.filter_type = FilterType::Nearest;
        layer.origin = Vec2::new(10.0, 20.0);
        layer.scale = Vec2::new(2.0, 2.0);
        layer.set_image(Some(checker(4, 4)), false, preparation()).unwrap();

        let global = layer.origin + Vec2::new(1.5, 0.5) * layer.scale;
        assert_eq!(layer.texture_vec(global), Vec4::new(0.0, 0.0, 0.0, 1.0));
        let global = layer.origin + Vec2::new(0.5, 0.5) * layer.scale;
        assert_eq!(layer.texture_vec(global), Vec4::ONE);
    }

    #[test]
    fn test_linear_sample_interpolates_between_pixels() {
        let mut layer = DataLayer::new(LayerId(1));
        layer.set_image(Some(checker(4, 4)), false, preparation()).unwrap();

        let sample = layer.texture_vec(Vec2::new(1.0, 0.5));
        assert!((sample.x - 0.5).abs() < 1e-6);
        assert_eq!(sample.w, 1.0);
    }

    #[test]
    fn test_zero_width_layer_samples_edge() {
        let mut layer = DataLayer::new(LayerId(1));
        layer.scale = Vec2::new(0.0, 1.0);
        layer.set_image(Some(checker(4, 4)), false, preparation()).unwrap();

        let color = layer.texture_vec(Vec2::new(3.0, 1.5));
        assert_eq!(color.w, 1.0);
    }

    #[test]
    fn test_outside_samples_read_border_or_edge() {
        let mut layer = DataLayer::new(LayerId(1));
        layer.filter_type = FilterType::Nearest;
        layer.set_image(Some(checker(4, 4)), false, preparation()).unwrap();

        layer.set_border_color_source(Some(Vec4::new(0.0, 0.0, 1.0, 1.0)));
        assert_eq!(layer.texture_vec(Vec2::new(-3.0, 1.0)), Vec4::new(0.0, 0.0, 1.0, 1.0));

        layer.set_border_color_source(None);
        assert!(!layer.has_border_color());
        // Clamped to pixel (0, 1) which is black
        assert_eq!(layer.texture_vec(Vec2::new(-3.0, 1.5)), Vec4::new(0.0, 0.0, 0.0, 1.0));
    }

    #[test]
    fn test_small_npot_image_is_resampled() {
        let mut layer = DataLayer::new(LayerId(1));
        let change = layer.set_image(Some(checker(6, 3)), false, preparation()).unwrap();
        assert_eq!(change, ImageChange::Relayout);

        let working = layer.working_image().unwrap();
        assert_eq!((working.width(), working.height()), (8, 4));
        assert_eq!(layer.image_scale(), Vec2::new(0.75, 0.75));
        assert_eq!(layer.image().unwrap().width(), 6);
    }

    #[test]
    fn test_large_npot_image_is_kept() {
        let mut layer = DataLayer::new(LayerId(1));
        layer.set_image(Some(checker(40, 40)), false, preparation()).unwrap();
        assert_eq!(layer.working_image().unwrap().width(), 40);
        assert_eq!(layer.image_scale(), Vec2::ONE);
    }

    #[test]
    fn test_same_raster_reset_keeps_layout() {
        let mut layer = DataLayer::new(LayerId(1));
        let image = checker(4, 4);
        layer.set_image(Some(image.clone()), false, preparation()).unwrap();
        let change = layer.set_image(Some(image), false, preparation()).unwrap();
        assert_eq!(change, ImageChange::SameLayout);
        assert!(layer.tile_images_dirty);
    }

    #[test]
    fn test_unallocated_image_is_rejected() {
        let mut layer = DataLayer::new(LayerId(1));
        let empty = Arc::new(Raster::new(0, 0, 1, PixelFormat::Rgba, DataType::U8));
        assert_eq!(
            layer.set_image(Some(empty), false, preparation()),
            Err(LayerError::UnallocatedImage)
        );
        assert!(layer.image().is_none());
    }

    #[test]
    fn test_clearing_image_resets_colors() {
        let mut layer = DataLayer::new(LayerId(1));
        layer.set_image(Some(checker(4, 4)), true, preparation()).unwrap();
        layer.set_undef_color_source(Vec4::new(0.2, 0.4, 0.6, 1.0));

        assert_eq!(layer.set_image(None, true, preparation()).unwrap(), ImageChange::Cleared);
        assert!(layer.is_display_frozen());
        assert_eq!(layer.image_undef_color(), UNSET_COLOR);
        assert_eq!(layer.border_color(), UNSET_COLOR);
    }

    #[test]
    fn test_colors_follow_pixel_format() {
        let mut layer = DataLayer::new(LayerId(1));
        let image = Raster::from_bytes(2, 2, PixelFormat::Luminance, DataType::U8, vec![9; 4]).unwrap();
        layer.set_image(Some(Arc::new(image)), false, preparation()).unwrap();

        layer.set_border_color_source(Some(Vec4::new(0.3, 0.6, 0.9, 0.5)));
        // Luminance replicates the first source component and has no alpha channel
        assert_eq!(layer.border_color(), Vec4::new(0.3, 0.3, 0.3, 1.0));

        layer.set_undef_color_source(Vec4::new(2.0, -0.5, 0.5, 0.5));
        assert_eq!(layer.image_undef_color(), Vec4::new(1.0, 1.0, 1.0, 1.0));
    }

    #[test]
    fn test_transparency_includes_border() {
        let mut layer = DataLayer::new(LayerId(1));
        layer.set_image(Some(checker(4, 4)), false, preparation()).unwrap();
        assert_eq!(layer.transparency_type(3), TransparencyType::Opaque);

        layer.set_border_color_source(Some(Vec4::new(1.0, 1.0, 1.0, 0.0)));
        assert_eq!(layer.transparency_type(3), TransparencyType::OnlyFullTransparencies);
    }

    #[test]
    fn test_modified_source_is_detected() {
        let mut layer = DataLayer::new(LayerId(1));
        let mut raster = Raster::from_rgba8(2, 2, vec![0; 16]).unwrap();
        layer.set_image(Some(Arc::new(raster.clone())), false, preparation()).unwrap();
        assert!(!layer.source_modified());

        raster.dirty();
        layer.image_source = Some(Arc::new(raster));
        assert!(layer.source_modified());
    }
}
