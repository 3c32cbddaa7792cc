//! Raster buffers.
//!
//! A [`Raster`] is a 2D (optionally layered) pixel buffer with a pixel format and a
//! component data type. Pixel storage is reference counted, so cloning a raster is
//! cheap and only copies on the first write.

use std::sync::Arc;

use glam::Vec4;
use image::imageops::{self, FilterType};
use image::{ImageBuffer, Luma, LumaA, Pixel, Rgb, Rgba};
use serde::{Deserialize, Serialize};

use crate::color::{ChannelSource, image_channel_for_texture_channel};

/// Pixel layout of a raster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PixelFormat {
    Rgba,
    Rgb,
    Luminance,
    LuminanceAlpha,
    Alpha,
    Intensity,
    Red,
    Green,
    Blue,
    Depth,
    Bgr,
    Bgra,
}

impl PixelFormat {
    /// Number of components stored per pixel
    pub const fn components(self) -> usize {
        match self {
            PixelFormat::Rgba | PixelFormat::Bgra => 4,
            PixelFormat::Rgb | PixelFormat::Bgr => 3,
            PixelFormat::LuminanceAlpha => 2,
            PixelFormat::Luminance
            | PixelFormat::Alpha
            | PixelFormat::Intensity
            | PixelFormat::Red
            | PixelFormat::Green
            | PixelFormat::Blue
            | PixelFormat::Depth => 1,
        }
    }
}

/// Storage type of a single pixel component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum DataType {
    /// Unsigned normalized byte (0-255 maps to 0.0-1.0)
    #[default]
    U8,
    /// 32-bit float, used as-is
    F32,
}

impl DataType {
    /// Size of one component in bytes
    pub const fn size_bytes(self) -> usize {
        match self {
            DataType::U8 => 1,
            DataType::F32 => 4,
        }
    }
}

/// Error type for raster construction and resampling.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RasterError {
    #[error("Raster has no pixels: {width}x{height}x{depth}")]
    ZeroSize { width: u32, height: u32, depth: u32 },

    #[error("Raster data length mismatch: expected {expected} bytes, got {actual}")]
    DataLength { expected: usize, actual: usize },

    #[error("Resampling of layered rasters is not supported (depth {0})")]
    LayeredResample(u32),
}

/// Pixel buffer with format, data type and a modification counter.
#[derive(Debug, Clone, PartialEq)]
pub struct Raster {
    width: u32,
    height: u32,
    depth: u32,
    format: PixelFormat,
    data_type: DataType,
    data: Arc<Vec<u8>>,
    modified_count: u64,
}

impl Raster {
    /// Allocate a zero-filled raster.
    pub fn new(width: u32, height: u32, depth: u32, format: PixelFormat, data_type: DataType) -> Self {
        let len = Self::byte_len(width, height, depth, format, data_type);
        Self {
            width,
            height,
            depth,
            format,
            data_type,
            data: Arc::new(vec![0; len]),
            modified_count: 0,
        }
    }

    /// Wrap existing pixel bytes (single slice, tightly packed rows).
    pub fn from_bytes(
        width: u32,
        height: u32,
        format: PixelFormat,
        data_type: DataType,
        bytes: Vec<u8>,
    ) -> Result<Self, RasterError> {
        if width == 0 || height == 0 {
            return Err(RasterError::ZeroSize { width, height, depth: 1 });
        }

        let expected = Self::byte_len(width, height, 1, format, data_type);
        if bytes.len() != expected {
            return Err(RasterError::DataLength {
                expected,
                actual: bytes.len(),
            });
        }

        Ok(Self {
            width,
            height,
            depth: 1,
            format,
            data_type,
            data: Arc::new(bytes),
            modified_count: 0,
        })
    }

    /// Convenience constructor for RGBA8 pixel data.
    pub fn from_rgba8(width: u32, height: u32, bytes: Vec<u8>) -> Result<Self, RasterError> {
        Self::from_bytes(width, height, PixelFormat::Rgba, DataType::U8, bytes)
    }

    /// Build a float raster from component values.
    pub fn from_f32(
        width: u32,
        height: u32,
        format: PixelFormat,
        values: &[f32],
    ) -> Result<Self, RasterError> {
        let bytes: &[u8] = bytemuck::cast_slice(values);
        Self::from_bytes(width, height, format, DataType::F32, bytes.to_vec())
    }

    fn byte_len(width: u32, height: u32, depth: u32, format: PixelFormat, data_type: DataType) -> usize {
        width as usize
            * height as usize
            * depth as usize
            * format.components()
            * data_type.size_bytes()
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }

    pub fn pixel_format(&self) -> PixelFormat {
        self.format
    }

    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    /// True if the raster has pixels in every dimension.
    pub fn is_allocated(&self) -> bool {
        self.width > 0 && self.height > 0 && self.depth > 0
    }

    /// Bytes per pixel
    pub fn pixel_size(&self) -> usize {
        self.format.components() * self.data_type.size_bytes()
    }

    /// Bytes per row
    pub fn row_size(&self) -> usize {
        self.width as usize * self.pixel_size()
    }

    /// Raw pixel bytes of all slices.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Mutable pixel bytes. Bumps the modification counter; copies the storage
    /// first if it is shared with another raster.
    pub fn data_mut(&mut self) -> &mut [u8] {
        self.dirty();
        Arc::make_mut(&mut self.data).as_mut_slice()
    }

    /// Modification counter, raised by [`Raster::dirty`] and [`Raster::data_mut`].
    pub fn modified_count(&self) -> u64 {
        self.modified_count
    }

    /// Mark the pixel contents as changed.
    pub fn dirty(&mut self) {
        self.modified_count += 1;
    }

    /// True if both rasters share the same pixel storage.
    pub fn shares_data_with(&self, other: &Raster) -> bool {
        Arc::ptr_eq(&self.data, &other.data)
    }

    /// Byte offset of pixel (s, t) in slice r
    pub fn pixel_offset(&self, s: u32, t: u32, r: u32) -> usize {
        ((r as usize * self.height as usize + t as usize) * self.width as usize + s as usize)
            * self.pixel_size()
    }

    /// Normalized value of a stored component.
    pub fn component(&self, s: u32, t: u32, r: u32, image_channel: usize) -> f32 {
        let offset = self.pixel_offset(s, t, r) + image_channel * self.data_type.size_bytes();
        read_component(&self.data, offset, self.data_type)
    }

    /// RGBA color of pixel (s, t) in the first slice.
    pub fn color_at(&self, s: u32, t: u32) -> Vec4 {
        self.color_at_slice(s, t, 0)
    }

    /// RGBA color of pixel (s, t) in slice r. Channels the pixel format cannot
    /// represent read as their constant (0.0 or 1.0).
    pub fn color_at_slice(&self, s: u32, t: u32, r: u32) -> Vec4 {
        let offset = self.pixel_offset(s, t, r);
        let mut color = Vec4::ZERO;
        for channel in 0..4 {
            color[channel] = match image_channel_for_texture_channel(channel, self.format) {
                Some(ChannelSource::Image(ic)) => read_component(
                    &self.data,
                    offset + ic * self.data_type.size_bytes(),
                    self.data_type,
                ),
                Some(ChannelSource::One) => 1.0,
                Some(ChannelSource::Zero) | None => 0.0,
            };
        }
        color
    }

    /// Copy a region of the first slice into a new raster of `width` x `height`.
    ///
    /// Rows are read through a bounded copy: parts of the region that fall outside
    /// the source buffer are left zeroed. Returns the copy and whether any row had
    /// to be truncated.
    pub fn copy_region(&self, s: i32, t: i32, width: u32, height: u32) -> (Raster, bool) {
        let mut tile = Raster::new(width, height, 1, self.format, self.data_type);
        let pixel_size = self.pixel_size() as i64;
        let row_len = width as usize * self.pixel_size();
        let source_end = self.row_size() as i64 * self.height as i64;
        let mut truncated = false;

        {
            let dest = Arc::make_mut(&mut tile.data);
            for row in 0..height as usize {
                let start = ((t as i64 + row as i64) * self.width as i64 + s as i64) * pixel_size;
                let dest_row = &mut dest[row * row_len..(row + 1) * row_len];
                truncated |= bounded_copy(dest_row, &self.data, start, source_end);
            }
        }

        (tile, truncated)
    }

    /// Resample the raster to a new size with a bilinear (triangle) filter.
    pub fn scaled(&self, new_width: u32, new_height: u32) -> Result<Raster, RasterError> {
        if new_width == 0 || new_height == 0 {
            return Err(RasterError::ZeroSize {
                width: new_width,
                height: new_height,
                depth: self.depth,
            });
        }
        if self.depth != 1 {
            return Err(RasterError::LayeredResample(self.depth));
        }

        let (w, h) = (self.width, self.height);
        let resized = match self.data_type {
            DataType::U8 => {
                let raw = self.data.as_ref().clone();
                match self.format.components() {
                    1 => resize_raw::<Luma<u8>>(w, h, raw, new_width, new_height),
                    2 => resize_raw::<LumaA<u8>>(w, h, raw, new_width, new_height),
                    3 => resize_raw::<Rgb<u8>>(w, h, raw, new_width, new_height),
                    _ => resize_raw::<Rgba<u8>>(w, h, raw, new_width, new_height),
                }
            }
            DataType::F32 => {
                let raw: Vec<f32> = bytemuck::pod_collect_to_vec(self.data.as_slice());
                let out = match self.format.components() {
                    1 => resize_raw::<Luma<f32>>(w, h, raw, new_width, new_height),
                    2 => resize_raw::<LumaA<f32>>(w, h, raw, new_width, new_height),
                    3 => resize_raw::<Rgb<f32>>(w, h, raw, new_width, new_height),
                    _ => resize_raw::<Rgba<f32>>(w, h, raw, new_width, new_height),
                };
                out.map(|values| bytemuck::cast_slice::<f32, u8>(&values).to_vec())
            }
        };

        let bytes = resized.ok_or(RasterError::DataLength {
            expected: Self::byte_len(w, h, 1, self.format, self.data_type),
            actual: self.data.len(),
        })?;

        Ok(Raster {
            width: new_width,
            height: new_height,
            depth: 1,
            format: self.format,
            data_type: self.data_type,
            data: Arc::new(bytes),
            modified_count: 0,
        })
    }

    /// Export an RGBA8 raster as an `image` buffer (e.g. for PNG dumps).
    pub fn to_rgba_image(&self) -> Option<image::RgbaImage> {
        if self.format != PixelFormat::Rgba || self.data_type != DataType::U8 || self.depth != 1 {
            return None;
        }
        image::RgbaImage::from_raw(self.width, self.height, self.data.as_ref().clone())
    }
}

fn read_component(data: &[u8], offset: usize, data_type: DataType) -> f32 {
    match data_type {
        DataType::U8 => data[offset] as f32 / 255.0,
        DataType::F32 => bytemuck::pod_read_unaligned::<f32>(&data[offset..offset + 4]),
    }
}

/// Copy `dest.len()` bytes starting at `start`, clipped to `[0, source_end)`.
/// Returns true if the range had to be clipped.
fn bounded_copy(dest: &mut [u8], source: &[u8], start: i64, source_end: i64) -> bool {
    let source_end = source_end.min(source.len() as i64);
    let len = dest.len() as i64;

    if start >= source_end || start + len <= 0 {
        return true;
    }

    let mut truncated = false;
    let mut src_start = start;
    let mut dest_start = 0i64;
    if src_start < 0 {
        truncated = true;
        dest_start = -src_start;
        src_start = 0;
    }

    let mut src_stop = start + len;
    if src_stop > source_end {
        truncated = true;
        src_stop = source_end;
    }

    let count = (src_stop - src_start) as usize;
    let dest_start = dest_start as usize;
    let src_start = src_start as usize;
    dest[dest_start..dest_start + count].copy_from_slice(&source[src_start..src_start + count]);
    truncated
}

fn resize_raw<P>(
    width: u32,
    height: u32,
    raw: Vec<P::Subpixel>,
    new_width: u32,
    new_height: u32,
) -> Option<Vec<P::Subpixel>>
where
    P: Pixel + 'static,
    P::Subpixel: 'static,
{
    let buffer: ImageBuffer<P, Vec<P::Subpixel>> = ImageBuffer::from_raw(width, height, raw)?;
    Some(imageops::resize(&buffer, new_width, new_height, FilterType::Triangle).into_raw())
}

/// Zero-copy window into a shared raster.
///
/// Rows of the window are `row_length` pixels apart in the underlying buffer.
#[derive(Debug, Clone)]
pub struct RasterView {
    raster: Arc<Raster>,
    origin: (u32, u32),
    width: u32,
    height: u32,
}

impl RasterView {
    /// Create a view, clipping the window to the raster bounds.
    pub fn new(raster: Arc<Raster>, s: u32, t: u32, width: u32, height: u32) -> Self {
        let s = s.min(raster.width().saturating_sub(1));
        let t = t.min(raster.height().saturating_sub(1));
        let width = width.min(raster.width() - s);
        let height = height.min(raster.height() - t);
        Self {
            raster,
            origin: (s, t),
            width,
            height,
        }
    }

    pub fn raster(&self) -> &Arc<Raster> {
        &self.raster
    }

    pub fn origin(&self) -> (u32, u32) {
        self.origin
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Distance between rows in pixels
    pub fn row_length(&self) -> u32 {
        self.raster.width()
    }

    /// Bytes of one row of the window
    pub fn row(&self, t: u32) -> &[u8] {
        let start = self.raster.pixel_offset(self.origin.0, self.origin.1 + t, 0);
        let len = self.width as usize * self.raster.pixel_size();
        &self.raster.data()[start..start + len]
    }

    /// RGBA color of window pixel (s, t)
    pub fn color_at(&self, s: u32, t: u32) -> Vec4 {
        self.raster.color_at(self.origin.0 + s, self.origin.1 + t)
    }
}
