//! Raster color model.
//!
//! Maps between the RGBA channels a texture is sampled with and the physical
//! components stored in each [`PixelFormat`], and classifies the transparency of
//! a raster channel.

use crate::raster::{DataType, PixelFormat, Raster};

/// Smallest power of two not below `nr`, for `nr` in `[1, 65536]`.
///
/// Values above 32768 saturate at 65536. Resolved by bisection so the common
/// texture sizes take at most four comparisons.
pub fn power_of_2_ceil(nr: u32) -> u32 {
    if nr <= 256 {
        if nr <= 16 {
            if nr <= 4 {
                return if nr <= 2 { nr } else { 4 };
            }
            return if nr <= 8 { 8 } else { 16 };
        }

        if nr <= 64 {
            return if nr <= 32 { 32 } else { 64 };
        }
        return if nr <= 128 { 128 } else { 256 };
    }

    if nr <= 4096 {
        if nr <= 1024 {
            return if nr <= 512 { 512 } else { 1024 };
        }
        return if nr <= 2048 { 2048 } else { 4096 };
    }

    if nr <= 16384 {
        return if nr <= 8192 { 8192 } else { 16384 };
    }

    if nr <= 32768 { 32768 } else { 65536 }
}

/// Where the value of an RGBA texture channel comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelSource {
    /// Component index within the stored pixel
    Image(usize),
    /// The format cannot represent the channel; it always reads 1.0
    One,
    /// The format cannot represent the channel; it always reads 0.0
    Zero,
}

/// Map a texture channel (0..=3, RGBA) to its source in a pixel format.
///
/// Returns `None` for channels outside 0..=3.
pub fn image_channel_for_texture_channel(channel: usize, format: PixelFormat) -> Option<ChannelSource> {
    use ChannelSource::{Image, One, Zero};

    if channel > 3 {
        return None;
    }

    let source = match format {
        PixelFormat::Rgba => Image(channel),
        PixelFormat::Rgb => {
            if channel == 3 { One } else { Image(channel) }
        }
        PixelFormat::LuminanceAlpha => Image(if channel == 3 { 1 } else { 0 }),
        PixelFormat::Luminance | PixelFormat::Depth => {
            if channel == 3 { One } else { Image(0) }
        }
        PixelFormat::Alpha => {
            if channel == 3 { Image(0) } else { Zero }
        }
        PixelFormat::Intensity => Image(0),
        PixelFormat::Red | PixelFormat::Green | PixelFormat::Blue => {
            let own = match format {
                PixelFormat::Red => 0,
                PixelFormat::Green => 1,
                _ => 2,
            };
            if channel == own {
                Image(0)
            } else if channel == 3 {
                One
            } else {
                Zero
            }
        }
        PixelFormat::Bgra => Image(if channel == 3 { 3 } else { 2 - channel }),
        PixelFormat::Bgr => {
            if channel == 3 { One } else { Image(2 - channel) }
        }
    };

    Some(source)
}

/// Map a stored pixel component back to the texture channel it feeds.
///
/// Returns `None` if the component does not exist in the format.
pub fn texture_channel_for_image_channel(channel: usize, format: PixelFormat) -> Option<usize> {
    if channel > 3 {
        return None;
    }

    match format {
        PixelFormat::Rgba => Some(channel),
        PixelFormat::Rgb => (channel < 3).then_some(channel),
        PixelFormat::LuminanceAlpha => (channel <= 1).then_some(3 * channel),
        PixelFormat::Luminance | PixelFormat::Intensity | PixelFormat::Red | PixelFormat::Depth => {
            (channel == 0).then_some(0)
        }
        PixelFormat::Alpha => (channel == 0).then_some(3),
        PixelFormat::Green => (channel == 0).then_some(1),
        PixelFormat::Blue => (channel == 0).then_some(2),
        PixelFormat::Bgra => Some(if channel == 3 { 3 } else { 2 - channel }),
        PixelFormat::Bgr => (channel < 3).then(|| 2 - channel),
    }
}

/// Transparency classification of a raster channel or a composite.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransparencyType {
    /// Every value is 1.0 or above
    Opaque,
    /// Every value is 0.0 or below
    FullyTransparent,
    /// Values are exactly 0.0 or 1.0, both occurring
    OnlyFullTransparencies,
    /// At least one value lies strictly between 0.0 and 1.0
    HasTransparencies,
}

/// Classify one texture channel of a raster (usually 3, alpha).
pub fn classify_transparency(raster: &Raster, texture_channel: usize) -> TransparencyType {
    let image_channel = match image_channel_for_texture_channel(texture_channel, raster.pixel_format()) {
        Some(ChannelSource::Image(ic)) => ic,
        Some(ChannelSource::One) => return TransparencyType::Opaque,
        Some(ChannelSource::Zero) | None => return TransparencyType::FullyTransparent,
    };

    if !raster.is_allocated() {
        return TransparencyType::FullyTransparent;
    }

    if raster.data_type() == DataType::U8 {
        return classify_bytes(raster.data(), image_channel, raster.pixel_size());
    }

    let mut found_opaque = false;
    let mut found_transparent = false;

    for r in 0..raster.depth() {
        for t in 0..raster.height() {
            for s in 0..raster.width() {
                let value = raster.component(s, t, r, image_channel);
                if value <= 0.0 {
                    found_transparent = true;
                } else if value >= 1.0 {
                    found_opaque = true;
                } else {
                    return TransparencyType::HasTransparencies;
                }
            }
        }
    }

    combine_findings(found_opaque, found_transparent)
}

fn classify_bytes(data: &[u8], offset: usize, step: usize) -> TransparencyType {
    let mut found_opaque = false;
    let mut found_transparent = false;

    for &value in data.iter().skip(offset).step_by(step.max(1)) {
        match value {
            0 => found_transparent = true,
            255 => found_opaque = true,
            _ => return TransparencyType::HasTransparencies,
        }
    }

    combine_findings(found_opaque, found_transparent)
}

fn combine_findings(found_opaque: bool, found_transparent: bool) -> TransparencyType {
    match (found_opaque, found_transparent) {
        (true, true) => TransparencyType::OnlyFullTransparencies,
        (false, true) => TransparencyType::FullyTransparent,
        _ => TransparencyType::Opaque,
    }
}

/// Combine an interior classification with a uniform border value.
///
/// A negative `border` means no border color is used (edge pixels are extended),
/// which leaves the classification unchanged.
pub fn add_opacity(tt: TransparencyType, border: f32) -> TransparencyType {
    use TransparencyType::*;

    if border < 0.0 {
        return tt;
    }

    if border > 0.0 && border < 1.0 {
        return HasTransparencies;
    }

    let border_opaque = border >= 1.0;
    match tt {
        Opaque if border_opaque => Opaque,
        Opaque => OnlyFullTransparencies,
        FullyTransparent if border_opaque => OnlyFullTransparencies,
        FullyTransparent => FullyTransparent,
        other => other,
    }
}

/// Scale a classification by a uniform opacity in `[0, 1]`.
pub fn multiply_opacity(tt: TransparencyType, opacity: f32) -> TransparencyType {
    use TransparencyType::*;

    if opacity <= 0.0 {
        return FullyTransparent;
    }
    if opacity >= 1.0 || tt == FullyTransparent {
        return tt;
    }
    HasTransparencies
}
