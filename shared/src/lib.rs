//! Shared types for the strata layered-texture compositor.
//!
//! - [`Raster`] - Image buffer handed to data layers (externally owned, shared via `Arc`)
//! - [`RasterView`] - Zero-copy window into a raster, used for tile textures
//! - [`color`] - Channel mapping between pixel formats and RGBA texture channels,
//!   plus transparency classification

pub mod color;
pub mod raster;

pub use color::{
    ChannelSource, TransparencyType, add_opacity, classify_transparency,
    image_channel_for_texture_channel, multiply_opacity, power_of_2_ceil,
    texture_channel_for_image_channel,
};
pub use raster::{DataType, PixelFormat, Raster, RasterError, RasterView};
