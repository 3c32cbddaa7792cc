//! Layer processes: the pluggable stages that turn data layers into color.
//!
//! A process reads up to a few data layers (plus their undefined masks) and
//! blends its color under whatever the processes above it produced. The same
//! process contributes a WGSL stage to the fragment shader and a per-pixel
//! routine to the software compositor, and both must agree.

mod color_map;
mod identity;

use std::fmt;
use std::sync::Arc;

use glam::{Vec2, Vec4};
use strata_shared::TransparencyType;

use crate::layer::LayerId;
use crate::registry::LayerRegistry;

pub use color_map::{COLOR_SEQUENCE_LEN, ColorMapProcess};
pub use identity::IdentityProcess;

/// Slot scan indices below this are visited even when a slot is empty
pub(crate) const MIN_SCANNED_SLOTS: i32 = 8;

/// Read access to data layers for the per-pixel routine of a process.
#[derive(Clone, Copy)]
pub struct ProcessContext<'a> {
    layers: &'a LayerRegistry,
}

impl<'a> ProcessContext<'a> {
    pub(crate) fn new(layers: &'a LayerRegistry) -> Self {
        Self { layers }
    }

    /// Whether the layer exists and has an image
    pub fn is_layer_ok(&self, id: Option<LayerId>) -> bool {
        self.layers.is_layer_ok(id)
    }

    /// Sample a layer at a global coordinate.
    pub fn texture_vec(&self, id: LayerId, global: Vec2) -> Option<Vec4> {
        self.layers.get(id).map(|layer| layer.texture_vec(global))
    }

    /// The undefined-mask layer of `id`, if it has a usable one
    pub fn undef_layer(&self, id: LayerId) -> Option<LayerId> {
        let undef = self.layers.get(id)?.undef_layer();
        self.is_layer_ok(undef).then_some(undef).flatten()
    }

    pub fn undef_channel(&self, id: LayerId) -> usize {
        self.layers.get(id).map_or(0, |layer| layer.undef_channel())
    }

    pub fn image_undef_color(&self, id: LayerId) -> Vec4 {
        self.layers
            .get(id)
            .map_or(crate::layer::UNSET_COLOR, |layer| layer.image_undef_color())
    }

    /// Undefined-mask value of layer `id` at a global coordinate (0.0 without mask)
    pub fn undef_value(&self, id: LayerId, global: Vec2) -> f32 {
        self.undef_layer(id)
            .and_then(|undef| self.texture_vec(undef, global))
            .map_or(0.0, |value| value[self.undef_channel(id)])
    }

    pub fn transparency_type(&self, id: LayerId, channel: usize) -> TransparencyType {
        self.layers
            .get(id)
            .map_or(TransparencyType::FullyTransparent, |layer| layer.transparency_type(channel))
    }

    pub fn texture_unit(&self, id: LayerId) -> Option<u32> {
        self.layers.get(id).and_then(|layer| layer.texture_unit())
    }
}

/// Context for emitting one fragment-shader stage.
#[derive(Clone, Copy)]
pub struct ShaderContext<'a> {
    process: ProcessContext<'a>,
    color_sequence_coord: f32,
}

impl<'a> ShaderContext<'a> {
    pub(crate) fn new(layers: &'a LayerRegistry, color_sequence_coord: f32) -> Self {
        Self {
            process: ProcessContext::new(layers),
            color_sequence_coord,
        }
    }

    pub fn layers(&self) -> &ProcessContext<'a> {
        &self.process
    }

    /// WGSL expression holding the pre-sampled texel of a layer, if it has a unit
    pub fn texel(&self, id: LayerId) -> Option<String> {
        if !self.process.is_layer_ok(Some(id)) {
            return None;
        }
        self.process.texture_unit(id).map(|unit| format!("texel{unit}"))
    }

    /// WGSL expression of the undefined-mask value of a layer, if it has one
    pub fn undef_value(&self, id: LayerId) -> Option<String> {
        let undef = self.process.undef_layer(id)?;
        let texel = self.texel(undef)?;
        Some(format!("{texel}.{}", channel_name(self.process.undef_channel(id))))
    }

    /// Vertical texture coordinate of this process's row in the color-sequence texture
    pub fn color_sequence_coord(&self) -> f32 {
        self.color_sequence_coord
    }
}

/// WGSL swizzle name of an RGBA channel
pub fn channel_name(channel: usize) -> &'static str {
    ["r", "g", "b", "a"][channel.min(3)]
}

/// WGSL `vec4<f32>` literal
pub fn vec4_literal(color: Vec4) -> String {
    format!(
        "vec4<f32>({:.6}, {:.6}, {:.6}, {:.6})",
        color.x, color.y, color.z, color.w
    )
}

/// One stage of the layer stack.
pub trait LayerProcess: Send + Sync + fmt::Debug {
    /// Global opacity multiplier in [0, 1]
    fn opacity(&self) -> f32 {
        1.0
    }

    /// Transparency of this process's output, including opacity
    fn transparency_type(&self, ctx: &ProcessContext<'_>) -> TransparencyType;

    /// Whether layer slot `slot` takes part
    fn is_on(&self, _slot: usize) -> bool {
        true
    }

    /// Data layer read through slot `slot`
    fn data_layer_id(&self, slot: usize) -> Option<LayerId>;

    fn needs_color_sequence(&self) -> bool {
        false
    }

    /// 256 RGBA8 entries
    fn color_sequence(&self) -> Option<Arc<[u8]>> {
        None
    }

    /// Returns true if the color sequence changed since the last call
    fn check_for_modified_color_sequence(&self) -> bool {
        false
    }

    /// Append the WGSL of this stage to `out`.
    ///
    /// The stage reads pre-sampled texels and blends its color under `frag`.
    fn shader_code(&self, ctx: &ShaderContext<'_>, out: &mut String, stage: usize);

    /// Blend this process's color at `global` under `color`.
    fn do_process(&self, ctx: &ProcessContext<'_>, color: &mut Vec4, undef: f32, global: Vec2);
}

/// Blend `col` under an already accumulated `frag` (alpha < 0 means unset).
pub fn blend_under(frag: Vec4, col: Vec4) -> Vec4 {
    if frag.w < 0.0 {
        return col;
    }
    let a = frag.w + col.w * (1.0 - frag.w);
    if a <= 0.0 {
        return col.truncate().extend(0.0);
    }
    let rgb = (frag.truncate() * frag.w + col.truncate() * col.w * (1.0 - frag.w)) / a;
    rgb.extend(a)
}

/// Apply a layer's own undefined mask to a sampled color.
///
/// Without an undefined color the pixel fades out; otherwise it is mixed
/// toward that color.
pub fn apply_undef(col: Vec4, undef: f32, undef_color: Vec4) -> Vec4 {
    if undef <= 0.0 {
        return col;
    }
    let undef = undef.min(1.0);
    if undef_color.w < 0.0 {
        return col.truncate().extend(col.w * (1.0 - undef));
    }
    col * (1.0 - undef) + undef_color * undef
}

/// WGSL twins of [`blend_under`] and [`apply_undef`].
pub(crate) const WGSL_HELPERS: &str = r#"
fn blend_under(frag: vec4<f32>, col: vec4<f32>) -> vec4<f32> {
    if frag.a < 0.0 {
        return col;
    }
    let a = frag.a + col.a * (1.0 - frag.a);
    if a <= 0.0 {
        return vec4<f32>(col.rgb, 0.0);
    }
    let rgb = (frag.rgb * frag.a + col.rgb * col.a * (1.0 - frag.a)) / a;
    return vec4<f32>(rgb, a);
}

fn apply_undef(col: vec4<f32>, undef: f32, undef_color: vec4<f32>) -> vec4<f32> {
    if undef <= 0.0 {
        return col;
    }
    let u = min(undef, 1.0);
    if undef_color.a < 0.0 {
        return vec4<f32>(col.rgb, col.a * (1.0 - u));
    }
    return col * (1.0 - u) + undef_color * u;
}
"#;

/// Ordered list of processes; the last one is on top.
#[derive(Debug, Default, Clone)]
pub struct ProcessStack {
    processes: Vec<Arc<dyn LayerProcess>>,
}

fn same_process(a: &Arc<dyn LayerProcess>, b: &Arc<dyn LayerProcess>) -> bool {
    Arc::as_ptr(a).cast::<()>() == Arc::as_ptr(b).cast::<()>()
}

impl ProcessStack {
    pub fn len(&self) -> usize {
        self.processes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processes.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Arc<dyn LayerProcess>> {
        self.processes.get(index)
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &Arc<dyn LayerProcess>> + ExactSizeIterator {
        self.processes.iter()
    }

    pub fn position(&self, process: &Arc<dyn LayerProcess>) -> Option<usize> {
        self.processes.iter().position(|p| same_process(p, process))
    }

    pub(crate) fn push(&mut self, process: Arc<dyn LayerProcess>) {
        self.processes.push(process);
    }

    pub(crate) fn remove(&mut self, process: &Arc<dyn LayerProcess>) -> bool {
        match self.position(process) {
            Some(index) => {
                self.processes.remove(index);
                true
            }
            None => false,
        }
    }

    /// Swap with the process below. Returns whether the order changed.
    pub(crate) fn move_earlier(&mut self, process: &Arc<dyn LayerProcess>) -> bool {
        match self.position(process) {
            Some(index) if index > 0 => {
                self.processes.swap(index, index - 1);
                true
            }
            _ => false,
        }
    }

    /// Swap with the process above. Returns whether the order changed.
    pub(crate) fn move_later(&mut self, process: &Arc<dyn LayerProcess>) -> bool {
        match self.position(process) {
            Some(index) if index + 1 < self.processes.len() => {
                self.processes.swap(index, index + 1);
                true
            }
            _ => false,
        }
    }
}

/// Transparency of a layer sampled through a process, with its own undefined mask.
pub(crate) fn masked_transparency(ctx: &ProcessContext<'_>, id: LayerId, tt: TransparencyType) -> TransparencyType {
    if ctx.undef_layer(id).is_none() {
        return tt;
    }
    let undef_alpha = ctx.image_undef_color(id).w.max(0.0);
    let may_lose = undef_alpha < 1.0 && tt != TransparencyType::FullyTransparent;
    let may_gain = undef_alpha > 0.0 && tt != TransparencyType::Opaque;
    if may_lose || may_gain {
        TransparencyType::HasTransparencies
    } else {
        tt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blend_under_unset_takes_color() {
        let col = Vec4::new(0.2, 0.4, 0.6, 0.5);
        assert_eq!(blend_under(Vec4::splat(-1.0), col), col);
    }

    #[test]
    fn test_blend_under_opaque_top_wins() {
        let top = Vec4::new(1.0, 0.0, 0.0, 1.0);
        assert_eq!(blend_under(top, Vec4::new(0.0, 1.0, 0.0, 1.0)), top);
    }

    #[test]
    fn test_blend_under_half_transparent() {
        let top = Vec4::new(1.0, 0.0, 0.0, 0.5);
        let bottom = Vec4::new(0.0, 0.0, 1.0, 1.0);
        let blended = blend_under(top, bottom);
        assert_eq!(blended.w, 1.0);
        assert!((blended.x - 0.5).abs() < 1e-6);
        assert!((blended.z - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_apply_undef_fades_without_color() {
        let col = Vec4::new(0.2, 0.4, 0.6, 1.0);
        let faded = apply_undef(col, 0.25, Vec4::splat(-1.0));
        assert_eq!(faded, Vec4::new(0.2, 0.4, 0.6, 0.75));
        assert_eq!(apply_undef(col, 0.0, Vec4::ONE), col);
        assert_eq!(apply_undef(col, 1.0, Vec4::ONE), Vec4::ONE);
    }

    #[test]
    fn test_stack_moves() {
        let a: Arc<dyn LayerProcess> = Arc::new(IdentityProcess::new(LayerId(1)));
        let b: Arc<dyn LayerProcess> = Arc::new(IdentityProcess::new(LayerId(2)));
        let mut stack = ProcessStack::default();
        stack.push(a.clone());
        stack.push(b.clone());

        assert!(!stack.move_later(&b));
        assert!(stack.move_later(&a));
        assert_eq!(stack.position(&a), Some(1));
        assert!(!stack.move_later(&a));
        assert!(stack.move_earlier(&a));
        assert!(!stack.move_earlier(&a));

        assert!(stack.remove(&a));
        assert!(!stack.remove(&a));
        assert_eq!(stack.len(), 1);
    }

    #[test]
    fn test_helpers_are_valid_wgsl() {
        let module = naga::front::wgsl::parse_str(WGSL_HELPERS).expect("helpers should parse");
        let mut validator = naga::valid::Validator::new(
            naga::valid::ValidationFlags::all(),
            naga::valid::Capabilities::all(),
        );
        validator.validate(&module).expect("helpers should validate");
    }
}
