use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use glam::{Vec2, Vec4};
use strata_shared::{TransparencyType, multiply_opacity};

use super::{
    LayerProcess, ProcessContext, ShaderContext, apply_undef, blend_under, channel_name,
    masked_transparency, vec4_literal,
};
use crate::layer::LayerId;

/// Number of entries in a color sequence
pub const COLOR_SEQUENCE_LEN: usize = 256;

/// Maps one channel of a data layer through a 256-entry color sequence.
///
/// Values are scaled linearly from `[min, max]` onto the sequence; values
/// outside the range clamp to the first or last entry. The sequence can be
/// replaced while the process sits in a stack; the next setup pass uploads it.
#[derive(Debug)]
pub struct ColorMapProcess {
    layer: LayerId,
    channel: usize,
    range: Vec2,
    opacity: f32,
    colors: RwLock<Arc<[u8]>>,
    revision: AtomicU64,
    seen_revision: AtomicU64,
}

impl ColorMapProcess {
    /// Map `channel` of `layer` through a gray ramp over `[0, 1]`.
    pub fn new(layer: LayerId, channel: usize) -> Self {
        let colors: Arc<[u8]> = (0..COLOR_SEQUENCE_LEN)
            .flat_map(|idx| {
                let v = idx as u8;
                [v, v, v, 255]
            })
            .collect();
        Self {
            layer,
            channel: channel.min(3),
            range: Vec2::new(0.0, 1.0),
            opacity: 1.0,
            colors: RwLock::new(colors),
            revision: AtomicU64::new(0),
            seen_revision: AtomicU64::new(0),
        }
    }

    pub fn with_range(mut self, min: f32, max: f32) -> Self {
        self.range = Vec2::new(min, max);
        self
    }

    pub fn with_opacity(mut self, opacity: f32) -> Self {
        self.opacity = opacity.clamp(0.0, 1.0);
        self
    }

    /// Replace the color sequence. Entries beyond the first 256 are ignored;
    /// missing entries are transparent black.
    pub fn with_colors(self, colors: &[[u8; 4]]) -> Self {
        self.set_colors(colors);
        self
    }

    pub fn set_colors(&self, colors: &[[u8; 4]]) {
        let mut table = vec![0; COLOR_SEQUENCE_LEN * 4];
        for (dest, src) in table.chunks_exact_mut(4).zip(colors) {
            dest.copy_from_slice(src);
        }
        match self.colors.write() {
            Ok(mut guard) => *guard = table.into(),
            Err(poisoned) => *poisoned.into_inner() = table.into(),
        }
        self.revision.fetch_add(1, Ordering::AcqRel);
    }

    /// Current color sequence, 256 RGBA8 entries
    pub fn colors(&self) -> Arc<[u8]> {
        match self.colors.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn layer(&self) -> LayerId {
        self.layer
    }

    /// Sequence index of a layer value
    pub fn color_index(&self, value: f32) -> usize {
        let idx = (self.normalized(value) * 255.0 + 0.5).floor();
        (idx as usize).min(COLOR_SEQUENCE_LEN - 1)
    }

    fn normalized(&self, value: f32) -> f32 {
        let width = self.range.y - self.range.x;
        if width <= 0.0 || !value.is_finite() {
            return 0.0;
        }
        ((value - self.range.x) / width).clamp(0.0, 1.0)
    }

    fn sequence_transparency(&self) -> TransparencyType {
        let mut has_zero = false;
        let mut has_one = false;
        for alpha in self.colors().iter().skip(3).step_by(4) {
            match *alpha {
                0 => has_zero = true,
                255 => has_one = true,
                _ => return TransparencyType::HasTransparencies,
            }
        }
        match (has_zero, has_one) {
            (true, true) => TransparencyType::OnlyFullTransparencies,
            (true, false) => TransparencyType::FullyTransparent,
            _ => TransparencyType::Opaque,
        }
    }
}

impl LayerProcess for ColorMapProcess {
    fn opacity(&self) -> f32 {
        self.opacity
    }

    fn transparency_type(&self, ctx: &ProcessContext<'_>) -> TransparencyType {
        if !ctx.is_layer_ok(Some(self.layer)) {
            return TransparencyType::FullyTransparent;
        }
        let tt = masked_transparency(ctx, self.layer, self.sequence_transparency());
        multiply_opacity(tt, self.opacity)
    }

    fn data_layer_id(&self, slot: usize) -> Option<LayerId> {
        (slot == 0).then_some(self.layer)
    }

    fn needs_color_sequence(&self) -> bool {
        true
    }

    fn color_sequence(&self) -> Option<Arc<[u8]>> {
        Some(self.colors())
    }

    fn check_for_modified_color_sequence(&self) -> bool {
        let revision = self.revision.load(Ordering::Acquire);
        self.seen_revision.swap(revision, Ordering::AcqRel) != revision
    }

    fn shader_code(&self, ctx: &ShaderContext<'_>, out: &mut String, stage: usize) {
        let Some(texel) = ctx.texel(self.layer) else {
            return;
        };
        let width = self.range.y - self.range.x;
        let inv_width = if width > 0.0 { 1.0 / width } else { 0.0 };

        out.push_str(&format!("    // stage {stage}: color map of layer {}\n", self.layer));
        out.push_str("    {\n");
        out.push_str(&format!(
            "        let v = clamp(({texel}.{} - {:.6}) * {:.6}, 0.0, 1.0);\n",
            channel_name(self.channel),
            self.range.x,
            inv_width
        ));
        out.push_str(&format!(
            "        var col = textureSampleLevel(texture0, sampler0, vec2<f32>((v * 255.0 + 0.5) / 256.0, {:.6}), 0.0);\n",
            ctx.color_sequence_coord()
        ));
        if let Some(undef) = ctx.undef_value(self.layer) {
            let undef_color = ctx.layers().image_undef_color(self.layer);
            out.push_str(&format!(
                "        col = apply_undef(col, {undef}, {});\n",
                vec4_literal(undef_color)
            ));
        }
        out.push_str(&format!("        col.a *= {:.6};\n", self.opacity));
        out.push_str("        frag = blend_under(frag, col);\n");
        out.push_str("    }\n");
    }

    fn do_process(&self, ctx: &ProcessContext<'_>, color: &mut Vec4, _undef: f32, global: Vec2) {
        if !ctx.is_layer_ok(Some(self.layer)) {
            return;
        }
        let Some(sample) = ctx.texture_vec(self.layer, global) else {
            return;
        };

        let idx = self.color_index(sample[self.channel]) * 4;
        let colors = self.colors();
        let entry = &colors[idx..idx + 4];
        let mut col = Vec4::new(
            entry[0] as f32,
            entry[1] as f32,
            entry[2] as f32,
            entry[3] as f32,
        ) / 255.0;

        let undef = ctx.undef_value(self.layer, global);
        col = apply_undef(col, undef, ctx.image_undef_color(self.layer));
        col.w *= self.opacity;
        *color = blend_under(*color, col);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_color_index_range_mapping() {
        let process = ColorMapProcess::new(LayerId(1), 0).with_range(10.0, 20.0);
        assert_eq!(process.color_index(10.0), 0);
        assert_eq!(process.color_index(20.0), 255);
        assert_eq!(process.color_index(15.0), 128);
        assert_eq!(process.color_index(-5.0), 0);
        assert_eq!(process.color_index(99.0), 255);
        assert_eq!(process.color_index(f32::NAN), 0);
    }

    #[test]
    fn test_empty_range_maps_to_first_entry() {
        let process = ColorMapProcess::new(LayerId(1), 0).with_range(3.0, 3.0);
        assert_eq!(process.color_index(3.0), 0);
    }

    #[test]
    fn test_sequence_transparency() {
        let process = ColorMapProcess::new(LayerId(1), 0);
        assert_eq!(process.sequence_transparency(), TransparencyType::Opaque);

        process.set_colors(&[[1, 2, 3, 255], [4, 5, 6, 0]]);
        assert_eq!(
            process.sequence_transparency(),
            TransparencyType::OnlyFullTransparencies
        );

        process.set_colors(&[[1, 2, 3, 128]]);
        assert_eq!(
            process.sequence_transparency(),
            TransparencyType::HasTransparencies
        );
    }

    #[test]
    fn test_modified_sequence_reported_once() {
        let process = ColorMapProcess::new(LayerId(1), 0);
        assert!(!process.check_for_modified_color_sequence());
        process.set_colors(&[[9, 9, 9, 255]]);
        assert!(process.check_for_modified_color_sequence());
        assert!(!process.check_for_modified_color_sequence());
    }
}
