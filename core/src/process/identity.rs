use glam::{Vec2, Vec4};
use strata_shared::{TransparencyType, multiply_opacity};

use super::{
    LayerProcess, ProcessContext, ShaderContext, apply_undef, blend_under, masked_transparency,
    vec4_literal,
};
use crate::layer::LayerId;

/// Shows one data layer as RGBA, scaled by an opacity.
#[derive(Debug, Clone, PartialEq)]
pub struct IdentityProcess {
    layer: LayerId,
    opacity: f32,
}

impl IdentityProcess {
    pub fn new(layer: LayerId) -> Self {
        Self { layer, opacity: 1.0 }
    }

    pub fn with_opacity(mut self, opacity: f32) -> Self {
        self.opacity = opacity.clamp(0.0, 1.0);
        self
    }

    pub fn layer(&self) -> LayerId {
        self.layer
    }
}

impl LayerProcess for IdentityProcess {
    fn opacity(&self) -> f32 {
        self.opacity
    }

    fn transparency_type(&self, ctx: &ProcessContext<'_>) -> TransparencyType {
        if !ctx.is_layer_ok(Some(self.layer)) {
            return TransparencyType::FullyTransparent;
        }
        let tt = ctx.transparency_type(self.layer, 3);
        multiply_opacity(masked_transparency(ctx, self.layer, tt), self.opacity)
    }

    fn data_layer_id(&self, slot: usize) -> Option<LayerId> {
        (slot == 0).then_some(self.layer)
    }

    fn shader_code(&self, ctx: &ShaderContext<'_>, out: &mut String, stage: usize) {
        let Some(texel) = ctx.texel(self.layer) else {
            return;
        };

        out.push_str(&format!("    // stage {stage}: layer {}\n", self.layer));
        out.push_str("    {\n");
        out.push_str(&format!("        var col = {texel};\n"));
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
        let Some(mut col) = ctx.texture_vec(self.layer, global) else {
            return;
        };
        if !ctx.is_layer_ok(Some(self.layer)) {
            return;
        }

        let undef = ctx.undef_value(self.layer, global);
        col = apply_undef(col, undef, ctx.image_undef_color(self.layer));
        col.w *= self.opacity;
        *color = blend_under(*color, col);
    }
}
