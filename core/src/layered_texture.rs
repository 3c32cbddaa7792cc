//! The layered texture: data layers, the process stack over them and the
//! lazily rebuilt render state.
//!
//! Setters only raise dirty flags. Work happens in the `ensure_*` steps,
//! which always run in the same order: texture capabilities, tiling info,
//! texture units, then the shader program or the software composite.

use std::fmt;
use std::sync::Arc;

use glam::{Vec2, Vec4};
use smallvec::SmallVec;
use strata_shared::{Raster, TransparencyType};

use crate::capabilities::{CapabilityProvider, TextureInfo};
use crate::composite::CompositeJob;
use crate::config::{CompositorConfig, TextureSizePolicy};
use crate::cutout::{CutoutRequest, CutoutState};
use crate::error::LayerError;
use crate::layer::{DataLayer, FilterType, ImageChange, ImagePreparation, LayerId};
use crate::process::{LayerProcess, ProcessContext, ProcessStack};
use crate::registry::LayerRegistry;
use crate::shader::{self, FragmentShader, ProcessInfo};
use crate::state::{SamplerBinding, SetupState, ShaderCompiler, ShaderSource};
use crate::tiling::{SeamParams, TilingInfo, TilingPlan};

/// Dirty flags driving the lazy rebuilds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct UpdateState {
    /// Envelope must be recomputed
    tiling_needs_update: bool,
    /// Tiles and texture units must be redone by the owner
    retiling_needed: bool,
    /// Shader program or composite must be rebuilt
    setup_dirty: bool,
    /// Composite layer changed layout; tiles of it must be redone
    retile_composite: bool,
    /// Composite image must be recomputed on the next setup rebuild
    composite_needs_update: bool,
}

impl Default for UpdateState {
    fn default() -> Self {
        Self {
            tiling_needs_update: false,
            retiling_needed: true,
            setup_dirty: true,
            retile_composite: false,
            composite_needs_update: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dirty {
    Tiling,
    Retiling,
    Setup,
    RetileComposite,
}

impl UpdateState {
    fn flag_mut(&mut self, dirty: Dirty) -> &mut bool {
        match dirty {
            Dirty::Tiling => &mut self.tiling_needs_update,
            Dirty::Retiling => &mut self.retiling_needed,
            Dirty::Setup => &mut self.setup_dirty,
            Dirty::RetileComposite => &mut self.retile_composite,
        }
    }
}

type RedrawCallback = Box<dyn Fn() + Send + Sync>;

/// Multi-layer texture compositor.
///
/// Owns the data layers and the process stack, and produces the render
/// setup (shader program or software composite) and the per-tile cut-outs.
/// All mutation goes through `&mut self`; wrap it in a lock to share it
/// between an update thread and the render thread.
pub struct LayeredTexture {
    config: CompositorConfig,
    layers: LayerRegistry,
    processes: ProcessStack,
    composite_layer: LayerId,
    tiling: TilingInfo,
    texture_info: TextureInfo,
    update: UpdateState,
    setup_state: SetupState,
    is_on: bool,
    use_shaders: bool,
    reinit_tiling: bool,
    capabilities: Option<Arc<dyn CapabilityProvider>>,
    compiler: Option<Arc<dyn ShaderCompiler>>,
    redraw: Option<RedrawCallback>,
}

impl fmt::Debug for LayeredTexture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LayeredTexture")
            .field("config", &self.config)
            .field("layers", &self.layers)
            .field("processes", &self.processes)
            .field("composite_layer", &self.composite_layer)
            .field("tiling", &self.tiling)
            .field("update", &self.update)
            .field("is_on", &self.is_on)
            .field("use_shaders", &self.use_shaders)
            .finish_non_exhaustive()
    }
}

impl Default for LayeredTexture {
    fn default() -> Self {
        Self::new(CompositorConfig::default())
    }
}

impl LayeredTexture {
    pub fn new(config: CompositorConfig) -> Self {
        let mut layers = LayerRegistry::new();
        let composite_layer = layers.add();

        Self {
            config,
            layers,
            processes: ProcessStack::default(),
            composite_layer,
            tiling: TilingInfo::default(),
            texture_info: TextureInfo::default(),
            update: UpdateState::default(),
            setup_state: SetupState::default(),
            is_on: true,
            use_shaders: false,
            reinit_tiling: false,
            capabilities: None,
            compiler: None,
            redraw: None,
        }
    }

    /// Query texture capabilities from `provider`.
    pub fn with_capabilities(mut self, provider: Arc<dyn CapabilityProvider>) -> Self {
        self.set_capability_provider(Some(provider));
        self
    }

    /// Compile generated shaders with `compiler`.
    pub fn with_shader_compiler(mut self, compiler: Arc<dyn ShaderCompiler>) -> Self {
        self.compiler = Some(compiler);
        self.raise(Dirty::Setup);
        self
    }

    pub fn set_capability_provider(&mut self, provider: Option<Arc<dyn CapabilityProvider>>) {
        self.capabilities = provider;
        self.texture_info.invalidate();
        self.ensure_texture_info();
    }

    /// Called whenever a dirty flag goes up, so the owner can schedule a frame.
    pub fn set_redraw_callback(&mut self, callback: impl Fn() + Send + Sync + 'static) {
        self.redraw = Some(Box::new(callback));
    }

    pub fn config(&self) -> &CompositorConfig {
        &self.config
    }

    fn request_redraw(&self) {
        if let Some(redraw) = &self.redraw {
            redraw();
        }
    }

    fn raise(&mut self, dirty: Dirty) {
        self.set_dirty(dirty, true);
    }

    fn set_dirty(&mut self, dirty: Dirty, value: bool) {
        let flag = self.update.flag_mut(dirty);
        let raised = !*flag && value;
        *flag = value;
        if raised {
            self.request_redraw();
        }
    }

    // ---- Data layers ----

    /// Add a data layer and return its ID.
    pub fn add_data_layer(&mut self) -> LayerId {
        let id = self.layers.add();
        tracing::debug!("Added data layer {}", id);
        id
    }

    /// Remove a data layer.
    ///
    /// The composite layer cannot be removed, nor can a layer that still
    /// serves as another layer's undefined mask.
    pub fn remove_data_layer(&mut self, id: LayerId) -> Result<(), LayerError> {
        if id == self.composite_layer {
            return Err(LayerError::ReservedLayer(id));
        }

        match self.layers.remove(id) {
            Ok(retile) => {
                if retile {
                    self.raise(Dirty::Retiling);
                }
                self.raise(Dirty::Tiling);
                Ok(())
            }
            Err(err) => {
                tracing::warn!("Data layer {} not removed: {}", id, err);
                Err(err)
            }
        }
    }

    /// ID of the layer holding the software composite
    pub fn composite_layer_id(&self) -> LayerId {
        self.composite_layer
    }

    pub fn nr_data_layers(&self) -> usize {
        self.layers.len()
    }

    pub fn data_layer_id(&self, index: usize) -> Option<LayerId> {
        self.layers.id_at(index)
    }

    pub fn data_layer_index(&self, id: LayerId) -> Option<usize> {
        self.layers.index_of(id)
    }

    pub fn data_layer(&self, id: LayerId) -> Option<&DataLayer> {
        self.layers.get(id)
    }

    pub fn layers(&self) -> &LayerRegistry {
        &self.layers
    }

    /// Whether the layer exists and has an image
    pub fn is_data_layer_ok(&self, id: LayerId) -> bool {
        self.layers.is_layer_ok(Some(id))
    }

    pub fn set_data_layer_origin(&mut self, id: LayerId, origin: Vec2) -> Result<(), LayerError> {
        self.layers.try_get_mut(id)?.origin = origin;
        self.raise(Dirty::Tiling);
        Ok(())
    }

    /// Set the global size of one source pixel; requires `x >= 0` and `y > 0`.
    pub fn set_data_layer_scale(&mut self, id: LayerId, scale: Vec2) -> Result<(), LayerError> {
        let layer = self.layers.try_get_mut(id)?;
        if scale.x < 0.0 || scale.y <= 0.0 {
            return Err(LayerError::InvalidScale {
                x: scale.x,
                y: scale.y,
            });
        }
        layer.scale = scale;
        self.raise(Dirty::Tiling);
        Ok(())
    }

    /// Edit a layer's image in place; the change is picked up on the next
    /// setup pass without re-tiling unless the size changed.
    pub fn modify_data_layer_image(
        &mut self,
        id: LayerId,
        edit: impl FnOnce(&mut Raster),
    ) -> Result<(), LayerError> {
        self.layers.try_get_mut(id)?.modify_source(edit)?;
        self.raise(Dirty::Setup);
        Ok(())
    }

    /// Set or clear the image of a layer.
    ///
    /// With `freeze_while_empty`, clearing the image freezes the display
    /// until a new image arrives.
    pub fn set_data_layer_image(
        &mut self,
        id: LayerId,
        image: Option<Arc<Raster>>,
        freeze_while_empty: bool,
    ) -> Result<(), LayerError> {
        let preparation = ImagePreparation {
            pad_to_power_of_2: self.config.texture_size_policy != TextureSizePolicy::AnySize
                && id != self.composite_layer,
            max_copy_size: self.config.max_texture_copy_size,
        };

        let layer = self.layers.try_get_mut(id)?;
        let was_frozen = layer.is_display_frozen();
        let change = layer.set_image(image, freeze_while_empty, preparation);
        if layer.is_display_frozen() && !was_frozen {
            self.request_redraw();
        }

        match change? {
            ImageChange::Relayout | ImageChange::Cleared => self.raise(Dirty::Tiling),
            ImageChange::SameLayout => self.raise(Dirty::Setup),
            ImageChange::Unchanged => {}
        }
        Ok(())
    }

    /// Use `channel` of layer `undef` as undefined mask of layer `id`.
    pub fn set_data_layer_undef_layer(&mut self, id: LayerId, undef: Option<LayerId>) -> Result<(), LayerError> {
        let retile = self.layers.set_undef_layer(id, undef)?;
        self.raise(Dirty::Setup);
        if retile {
            self.raise(Dirty::Retiling);
        }
        Ok(())
    }

    pub fn set_data_layer_undef_channel(&mut self, id: LayerId, channel: usize) -> Result<(), LayerError> {
        let retile = self.layers.set_undef_channel(id, channel)?;
        self.raise(Dirty::Setup);
        if retile {
            self.raise(Dirty::Retiling);
        }
        Ok(())
    }

    /// Color that fully undefined pixels of the layer take; negative components are unset.
    pub fn set_data_layer_image_undef_color(&mut self, id: LayerId, color: Vec4) -> Result<(), LayerError> {
        let layer = self.layers.try_get_mut(id)?;
        layer.set_undef_color_source(color);
        if layer.texture_unit().is_some() {
            self.raise(Dirty::Setup);
        }
        Ok(())
    }

    /// Uniform color outside the image, or `None` to extend the edge pixels.
    pub fn set_data_layer_border_color(&mut self, id: LayerId, color: Option<Vec4>) -> Result<(), LayerError> {
        let layer = self.layers.try_get_mut(id)?;
        layer.set_border_color_source(color);
        if layer.texture_unit().is_some() {
            self.raise(Dirty::Retiling);
        }
        Ok(())
    }

    pub fn set_data_layer_filter_type(&mut self, id: LayerId, filter: FilterType) -> Result<(), LayerError> {
        let layer = self.layers.try_get_mut(id)?;
        layer.filter_type = filter;
        if layer.texture_unit().is_some() {
            self.raise(Dirty::Retiling);
        }
        Ok(())
    }

    pub fn data_layer_transparency_type(&self, id: LayerId, channel: usize) -> TransparencyType {
        self.layers
            .get(id)
            .map_or(TransparencyType::FullyTransparent, |layer| layer.transparency_type(channel))
    }

    /// Sample a layer at a global coordinate
    pub fn data_layer_texture_vec(&self, id: LayerId, global: Vec2) -> Option<Vec4> {
        self.layers.get(id).map(|layer| layer.texture_vec(global))
    }

    /// Layers whose tile textures went stale without a layout change, since the last call
    pub fn take_dirty_tile_layers(&mut self) -> Vec<LayerId> {
        self.layers
            .iter_mut()
            .filter_map(|layer| std::mem::take(&mut layer.tile_images_dirty).then_some(layer.id()))
            .collect()
    }

    // ---- Stack-wide undefined mask ----

    pub fn set_stack_undef_layer(&mut self, undef: Option<LayerId>) {
        let retile = self.layers.set_stack_undef_layer(undef);
        self.raise(Dirty::Setup);
        if retile {
            self.raise(Dirty::Retiling);
        }
    }

    pub fn set_stack_undef_channel(&mut self, channel: usize) -> Result<(), LayerError> {
        let retile = self.layers.set_stack_undef_channel(channel)?;
        self.raise(Dirty::Setup);
        if retile {
            self.raise(Dirty::Retiling);
        }
        Ok(())
    }

    /// Color of fully masked composite pixels, clamped to [0, 1].
    pub fn set_stack_undef_color(&mut self, color: Vec4) {
        self.layers.stack_undef_color = color.clamp(Vec4::ZERO, Vec4::ONE);
    }

    pub fn stack_undef_layer(&self) -> Option<LayerId> {
        self.layers.stack_undef_layer
    }

    pub fn stack_undef_channel(&self) -> usize {
        self.layers.stack_undef_channel
    }

    pub fn stack_undef_color(&self) -> Vec4 {
        self.layers.stack_undef_color
    }

    // ---- Processes ----

    pub fn processes(&self) -> &ProcessStack {
        &self.processes
    }

    /// Put a process on top of the stack.
    pub fn add_process(&mut self, process: Arc<dyn LayerProcess>) {
        self.processes.push(process);
        self.raise(Dirty::Setup);
    }

    pub fn remove_process(&mut self, process: &Arc<dyn LayerProcess>) -> bool {
        let removed = self.processes.remove(process);
        if removed {
            self.raise(Dirty::Setup);
        }
        removed
    }

    pub fn move_process_earlier(&mut self, process: &Arc<dyn LayerProcess>) -> bool {
        let moved = self.processes.move_earlier(process);
        if moved {
            self.raise(Dirty::Setup);
        }
        moved
    }

    pub fn move_process_later(&mut self, process: &Arc<dyn LayerProcess>) -> bool {
        let moved = self.processes.move_later(process);
        if moved {
            self.raise(Dirty::Setup);
        }
        moved
    }

    // ---- Global knobs ----

    /// When off, no process contributes to the composite.
    pub fn turn_on(&mut self, on: bool) {
        if self.is_on != on {
            self.raise(Dirty::Retiling);
            self.is_on = on;
        }
    }

    pub fn is_on(&self) -> bool {
        self.is_on
    }

    pub fn allow_shaders(&mut self, allow: bool, may_skip_early_processes: bool) {
        if self.config.allow_shaders != allow || self.config.may_skip_early_processes != may_skip_early_processes {
            self.config.allow_shaders = allow;
            self.config.may_skip_early_processes = may_skip_early_processes;
            self.raise(Dirty::Retiling);
        }
    }

    pub fn are_shaders_allowed(&self) -> bool {
        self.config.allow_shaders
    }

    /// Whether the last setup rebuild produced a shader program
    pub fn uses_shaders(&self) -> bool {
        self.use_shaders
    }

    pub fn set_texture_size_policy(&mut self, policy: TextureSizePolicy) {
        self.config.texture_size_policy = policy;
        self.raise(Dirty::Retiling);
    }

    pub fn texture_size_policy(&self) -> TextureSizePolicy {
        self.config.texture_size_policy
    }

    /// Configured policy, degraded to power-of-two sizes when the context
    /// lacks non-power-of-two support.
    pub fn used_texture_size_policy(&self) -> TextureSizePolicy {
        if self.config.texture_size_policy == TextureSizePolicy::AnySize
            && !self.texture_info.caps.non_power_of_2_support
        {
            return TextureSizePolicy::PowerOf2;
        }
        self.config.texture_size_policy
    }

    /// Largest padded width x height a layer image may be resampled to.
    /// Takes effect on the next image modification check.
    pub fn set_max_texture_copy_size(&mut self, width_x_height: u32) {
        self.config.max_texture_copy_size = width_x_height;
        for layer in self.layers.iter_mut() {
            layer.image_modified_flag = false;
            layer.invalidate_resampled_image();
        }
    }

    /// Seam doublings along `axis` (0 or 1), or both axes for any other value.
    pub fn set_seam_power(&mut self, power: u32, axis: usize) {
        if axis != 1 {
            self.config.seam_power[0] = power;
        }
        if axis != 0 {
            self.config.seam_power[1] = power;
        }
        self.raise(Dirty::Retiling);
    }

    pub fn seam_power(&self, axis: usize) -> u32 {
        self.config.seam_power[usize::from(axis > 0)]
    }

    /// Render into one graphics context only, or all contexts for `None`.
    pub fn set_graphics_context_id(&mut self, context_id: Option<u32>) {
        self.texture_info.set_context_id(context_id);
        self.ensure_texture_info();
    }

    pub fn graphics_context_id(&self) -> Option<u32> {
        self.texture_info.context_id
    }

    /// Cap the queried maximum texture size (halving it while above the cap).
    pub fn set_max_texture_size_override(&mut self, max_size: Option<u32>) {
        self.config.max_texture_size_override = max_size;
        self.texture_info.invalidate();
        self.ensure_texture_info();
    }

    // ---- Lazy updates ----

    fn ensure_texture_info(&mut self) {
        if self.texture_info.is_valid {
            return;
        }
        // Keep frames coming until the capabilities can be queried
        self.request_redraw();

        let provider = self.capabilities.as_deref();
        if self.texture_info.update(provider, self.config.max_texture_size_override) {
            self.update.retiling_needed = true;
        }
    }

    fn ensure_tiling_info(&mut self) {
        if !self.update.tiling_needs_update {
            return;
        }
        self.tiling = TilingInfo::compute(&self.layers, self.composite_layer);
        self.update.tiling_needs_update = false;
        self.update.retiling_needed = true;

        tracing::debug!(
            "Tiling envelope origin {:?} size {:?}, smallest scale {:?}",
            self.tiling.envelope_origin,
            self.tiling.envelope_size,
            self.tiling.smallest_scale
        );
    }

    fn seam_params(&self) -> SeamParams {
        SeamParams {
            max_texture_size: self.texture_info.caps.max_size,
            seam_power: self.config.seam_power,
            external_texel_size_ratio: self.config.external_texel_size_ratio,
        }
    }

    fn nr_units(&self) -> u32 {
        self.texture_info.caps.nr_units
    }

    fn process_info(&self) -> ProcessInfo {
        shader::process_info(
            &self.layers,
            &self.processes,
            self.is_on,
            self.nr_units(),
            self.config.may_skip_early_processes,
        )
    }

    /// True while a layer image is cleared with the freeze flag
    pub fn is_display_frozen(&self) -> bool {
        self.layers.iter().any(DataLayer::is_display_frozen)
    }

    /// Whether the owner must redo its tiles (and call [`reinit_tiling`](Self::reinit_tiling)).
    pub fn needs_retiling(&mut self) -> bool {
        if self.is_display_frozen() {
            return false;
        }
        self.ensure_tiling_info();
        self.ensure_texture_info();
        self.update.retiling_needed || self.update.retile_composite
    }

    /// Current envelope, recomputed if needed
    pub fn tiling_info(&mut self) -> TilingInfo {
        self.ensure_tiling_info();
        self.tiling
    }

    pub fn is_envelope_defined(&mut self) -> bool {
        self.tiling_info().is_envelope_defined()
    }

    pub fn image_envelope_size(&mut self) -> Vec2 {
        self.tiling_info().envelope_size
    }

    pub fn texture_envelope_size(&mut self) -> Vec2 {
        self.tiling_info().texture_envelope_size()
    }

    pub fn envelope_center(&mut self) -> Vec2 {
        self.tiling_info().envelope_center()
    }

    pub fn tiling_plan_resolution(&mut self) -> Vec2 {
        self.tiling_info().plan_resolution()
    }

    /// Maximum texture size, or `None` while capabilities are unknown
    pub fn max_texture_size(&mut self) -> Option<u32> {
        self.ensure_texture_info();
        self.texture_info.is_valid.then_some(self.texture_info.caps.max_size)
    }

    /// Number of texture units, or `None` while capabilities are unknown
    pub fn nr_texture_units(&mut self) -> Option<u32> {
        self.ensure_texture_info();
        self.texture_info.is_valid.then_some(self.texture_info.caps.nr_units)
    }

    /// Seam width in layer pixels of layer `id` along `axis`
    pub fn seam_width(&mut self, id: LayerId, axis: usize) -> u32 {
        self.ensure_tiling_info();
        let params = self.seam_params();
        self.layers
            .get(id)
            .map_or(1, |layer| self.tiling.seam_width(layer, axis, &params))
    }

    /// Upper bound on tile overlap along `axis`, in tiling-plan pixels
    pub fn tile_overlap_upper_bound(&mut self, axis: usize) -> u32 {
        if axis > 1 {
            return 0;
        }
        self.ensure_tiling_info();
        let params = self.seam_params();
        self.tiling
            .tile_overlap_upper_bound(&self.layers, self.composite_layer, axis, &params)
    }

    /// Divide the envelope into bricks of about `brick_size` tiling-plan pixels.
    pub fn plan_tiling(&mut self, brick_size: u16, strict: bool) -> TilingPlan {
        self.ensure_tiling_info();
        self.ensure_texture_info();
        let params = self.seam_params();
        self.tiling.plan_tiling(
            brick_size,
            strict,
            self.config.texture_size_policy,
            &self.layers,
            self.composite_layer,
            &params,
        )
    }

    /// Refresh tiling and capabilities, reassign texture units and mark the
    /// tiling as redone.
    pub fn reinit_tiling(&mut self, texel_size_ratio: f32) {
        self.reinit_tiling = true;
        self.ensure_tiling_info();
        self.ensure_texture_info();
        self.assign_texture_units();

        for layer in self.layers.iter_mut() {
            layer.tile_images_dirty = false;
        }

        self.set_dirty(Dirty::Retiling, false);
        self.config.external_texel_size_ratio = texel_size_ratio;
        self.reinit_tiling = false;
    }

    fn assign_texture_units(&mut self) {
        self.use_shaders = self.config.allow_shaders && self.texture_info.caps.shading_support;

        let mut info = ProcessInfo::default();
        if self.use_shaders {
            info = self.process_info();
            self.use_shaders = info.use_shaders;
        }
        let nr_units = self.nr_units();
        shader::assign_texture_units(&mut self.layers, &info, nr_units, self.composite_layer);

        if self.update.retiling_needed || self.update.setup_dirty {
            self.set_dirty(Dirty::RetileComposite, false);
        }
        self.raise(Dirty::Setup);
        self.ensure_setup_state();
    }

    /// Force a setup rebuild on the next [`setup_state`](Self::setup_state).
    pub fn update_setup_state(&mut self) {
        self.raise(Dirty::Setup);
    }

    /// Render state shared by all tiles, rebuilt if needed.
    pub fn setup_state(&mut self) -> &SetupState {
        self.ensure_setup_state();
        &self.setup_state
    }

    fn ensure_setup_state(&mut self) {
        if self.is_display_frozen() {
            return;
        }

        self.check_for_modified_images();

        if self.is_on {
            let mut modified = false;
            for process in self.processes.iter() {
                modified |= process.check_for_modified_color_sequence();
            }
            if modified {
                self.raise(Dirty::Setup);
            }
        }

        if self.update.setup_dirty {
            self.update.composite_needs_update = !self.update.retile_composite;
            self.build_shaders();
            self.set_dirty(Dirty::Setup, false);
        }
    }

    /// Re-apply images whose contents changed since they were set.
    fn check_for_modified_images(&mut self) {
        let mut modified: SmallVec<[LayerId; 8]> = SmallVec::new();
        for layer in self.layers.iter_mut() {
            layer.image_modified_flag = false;
            if layer.source_modified() {
                modified.push(layer.id());
            }
        }

        for id in &modified {
            let image = self.layers.get(*id).and_then(|layer| layer.image().cloned());
            if let Err(err) = self.set_data_layer_image(*id, image, false) {
                tracing::warn!("Modified image of layer {} not re-applied: {}", id, err);
            }
            if let Some(layer) = self.layers.get_mut(*id) {
                layer.image_modified_flag = true;
            }
            self.raise(Dirty::Setup);
        }

        if modified.is_empty() {
            return;
        }
        for layer in self.layers.iter_mut() {
            if layer.undef_layer.is_some_and(|undef| modified.contains(&undef)) {
                layer.clear_transparency_type();
            }
        }
    }

    fn set_rendering_hint(&mut self, stack_is_opaque: bool) {
        let masked = self.layers.is_layer_ok(self.layers.stack_undef_layer)
            && self.layers.stack_undef_color.w < 1.0;
        self.setup_state.set_rendering_hint(stack_is_opaque && !masked);
    }

    fn build_shaders(&mut self) {
        self.use_shaders = self.config.allow_shaders && self.texture_info.caps.shading_support;

        let mut info = ProcessInfo::default();
        if self.use_shaders {
            info = self.process_info();
            self.use_shaders = info.use_shaders;
        }

        if !self.use_shaders {
            let create = !self.update.retile_composite;
            self.set_dirty(Dirty::RetileComposite, false);
            if create {
                self.create_composite_texture(!self.texture_info.is_valid);
            }

            if !self.update.retile_composite {
                self.setup_state.clear();
                let opaque = self.data_layer_transparency_type(self.composite_layer, 3)
                    == TransparencyType::Opaque;
                self.set_rendering_hint(opaque);
            }
            return;
        }

        let mut needs_color_sequence = false;
        let mut unassigned = false;
        let mut min_unit = u32::MAX;
        let mut units: SmallVec<[u32; 8]> = SmallVec::new();

        for id in info.used_layers() {
            if id.is_color_sequence() {
                needs_color_sequence = true;
                continue;
            }
            match self.layers.get(*id).and_then(DataLayer::texture_unit) {
                Some(unit) => {
                    units.push(unit);
                    min_unit = min_unit.min(unit);
                }
                None => unassigned = true,
            }
        }

        if unassigned || (min_unit == 0 && needs_color_sequence) {
            self.raise(Dirty::Retiling);
            return;
        }

        self.setup_state.clear();

        let vertex = shader::vertex_shader_code(&units);
        let fragment = FragmentShader {
            layers: &self.layers,
            processes: &self.processes,
            is_on: self.is_on,
            units: &units,
            color_sequence: needs_color_sequence,
            nr_proc: info.nr_proc,
            stack_is_opaque: info.stack_is_opaque,
        }
        .code();
        let source = ShaderSource { vertex, fragment };

        if let Some(compiler) = &self.compiler {
            match compiler.compile(&source) {
                Ok(program) => self.setup_state.program = Some(program),
                Err(err) => tracing::warn!("Layered texture shader not compiled: {}", err),
            }
        }

        if needs_color_sequence {
            self.setup_state.color_sequence = Some(Arc::new(shader::color_sequence_raster(&self.processes)));
            units.push(0);
        }

        self.setup_state.samplers = units
            .iter()
            .map(|unit| SamplerBinding {
                name: format!("texture{unit}"),
                unit: *unit,
            })
            .collect();
        self.setup_state.shader = Some(source);
        self.set_rendering_hint(info.stack_is_opaque);

        tracing::debug!(
            "Built layered texture shader: {} processes over {} units",
            info.nr_proc,
            self.setup_state.samplers.len()
        );
    }

    /// Recompute the software composite if flagged.
    fn create_composite_texture(&mut self, dummy: bool) {
        if !self.update.composite_needs_update {
            return;
        }
        self.update.composite_needs_update = false;
        self.ensure_tiling_info();

        let tiling = self.tiling;
        let cells = (tiling.envelope_size / tiling.smallest_scale).ceil();
        let dummy = dummy || !cells.is_finite();
        let width = if dummy || cells.x < 1.0 { 1 } else { cells.x as u32 };
        let height = if dummy || cells.y < 1.0 { 1 } else { cells.y as u32 };
        let scale = tiling.envelope_size / Vec2::new(width as f32, height as f32);

        let Some(composite) = self.layers.get_mut(self.composite_layer) else {
            return;
        };
        composite.origin = tiling.envelope_origin;
        composite.scale = scale;
        let border_color = composite.border_color();
        let border_pixel = composite.has_border_color();

        let output = {
            let ctx = ProcessContext::new(&self.layers);
            let mut processes = Vec::new();
            let mut min_opacity = 1.0f32;
            if self.is_on {
                for process in self.processes.iter() {
                    if process.transparency_type(&ctx) != TransparencyType::FullyTransparent {
                        processes.push(process);
                    }
                    min_opacity = min_opacity.min(process.opacity());
                }
            }

            CompositeJob {
                layers: &self.layers,
                processes,
                min_opacity,
                dummy,
                origin: tiling.envelope_origin,
                scale,
                width,
                height,
                border_pixel,
            }
            .run()
        };

        let output = match output {
            Ok(output) => output,
            Err(err) => {
                tracing::warn!("Composite texture not created: {}", err);
                return;
            }
        };

        let new_border = output.border_color.unwrap_or(border_color);
        let reinit = self.reinit_tiling;
        let use_shaders = self.use_shaders;
        let Some(composite) = self.layers.get_mut(self.composite_layer) else {
            return;
        };
        let resized = composite.set_composite_image(Arc::new(output.raster));
        let retile = !(reinit || use_shaders)
            && (resized || composite.texture_unit() != Some(0) || new_border != composite.border_color());
        composite.set_border_color_source(Some(new_border));

        self.set_dirty(Dirty::RetileComposite, retile);
    }

    /// Software composite of the whole stack, recomputed on every call.
    pub fn composite_texture_image(&mut self) -> Option<Arc<Raster>> {
        self.update.composite_needs_update = true;
        self.create_composite_texture(false);
        self.layers
            .get(self.composite_layer)
            .and_then(|layer| layer.working_image().cloned())
    }

    /// Tile textures and texture coordinates covering `[origin, opposite]`,
    /// given in tiling-plan pixels.
    pub fn create_cutout_state(&mut self, origin: Vec2, opposite: Vec2) -> CutoutState {
        self.ensure_tiling_info();
        self.ensure_texture_info();
        let params = self.seam_params();
        CutoutRequest {
            layers: &self.layers,
            tiling: &self.tiling,
            seam: &params,
            policy: self.config.texture_size_policy,
            used_policy: self.used_texture_size_policy(),
        }
        .build(origin, opposite)
    }
}
