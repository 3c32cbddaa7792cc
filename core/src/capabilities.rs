//! Graphics-context texture capabilities.

use hashbrown::HashMap;

/// Texture limits of one graphics context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureCapabilities {
    /// Number of texture units available to a fragment shader
    pub nr_units: u32,
    /// Largest texture dimension
    pub max_size: u32,
    pub non_power_of_2_support: bool,
    pub shading_support: bool,
}

impl Default for TextureCapabilities {
    /// Values assumed while no context could be queried
    fn default() -> Self {
        Self {
            nr_units: 256,
            max_size: 65536,
            non_power_of_2_support: false,
            shading_support: false,
        }
    }
}

/// Source of per-context texture capabilities.
pub trait CapabilityProvider: Send + Sync {
    /// Highest graphics-context ID in use
    fn max_context_id(&self) -> u32;

    /// Capabilities of a context, or `None` if it cannot be queried yet
    fn capabilities(&self, context_id: u32) -> Option<TextureCapabilities>;
}

/// Provider reporting fixed capabilities for a single context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StaticCapabilities(pub TextureCapabilities);

impl CapabilityProvider for StaticCapabilities {
    fn max_context_id(&self) -> u32 {
        0
    }

    fn capabilities(&self, context_id: u32) -> Option<TextureCapabilities> {
        (context_id == 0).then_some(self.0)
    }
}

/// Merged capabilities of the contexts the compositor renders into.
#[derive(Debug, Default)]
pub(crate) struct TextureInfo {
    pub is_valid: bool,
    pub context_id: Option<u32>,
    pub caps: TextureCapabilities,
    cache: HashMap<u32, TextureCapabilities>,
}

impl TextureInfo {
    pub fn set_context_id(&mut self, context_id: Option<u32>) {
        self.context_id = context_id;
        self.is_valid = false;
        self.caps.shading_support = false;
    }

    pub fn invalidate(&mut self) {
        self.is_valid = false;
        self.cache.clear();
    }

    /// Query the provider unless already valid. Returns true when the info
    /// became valid, in which case tiling and units must be redone.
    pub fn update(&mut self, provider: Option<&dyn CapabilityProvider>, max_size_override: Option<u32>) -> bool {
        if self.is_valid {
            return false;
        }
        let Some(provider) = provider else {
            return false;
        };

        for context_id in 0..=provider.max_context_id() {
            if self.context_id.is_some_and(|id| id != context_id) {
                continue;
            }

            let caps = match self.cache.get(&context_id) {
                Some(caps) => *caps,
                None => match provider.capabilities(context_id) {
                    Some(caps) => {
                        self.cache.insert(context_id, caps);
                        caps
                    }
                    None => continue,
                },
            };

            let first = !self.is_valid;
            if first || self.caps.nr_units > caps.nr_units {
                self.caps.nr_units = caps.nr_units;
            }

            if first || self.caps.max_size > caps.max_size {
                self.caps.max_size = caps.max_size;
                while let Some(limit) = max_size_override {
                    if self.caps.max_size <= limit || self.caps.max_size <= 64 {
                        break;
                    }
                    self.caps.max_size /= 2;
                }
            }

            if first || self.caps.non_power_of_2_support {
                self.caps.non_power_of_2_support = caps.non_power_of_2_support;
            }

            if first || self.caps.shading_support {
                self.caps.shading_support = caps.shading_support && self.caps.nr_units > 0;
            }

            self.is_valid = true;
        }

        if self.is_valid {
            tracing::debug!(
                "Texture capabilities: {} units, max size {}, npot {}, shading {}",
                self.caps.nr_units,
                self.caps.max_size,
                self.caps.non_power_of_2_support,
                self.caps.shading_support
            );
        }
        self.is_valid
    }
}
