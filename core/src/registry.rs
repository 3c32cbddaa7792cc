//! Ordered data-layer table with stable IDs and undefined-mask reference counts.

use std::collections::BTreeSet;

use glam::Vec4;

use crate::error::LayerError;
use crate::layer::{DataLayer, LayerId};

/// Table size from which released IDs are handed out again
pub const START_RECYCLING_ID: u32 = 100;

/// Whose undefined-mask reference is being counted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum UndefOwner {
    Stack,
    Layer(usize),
}

/// Data layers in insertion order plus the id-to-index table.
///
/// Also holds the stack-wide undefined mask, since it takes part in the same
/// reference counting as per-layer masks.
#[derive(Debug)]
pub struct LayerRegistry {
    layers: Vec<DataLayer>,
    /// Indexed by ID; entry 0 is never used
    id_to_index: Vec<Option<usize>>,
    released_ids: BTreeSet<u32>,
    pub(crate) stack_undef_layer: Option<LayerId>,
    pub(crate) stack_undef_channel: usize,
    pub(crate) stack_undef_color: Vec4,
}

impl Default for LayerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl LayerRegistry {
    pub fn new() -> Self {
        Self {
            layers: Vec::new(),
            id_to_index: vec![None],
            released_ids: BTreeSet::new(),
            stack_undef_layer: None,
            stack_undef_channel: 0,
            stack_undef_color: Vec4::ZERO,
        }
    }

    /// Append a layer and return its ID.
    ///
    /// IDs grow monotonically until the table reaches [`START_RECYCLING_ID`]
    /// entries; after that the lowest released ID is reused first.
    pub fn add(&mut self) -> LayerId {
        let mut free_id = self.id_to_index.len() as u32;
        if free_id >= START_RECYCLING_ID {
            if let Some(released) = self.released_ids.pop_first() {
                free_id = released;
            }
        }

        let index = self.layers.len();
        match self.id_to_index.get_mut(free_id as usize) {
            Some(slot) => *slot = Some(index),
            None => self.id_to_index.push(Some(index)),
        }

        let id = LayerId(free_id);
        self.layers.push(DataLayer::new(id));
        id
    }

    /// Remove a layer.
    ///
    /// Refused while any channel of the layer still serves as undefined mask
    /// elsewhere. A layer referencing itself does not count. Returns whether
    /// retiling became necessary.
    pub fn remove(&mut self, id: LayerId) -> Result<bool, LayerError> {
        let index = self.index_of(id).ok_or(LayerError::UnknownLayer(id))?;
        let layer = &self.layers[index];

        for channel in 0..4 {
            let mut count = layer.undef_channel_ref_count[channel];
            if layer.undef_layer == Some(id) && layer.undef_channel == channel {
                count = count.saturating_sub(1);
            }
            if count > 0 {
                return Err(LayerError::StillReferenced { id, channel, count });
            }
        }

        let retile = self.raise_undef_ref_count(false, UndefOwner::Layer(index));
        self.layers.remove(index);
        self.id_to_index[id.0 as usize] = None;
        for (idx, layer) in self.layers.iter().enumerate().skip(index) {
            self.id_to_index[layer.id().0 as usize] = Some(idx);
        }
        self.released_ids.insert(id.0);

        tracing::debug!("Removed data layer {}", id);
        Ok(retile)
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn index_of(&self, id: LayerId) -> Option<usize> {
        self.id_to_index.get(id.0 as usize).copied().flatten()
    }

    pub fn id_at(&self, index: usize) -> Option<LayerId> {
        self.layers.get(index).map(DataLayer::id)
    }

    pub fn get(&self, id: LayerId) -> Option<&DataLayer> {
        self.index_of(id).map(|idx| &self.layers[idx])
    }

    pub(crate) fn get_mut(&mut self, id: LayerId) -> Option<&mut DataLayer> {
        self.index_of(id).map(|idx| &mut self.layers[idx])
    }

    pub(crate) fn try_get_mut(&mut self, id: LayerId) -> Result<&mut DataLayer, LayerError> {
        self.get_mut(id).ok_or(LayerError::UnknownLayer(id))
    }

    pub fn iter(&self) -> impl Iterator<Item = &DataLayer> {
        self.layers.iter()
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut DataLayer> {
        self.layers.iter_mut()
    }

    pub(crate) fn layers(&self) -> &[DataLayer] {
        &self.layers
    }

    /// Whether the ID names a layer with an image
    pub fn is_layer_ok(&self, id: Option<LayerId>) -> bool {
        id.and_then(|id| self.get(id))
            .is_some_and(|layer| layer.image().is_some())
    }

    /// Point a layer's undefined mask at another layer. Returns whether
    /// retiling became necessary.
    pub(crate) fn set_undef_layer(
        &mut self,
        id: LayerId,
        undef: Option<LayerId>,
    ) -> Result<bool, LayerError> {
        let index = self.index_of(id).ok_or(LayerError::UnknownLayer(id))?;
        let mut retile = self.raise_undef_ref_count(false, UndefOwner::Layer(index));
        self.layers[index].undef_layer = undef;
        retile |= self.raise_undef_ref_count(true, UndefOwner::Layer(index));
        Ok(retile)
    }

    /// Select the mask channel; an unset mask layer defaults to the layer itself.
    pub(crate) fn set_undef_channel(&mut self, id: LayerId, channel: usize) -> Result<bool, LayerError> {
        let index = self.index_of(id).ok_or(LayerError::UnknownLayer(id))?;
        if channel > 3 {
            return Err(LayerError::InvalidChannel(channel));
        }

        let mut retile = self.raise_undef_ref_count(false, UndefOwner::Layer(index));
        let layer = &mut self.layers[index];
        layer.undef_channel = channel;
        if layer.undef_layer.is_none() {
            layer.undef_layer = Some(id);
        }
        retile |= self.raise_undef_ref_count(true, UndefOwner::Layer(index));
        Ok(retile)
    }

    pub(crate) fn set_stack_undef_layer(&mut self, undef: Option<LayerId>) -> bool {
        let mut retile = self.raise_undef_ref_count(false, UndefOwner::Stack);
        self.stack_undef_layer = undef;
        retile |= self.raise_undef_ref_count(true, UndefOwner::Stack);
        retile
    }

    pub(crate) fn set_stack_undef_channel(&mut self, channel: usize) -> Result<bool, LayerError> {
        if channel > 3 {
            return Err(LayerError::InvalidChannel(channel));
        }
        let mut retile = self.raise_undef_ref_count(false, UndefOwner::Stack);
        self.stack_undef_channel = channel;
        retile |= self.raise_undef_ref_count(true, UndefOwner::Stack);
        Ok(retile)
    }

    /// Adjust the reference count on the mask channel `owner` points at.
    ///
    /// Returns true when a textured mask layer gains its first or loses its
    /// last reference, which changes the set of textures to bind.
    pub(crate) fn raise_undef_ref_count(&mut self, up: bool, owner: UndefOwner) -> bool {
        let (undef_id, channel) = match owner {
            UndefOwner::Stack => (self.stack_undef_layer, self.stack_undef_channel),
            UndefOwner::Layer(index) => match self.layers.get(index) {
                Some(layer) => (layer.undef_layer, layer.undef_channel),
                None => return false,
            },
        };

        let Some(undef_index) = undef_id.and_then(|id| self.index_of(id)) else {
            return false;
        };

        let layer = &mut self.layers[undef_index];
        let count = &mut layer.undef_channel_ref_count[channel];
        if up {
            *count += 1;
        } else {
            *count = count.saturating_sub(1);
        }

        let count = *count;
        layer.texture_unit.is_some() && (count == 0 || (up && count == 1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_start_at_one() {
        let mut registry = LayerRegistry::new();
        assert_eq!(registry.add(), LayerId(1));
        assert_eq!(registry.add(), LayerId(2));
        assert_eq!(registry.index_of(LayerId(2)), Some(1));
        assert_eq!(registry.index_of(LayerId::COLOR_SEQUENCE), None);
    }

    #[test]
    fn test_remove_shifts_indices() {
        let mut registry = LayerRegistry::new();
        let a = registry.add();
        let b = registry.add();
        let c = registry.add();

        registry.remove(b).unwrap();
        assert_eq!(registry.index_of(a), Some(0));
        assert_eq!(registry.index_of(b), None);
        assert_eq!(registry.index_of(c), Some(1));
        assert_eq!(registry.id_at(1), Some(c));
    }

    #[test]
    fn test_released_ids_reused_after_threshold() {
        let mut registry = LayerRegistry::new();
        let ids: Vec<LayerId> = (0..120).map(|_| registry.add()).collect();

        registry.remove(ids[40]).unwrap();
        registry.remove(ids[10]).unwrap();

        // Lowest released ID first
        assert_eq!(registry.add(), ids[10]);
        assert_eq!(registry.add(), ids[40]);
        assert_eq!(registry.add(), LayerId(121));
    }

    #[test]
    fn test_released_ids_not_reused_below_threshold() {
        let mut registry = LayerRegistry::new();
        let a = registry.add();
        registry.add();
        registry.remove(a).unwrap();
        assert_eq!(registry.add(), LayerId(3));
    }

    #[test]
    fn test_undef_references_are_counted() {
        let mut registry = LayerRegistry::new();
        let mask = registry.add();
        let user = registry.add();

        registry.set_undef_layer(user, Some(mask)).unwrap();
        registry.set_undef_channel(user, 2).unwrap();
        assert_eq!(registry.get(mask).unwrap().undef_channel_ref_count(2), 1);
        assert_eq!(registry.get(mask).unwrap().undef_channel_ref_count(0), 0);

        registry.set_stack_undef_layer(Some(mask));
        assert_eq!(registry.get(mask).unwrap().undef_channel_ref_count(0), 1);

        registry.set_undef_layer(user, None).unwrap();
        assert_eq!(registry.get(mask).unwrap().undef_channel_ref_count(2), 0);
    }

    #[test]
    fn test_referenced_layer_cannot_be_removed() {
        let mut registry = LayerRegistry::new();
        let mask = registry.add();
        let user = registry.add();
        registry.set_undef_layer(user, Some(mask)).unwrap();

        let err = registry.remove(mask).unwrap_err();
        assert_eq!(
            err,
            LayerError::StillReferenced {
                id: mask,
                channel: 0,
                count: 1
            }
        );
        assert_eq!(registry.len(), 2);

        // Removing the referencing layer releases the reference
        registry.remove(user).unwrap();
        assert_eq!(registry.get(mask).unwrap().undef_channel_ref_count(0), 0);
        registry.remove(mask).unwrap();
        assert!(registry.is_empty());
    }

    #[test]
    fn test_self_reference_does_not_block_removal() {
        let mut registry = LayerRegistry::new();
        let layer = registry.add();
        registry.set_undef_channel(layer, 3).unwrap();
        assert_eq!(registry.get(layer).unwrap().undef_layer(), Some(layer));
        registry.remove(layer).unwrap();
    }

    #[test]
    fn test_invalid_channel_is_rejected() {
        let mut registry = LayerRegistry::new();
        let layer = registry.add();
        assert_eq!(
            registry.set_undef_channel(layer, 4),
            Err(LayerError::InvalidChannel(4))
        );
        assert_eq!(
            registry.set_stack_undef_channel(7),
            Err(LayerError::InvalidChannel(7))
        );
    }
}
