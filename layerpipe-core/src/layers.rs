//! # Layer state
//!
//! The observable, user-editable state of an image's layer tree: per-layer visibility plus a flip.
//! Two serializations exist:
//! * The compact *state string*, `L.<flip> V.<bits>`. This one feeds the result cache key, so it
//!   must distinguish every state that renders differently.
//! * The *map form*, layer name to entry, used by the persisted project document where layer order
//!   may have shifted between saves.
//!
//! The state string doubles as a tiny command language when deserializing:
//! `L.<0-3>` sets the flip, `V.<bits>` sets every layer, `S.<n>`/`H.<n>` show/hide one layer.

use std::collections::BTreeMap;

use crate::compositor::LayerInfo;

bitflags::bitflags! {
    /// Mirroring applied as the very last render step.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
    pub struct Flip: u8 {
        const X = 0b01;
        const Y = 0b10;
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum StateError {
    #[error("malformed layer state token {0:?}")]
    MalformedToken(String),
    #[error("flip value {0} out of range")]
    BadFlip(u32),
    #[error("layer {index} out of range, image has {count} layers")]
    LayerOutOfRange { index: usize, count: usize },
    #[error("visibility has {got} bits, image has {expected} layers")]
    BitCount { expected: usize, got: usize },
}

/// Entry of the map form.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct LayerEntry {
    pub visible: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LayerState {
    visible: Vec<bool>,
    pub flip: Flip,
}
impl LayerState {
    /// Initial state, as the layers were loaded.
    #[must_use]
    pub fn new(layers: &[LayerInfo]) -> Self {
        Self {
            visible: layers.iter().map(|layer| layer.visible).collect(),
            flip: Flip::empty(),
        }
    }
    #[must_use]
    pub fn visibility(&self) -> &[bool] {
        &self.visible
    }
    /// Set a layer's visibility, returning whether it changed.
    /// # Errors
    /// If `index` is out of range.
    pub fn set_visible(&mut self, index: usize, visible: bool) -> Result<bool, StateError> {
        let count = self.visible.len();
        let slot = self
            .visible
            .get_mut(index)
            .ok_or(StateError::LayerOutOfRange { index, count })?;
        let changed = *slot != visible;
        *slot = visible;
        Ok(changed)
    }
    /// Set one flip axis, returning whether anything changed.
    pub fn set_flip_axis(&mut self, axis: Flip, on: bool) -> bool {
        let before = self.flip;
        self.flip.set(axis, on);
        before != self.flip
    }
    #[must_use]
    pub fn serialize(&self) -> String {
        let mut out = String::with_capacity(8 + self.visible.len());
        out.push_str("L.");
        out.push_str(&self.flip.bits().to_string());
        out.push_str(" V.");
        out.extend(self.visible.iter().map(|&v| if v { '1' } else { '0' }));
        out
    }
    /// Apply a state string. Either every token applies or none do.
    /// Returns whether the state changed.
    /// # Errors
    /// On the first malformed or out-of-range token. `self` is untouched.
    pub fn deserialize(&mut self, state: &str) -> Result<bool, StateError> {
        let mut next = self.clone();
        for token in state.split_whitespace() {
            next.apply_token(token)?;
        }
        let changed = next != *self;
        *self = next;
        Ok(changed)
    }
    fn apply_token(&mut self, token: &str) -> Result<(), StateError> {
        let malformed = || StateError::MalformedToken(token.to_owned());
        let (op, arg) = token.split_once('.').ok_or_else(malformed)?;
        match op {
            "L" => {
                let bits: u32 = arg.parse().map_err(|_| malformed())?;
                let flip = u8::try_from(bits)
                    .ok()
                    .and_then(Flip::from_bits)
                    .ok_or(StateError::BadFlip(bits))?;
                self.flip = flip;
            }
            "V" => {
                if arg.len() != self.visible.len() {
                    return Err(StateError::BitCount {
                        expected: self.visible.len(),
                        got: arg.len(),
                    });
                }
                let bits = arg
                    .chars()
                    .map(|c| match c {
                        '0' => Ok(false),
                        '1' => Ok(true),
                        _ => Err(malformed()),
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                self.visible = bits;
            }
            "S" | "H" => {
                let index: usize = arg.parse().map_err(|_| malformed())?;
                self.set_visible(index, op == "S")?;
            }
            _ => return Err(malformed()),
        }
        Ok(())
    }
    /// Map form, keyed by layer name. Layers sharing a name collapse into the last one.
    #[must_use]
    pub fn to_map(&self, layers: &[LayerInfo]) -> BTreeMap<String, LayerEntry> {
        layers
            .iter()
            .zip(&self.visible)
            .map(|(info, &visible)| (info.name.clone(), LayerEntry { visible }))
            .collect()
    }
    /// Apply a map form. Names not present in `layers` are reported back as warnings.
    pub fn apply_map(
        &mut self,
        layers: &[LayerInfo],
        map: &BTreeMap<String, LayerEntry>,
    ) -> Vec<String> {
        let mut warnings = Vec::new();
        for (name, entry) in map {
            let mut found = false;
            for (info, visible) in layers.iter().zip(self.visible.iter_mut()) {
                if &info.name == name {
                    *visible = entry.visible;
                    found = true;
                }
            }
            if !found {
                warnings.push(format!("layer {name:?} not found"));
            }
        }
        warnings
    }
}
