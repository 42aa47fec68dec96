// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Key types for arena-based storage.
//!
//! Each model object gets a unique, type-safe key for O(1) lookup in the
//! arena. Keys are created by `slotmap::SlotMap` and remain valid even after
//! other objects are removed (generational indices), so a removed feature can
//! never be confused with one inserted later.

use serde::{Deserialize, Serialize};
use slotmap::new_key_type;

use crate::error::Error;

new_key_type! {
    /// Key for a feature (city object, boundary surface, opening, group, ...).
    pub struct FeatureKey;

    /// Key for a geometry object (primitive or aggregate).
    pub struct GeometryKey;

    /// Key for an appearance (theme container).
    pub struct AppearanceKey;

    /// Key for a surface data entry (texture or material).
    pub struct SurfaceDataKey;
}

/// Level of detail, 0 to 4.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct Lod(u8);

impl Lod {
    /// Number of distinct levels of detail.
    pub const COUNT: usize = 5;

    /// Creates a level of detail, returning `None` outside 0..=4.
    pub fn new(value: u8) -> Option<Self> {
        ((value as usize) < Self::COUNT).then_some(Lod(value))
    }

    pub fn value(self) -> u8 {
        self.0
    }

    /// Index into a per-LOD mask.
    pub fn index(self) -> usize {
        self.0 as usize
    }

    /// All levels of detail in ascending order.
    pub fn all() -> impl Iterator<Item = Lod> {
        (0..Self::COUNT as u8).map(Lod)
    }

    /// Property-name prefix used on the wire, e.g. `lod2`.
    pub fn prefix(self) -> String {
        format!("lod{}", self.0)
    }
}

impl TryFrom<u8> for Lod {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Lod::new(value).ok_or(Error::InvalidLod(value))
    }
}

impl From<Lod> for u8 {
    fn from(lod: Lod) -> u8 {
        lod.0
    }
}

impl std::fmt::Display for Lod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "LOD{}", self.0)
    }
}

/// A location that can hold a geometry, either inline or by reference.
///
/// Slots are addressed by container and position. Positions shift when a
/// sibling is removed, so callers that remove several slots of one container
/// must do so in descending index order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Slot {
    /// The value of a feature's geometry property.
    Property { feature: FeatureKey, index: usize },
    /// A member of an aggregate geometry (or the exterior of a solid).
    Member { geometry: GeometryKey, index: usize },
    /// The template of an implicit geometry property.
    Template { feature: FeatureKey, index: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lod_range() {
        assert!(Lod::new(0).is_some());
        assert!(Lod::new(4).is_some());
        assert!(Lod::new(5).is_none());
        assert_eq!(Lod::all().count(), Lod::COUNT);
    }

    #[test]
    fn lod_try_from_rejects_out_of_range() {
        assert!(matches!(Lod::try_from(7u8), Err(Error::InvalidLod(7))));
        assert_eq!(u8::from(Lod::try_from(3u8).unwrap()), 3);
    }

    #[test]
    fn lod_display_and_prefix() {
        let lod = Lod::new(2).unwrap();
        assert_eq!(lod.to_string(), "LOD2");
        assert_eq!(lod.prefix(), "lod2");
    }

    #[test]
    fn lod_serde_validates() {
        let lod: Lod = serde_json::from_str("3").unwrap();
        assert_eq!(lod.value(), 3);
        assert!(serde_json::from_str::<Lod>("9").is_err());
    }
}
