// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Walks over the feature and geometry trees.
//!
//! Downward walks follow ownership (children, properties, inline members).
//! Upward walks follow the parent links stored in each object. Orders are
//! deterministic: features pre-order, properties in declaration order,
//! members left to right.

use crate::arena::*;
use crate::construction::property_root;
use crate::error::{Error, Result};
use crate::keys::*;

impl ModelArena {
    // =========================================================================
    // Features
    // =========================================================================

    /// The top-level feature a feature belongs to (itself if it has no parent).
    pub fn top_level(&self, key: FeatureKey) -> FeatureKey {
        let mut current = key;
        while let Some(parent) = self.features.get(current).and_then(|f| f.parent) {
            current = parent;
        }
        current
    }

    /// Parent chain of a feature, nearest first.
    pub fn ancestors(&self, key: FeatureKey) -> Vec<FeatureKey> {
        let mut result = Vec::new();
        let mut current = self.features.get(key).and_then(|f| f.parent);
        while let Some(parent) = current {
            result.push(parent);
            current = self.features.get(parent).and_then(|f| f.parent);
        }
        result
    }

    /// A feature and all nested features, pre-order.
    pub fn feature_tree(&self, root: FeatureKey) -> Vec<FeatureKey> {
        let mut result = Vec::new();
        let mut stack = vec![root];
        while let Some(key) = stack.pop() {
            let Some(data) = self.features.get(key) else {
                continue;
            };
            result.push(key);
            stack.extend(data.children.iter().rev());
        }
        result
    }

    /// `true` if the feature itself has at least one geometry property.
    pub fn has_own_geometry(&self, key: FeatureKey) -> bool {
        self.features
            .get(key)
            .is_some_and(|f| !f.geometry.is_empty())
    }

    /// `true` if the feature or any nested feature has a geometry property.
    pub fn subtree_has_geometry(&self, key: FeatureKey) -> bool {
        self.feature_tree(key)
            .into_iter()
            .any(|f| self.has_own_geometry(f))
    }

    /// Which levels of detail occur on geometry properties in a feature tree.
    pub fn lods_present(&self, key: FeatureKey) -> [bool; Lod::COUNT] {
        let mut present = [false; Lod::COUNT];
        for f in self.feature_tree(key) {
            for property in &self.features[f].geometry {
                present[property.lod.index()] = true;
            }
        }
        present
    }

    /// Every identifier used inside a feature tree: features, geometries,
    /// appearances and surface data.
    pub fn collect_ids(&self, key: FeatureKey) -> Vec<String> {
        let mut ids = Vec::new();
        for f in self.feature_tree(key) {
            let data = &self.features[f];
            ids.extend(data.id.clone());
            for g in self.feature_geometries(f) {
                ids.extend(self.geometries[g].id.clone());
            }
            for &a in &data.appearances {
                let Some(app) = self.appearances.get(a) else {
                    continue;
                };
                ids.extend(app.id.clone());
                for &sd in &app.surface_data {
                    ids.extend(self.surface_data.get(sd).and_then(|s| s.id.clone()));
                }
            }
        }
        ids
    }

    // =========================================================================
    // Geometries
    // =========================================================================

    /// A geometry and its inline members, pre-order.
    pub fn geometry_tree(&self, root: GeometryKey) -> Vec<GeometryKey> {
        let mut result = Vec::new();
        let mut stack = vec![root];
        while let Some(key) = stack.pop() {
            let Some(data) = self.geometries.get(key) else {
                continue;
            };
            result.push(key);
            for member in data.shape.members().iter().rev() {
                if let Member::Inline(child) = member {
                    stack.push(*child);
                }
            }
        }
        result
    }

    /// Inline root geometries of a feature's own properties, inline
    /// templates included.
    pub fn property_roots(&self, key: FeatureKey) -> Vec<GeometryKey> {
        self.features
            .get(key)
            .map(|f| f.geometry.iter().filter_map(property_root).collect())
            .unwrap_or_default()
    }

    /// All geometries owned by a feature itself (not by nested features).
    pub fn feature_geometries(&self, key: FeatureKey) -> Vec<GeometryKey> {
        self.property_roots(key)
            .into_iter()
            .flat_map(|root| self.geometry_tree(root))
            .collect()
    }

    /// All geometries inside a feature tree.
    pub fn tree_geometries(&self, key: FeatureKey) -> Vec<GeometryKey> {
        self.feature_tree(key)
            .into_iter()
            .flat_map(|f| self.feature_geometries(f))
            .collect()
    }

    /// The root of the inline tree a geometry sits in.
    pub fn root_geometry(&self, key: GeometryKey) -> GeometryKey {
        let mut current = key;
        while let Some(GeometryOwner::Geometry(parent)) = self.geometries.get(current).map(|g| g.owner) {
            current = parent;
        }
        current
    }

    /// The feature whose property holds a geometry, directly or as a member.
    pub fn owning_feature(&self, key: GeometryKey) -> Option<FeatureKey> {
        match self.geometries.get(self.root_geometry(key))?.owner {
            GeometryOwner::Feature(f) => Some(f),
            _ => None,
        }
    }

    /// Coordinates of a geometry and its inline members. Referenced members
    /// are not followed.
    pub fn geometry_coordinates(&self, key: GeometryKey) -> Vec<[f64; 3]> {
        self.geometry_tree(key)
            .into_iter()
            .flat_map(|g| self.geometries[g].shape.coordinates())
            .collect()
    }

    // =========================================================================
    // Slots
    // =========================================================================

    /// The slot currently holding an inline geometry.
    pub fn slot_of(&self, key: GeometryKey) -> Option<Slot> {
        match self.geometries.get(key)?.owner {
            GeometryOwner::Geometry(parent) => {
                let members = self.geometries.get(parent)?.shape.members();
                let index = members.iter().position(|m| *m == Member::Inline(key))?;
                Some(Slot::Member {
                    geometry: parent,
                    index,
                })
            }
            GeometryOwner::Feature(feature) => {
                let properties = &self.features.get(feature)?.geometry;
                properties
                    .iter()
                    .enumerate()
                    .find_map(|(index, property)| match &property.value {
                        PropertyValue::Inline(g) if *g == key => {
                            Some(Slot::Property { feature, index })
                        }
                        PropertyValue::Implicit(implicit)
                            if implicit.template == Member::Inline(key) =>
                        {
                            Some(Slot::Template { feature, index })
                        }
                        _ => None,
                    })
            }
            GeometryOwner::Template => None,
        }
    }

    /// What a slot holds.
    pub fn slot_member(&self, slot: Slot) -> Result<Member> {
        let invalid = || Error::InvalidSlot(format!("{slot:?}"));
        match slot {
            Slot::Property { feature, index } => match &self.property(feature, index)?.value {
                PropertyValue::Inline(g) => Ok(Member::Inline(*g)),
                PropertyValue::Reference(id) => Ok(Member::Reference(id.clone())),
                PropertyValue::Implicit(_) => Err(invalid()),
            },
            Slot::Template { feature, index } => match &self.property(feature, index)?.value {
                PropertyValue::Implicit(implicit) => Ok(implicit.template.clone()),
                _ => Err(invalid()),
            },
            Slot::Member { geometry, index } => self
                .geometries
                .get(geometry)
                .ok_or(Error::GeometryNotFound(geometry))?
                .shape
                .members()
                .get(index)
                .cloned()
                .ok_or_else(invalid),
        }
    }

    /// The feature that holds a slot.
    pub fn slot_feature(&self, slot: Slot) -> Option<FeatureKey> {
        match slot {
            Slot::Property { feature, .. } | Slot::Template { feature, .. } => Some(feature),
            Slot::Member { geometry, .. } => self.owning_feature(geometry),
        }
    }

    /// Level of detail of the property a slot belongs to.
    pub fn slot_lod(&self, slot: Slot) -> Option<Lod> {
        match slot {
            Slot::Property { feature, index } | Slot::Template { feature, index } => {
                self.property(feature, index).ok().map(|p| p.lod)
            }
            Slot::Member { geometry, .. } => self.geometries.get(geometry).and_then(|g| g.lod),
        }
    }

    /// The kind of geometry a slot admits.
    pub fn slot_kind(&self, slot: Slot) -> SlotKind {
        match slot {
            Slot::Property { feature, index } => self
                .property(feature, index)
                .map(|p| p.slot_kind())
                .unwrap_or(SlotKind::Any),
            Slot::Template { .. } => SlotKind::Any,
            Slot::Member { geometry, .. } => self
                .geometries
                .get(geometry)
                .map(|g| g.shape.member_kind())
                .unwrap_or(SlotKind::Any),
        }
    }

    /// Every occupied geometry slot in a feature tree, in encounter order:
    /// features pre-order, then properties, then members depth-first.
    pub fn slots(&self, key: FeatureKey) -> Vec<(Slot, Member)> {
        let mut result = Vec::new();
        for feature in self.feature_tree(key) {
            for (index, property) in self.features[feature].geometry.iter().enumerate() {
                let (slot, member) = match &property.value {
                    PropertyValue::Inline(g) => {
                        (Slot::Property { feature, index }, Member::Inline(*g))
                    }
                    PropertyValue::Reference(id) => {
                        (Slot::Property { feature, index }, Member::Reference(id.clone()))
                    }
                    PropertyValue::Implicit(implicit) => {
                        (Slot::Template { feature, index }, implicit.template.clone())
                    }
                };
                let inline = match &member {
                    Member::Inline(g) => Some(*g),
                    Member::Reference(_) => None,
                };
                result.push((slot, member));
                if let Some(root) = inline {
                    self.collect_member_slots(root, &mut result);
                }
            }
        }
        result
    }

    fn collect_member_slots(&self, geometry: GeometryKey, out: &mut Vec<(Slot, Member)>) {
        let Some(data) = self.geometries.get(geometry) else {
            return;
        };
        for (index, member) in data.shape.members().iter().enumerate() {
            out.push((Slot::Member { geometry, index }, member.clone()));
            if let Member::Inline(child) = member {
                self.collect_member_slots(*child, out);
            }
        }
    }

    /// By-reference slots of a feature tree with the referenced identifier.
    pub fn reference_slots(&self, key: FeatureKey) -> Vec<(Slot, String)> {
        self.slots(key)
            .into_iter()
            .filter_map(|(slot, member)| match member {
                Member::Reference(id) => Some((slot, id)),
                Member::Inline(_) => None,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serialization::*;

    fn polygon(id: &str, x: f64) -> MemberRecord {
        MemberRecord::inline(GeometryRecord::new(
            Some(id),
            ShapeRecord::Polygon {
                exterior: vec![[x, 0.0, 0.0], [x + 1.0, 0.0, 0.0], [x, 1.0, 5.0]],
                interiors: Vec::new(),
            },
        ))
    }

    fn model() -> (ModelArena, FeatureKey) {
        let mut wall = FeatureRecord::new("WallSurface", Some("wall"));
        wall.geometry.push(GeometryPropertyRecord::inline(
            "lod2MultiSurface",
            2,
            GeometryRecord::new(
                Some("wall_ms"),
                ShapeRecord::MultiSurface {
                    members: vec![polygon("a", 0.0), MemberRecord::href("b")],
                },
            ),
        ));
        let mut roof = FeatureRecord::new("RoofSurface", Some("roof"));
        roof.geometry.push(GeometryPropertyRecord::href("lod3MultiSurface", 3, "a"));

        let mut building = FeatureRecord::new("Building", Some("bldg"));
        building.geometry.push(GeometryPropertyRecord::inline(
            "lod1Solid",
            1,
            GeometryRecord::new(
                Some("solid"),
                ShapeRecord::Solid {
                    exterior: Some(MemberRecord::inline(GeometryRecord::new(
                        Some("shell"),
                        ShapeRecord::CompositeSurface {
                            members: vec![polygon("b", 10.0)],
                        },
                    ))),
                },
            ),
        ));
        building.children = vec![wall, roof];

        let mut arena = ModelArena::new();
        let key = arena.import_feature(building, None).unwrap();
        (arena, key)
    }

    #[test]
    fn feature_tree_is_preorder() {
        let (arena, b) = model();
        let ids: Vec<_> = arena
            .feature_tree(b)
            .into_iter()
            .filter_map(|f| arena.feature(f).unwrap().id.clone())
            .collect();
        assert_eq!(ids, ["bldg", "wall", "roof"]);
    }

    #[test]
    fn reference_slots_in_encounter_order() {
        let (arena, b) = model();
        let refs: Vec<_> = arena
            .reference_slots(b)
            .into_iter()
            .map(|(_, id)| id)
            .collect();
        assert_eq!(refs, ["b", "a"]);
    }

    #[test]
    fn lods_and_geometry_queries() {
        let (arena, b) = model();
        let lods = arena.lods_present(b);
        assert_eq!(lods, [false, true, true, true, false]);

        let a = arena.geometry_by_id("a").unwrap();
        let wall = arena.feature_by_id("wall").unwrap();
        assert_eq!(arena.owning_feature(a), Some(wall));
        assert_eq!(arena.top_level(wall), b);
        assert_eq!(arena.geometry_coordinates(a).len(), 3);
        assert_eq!(arena.tree_geometries(b).len(), 5);
    }

    #[test]
    fn slot_of_finds_member_and_property() {
        let (arena, _) = model();
        let a = arena.geometry_by_id("a").unwrap();
        let ms = arena.geometry_by_id("wall_ms").unwrap();
        assert_eq!(arena.slot_of(a), Some(Slot::Member { geometry: ms, index: 0 }));
        assert_eq!(arena.slot_lod(arena.slot_of(a).unwrap()), Lod::new(2));

        let solid = arena.geometry_by_id("solid").unwrap();
        let slot = arena.slot_of(solid).unwrap();
        assert_eq!(arena.slot_kind(slot), SlotKind::Solid);
        assert_eq!(arena.slot_member(slot).unwrap(), Member::Inline(solid));
    }

    #[test]
    fn collect_ids_covers_tree() {
        let (arena, b) = model();
        let ids = arena.collect_ids(b);
        for id in ["bldg", "wall", "roof", "solid", "shell", "b", "wall_ms", "a"] {
            assert!(ids.iter().any(|i| i == id), "missing {id}");
        }
    }
}
