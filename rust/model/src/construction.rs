// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Construction and removal of model objects.
//!
//! Every object is created through the arena, which keeps parent links, the
//! identifier indices and the id pool consistent. Removal cascades down the
//! ownership tree: removing a feature removes its children, its inline
//! geometry and its appearances. By-reference links pointing at removed
//! objects are left alone; cleaning those up is the caller's business.

use crate::arena::*;
use crate::error::{Error, Result};
use crate::keys::*;

/// Identifiers of everything a feature removal took out of the arena.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeatureRemoval {
    /// Number of removed features, including anonymous ones.
    pub features: usize,
    pub feature_ids: Vec<String>,
    pub geometry_ids: Vec<String>,
}

impl FeatureRemoval {
    pub fn merge(&mut self, other: FeatureRemoval) {
        self.features += other.features;
        self.feature_ids.extend(other.feature_ids);
        self.geometry_ids.extend(other.geometry_ids);
    }
}

impl ModelArena {
    /// Adds a feature, optionally as the last child of `parent`.
    pub fn add_feature(&mut self, mut data: FeatureData, parent: Option<FeatureKey>) -> FeatureKey {
        let parent = parent.filter(|p| self.features.contains_key(*p));
        data.parent = parent;
        let id = data.id.clone();
        let key = self.features.insert(data);

        if let Some(p) = parent {
            self.features[p].children.push(key);
        }
        if let Some(id) = id {
            self.index_feature_id(&id, key);
        }
        key
    }

    /// Adds a single geometry node. Inline members referenced by its shape
    /// must already be in the arena.
    pub fn add_geometry(&mut self, data: GeometryData) -> GeometryKey {
        let id = data.id.clone();
        let key = self.geometries.insert(data);
        if let Some(id) = id {
            self.index_geometry_id(&id, key);
        }
        key
    }

    /// Adds an appearance and links it to its owning feature.
    pub fn add_appearance(&mut self, data: AppearanceData) -> AppearanceKey {
        let owner = data.owner;
        if let Some(id) = &data.id {
            self.ids.register(id);
        }
        let key = self.appearances.insert(data);
        if let AppearanceOwner::Feature(f) = owner {
            if let Some(feature) = self.features.get_mut(f) {
                feature.appearances.push(key);
            }
        }
        key
    }

    /// Adds a surface data entry to the appearance it names.
    pub fn add_surface_data(&mut self, data: SurfaceData) -> SurfaceDataKey {
        let appearance = data.appearance;
        if let Some(id) = &data.id {
            self.ids.register(id);
        }
        let key = self.surface_data.insert(data);
        if let Some(app) = self.appearances.get_mut(appearance) {
            app.surface_data.push(key);
        }
        key
    }

    /// Assigns (or replaces) the identifier of a feature.
    pub fn set_feature_id(&mut self, key: FeatureKey, id: String) -> Result<()> {
        let feature = self.features.get_mut(key).ok_or(Error::FeatureNotFound(key))?;
        let old = feature.id.replace(id.clone());
        if let Some(old) = old {
            self.unindex_feature_id(&old, key);
        }
        self.index_feature_id(&id, key);
        Ok(())
    }

    /// Assigns (or replaces) the identifier of a geometry.
    pub fn set_geometry_id(&mut self, key: GeometryKey, id: String) -> Result<()> {
        let geometry = self
            .geometries
            .get_mut(key)
            .ok_or(Error::GeometryNotFound(key))?;
        let old = geometry.id.replace(id.clone());
        if let Some(old) = old {
            self.unindex_geometry_id(&old, key);
        }
        self.index_geometry_id(&id, key);
        Ok(())
    }

    // --- Removal ---

    /// Removes a geometry and its inline members. The slot holding the
    /// geometry is not touched. Returns the identifiers of removed geometries.
    pub fn remove_geometry(&mut self, key: GeometryKey) -> Vec<String> {
        let mut removed = Vec::new();
        let mut stack = vec![key];
        while let Some(current) = stack.pop() {
            let Some(data) = self.geometries.remove(current) else {
                continue;
            };
            for member in data.shape.members() {
                if let Member::Inline(child) = member {
                    stack.push(*child);
                }
            }
            if let Some(id) = data.id {
                self.unindex_geometry_id(&id, current);
                removed.push(id);
            }
        }
        removed
    }

    /// Removes a feature with its whole subtree and unlinks it from its parent.
    pub fn remove_feature(&mut self, key: FeatureKey) -> Result<FeatureRemoval> {
        let parent = self
            .features
            .get(key)
            .ok_or(Error::FeatureNotFound(key))?
            .parent;
        if let Some(p) = parent {
            if let Some(pd) = self.features.get_mut(p) {
                pd.children.retain(|c| *c != key);
            }
        }

        let mut removal = FeatureRemoval::default();
        self.drop_feature_tree(key, &mut removal);
        Ok(removal)
    }

    fn drop_feature_tree(&mut self, key: FeatureKey, removal: &mut FeatureRemoval) {
        let Some(data) = self.features.remove(key) else {
            return;
        };
        removal.features += 1;

        for property in &data.geometry {
            if let Some(root) = property_root(property) {
                removal.geometry_ids.extend(self.remove_geometry(root));
            }
        }
        for &appearance in &data.appearances {
            self.drop_appearance(appearance);
        }
        for &child in &data.children {
            self.drop_feature_tree(child, removal);
        }
        if let Some(id) = data.id {
            self.unindex_feature_id(&id, key);
            removal.feature_ids.push(id);
        }
    }

    /// Removes an appearance with its surface data and unlinks it from its owner.
    pub fn remove_appearance(&mut self, key: AppearanceKey) -> Result<()> {
        let owner = self
            .appearances
            .get(key)
            .ok_or(Error::AppearanceNotFound(key))?
            .owner;
        if let AppearanceOwner::Feature(f) = owner {
            if let Some(feature) = self.features.get_mut(f) {
                feature.appearances.retain(|a| *a != key);
            }
        }
        self.drop_appearance(key);
        Ok(())
    }

    fn drop_appearance(&mut self, key: AppearanceKey) {
        if let Some(data) = self.appearances.remove(key) {
            for sd in data.surface_data {
                self.surface_data.remove(sd);
            }
        }
    }

    /// Removes a surface data entry and unlinks it from its appearance.
    pub fn remove_surface_data(&mut self, key: SurfaceDataKey) -> Result<()> {
        let data = self
            .surface_data
            .remove(key)
            .ok_or(Error::SurfaceDataNotFound(key))?;
        if let Some(app) = self.appearances.get_mut(data.appearance) {
            app.surface_data.retain(|s| *s != key);
        }
        Ok(())
    }

    // --- Geometry properties and slots ---

    /// Takes a geometry property off its feature without removing any geometry.
    pub fn detach_property(&mut self, feature: FeatureKey, index: usize) -> Result<GeometryProperty> {
        let data = self
            .features
            .get_mut(feature)
            .ok_or(Error::FeatureNotFound(feature))?;
        if index >= data.geometry.len() {
            return Err(Error::InvalidSlot(format!(
                "property {index} of {}",
                data.label()
            )));
        }
        Ok(data.geometry.remove(index))
    }

    /// Removes a geometry property together with its inline geometry.
    /// Returns the identifiers of removed geometries.
    pub fn remove_property(&mut self, feature: FeatureKey, index: usize) -> Result<Vec<String>> {
        let property = self.detach_property(feature, index)?;
        Ok(property_root(&property)
            .map(|root| self.remove_geometry(root))
            .unwrap_or_default())
    }

    /// Removes whatever a slot holds. A property or template slot loses the
    /// whole property; a member slot loses the member.
    pub fn remove_slot(&mut self, slot: Slot) -> Result<Vec<String>> {
        match slot {
            Slot::Property { feature, index } | Slot::Template { feature, index } => {
                self.remove_property(feature, index)
            }
            Slot::Member { geometry, index } => {
                let data = self
                    .geometries
                    .get_mut(geometry)
                    .ok_or(Error::GeometryNotFound(geometry))?;
                let member = data
                    .shape
                    .remove_member(index)
                    .ok_or_else(|| Error::InvalidSlot(format!("member {index} of {geometry:?}")))?;
                Ok(match member {
                    Member::Inline(child) => self.remove_geometry(child),
                    Member::Reference(_) => Vec::new(),
                })
            }
        }
    }

    /// Puts `member` into a slot and returns what the slot held before.
    ///
    /// An inline geometry placed into the slot is re-parented and takes on
    /// the slot's level of detail. The previous content is not removed.
    pub fn set_slot(&mut self, slot: Slot, member: Member) -> Result<Member> {
        let invalid = || Error::InvalidSlot(format!("{slot:?}"));
        let (owner, lod) = match slot {
            Slot::Property { feature, index } | Slot::Template { feature, index } => {
                let property = self.property(feature, index)?;
                let implicit = matches!(property.value, PropertyValue::Implicit(_));
                if implicit != matches!(slot, Slot::Template { .. }) {
                    return Err(invalid());
                }
                (GeometryOwner::Feature(feature), Some(property.lod))
            }
            Slot::Member { geometry, index } => {
                let data = self
                    .geometries
                    .get(geometry)
                    .ok_or(Error::GeometryNotFound(geometry))?;
                if index >= data.shape.members().len() {
                    return Err(invalid());
                }
                (GeometryOwner::Geometry(geometry), data.lod)
            }
        };

        if let Member::Inline(g) = &member {
            let data = self
                .geometries
                .get_mut(*g)
                .ok_or(Error::GeometryNotFound(*g))?;
            data.owner = owner;
            self.set_subtree_lod(*g, lod);
        }

        match slot {
            Slot::Property { feature, index } => {
                let property = &mut self.features[feature].geometry[index];
                let new = match member {
                    Member::Inline(g) => PropertyValue::Inline(g),
                    Member::Reference(id) => PropertyValue::Reference(id),
                };
                match std::mem::replace(&mut property.value, new) {
                    PropertyValue::Inline(g) => Ok(Member::Inline(g)),
                    PropertyValue::Reference(id) => Ok(Member::Reference(id)),
                    PropertyValue::Implicit(implicit) => {
                        property.value = PropertyValue::Implicit(implicit);
                        Err(invalid())
                    }
                }
            }
            Slot::Template { feature, index } => match &mut self.features[feature].geometry[index].value {
                PropertyValue::Implicit(implicit) => Ok(std::mem::replace(&mut implicit.template, member)),
                _ => Err(invalid()),
            },
            Slot::Member { geometry, index } => {
                let members = self.geometries[geometry].shape.members_mut();
                let target = members.get_mut(index).ok_or_else(invalid)?;
                Ok(std::mem::replace(target, member))
            }
        }
    }

    /// Changes the level of detail of a geometry property, renaming its
    /// `lodN` prefix and relabelling its inline geometry.
    pub fn relabel_property(&mut self, feature: FeatureKey, index: usize, lod: Lod) -> Result<()> {
        let property = self.property(feature, index)?;
        let old_prefix = property.lod.prefix();
        let root = property_root(property);

        let property = &mut self.features[feature].geometry[index];
        if let Some(rest) = property.name.strip_prefix(&old_prefix) {
            property.name = format!("{}{rest}", lod.prefix());
        }
        property.lod = lod;

        if let Some(root) = root {
            self.set_subtree_lod(root, Some(lod));
        }
        Ok(())
    }

    /// Sets the level of detail of a geometry and its inline members.
    pub fn set_subtree_lod(&mut self, root: GeometryKey, lod: Option<Lod>) {
        for key in self.geometry_tree(root) {
            if let Some(g) = self.geometries.get_mut(key) {
                g.lod = lod;
            }
        }
    }

    pub(crate) fn property(&self, feature: FeatureKey, index: usize) -> Result<&GeometryProperty> {
        let data = self.features.get(feature).ok_or(Error::FeatureNotFound(feature))?;
        data.geometry
            .get(index)
            .ok_or_else(|| Error::InvalidSlot(format!("property {index} of {}", data.label())))
    }
}

/// The inline root geometry of a property, including inline templates.
pub(crate) fn property_root(property: &GeometryProperty) -> Option<GeometryKey> {
    match &property.value {
        PropertyValue::Inline(g) => Some(*g),
        PropertyValue::Implicit(ImplicitGeometry {
            template: Member::Inline(g),
            ..
        }) => Some(*g),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn polygon(arena: &mut ModelArena, id: &str, owner: GeometryOwner) -> GeometryKey {
        arena.add_geometry(GeometryData {
            id: Some(id.into()),
            srs: None,
            lod: Lod::new(2),
            owner,
            shape: Shape::Polygon {
                exterior: vec![[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]],
                interiors: Vec::new(),
            },
        })
    }

    fn with_surface(arena: &mut ModelArena, feature: FeatureKey) -> GeometryKey {
        let ms = arena.add_geometry(GeometryData {
            id: Some("ms".into()),
            srs: None,
            lod: Lod::new(2),
            owner: GeometryOwner::Feature(feature),
            shape: Shape::MultiSurface(Vec::new()),
        });
        let p = polygon(arena, "p1", GeometryOwner::Geometry(ms));
        if let Shape::MultiSurface(m) = &mut arena.geometries[ms].shape {
            m.push(Member::Inline(p));
            m.push(Member::Reference("elsewhere".into()));
        }
        arena.features[feature].geometry.push(GeometryProperty {
            name: "lod2MultiSurface".into(),
            lod: Lod::new(2).unwrap(),
            value: PropertyValue::Inline(ms),
        });
        ms
    }

    #[test]
    fn add_feature_links_parent_and_indexes_id() {
        let mut arena = ModelArena::new();
        let mut data = FeatureData::new("Building");
        data.id = Some("b1".into());
        let b = arena.add_feature(data, None);
        let w = arena.add_feature(FeatureData::new("WallSurface"), Some(b));

        assert_eq!(arena.feature(w).unwrap().parent, Some(b));
        assert_eq!(arena.feature(b).unwrap().children, vec![w]);
        assert_eq!(arena.feature_by_id("b1"), Some(b));
        assert!(arena.ids.contains("b1"));
    }

    #[test]
    fn remove_feature_cascades() {
        let mut arena = ModelArena::new();
        let b = arena.add_feature(FeatureData::new("Building"), None);
        let mut wall = FeatureData::new("WallSurface");
        wall.id = Some("w".into());
        let w = arena.add_feature(wall, Some(b));
        with_surface(&mut arena, w);
        arena.add_appearance(AppearanceData {
            id: None,
            theme: None,
            owner: AppearanceOwner::Feature(w),
            surface_data: Vec::new(),
        });

        let removal = arena.remove_feature(w).unwrap();
        assert_eq!(removal.features, 1);
        assert_eq!(removal.feature_ids, vec!["w".to_string()]);
        assert_eq!(removal.geometry_ids.len(), 2);
        assert!(arena.feature(b).unwrap().children.is_empty());
        assert_eq!(arena.geometry_count(), 0);
        assert_eq!(arena.appearance_count(), 0);
        assert!(arena.geometry_by_id("p1").is_none());
    }

    #[test]
    fn remove_member_slot_drops_inline_subtree() {
        let mut arena = ModelArena::new();
        let b = arena.add_feature(FeatureData::new("Building"), None);
        let ms = with_surface(&mut arena, b);

        let removed = arena
            .remove_slot(Slot::Member {
                geometry: ms,
                index: 0,
            })
            .unwrap();
        assert_eq!(removed, vec!["p1".to_string()]);
        assert_eq!(arena.geometry(ms).unwrap().shape.members().len(), 1);
    }

    #[test]
    fn set_slot_reparents_and_relabels() {
        let mut arena = ModelArena::new();
        let b = arena.add_feature(FeatureData::new("Building"), None);
        let ms = with_surface(&mut arena, b);
        let loose = polygon(&mut arena, "p2", GeometryOwner::Template);
        arena.geometries[loose].lod = None;

        let old = arena
            .set_slot(
                Slot::Member {
                    geometry: ms,
                    index: 1,
                },
                Member::Inline(loose),
            )
            .unwrap();
        assert_eq!(old, Member::Reference("elsewhere".into()));
        let data = arena.geometry(loose).unwrap();
        assert_eq!(data.owner, GeometryOwner::Geometry(ms));
        assert_eq!(data.lod, Lod::new(2));
    }

    #[test]
    fn set_slot_rejects_mismatched_slot_without_touching_geometry() {
        let mut arena = ModelArena::new();
        let b = arena.add_feature(FeatureData::new("Building"), None);
        let ms = with_surface(&mut arena, b);
        let loose = polygon(&mut arena, "p2", GeometryOwner::Template);
        arena.geometries[loose].lod = None;

        // Property 0 holds an inline geometry, not a template placement.
        let err = arena
            .set_slot(Slot::Template { feature: b, index: 0 }, Member::Inline(loose))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidSlot(_)));
        let err = arena
            .set_slot(
                Slot::Member {
                    geometry: ms,
                    index: 7,
                },
                Member::Inline(loose),
            )
            .unwrap_err();
        assert!(matches!(err, Error::InvalidSlot(_)));

        let data = arena.geometry(loose).unwrap();
        assert_eq!(data.owner, GeometryOwner::Template);
        assert_eq!(data.lod, None);
        assert!(matches!(
            arena.feature(b).unwrap().geometry[0].value,
            PropertyValue::Inline(g) if g == ms
        ));
    }

    #[test]
    fn relabel_property_renames_prefix() {
        let mut arena = ModelArena::new();
        let b = arena.add_feature(FeatureData::new("Building"), None);
        let ms = with_surface(&mut arena, b);

        arena.relabel_property(b, 0, Lod::new(3).unwrap()).unwrap();
        let property = &arena.feature(b).unwrap().geometry[0];
        assert_eq!(property.name, "lod3MultiSurface");
        assert_eq!(arena.geometry(ms).unwrap().lod, Lod::new(3));
    }

    #[test]
    fn set_feature_id_reindexes() {
        let mut arena = ModelArena::new();
        let b = arena.add_feature(FeatureData::new("Building"), None);
        arena.set_feature_id(b, "new".into()).unwrap();
        assert_eq!(arena.feature_by_id("new"), Some(b));
    }
}
