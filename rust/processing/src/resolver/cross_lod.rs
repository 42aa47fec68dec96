// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! References between levels of detail inside one feature.
//!
//! A geometry declared at one LOD is often reused by href from a property at
//! another LOD (a LOD 3 wall pointing at LOD 2 polygons). Tools that handle
//! one LOD at a time cannot follow such links, so they are either resolved
//! into independent copies or unlinked outright when the declaring LOD is
//! about to be dropped.

use city_lite_model::{FeatureClass, FeatureKey, Lod, Member, ModelArena, Slot};
use rustc_hash::FxHashMap;

use crate::appearance_index::AppearanceIndex;
use crate::copy::GeometryCopyBuilder;
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrossLodMode {
    /// Replace every cross-LOD reference with an inline copy, one copy per
    /// referencing LOD.
    Resolve,
    /// Unlink references whose target is declared at the given LOD from
    /// another LOD.
    RemoveReferencesTo(Lod),
}

/// A cross-LOD reference found in a feature tree.
struct CrossLodRef {
    slot: Slot,
    target: String,
    target_lod: Lod,
    slot_lod: Lod,
}

fn cross_lod_refs(arena: &ModelArena, feature: FeatureKey) -> Vec<CrossLodRef> {
    let mut refs = Vec::new();
    for (slot, target) in arena.reference_slots(feature) {
        let Some(key) = arena.geometry_by_id(&target) else {
            tracing::debug!(href = %target, "dangling geometry reference left unresolved");
            continue;
        };
        let in_tree = arena
            .owning_feature(key)
            .is_some_and(|f| arena.top_level(f) == feature);
        if !in_tree {
            continue;
        }
        let (Some(target_lod), Some(slot_lod)) =
            (arena.geometry(key).and_then(|g| g.lod), arena.slot_lod(slot))
        else {
            continue;
        };
        if target_lod != slot_lod {
            refs.push(CrossLodRef {
                slot,
                target,
                target_lod,
                slot_lod,
            });
        }
    }
    refs
}

/// `true` if the slot sits on a boundary surface or below one.
fn under_boundary_surface(arena: &ModelArena, slot: Slot) -> bool {
    let Some(feature) = arena.slot_feature(slot) else {
        return false;
    };
    std::iter::once(feature)
        .chain(arena.ancestors(feature))
        .any(|f| arena.feature(f).is_some_and(|d| d.class() == FeatureClass::BoundarySurface))
}

pub(crate) fn slot_index(slot: &Slot) -> usize {
    match *slot {
        Slot::Property { index, .. } | Slot::Template { index, .. } | Slot::Member { index, .. } => {
            index
        }
    }
}

/// Resolves or unlinks the cross-LOD references of a top-level feature.
///
/// In [`CrossLodMode::Resolve`] mode, the references to one geometry from
/// one LOD share a single copy: the preferred location (on a boundary
/// surface if any, else the first one encountered) receives the copy inline
/// and the others are pointed at it. Appearances decorating the source are
/// re-created for the copy inside appearances of `feature`.
///
/// Returns the number of references resolved or removed.
pub fn resolve_cross_lod_references(
    arena: &mut ModelArena,
    feature: FeatureKey,
    mode: CrossLodMode,
    global: Option<&AppearanceIndex>,
) -> Result<usize> {
    let refs = cross_lod_refs(arena, feature);
    if refs.is_empty() {
        return Ok(0);
    }

    match mode {
        CrossLodMode::Resolve => resolve(arena, feature, refs, global),
        CrossLodMode::RemoveReferencesTo(lod) => {
            let mut slots: Vec<Slot> = refs
                .into_iter()
                .filter(|r| r.target_lod == lod && r.slot_lod != lod)
                .map(|r| r.slot)
                .collect();
            slots.sort_by_key(|s| std::cmp::Reverse(slot_index(s)));
            for &slot in &slots {
                arena.remove_slot(slot)?;
            }
            if !slots.is_empty() {
                tracing::debug!(removed = slots.len(), %lod, "unlinked cross-LOD references");
            }
            Ok(slots.len())
        }
    }
}

fn resolve(
    arena: &mut ModelArena,
    feature: FeatureKey,
    refs: Vec<CrossLodRef>,
    global: Option<&AppearanceIndex>,
) -> Result<usize> {
    // (target, referencing LOD) → slots, in encounter order
    let mut order: Vec<(String, Lod)> = Vec::new();
    let mut groups: FxHashMap<(String, Lod), Vec<Slot>> = FxHashMap::default();
    for r in refs {
        let key = (r.target, r.slot_lod);
        groups
            .entry(key.clone())
            .or_insert_with(|| {
                order.push(key);
                Vec::new()
            })
            .push(r.slot);
    }

    let mut builder = GeometryCopyBuilder::new();
    let mut local = AppearanceIndex::for_feature(arena, feature);
    let mut resolved = 0;

    for key in order {
        let Some(slots) = groups.remove(&key) else {
            continue;
        };
        let Some(source) = arena.geometry_by_id(&key.0) else {
            continue;
        };

        let chosen = slots
            .iter()
            .position(|&s| under_boundary_surface(arena, s))
            .unwrap_or(0);
        let target_slot = slots[chosen];

        let copy = builder.copy(arena, source, arena.slot_kind(target_slot))?;
        arena.set_slot(target_slot, Member::Inline(copy.root))?;
        builder.retarget(arena, &copy.id_map, feature, &mut local, global);

        if let Some(copy_id) = copy.root_id(arena).map(str::to_string) {
            for (i, &slot) in slots.iter().enumerate() {
                if i != chosen {
                    arena.set_slot(slot, Member::Reference(copy_id.clone()))?;
                }
            }
        }
        resolved += slots.len();
        tracing::trace!(href = %key.0, lod = %key.1, locations = slots.len(), "resolved cross-LOD reference");
    }

    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use city_lite_model::{
        AppearanceRecord, FeatureRecord, GeometryPropertyRecord, GeometryRecord, MemberRecord,
        ShapeRecord, SurfaceDataKind, SurfaceDataRecord, Target,
    };

    fn polygon(id: &str) -> MemberRecord {
        MemberRecord::inline(GeometryRecord::new(
            Some(id),
            ShapeRecord::Polygon {
                exterior: vec![[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [1.0, 1.0, 0.0]],
                interiors: Vec::new(),
            },
        ))
    }

    fn multi_surface(id: &str, members: Vec<MemberRecord>) -> GeometryRecord {
        GeometryRecord::new(Some(id), ShapeRecord::MultiSurface { members })
    }

    /// Building with LOD 2 polygons that a LOD 3 wall and a LOD 3 building
    /// property both reference.
    fn building() -> FeatureRecord {
        let mut b = FeatureRecord::new("Building", Some("b"));
        b.geometry.push(GeometryPropertyRecord::inline(
            "lod2MultiSurface",
            2,
            multi_surface("ms2", vec![polygon("p1"), polygon("p2")]),
        ));
        b.geometry.push(GeometryPropertyRecord::inline(
            "lod3MultiSurface",
            3,
            multi_surface("ms3", vec![MemberRecord::href("p1"), MemberRecord::href("p2")]),
        ));

        let mut wall = FeatureRecord::new("WallSurface", Some("w"));
        wall.geometry.push(GeometryPropertyRecord::inline(
            "lod3MultiSurface",
            3,
            multi_surface("wall3", vec![MemberRecord::href("p1")]),
        ));
        b.children.push(wall);
        b
    }

    fn members_of(arena: &ModelArena, id: &str) -> Vec<Member> {
        let key = arena.geometry_by_id(id).unwrap();
        arena.geometry(key).unwrap().shape.members().to_vec()
    }

    #[test]
    fn resolve_prefers_boundary_surface_location() {
        let mut arena = ModelArena::new();
        let b = arena.import_feature(building(), None).unwrap();

        let resolved = resolve_cross_lod_references(&mut arena, b, CrossLodMode::Resolve, None).unwrap();
        assert_eq!(resolved, 3);

        // The wall holds the LOD 3 copy of p1 inline...
        let wall = members_of(&arena, "wall3");
        let Member::Inline(copy) = wall[0] else {
            panic!("wall member not inline");
        };
        let copy_id = arena.geometry(copy).unwrap().id.clone().unwrap();
        assert_ne!(copy_id, "p1");
        assert_eq!(arena.geometry(copy).unwrap().lod, Lod::new(3));

        // ...and the building-level LOD 3 property points at that copy.
        let ms3 = members_of(&arena, "ms3");
        assert_eq!(ms3[0], Member::Reference(copy_id));
        assert!(matches!(ms3[1], Member::Inline(_)));

        // No cross-LOD references are left.
        assert_eq!(
            resolve_cross_lod_references(&mut arena, b, CrossLodMode::Resolve, None).unwrap(),
            0
        );
    }

    #[test]
    fn same_lod_and_dangling_references_are_untouched() {
        let mut record = FeatureRecord::new("Building", Some("b"));
        record.geometry.push(GeometryPropertyRecord::inline(
            "lod2MultiSurface",
            2,
            multi_surface("ms2", vec![polygon("p1"), MemberRecord::href("p1"), MemberRecord::href("ghost")]),
        ));
        let mut arena = ModelArena::new();
        let b = arena.import_feature(record, None).unwrap();

        let resolved = resolve_cross_lod_references(&mut arena, b, CrossLodMode::Resolve, None).unwrap();
        assert_eq!(resolved, 0);
        assert_eq!(members_of(&arena, "ms2")[2], Member::Reference("ghost".into()));
    }

    #[test]
    fn remove_mode_unlinks_references_to_lod() {
        let mut arena = ModelArena::new();
        let b = arena.import_feature(building(), None).unwrap();

        let removed = resolve_cross_lod_references(
            &mut arena,
            b,
            CrossLodMode::RemoveReferencesTo(Lod::new(2).unwrap()),
            None,
        )
        .unwrap();
        assert_eq!(removed, 3);
        assert!(members_of(&arena, "ms3").is_empty());
        assert!(members_of(&arena, "wall3").is_empty());
        assert_eq!(members_of(&arena, "ms2").len(), 2);
    }

    #[test]
    fn resolve_retargets_local_appearances() {
        let mut record = building();
        record.appearances.push(AppearanceRecord {
            id: None,
            theme: Some("rgb".into()),
            surface_data: vec![SurfaceDataRecord {
                id: Some("red".into()),
                kind: SurfaceDataKind::X3DMaterial,
                is_front: true,
                image_uri: None,
                properties: Default::default(),
                targets: vec![Target {
                    uri: "#p2".into(),
                    coords: None,
                }],
            }],
        });
        let mut arena = ModelArena::new();
        let b = arena.import_feature(record, None).unwrap();
        resolve_cross_lod_references(&mut arena, b, CrossLodMode::Resolve, None).unwrap();

        let Member::Inline(copy) = members_of(&arena, "ms3")[1] else {
            panic!("expected inline copy");
        };
        let copy_id = arena.geometry(copy).unwrap().id.clone().unwrap();

        let app = arena.feature(b).unwrap().appearances[0];
        let sd = arena.appearance(app).unwrap().surface_data[0];
        let uris: Vec<_> = arena
            .surface_data(sd)
            .unwrap()
            .targets
            .iter()
            .map(|t| t.uri.clone())
            .collect();
        assert_eq!(uris, vec!["p2".to_string(), copy_id]);
    }
}
