// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Level-of-detail filtering with cascading removal.
//!
//! Filtering a top-level feature runs in four steps:
//!
//! 1. Build a keep mask over LOD 0 to 4 from the policy and the levels present
//!    in the feature tree.
//! 2. Remove every geometry property (implicit placements included) whose
//!    level is not kept. Cross-LOD references are resolved first so that
//!    kept geometry never points into a removed level.
//! 3. Unless empty features are kept, prune features left without geometry,
//!    walking up from every feature that lost a property.
//! 4. Drop appearance targets of removed geometries (local and global) and
//!    by-reference feature properties pointing at removed features.

use std::cmp::Reverse;

use city_lite_model::{FeatureKey, Lod, ModelArena};
use rustc_hash::FxHashSet;

use crate::appearance_index::{AppearanceIndex, Cleanup};
use crate::error::Result;
use crate::resolver::cross_lod::{resolve_cross_lod_references, CrossLodMode};

/// A set of levels of detail.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct LodSet([bool; Lod::COUNT]);

impl LodSet {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn all() -> Self {
        Self([true; Lod::COUNT])
    }

    pub fn insert(&mut self, lod: Lod) {
        self.0[lod.index()] = true;
    }

    pub fn contains(&self, lod: Lod) -> bool {
        self.0[lod.index()]
    }

    pub fn is_empty(&self) -> bool {
        !self.0.iter().any(|&b| b)
    }

    pub fn iter(&self) -> impl Iterator<Item = Lod> + '_ {
        Lod::all().filter(|lod| self.contains(*lod))
    }
}

impl FromIterator<Lod> for LodSet {
    fn from_iter<I: IntoIterator<Item = Lod>>(iter: I) -> Self {
        let mut set = Self::empty();
        for lod in iter {
            set.insert(lod);
        }
        set
    }
}

/// Which levels of detail survive a filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LodPolicy {
    Keep(LodSet),
    Remove(LodSet),
    /// Keep only the lowest of the given levels present in a feature.
    Minimum(LodSet),
    /// Keep only the highest of the given levels present in a feature.
    Maximum(LodSet),
}

impl LodPolicy {
    /// Keep mask for a feature with the given levels present. `Minimum` and
    /// `Maximum` keep nothing when none of their levels is present.
    pub fn mask(&self, present: [bool; Lod::COUNT]) -> [bool; Lod::COUNT] {
        let mut mask = [false; Lod::COUNT];
        match self {
            LodPolicy::Keep(set) => {
                for lod in set.iter() {
                    mask[lod.index()] = true;
                }
            }
            LodPolicy::Remove(set) => {
                for lod in Lod::all() {
                    mask[lod.index()] = !set.contains(lod);
                }
            }
            LodPolicy::Minimum(set) | LodPolicy::Maximum(set) => {
                let mut candidates = set.iter().filter(|lod| present[lod.index()]);
                let chosen = if matches!(self, LodPolicy::Minimum(_)) {
                    candidates.next()
                } else {
                    candidates.last()
                };
                if let Some(lod) = chosen {
                    mask[lod.index()] = true;
                }
            }
        }
        mask
    }
}

/// What a filter run did to one top-level feature.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LodFilterOutcome {
    /// `false` if the top-level feature itself was removed.
    pub survives: bool,
    pub properties_removed: usize,
    pub removed_feature_ids: Vec<String>,
    pub features_removed: usize,
    pub references_removed: usize,
    pub cleanup: Cleanup,
}

#[derive(Debug, Clone, Copy)]
pub struct LodFilter {
    policy: LodPolicy,
    keep_empty: bool,
}

impl LodFilter {
    pub fn new(policy: LodPolicy, keep_empty: bool) -> Self {
        Self { policy, keep_empty }
    }

    /// Filters a top-level feature. Targets in `global` pointing at removed
    /// geometries are detached as well.
    pub fn apply(
        &self,
        arena: &mut ModelArena,
        feature: FeatureKey,
        mut global: Option<&mut AppearanceIndex>,
    ) -> Result<LodFilterOutcome> {
        let mut outcome = LodFilterOutcome {
            survives: true,
            ..Default::default()
        };

        let mask = self.policy.mask(arena.lods_present(feature));
        let doomed = |arena: &ModelArena, f: FeatureKey| -> Vec<usize> {
            arena
                .feature(f)
                .map(|d| {
                    d.geometry
                        .iter()
                        .enumerate()
                        .filter(|(_, p)| !mask[p.lod.index()])
                        .map(|(i, _)| i)
                        .collect()
                })
                .unwrap_or_default()
        };
        let tree = arena.feature_tree(feature);
        if tree.iter().all(|&f| doomed(arena, f).is_empty()) {
            return Ok(outcome);
        }

        resolve_cross_lod_references(arena, feature, CrossLodMode::Resolve, global.as_deref())?;
        let mut local = AppearanceIndex::for_feature(arena, feature);

        // Property removal
        let mut removed_geometries = Vec::new();
        let mut candidates = Vec::new();
        let mut lost_own = false;
        for f in tree {
            let indices = doomed(arena, f);
            if indices.is_empty() {
                continue;
            }
            for &i in indices.iter().rev() {
                removed_geometries.extend(arena.remove_property(f, i)?);
                outcome.properties_removed += 1;
            }
            lost_own |= f == feature;
            if !self.keep_empty {
                candidates.push(f);
            }
        }

        // Pruning, deepest candidates first
        candidates.sort_by_key(|&f| Reverse(arena.ancestors(f).len()));
        let mut visited: FxHashSet<FeatureKey> = FxHashSet::default();
        for candidate in candidates {
            let mut current = Some(candidate);
            while let Some(f) = current {
                if visited.contains(&f) || !arena.contains_feature(f) || arena.subtree_has_geometry(f) {
                    break;
                }
                if f == feature {
                    if lost_own {
                        self.remove(arena, f, &mut visited, &mut outcome, &mut removed_geometries)?;
                        outcome.survives = false;
                    }
                    break;
                }

                let parent = arena.feature(f).and_then(|d| d.parent);
                self.remove(arena, f, &mut visited, &mut outcome, &mut removed_geometries)?;
                if let Some(p) = parent {
                    let empty_siblings: Vec<FeatureKey> = arena
                        .feature(p)
                        .map(|d| d.children.clone())
                        .unwrap_or_default()
                        .into_iter()
                        .filter(|&c| !arena.subtree_has_geometry(c))
                        .collect();
                    for sibling in empty_siblings {
                        self.remove(arena, sibling, &mut visited, &mut outcome, &mut removed_geometries)?;
                    }
                }
                current = parent;
            }
        }

        // Appearance cleanup
        outcome
            .cleanup
            .merge(local.detach_all(arena, &removed_geometries)?);
        if let Some(global) = global.as_deref_mut() {
            outcome
                .cleanup
                .merge(global.detach_all(arena, &removed_geometries)?);
        }

        // Feature references into removed features
        if outcome.survives && !outcome.removed_feature_ids.is_empty() {
            let removed: FxHashSet<&str> =
                outcome.removed_feature_ids.iter().map(String::as_str).collect();
            let mut dropped = 0;
            for f in arena.feature_tree(feature) {
                let Some(data) = arena.feature_mut(f) else {
                    continue;
                };
                let before = data.references.len() + data.relations.len();
                data.references.retain(|r| !removed.contains(r.href.as_str()));
                data.relations
                    .retain(|r| !removed.contains(r.related_to.as_str()));
                dropped += before - data.references.len() - data.relations.len();
            }
            outcome.references_removed = dropped;
        }

        if outcome.properties_removed > 0 {
            tracing::debug!(
                properties = outcome.properties_removed,
                features = outcome.features_removed,
                survives = outcome.survives,
                "filtered levels of detail"
            );
        }
        Ok(outcome)
    }

    fn remove(
        &self,
        arena: &mut ModelArena,
        feature: FeatureKey,
        visited: &mut FxHashSet<FeatureKey>,
        outcome: &mut LodFilterOutcome,
        removed_geometries: &mut Vec<String>,
    ) -> Result<()> {
        if !visited.insert(feature) || !arena.contains_feature(feature) {
            return Ok(());
        }
        let label = arena.feature(feature).map(|d| d.label()).unwrap_or_default();
        let removal = arena.remove_feature(feature)?;
        tracing::trace!(feature = %label, "removed feature left without geometry");
        outcome.features_removed += removal.features;
        outcome.removed_feature_ids.extend(removal.feature_ids);
        removed_geometries.extend(removal.geometry_ids);
        Ok(())
    }
}

/// Filters a top-level feature by level of detail. Returns `false` if the
/// feature itself was removed.
pub fn filter_by_lod(
    arena: &mut ModelArena,
    feature: FeatureKey,
    policy: &LodPolicy,
    keep_empty: bool,
) -> Result<bool> {
    Ok(LodFilter::new(*policy, keep_empty)
        .apply(arena, feature, None)?
        .survives)
}

/// Derives `target` from `source` where the feature has `source` data: the
/// `target` level is dropped and `source` properties are relabelled.
///
/// Returns the number of relabelled properties.
pub fn use_higher_lod_as(
    arena: &mut ModelArena,
    feature: FeatureKey,
    source: Lod,
    target: Lod,
    global: Option<&mut AppearanceIndex>,
) -> Result<usize> {
    resolve_cross_lod_references(arena, feature, CrossLodMode::Resolve, global.as_deref())?;
    if !arena.lods_present(feature)[source.index()] {
        return Ok(0);
    }

    let drop: LodSet = [target].into_iter().collect();
    LodFilter::new(LodPolicy::Remove(drop), true).apply(arena, feature, global)?;

    let mut relabelled = 0;
    for f in arena.feature_tree(feature) {
        let indices: Vec<usize> = arena
            .feature(f)
            .map(|d| {
                d.geometry
                    .iter()
                    .enumerate()
                    .filter(|(_, p)| p.lod == source)
                    .map(|(i, _)| i)
                    .collect()
            })
            .unwrap_or_default();
        for i in indices {
            arena.relabel_property(f, i, target)?;
            relabelled += 1;
        }
    }
    Ok(relabelled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use city_lite_model::{
        AppearanceRecord, FeatureRecord, FeatureRef, GeometryPropertyRecord, GeometryRecord,
        MemberRecord, ShapeRecord, SurfaceDataKind, SurfaceDataRecord, Target,
    };

    fn lod(value: u8) -> Lod {
        Lod::new(value).unwrap()
    }

    fn set(values: &[u8]) -> LodSet {
        values.iter().map(|&v| lod(v)).collect()
    }

    fn polygon(id: &str) -> GeometryRecord {
        GeometryRecord::new(
            Some(id),
            ShapeRecord::Polygon {
                exterior: vec![[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [1.0, 1.0, 0.0]],
                interiors: Vec::new(),
            },
        )
    }

    fn surface(id: &str) -> GeometryRecord {
        GeometryRecord::new(
            Some(id),
            ShapeRecord::MultiSurface {
                members: vec![MemberRecord::inline(polygon(&format!("{id}_p")))],
            },
        )
    }

    fn solid(id: &str) -> GeometryRecord {
        GeometryRecord::new(
            Some(id),
            ShapeRecord::Solid {
                exterior: Some(MemberRecord::inline(GeometryRecord::new(
                    Some(&format!("{id}_shell")),
                    ShapeRecord::CompositeSurface {
                        members: vec![MemberRecord::inline(polygon(&format!("{id}_p")))],
                    },
                ))),
            },
        )
    }

    fn with_surface(record: &mut FeatureRecord, lod: u8, id: &str) {
        record.geometry.push(GeometryPropertyRecord::inline(
            format!("lod{lod}MultiSurface"),
            lod,
            surface(id),
        ));
    }

    /// Root → [A(LOD 2), B → [C]]
    fn root_tree() -> FeatureRecord {
        let mut a = FeatureRecord::new("BuildingPart", Some("a"));
        with_surface(&mut a, 2, "ga");
        let c = FeatureRecord::new("BuildingInstallation", Some("c"));
        let mut b = FeatureRecord::new("BuildingPart", Some("b"));
        b.children.push(c);
        let mut root = FeatureRecord::new("Building", Some("root"));
        root.children.push(a);
        root.children.push(b);
        root
    }

    #[test]
    fn policy_masks() {
        let present = [false, true, true, false, true];
        assert_eq!(LodPolicy::Keep(set(&[1, 3])).mask(present), [false, true, false, true, false]);
        assert_eq!(LodPolicy::Remove(set(&[1])).mask(present), [true, false, true, true, true]);
        assert_eq!(LodPolicy::Minimum(set(&[0, 2, 4])).mask(present), [false, false, true, false, false]);
        assert_eq!(LodPolicy::Maximum(set(&[1, 2])).mask(present), [false, false, true, false, false]);
        assert_eq!(LodPolicy::Maximum(set(&[3])).mask(present), [false; 5]);
    }

    #[test]
    fn removing_nothing_changes_nothing() {
        let mut record = root_tree();
        record.geometry.push(GeometryPropertyRecord::href("lod3MultiSurface", 3, "ga_p"));
        let mut arena = ModelArena::new();
        let root = arena.import_feature(record, None).unwrap();
        let before = arena.export_feature(root).unwrap();

        assert!(filter_by_lod(&mut arena, root, &LodPolicy::Remove(LodSet::empty()), false).unwrap());
        assert_eq!(arena.export_feature(root).unwrap(), before);
    }

    #[test]
    fn filtering_twice_equals_filtering_once() {
        let policy = LodPolicy::Keep(set(&[2]));
        let mut record = root_tree();
        with_surface(&mut record, 1, "r1");
        with_surface(&mut record, 2, "r2");
        let mut arena = ModelArena::new();
        let root = arena.import_feature(record, None).unwrap();

        filter_by_lod(&mut arena, root, &policy, false).unwrap();
        let once = arena.export_feature(root).unwrap();
        filter_by_lod(&mut arena, root, &policy, false).unwrap();
        assert_eq!(arena.export_feature(root).unwrap(), once);
    }

    #[test]
    fn empty_subtrees_are_pruned_but_root_survives() {
        let mut arena = ModelArena::new();
        let root = arena.import_feature(root_tree(), None).unwrap();

        let outcome = LodFilter::new(LodPolicy::Remove(set(&[2])), false)
            .apply(&mut arena, root, None)
            .unwrap();

        assert!(outcome.survives);
        assert!(arena.feature(root).unwrap().children.is_empty());
        let mut removed = outcome.removed_feature_ids.clone();
        removed.sort();
        assert_eq!(removed, vec!["a", "b", "c"]);
        assert_eq!(arena.feature_count(), 1);
        assert_eq!(arena.geometry_count(), 0);
    }

    #[test]
    fn keep_empty_leaves_features_in_place() {
        let mut arena = ModelArena::new();
        let root = arena.import_feature(root_tree(), None).unwrap();
        assert!(filter_by_lod(&mut arena, root, &LodPolicy::Remove(set(&[2])), true).unwrap());
        assert_eq!(arena.feature_count(), 4);
    }

    #[test]
    fn top_level_feature_losing_all_geometry_is_removed() {
        let mut record = FeatureRecord::new("Building", Some("b"));
        with_surface(&mut record, 1, "g1");
        let mut arena = ModelArena::new();
        let b = arena.import_feature(record, None).unwrap();

        assert!(!filter_by_lod(&mut arena, b, &LodPolicy::Keep(set(&[2])), false).unwrap());
        assert_eq!(arena.feature_count(), 0);
    }

    #[test]
    fn references_to_removed_features_are_dropped() {
        let mut record = root_tree();
        record.references.push(FeatureRef {
            property: "address".into(),
            href: "#c".into(),
        });
        record.references.push(FeatureRef {
            property: "address".into(),
            href: "#elsewhere".into(),
        });
        let mut arena = ModelArena::new();
        let root = arena.import_feature(record, None).unwrap();

        let outcome = LodFilter::new(LodPolicy::Remove(set(&[2])), false)
            .apply(&mut arena, root, None)
            .unwrap();
        assert_eq!(outcome.references_removed, 1);

        let refs = &arena.feature(root).unwrap().references;
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].href, "elsewhere");
        for r in refs {
            assert!(r.href == "elsewhere" || arena.feature_by_id(&r.href).is_some());
        }
    }

    #[test]
    fn appearances_of_removed_geometry_are_pruned() {
        let mut record = FeatureRecord::new("Building", Some("b"));
        with_surface(&mut record, 1, "g1");
        with_surface(&mut record, 2, "g2");
        record.appearances.push(AppearanceRecord {
            id: None,
            theme: Some("rgb".into()),
            surface_data: vec![
                SurfaceDataRecord {
                    id: Some("m1".into()),
                    kind: SurfaceDataKind::X3DMaterial,
                    is_front: true,
                    image_uri: None,
                    properties: Default::default(),
                    targets: vec![Target {
                        uri: "#g1_p".into(),
                        coords: None,
                    }],
                },
                SurfaceDataRecord {
                    id: Some("m2".into()),
                    kind: SurfaceDataKind::X3DMaterial,
                    is_front: true,
                    image_uri: None,
                    properties: Default::default(),
                    targets: vec![
                        Target {
                            uri: "#g1_p".into(),
                            coords: None,
                        },
                        Target {
                            uri: "#g2_p".into(),
                            coords: None,
                        },
                    ],
                },
            ],
        });
        let mut arena = ModelArena::new();
        let b = arena.import_feature(record, None).unwrap();

        let outcome = LodFilter::new(LodPolicy::Keep(set(&[2])), false)
            .apply(&mut arena, b, None)
            .unwrap();
        assert_eq!(outcome.cleanup.surface_data_removed, 1);

        for &app in &arena.feature(b).unwrap().appearances {
            let app = arena.appearance(app).unwrap();
            assert!(!app.surface_data.is_empty());
            for &sd in &app.surface_data {
                let sd = arena.surface_data(sd).unwrap();
                assert_eq!(sd.id.as_deref(), Some("m2"));
                assert_eq!(sd.targets.len(), 1);
            }
        }
    }

    #[test]
    fn kept_level_referencing_removed_level_gets_a_copy() {
        let mut record = FeatureRecord::new("Building", Some("b"));
        with_surface(&mut record, 2, "g2");
        record.geometry.push(GeometryPropertyRecord::inline(
            "lod3MultiSurface",
            3,
            GeometryRecord::new(
                Some("g3"),
                ShapeRecord::MultiSurface {
                    members: vec![MemberRecord::href("g2_p")],
                },
            ),
        ));
        let mut arena = ModelArena::new();
        let b = arena.import_feature(record, None).unwrap();

        assert!(filter_by_lod(&mut arena, b, &LodPolicy::Keep(set(&[3])), false).unwrap());
        let g3 = arena.geometry_by_id("g3").unwrap();
        let members = arena.geometry(g3).unwrap().shape.members();
        assert!(matches!(members[0], city_lite_model::Member::Inline(_)));
        assert!(arena.geometry_by_id("g2_p").is_none());
    }

    #[test]
    fn lod4_becomes_lod3() {
        let mut record = FeatureRecord::new("Building", Some("b"));
        record
            .geometry
            .push(GeometryPropertyRecord::inline("lod2Solid", 2, solid("s2")));
        record
            .geometry
            .push(GeometryPropertyRecord::inline("lod4Solid", 4, solid("s4")));
        let mut arena = ModelArena::new();
        let b = arena.import_feature(record, None).unwrap();

        let relabelled = use_higher_lod_as(&mut arena, b, lod(4), lod(3), None).unwrap();
        assert_eq!(relabelled, 1);

        let present = arena.lods_present(b);
        assert_eq!(present, [false, false, true, true, false]);
        let exported = arena.export_feature(b).unwrap();
        let names: Vec<&str> = exported.geometry.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["lod2Solid", "lod3Solid"]);
        let s4 = arena.geometry_by_id("s4").unwrap();
        assert_eq!(arena.geometry(s4).unwrap().lod, Some(lod(3)));
    }

    #[test]
    fn lod_mapping_without_source_level_is_a_no_op() {
        let mut record = FeatureRecord::new("Building", Some("b"));
        record
            .geometry
            .push(GeometryPropertyRecord::inline("lod3Solid", 3, solid("s3")));
        let mut arena = ModelArena::new();
        let b = arena.import_feature(record, None).unwrap();

        assert_eq!(use_higher_lod_as(&mut arena, b, lod(4), lod(3), None).unwrap(), 0);
        assert!(arena.geometry_by_id("s3").is_some());
    }
}
