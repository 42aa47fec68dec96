// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Geometry references between top-level features.
//!
//! Top-level features are serialized independently, so a geometry declared
//! in one feature and referenced by href from another cannot survive being
//! split apart. Resolution takes two streaming passes:
//!
//! 1. Pass A reads every feature once and records, per shared geometry id,
//!    the feature declaring it and the features referencing it. A short
//!    extraction pass then buffers the payloads of shared geometries only.
//! 2. While the document is streamed for output, [`CrossFeaturePlan::apply`]
//!    rewrites each feature as it passes by.
//!
//! The owner of a shared geometry is the lowest feature index among its
//! declarer and referencers. The owner holds the geometry with its original
//! identifiers; every other involved feature gets a private copy with fresh
//! identifiers. Inside one feature the first referencing location receives
//! the copy inline and the remaining locations point at it. Local appearances
//! of the declarer that target the shared subtree follow the geometry into
//! appearances owned by the receiving feature.

use std::collections::BTreeSet;

use city_lite_model::{
    clip_href, AppearanceKey, AppearanceOwner, AppearanceRecord, DocumentMember, DocumentSource,
    FeatureKey, GeometryKey, GeometryOwner, GeometryRecord, Member, MemberFilter, ModelArena,
    Relation, Slot,
};
use rustc_hash::{FxHashMap, FxHashSet};

use crate::appearance_index::AppearanceIndex;
use crate::context::DocumentContext;
use crate::copy::{ensure_fits, GeometryCopyBuilder};
use crate::error::{Error, Result};

/// Relation type recorded between features sharing a geometry.
pub const SHARED_RELATION: &str = "shared";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CrossFeatureStats {
    /// Reference locations that will be rewritten.
    pub resolved: usize,
    pub relations_created: usize,
}

#[derive(Debug, Clone)]
struct SharedGeometry {
    declarer: usize,
    owner: usize,
    payload: Option<GeometryRecord>,
    /// Local appearances of the declarer, restricted to the shared subtree.
    decoration: Vec<AppearanceRecord>,
}

/// The rewrites pass A decided on, applied feature by feature.
#[derive(Debug, Default)]
pub struct CrossFeaturePlan {
    shared: FxHashMap<String, SharedGeometry>,
    /// Feature index → shared ids the feature is involved with.
    involved: FxHashMap<usize, Vec<String>>,
    /// Feature index → related feature indices.
    relations: FxHashMap<usize, Vec<usize>>,
    /// Feature index → id, including lazily assigned ones.
    feature_ids: Vec<Option<String>>,
    assigned_ids: FxHashMap<usize, String>,
    builder: GeometryCopyBuilder,
}

/// Runs pass A and the extraction pass over `source` and stores the
/// resulting plan in `ctx`.
pub fn resolve_cross_feature_references(
    source: &dyn DocumentSource,
    ctx: &mut DocumentContext,
) -> Result<CrossFeatureStats> {
    let mut declarations: FxHashMap<String, usize> = FxHashMap::default();
    let mut referencers: FxHashMap<String, Vec<usize>> = FxHashMap::default();
    let mut locations: FxHashMap<String, usize> = FxHashMap::default();
    let mut feature_ids = Vec::new();

    // Pass A
    let mut reader = source.open(MemberFilter::features())?;
    while let Some(member) = reader.next_member()? {
        let DocumentMember::Feature(record) = member else {
            continue;
        };
        let index = feature_ids.len();
        let mut scratch = ModelArena::new();
        let key = scratch.import_feature(record, None)?;

        for id in scratch.collect_ids(key) {
            ctx.arena.ids.register(&id);
        }
        for g in scratch.tree_geometries(key) {
            if let Some(id) = scratch.geometry(g).and_then(|g| g.id.clone()) {
                declarations.entry(id).or_insert(index);
            }
        }
        for (_, target) in scratch.reference_slots(key) {
            if scratch.geometry_by_id(&target).is_some() {
                continue;
            }
            *locations.entry(target.clone()).or_default() += 1;
            let users = referencers.entry(target).or_default();
            if users.last() != Some(&index) {
                users.push(index);
            }
        }
        feature_ids.push(scratch.feature(key).and_then(|f| f.id.clone()));
    }
    drop(reader);

    let mut plan = CrossFeaturePlan {
        feature_ids,
        ..Default::default()
    };
    let mut stats = CrossFeatureStats::default();

    let mut targets: Vec<(String, Vec<usize>)> = referencers.into_iter().collect();
    targets.sort();
    for (id, users) in targets {
        let Some(&declarer) = declarations.get(&id) else {
            tracing::debug!(href = %id, "dangling cross-feature reference left unresolved");
            continue;
        };
        let owner = users.iter().copied().chain([declarer]).min().unwrap_or(declarer);
        stats.resolved += locations.get(&id).copied().unwrap_or(0);

        for f in std::iter::once(declarer).chain(users.iter().copied()) {
            let ids = plan.involved.entry(f).or_default();
            if !ids.contains(&id) {
                ids.push(id.clone());
            }
        }
        plan.shared.insert(
            id,
            SharedGeometry {
                declarer,
                owner,
                payload: None,
                decoration: Vec::new(),
            },
        );
    }

    if plan.shared.is_empty() {
        ctx.cross_feature = Some(plan);
        return Ok(stats);
    }

    // Extraction pass: payloads of shared geometries, nothing else.
    let mut by_declarer: FxHashMap<usize, Vec<String>> = FxHashMap::default();
    for (id, shared) in &plan.shared {
        by_declarer.entry(shared.declarer).or_default().push(id.clone());
    }
    let mut reader = source.open(MemberFilter::features())?;
    let mut index = 0;
    while let Some(member) = reader.next_member()? {
        let DocumentMember::Feature(record) = member else {
            continue;
        };
        if let Some(ids) = by_declarer.get(&index) {
            let mut scratch = ModelArena::new();
            let key = scratch.import_feature(record, None)?;
            let local = AppearanceIndex::for_feature(&scratch, key);
            for id in ids {
                if let Some(g) = scratch.geometry_by_id(id) {
                    let payload = scratch.export_geometry(g)?;
                    let decoration = decoration_of(&scratch, &local, g)?;
                    if let Some(shared) = plan.shared.get_mut(id) {
                        shared.payload = Some(payload);
                        shared.decoration = decoration;
                    }
                }
            }
        }
        index += 1;
    }
    drop(reader);

    if ctx.options.cross_feature_relations {
        stats.relations_created = plan.plan_relations(&mut ctx.arena);
    }

    tracing::info!(
        document = source.name(),
        shared = plan.shared.len(),
        resolved = stats.resolved,
        relations = stats.relations_created,
        "cross-feature references planned"
    );
    ctx.cross_feature = Some(plan);
    Ok(stats)
}

impl CrossFeaturePlan {
    /// Pairs every non-owner with the owner of each shared geometry and
    /// assigns ids to anonymous features taking part. Returns the number of
    /// relation records that will be written.
    fn plan_relations(&mut self, arena: &mut ModelArena) -> usize {
        let mut pairs: BTreeSet<(usize, usize)> = BTreeSet::new();
        for (f, ids) in &self.involved {
            for id in ids {
                let owner = self.shared[id].owner;
                if *f != owner {
                    pairs.insert((*f.min(&owner), *f.max(&owner)));
                }
            }
        }

        for &(a, b) in &pairs {
            self.relations.entry(a).or_default().push(b);
            self.relations.entry(b).or_default().push(a);
            for f in [a, b] {
                if self.feature_ids.get(f).is_some_and(Option::is_none) {
                    let id = arena.ids.fresh();
                    self.feature_ids[f] = Some(id.clone());
                    self.assigned_ids.insert(f, id);
                }
            }
        }
        pairs.len() * 2
    }

    pub fn is_empty(&self) -> bool {
        self.shared.is_empty()
    }

    /// Rewrites the top-level feature with stream index `index`.
    ///
    /// Returns the number of reference locations rewritten.
    pub fn apply(
        &mut self,
        arena: &mut ModelArena,
        index: usize,
        feature: FeatureKey,
        global: Option<&AppearanceIndex>,
    ) -> Result<usize> {
        if let Some(id) = self.assigned_ids.get(&index) {
            arena.set_feature_id(feature, id.clone())?;
        }
        if let Some(related) = self.relations.get(&index) {
            for r in related {
                let Some(Some(related_to)) = self.feature_ids.get(*r) else {
                    continue;
                };
                if let Some(data) = arena.feature_mut(feature) {
                    let relation = Relation {
                        related_to: related_to.clone(),
                        relation_type: SHARED_RELATION.to_string(),
                    };
                    if !data.relations.contains(&relation) {
                        data.relations.push(relation);
                    }
                }
            }
        }

        let Some(ids) = self.involved.get(&index).cloned() else {
            return Ok(0);
        };
        let mut local = AppearanceIndex::for_feature(arena, feature);
        let mut rewritten = 0;

        for id in ids {
            let Some((owner, declarer)) = self.shared.get(&id).map(|s| (s.owner, s.declarer)) else {
                continue;
            };

            if index == declarer {
                if index != owner {
                    self.rehome_declaration(arena, feature, &id, &mut local)?;
                }
                continue;
            }

            let slots = slots_referencing(arena, feature, &id);
            if slots.is_empty() {
                continue;
            }
            let Some((payload, decoration)) = self
                .shared
                .get(&id)
                .and_then(|s| Some((s.payload.clone()?, s.decoration.clone())))
            else {
                tracing::debug!(href = %id, "shared geometry payload unavailable");
                continue;
            };

            let kind = arena.slot_kind(slots[0]);
            let staged = arena.import_geometry(payload, GeometryOwner::Template, None);
            if let Err(e) = ensure_fits(arena, staged, kind) {
                arena.remove_geometry(staged);
                return Err(e);
            }

            let staged_apps: Vec<AppearanceKey> = decoration
                .into_iter()
                .map(|record| arena.import_appearance(record, AppearanceOwner::Global))
                .collect();
            let staged_index = AppearanceIndex::index(arena, &staged_apps);

            let placed = if index == owner {
                // Original ids; the remaining locations already point at them.
                let id_map: FxHashMap<String, String> = subtree_ids(arena, staged)
                    .into_iter()
                    .map(|id| (id.clone(), id))
                    .collect();
                arena
                    .set_slot(slots[0], Member::Inline(staged))
                    .map(|_| id_map)
                    .map_err(Error::from)
            } else {
                let copy = self.builder.copy(arena, staged, kind);
                arena.remove_geometry(staged);
                copy.and_then(|copy| {
                    arena.set_slot(slots[0], Member::Inline(copy.root))?;
                    self.builder
                        .retarget(arena, &copy.id_map, feature, &mut local, global);
                    if let Some(copy_id) = copy.root_id(arena).map(str::to_string) {
                        for &slot in &slots[1..] {
                            arena.set_slot(slot, Member::Reference(copy_id.clone()))?;
                        }
                    }
                    Ok(copy.id_map)
                })
            };
            if let Ok(id_map) = &placed {
                self.builder
                    .retarget_from(arena, id_map, feature, &staged_index, &mut local);
            }
            for app in staged_apps {
                arena.remove_appearance(app)?;
            }
            placed?;
            rewritten += slots.len();
        }

        Ok(rewritten)
    }

    /// The declarer lost ownership to an earlier referencer: its declaration
    /// becomes a private copy with fresh ids, and its own references and
    /// appearance targets follow the new ids.
    fn rehome_declaration(
        &mut self,
        arena: &mut ModelArena,
        feature: FeatureKey,
        id: &str,
        local: &mut AppearanceIndex,
    ) -> Result<()> {
        let Some(key) = arena.geometry_by_id(id) else {
            return Ok(());
        };
        let Some(slot) = arena.slot_of(key) else {
            return Ok(());
        };
        let copy = self.builder.copy(arena, key, arena.slot_kind(slot))?;
        arena.set_slot(slot, Member::Inline(copy.root))?;
        arena.remove_geometry(key);

        for (slot, target) in arena.reference_slots(feature) {
            if let Some(new) = copy.id_map.get(&target) {
                arena.set_slot(slot, Member::Reference(new.clone()))?;
            }
        }
        for (old, new) in &copy.id_map {
            for sd in local.remove_targets(old) {
                if let Some(data) = arena.surface_data_mut(sd) {
                    for target in data.targets.iter_mut().filter(|t| t.uri == *old) {
                        target.uri = new.clone();
                    }
                }
                local.insert(new, sd);
            }
        }
        Ok(())
    }
}

/// The appearances in `local` that target the subtree of `root`, with
/// their targets restricted to that subtree.
fn decoration_of(
    arena: &ModelArena,
    local: &AppearanceIndex,
    root: GeometryKey,
) -> Result<Vec<AppearanceRecord>> {
    let ids = subtree_ids(arena, root);
    let members: FxHashSet<&str> = ids.iter().map(String::as_str).collect();

    let mut appearances: Vec<AppearanceKey> = Vec::new();
    for id in &ids {
        for &sd in local.surface_data_for(id) {
            if let Some(app) = arena.surface_data(sd).map(|d| d.appearance) {
                if !appearances.contains(&app) {
                    appearances.push(app);
                }
            }
        }
    }

    let mut records = Vec::with_capacity(appearances.len());
    for app in appearances {
        let mut record = arena.export_appearance(app)?;
        for sd in &mut record.surface_data {
            sd.targets.retain(|t| members.contains(clip_href(&t.uri)));
        }
        record.surface_data.retain(|sd| !sd.targets.is_empty());
        records.push(record);
    }
    Ok(records)
}

fn subtree_ids(arena: &ModelArena, root: GeometryKey) -> Vec<String> {
    arena
        .geometry_tree(root)
        .into_iter()
        .filter_map(|g| arena.geometry(g).and_then(|g| g.id.clone()))
        .collect()
}

fn slots_referencing(arena: &ModelArena, feature: FeatureKey, id: &str) -> Vec<Slot> {
    arena
        .reference_slots(feature)
        .into_iter()
        .filter(|(_, target)| target == id)
        .map(|(slot, _)| slot)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ProcessingOptions;
    use city_lite_model::{
        DocumentHeader, FeatureRecord, GeometryPropertyRecord, MemberRecord, MemoryDocument,
        PropertyValue, ShapeRecord, SurfaceDataKind, SurfaceDataRecord, Target,
    };
    use rustc_hash::FxHashSet;

    fn solid(id: &str) -> GeometryRecord {
        GeometryRecord::new(
            Some(id),
            ShapeRecord::Solid {
                exterior: Some(MemberRecord::inline(GeometryRecord::new(
                    Some(&format!("{id}_shell")),
                    ShapeRecord::CompositeSurface {
                        members: Vec::new(),
                    },
                ))),
            },
        )
    }

    fn declaring(id: &str) -> FeatureRecord {
        let mut f = FeatureRecord::new("Building", Some(id));
        f.geometry
            .push(GeometryPropertyRecord::inline("lod2Solid", 2, solid("g1")));
        f
    }

    fn referencing(id: Option<&str>) -> FeatureRecord {
        let mut f = FeatureRecord::new("Building", id);
        f.geometry
            .push(GeometryPropertyRecord::href("lod2Solid", 2, "g1"));
        f
    }

    /// Streams the document the way the output pass does and returns the
    /// rewritten features.
    fn run(doc: &MemoryDocument, relations: bool) -> (Vec<FeatureRecord>, CrossFeatureStats) {
        let options = ProcessingOptions {
            resolve_cross_feature: true,
            cross_feature_relations: relations,
            ..Default::default()
        };
        let mut ctx = DocumentContext::new(DocumentHeader::default(), options);
        let stats = resolve_cross_feature_references(doc, &mut ctx).unwrap();
        let mut plan = ctx.cross_feature.take().unwrap();

        let mut out = Vec::new();
        let mut reader = doc.open(MemberFilter::features()).unwrap();
        let mut index = 0;
        while let Some(DocumentMember::Feature(record)) = reader.next_member().unwrap() {
            let key = ctx.arena.import_feature(record, None).unwrap();
            plan.apply(&mut ctx.arena, index, key, None).unwrap();
            out.push(ctx.arena.export_feature(key).unwrap());
            ctx.arena.remove_feature(key).unwrap();
            index += 1;
        }
        (out, stats)
    }

    fn inline_id(record: &FeatureRecord) -> Option<String> {
        record.geometry[0].geometry.as_ref().and_then(|g| g.id.clone())
    }

    #[test]
    fn first_referencer_owns_and_others_get_private_copies() {
        let doc = MemoryDocument::new("doc", DocumentHeader::default())
            .with_member(DocumentMember::Feature(referencing(Some("f1"))))
            .with_member(DocumentMember::Feature(referencing(Some("f2"))))
            .with_member(DocumentMember::Feature(referencing(Some("f3"))))
            .with_member(DocumentMember::Feature(declaring("d")));

        let (out, stats) = run(&doc, false);
        assert_eq!(stats.resolved, 3);

        assert_eq!(inline_id(&out[0]).as_deref(), Some("g1"));
        let ids: Vec<String> = out.iter().map(|f| inline_id(f).unwrap()).collect();
        let distinct: FxHashSet<&String> = ids.iter().collect();
        assert_eq!(distinct.len(), 4, "copies must not share ids: {ids:?}");
        for f in &out {
            assert!(f.geometry[0].href.is_none());
        }
    }

    #[test]
    fn earlier_declarer_keeps_original_ids() {
        let doc = MemoryDocument::new("doc", DocumentHeader::default())
            .with_member(DocumentMember::Feature(declaring("d")))
            .with_member(DocumentMember::Feature(referencing(Some("f1"))));

        let (out, _) = run(&doc, false);
        assert_eq!(inline_id(&out[0]).as_deref(), Some("g1"));
        let copy = inline_id(&out[1]).unwrap();
        assert_ne!(copy, "g1");

        // The nested shell is copied with a fresh id as well.
        let ShapeRecord::Solid {
            exterior: Some(MemberRecord::Inline(shell)),
        } = &out[1].geometry[0].geometry.as_ref().unwrap().shape
        else {
            panic!("expected solid with inline shell");
        };
        assert_ne!(shell.id.as_deref(), Some("g1_shell"));
    }

    fn shell_id(record: &FeatureRecord) -> Option<String> {
        match &record.geometry[0].geometry.as_ref()?.shape {
            ShapeRecord::Solid {
                exterior: Some(MemberRecord::Inline(shell)),
            } => shell.id.clone(),
            _ => None,
        }
    }

    fn target_uris(record: &FeatureRecord) -> Vec<String> {
        record
            .appearances
            .iter()
            .flat_map(|a| &a.surface_data)
            .flat_map(|sd| &sd.targets)
            .map(|t| t.uri.clone())
            .collect()
    }

    #[test]
    fn declarer_decoration_follows_the_geometry() {
        let mut d = declaring("d");
        d.appearances.push(AppearanceRecord {
            id: None,
            theme: Some("rgb".into()),
            surface_data: vec![SurfaceDataRecord {
                id: Some("red".into()),
                kind: SurfaceDataKind::X3DMaterial,
                is_front: true,
                image_uri: None,
                properties: Default::default(),
                targets: ["#g1_shell", "#elsewhere"]
                    .iter()
                    .map(|uri| Target {
                        uri: uri.to_string(),
                        coords: None,
                    })
                    .collect(),
            }],
        });
        let doc = MemoryDocument::new("doc", DocumentHeader::default())
            .with_member(DocumentMember::Feature(referencing(Some("f1"))))
            .with_member(DocumentMember::Feature(referencing(Some("f2"))))
            .with_member(DocumentMember::Feature(d));

        let (out, _) = run(&doc, false);

        // The owner keeps the original ids and gets its own material.
        assert_eq!(out[0].appearances.len(), 1);
        let owned = &out[0].appearances[0];
        assert_eq!(owned.theme.as_deref(), Some("rgb"));
        assert_eq!(owned.surface_data.len(), 1);
        assert_ne!(owned.surface_data[0].id.as_deref(), Some("red"));
        assert_eq!(target_uris(&out[0]), vec!["#g1_shell".to_string()]);

        let copied_shell = shell_id(&out[1]).unwrap();
        assert_ne!(copied_shell, "g1_shell");
        assert_eq!(target_uris(&out[1]), vec![format!("#{copied_shell}")]);

        // The declarer's material follows its re-homed copy.
        let rehomed_shell = shell_id(&out[2]).unwrap();
        assert_eq!(out[2].appearances[0].surface_data[0].id.as_deref(), Some("red"));
        let uris = target_uris(&out[2]);
        assert_eq!(uris.len(), 2);
        assert!(uris.contains(&format!("#{rehomed_shell}")));
        assert!(uris.contains(&"#elsewhere".to_string()));
    }

    #[test]
    fn relations_link_non_owners_to_owner() {
        let doc = MemoryDocument::new("doc", DocumentHeader::default())
            .with_member(DocumentMember::Feature(declaring("d")))
            .with_member(DocumentMember::Feature(referencing(None)));

        let (out, stats) = run(&doc, true);
        assert_eq!(stats.relations_created, 2);

        let assigned = out[1].id.clone().expect("anonymous feature gets an id");
        assert_eq!(out[0].relations[0].related_to, format!("#{assigned}"));
        assert_eq!(out[0].relations[0].relation_type, SHARED_RELATION);
        assert_eq!(out[1].relations[0].related_to, "#d");
    }

    #[test]
    fn several_locations_in_one_feature_share_one_copy() {
        let mut f = referencing(Some("f1"));
        f.geometry
            .push(GeometryPropertyRecord::href("lod3Solid", 3, "g1"));
        let doc = MemoryDocument::new("doc", DocumentHeader::default())
            .with_member(DocumentMember::Feature(declaring("d")))
            .with_member(DocumentMember::Feature(f));

        let (out, stats) = run(&doc, false);
        assert_eq!(stats.resolved, 2);
        let copy = inline_id(&out[1]).unwrap();
        assert_eq!(out[1].geometry[1].href.as_deref(), Some(format!("#{copy}").as_str()));
    }

    #[test]
    fn dangling_references_are_left_alone() {
        let mut f = FeatureRecord::new("Building", Some("f1"));
        f.geometry
            .push(GeometryPropertyRecord::href("lod2Solid", 2, "nowhere"));
        let doc = MemoryDocument::new("doc", DocumentHeader::default())
            .with_member(DocumentMember::Feature(f));

        let (out, stats) = run(&doc, false);
        assert_eq!(stats, CrossFeatureStats::default());
        assert_eq!(out[0].geometry[0].href.as_deref(), Some("#nowhere"));
    }

    #[test]
    fn arena_value_is_inline_after_apply() {
        let doc = MemoryDocument::new("doc", DocumentHeader::default())
            .with_member(DocumentMember::Feature(declaring("d")))
            .with_member(DocumentMember::Feature(referencing(Some("f1"))));
        let mut ctx = DocumentContext::new(
            DocumentHeader::default(),
            ProcessingOptions::default(),
        );
        resolve_cross_feature_references(&doc, &mut ctx).unwrap();
        let mut plan = ctx.cross_feature.take().unwrap();

        let DocumentMember::Feature(record) = doc.members[1].clone() else {
            unreachable!()
        };
        let key = ctx.arena.import_feature(record, None).unwrap();
        assert_eq!(plan.apply(&mut ctx.arena, 1, key, None).unwrap(), 1);
        let property = &ctx.arena.feature(key).unwrap().geometry[0];
        assert!(matches!(property.value, PropertyValue::Inline(_)));
    }
}
