// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Deep copies of geometry subtrees with fresh identifiers.
//!
//! A copy is structurally independent of its source: every copied object
//! that had an identifier gets a new one from the document's id pool, and
//! references between objects inside the copied subtree are rewritten to the
//! new identifiers. References leaving the subtree are kept as they are.
//!
//! When appearances decorate the source, [`GeometryCopyBuilder::retarget`]
//! re-creates the decoration for the copy inside appearances owned by the
//! receiving feature. Materialized appearances and surface data are reused
//! per owner, so copying many geometries that share one material yields one
//! new material with many targets.

use city_lite_model::{
    AppearanceData, AppearanceKey, AppearanceOwner, FeatureKey, GeometryData, GeometryKey,
    GeometryOwner, Member, ModelArena, Shape, SlotKind, SurfaceData, SurfaceDataKey, Target,
};
use rustc_hash::FxHashMap;

use crate::appearance_index::AppearanceIndex;
use crate::error::{Error, Result};

/// Result of a copy.
#[derive(Debug, Clone)]
pub struct GeometryCopy {
    /// Root of the copied subtree, not yet placed into any slot.
    pub root: GeometryKey,
    /// Old id → new id for every copied object that had an id.
    pub id_map: FxHashMap<String, String>,
    /// Number of copied geometry objects.
    pub objects: usize,
}

impl GeometryCopy {
    /// The new identifier of the copy root, if the source root had one.
    pub fn root_id<'a>(&self, arena: &'a ModelArena) -> Option<&'a str> {
        arena.geometry(self.root).and_then(|g| g.id.as_deref())
    }
}

/// Creates geometry copies and the appearance objects that go with them.
#[derive(Debug, Default)]
pub struct GeometryCopyBuilder {
    /// (owner, source surface data) → materialized surface data
    by_source: FxHashMap<(FeatureKey, SurfaceDataKey), SurfaceDataKey>,
    /// (owner, theme) → materialized appearance
    by_theme: FxHashMap<(FeatureKey, Option<String>), AppearanceKey>,
}

impl GeometryCopyBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deep-copies `source` for placement into a slot admitting `kind`.
    ///
    /// Returns [`Error::IncompatibleSlot`] when the source does not fit the
    /// slot. The copy is detached (owned by nothing) until it is put into a
    /// slot with [`ModelArena::set_slot`].
    pub fn copy(&self, arena: &mut ModelArena, source: GeometryKey, kind: SlotKind) -> Result<GeometryCopy> {
        ensure_fits(arena, source, kind)?;

        // Assign all new ids up front so that references to later siblings
        // are remapped as well.
        let mut id_map = FxHashMap::default();
        let subtree = arena.geometry_tree(source);
        for &key in &subtree {
            if let Some(id) = arena.geometry(key).and_then(|g| g.id.clone()) {
                if !id_map.contains_key(&id) {
                    let fresh = arena.ids.fresh();
                    id_map.insert(id, fresh);
                }
            }
        }

        let root = copy_node(arena, source, GeometryOwner::Template, &id_map)?;
        tracing::trace!(objects = subtree.len(), "copied geometry subtree");
        Ok(GeometryCopy {
            root,
            id_map,
            objects: subtree.len(),
        })
    }

    /// Re-creates appearance targets for the ids of a copy, scoped to
    /// `owner`. Sources are looked up in `local` and, if given, `global`;
    /// created targets are registered in `local`.
    ///
    /// Returns the number of targets created.
    pub fn retarget(
        &mut self,
        arena: &mut ModelArena,
        id_map: &FxHashMap<String, String>,
        owner: FeatureKey,
        local: &mut AppearanceIndex,
        global: Option<&AppearanceIndex>,
    ) -> usize {
        let mut created = 0;
        for (old, new) in id_map {
            let mut sources: Vec<SurfaceDataKey> = local.surface_data_for(old).to_vec();
            if let Some(global) = global {
                sources.extend_from_slice(global.surface_data_for(old));
            }
            created += self.add_targets(arena, owner, old, new, &sources, local);
        }
        created
    }

    /// Like [`retarget`](Self::retarget), but takes the sources from
    /// `decoration` only. Used for appearances that belong to another
    /// feature than the one receiving the geometry.
    pub fn retarget_from(
        &mut self,
        arena: &mut ModelArena,
        id_map: &FxHashMap<String, String>,
        owner: FeatureKey,
        decoration: &AppearanceIndex,
        local: &mut AppearanceIndex,
    ) -> usize {
        let mut created = 0;
        for (old, new) in id_map {
            let sources = decoration.surface_data_for(old);
            created += self.add_targets(arena, owner, old, new, sources, local);
        }
        created
    }

    fn add_targets(
        &mut self,
        arena: &mut ModelArena,
        owner: FeatureKey,
        old: &str,
        new: &str,
        sources: &[SurfaceDataKey],
        local: &mut AppearanceIndex,
    ) -> usize {
        let mut created = 0;
        for &source in sources {
            let Some(coords) = arena
                .surface_data(source)
                .and_then(|sd| sd.targets.iter().find(|t| t.uri == old))
                .map(|t| t.coords.clone())
            else {
                continue;
            };
            let Some(target_sd) = self.materialize(arena, owner, source) else {
                continue;
            };
            if let Some(sd) = arena.surface_data_mut(target_sd) {
                sd.targets.push(Target {
                    uri: new.to_string(),
                    coords,
                });
                local.insert(new, target_sd);
                created += 1;
            }
        }
        created
    }

    /// The owner-scoped counterpart of a source surface data entry.
    fn materialize(
        &mut self,
        arena: &mut ModelArena,
        owner: FeatureKey,
        source: SurfaceDataKey,
    ) -> Option<SurfaceDataKey> {
        if let Some(&existing) = self.by_source.get(&(owner, source)) {
            if arena.surface_data(existing).is_some() {
                return Some(existing);
            }
        }

        let source_data = arena.surface_data(source)?.clone();
        let theme = arena.appearance(source_data.appearance)?.theme.clone();

        // A source already owned by the receiving feature is its own bucket.
        if arena.appearance(source_data.appearance)?.owner == AppearanceOwner::Feature(owner) {
            self.by_source.insert((owner, source), source);
            return Some(source);
        }

        let appearance = match self.by_theme.get(&(owner, theme.clone())) {
            Some(&a) if arena.appearance(a).is_some() => a,
            _ => {
                let a = arena.add_appearance(AppearanceData {
                    id: None,
                    theme: theme.clone(),
                    owner: AppearanceOwner::Feature(owner),
                    surface_data: Vec::new(),
                });
                self.by_theme.insert((owner, theme), a);
                a
            }
        };

        let id = source_data.id.as_ref().map(|_| arena.ids.fresh());
        let key = arena.add_surface_data(SurfaceData {
            id,
            targets: Vec::new(),
            appearance,
            ..source_data
        });
        self.by_source.insert((owner, source), key);
        Some(key)
    }
}

/// Fails with [`Error::IncompatibleSlot`] unless the geometry fits a slot
/// admitting `kind`.
pub fn ensure_fits(arena: &ModelArena, geometry: GeometryKey, kind: SlotKind) -> Result<()> {
    let data = arena
        .geometry(geometry)
        .ok_or(city_lite_model::Error::GeometryNotFound(geometry))?;
    let category = data.shape.category();
    if kind.accepts(category) {
        return Ok(());
    }
    Err(Error::IncompatibleSlot {
        geometry: data
            .id
            .clone()
            .unwrap_or_else(|| data.shape.type_name().to_string()),
        expected: kind,
        found: category,
    })
}

fn copy_node(
    arena: &mut ModelArena,
    source: GeometryKey,
    owner: GeometryOwner,
    id_map: &FxHashMap<String, String>,
) -> Result<GeometryKey> {
    let data = arena
        .geometry(source)
        .ok_or(city_lite_model::Error::GeometryNotFound(source))?
        .clone();

    let key = arena.add_geometry(GeometryData {
        id: data.id.as_ref().and_then(|id| id_map.get(id).cloned()),
        srs: data.srs.clone(),
        lod: data.lod,
        owner,
        shape: Shape::MultiSurface(Vec::new()),
    });

    let parent = GeometryOwner::Geometry(key);
    let mut copy_member = |arena: &mut ModelArena, member: &Member| -> Result<Member> {
        Ok(match member {
            Member::Inline(child) => Member::Inline(copy_node(arena, *child, parent, id_map)?),
            Member::Reference(id) => {
                Member::Reference(id_map.get(id).cloned().unwrap_or_else(|| id.clone()))
            }
        })
    };

    let shape = match &data.shape {
        Shape::Point(_) | Shape::LineString(_) | Shape::Polygon { .. } => data.shape.clone(),
        Shape::MultiCurve(m) => Shape::MultiCurve(copy_members(arena, m, &mut copy_member)?),
        Shape::MultiSurface(m) => Shape::MultiSurface(copy_members(arena, m, &mut copy_member)?),
        Shape::CompositeSurface(m) => {
            Shape::CompositeSurface(copy_members(arena, m, &mut copy_member)?)
        }
        Shape::Solid(exterior) => Shape::Solid(
            exterior
                .as_ref()
                .map(|m| copy_member(arena, m))
                .transpose()?,
        ),
        Shape::MultiSolid(m) => Shape::MultiSolid(copy_members(arena, m, &mut copy_member)?),
    };

    if let Some(g) = arena.geometry_mut(key) {
        g.shape = shape;
    }
    Ok(key)
}

fn copy_members<F>(arena: &mut ModelArena, members: &[Member], f: &mut F) -> Result<Vec<Member>>
where
    F: FnMut(&mut ModelArena, &Member) -> Result<Member>,
{
    members.iter().map(|m| f(arena, m)).collect()
}
