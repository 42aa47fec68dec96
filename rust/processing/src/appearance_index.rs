// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Reverse index from geometry ids to the surface data that decorate them.
//!
//! Built in one scan over a set of appearances. Removing the targets of a
//! geometry cascades: surface data left without targets is removed from its
//! appearance, and an appearance left without surface data is removed from
//! its owning feature. Emptied global appearances are not removed here; they
//! are reported so that postprocessing can drop them once the whole document
//! has been seen.

use city_lite_model::{AppearanceKey, AppearanceOwner, FeatureKey, ModelArena, SurfaceDataKey};
use rustc_hash::{FxHashMap, FxHashSet};

use crate::error::Result;

/// What a cleanup removed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Cleanup {
    pub targets_removed: usize,
    pub surface_data_removed: usize,
    pub appearances_removed: usize,
    /// Global appearances left without surface data.
    pub emptied_globals: Vec<AppearanceKey>,
}

impl Cleanup {
    pub fn merge(&mut self, other: Cleanup) {
        self.targets_removed += other.targets_removed;
        self.surface_data_removed += other.surface_data_removed;
        self.appearances_removed += other.appearances_removed;
        self.emptied_globals.extend(other.emptied_globals);
    }
}

/// Target id → surface data entries targeting it.
#[derive(Debug, Clone, Default)]
pub struct AppearanceIndex {
    targets: FxHashMap<String, Vec<SurfaceDataKey>>,
    capacity_hint: usize,
}

impl AppearanceIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Indexes the targets of all surface data of the given appearances.
    pub fn index(arena: &ModelArena, appearances: &[AppearanceKey]) -> Self {
        let themes: FxHashSet<Option<&str>> = appearances
            .iter()
            .filter_map(|&a| arena.appearance(a))
            .map(|a| a.theme.as_deref())
            .collect();

        let mut index = Self {
            targets: FxHashMap::default(),
            capacity_hint: themes.len().max(1),
        };
        for &a in appearances {
            let Some(appearance) = arena.appearance(a) else {
                continue;
            };
            for &sd in &appearance.surface_data {
                let Some(data) = arena.surface_data(sd) else {
                    continue;
                };
                for target in &data.targets {
                    index.insert(&target.uri, sd);
                }
            }
        }
        index
    }

    /// Indexes the appearances owned anywhere inside a feature tree.
    pub fn for_feature(arena: &ModelArena, feature: FeatureKey) -> Self {
        let appearances: Vec<AppearanceKey> = arena
            .feature_tree(feature)
            .into_iter()
            .filter_map(|f| arena.feature(f))
            .flat_map(|f| f.appearances.iter().copied())
            .collect();
        Self::index(arena, &appearances)
    }

    pub fn insert(&mut self, target: &str, surface_data: SurfaceDataKey) {
        let hint = self.capacity_hint.max(1);
        let entries = self
            .targets
            .entry(target.to_string())
            .or_insert_with(|| Vec::with_capacity(hint));
        if !entries.contains(&surface_data) {
            entries.push(surface_data);
        }
    }

    /// Surface data entries currently targeting `id`.
    pub fn surface_data_for(&self, id: &str) -> &[SurfaceDataKey] {
        self.targets.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn contains(&self, id: &str) -> bool {
        self.targets.contains_key(id)
    }

    /// Returns and forgets all associations of a target id.
    pub fn remove_targets(&mut self, id: &str) -> Vec<SurfaceDataKey> {
        self.targets.remove(id).unwrap_or_default()
    }

    pub fn target_ids(&self) -> impl Iterator<Item = &str> {
        self.targets.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    /// Removes every target pointing at `geometry_id` from the indexed
    /// surface data and prunes whatever becomes empty.
    pub fn detach(&mut self, arena: &mut ModelArena, geometry_id: &str) -> Result<Cleanup> {
        let mut cleanup = Cleanup::default();
        for sd in self.remove_targets(geometry_id) {
            let Some(data) = arena.surface_data_mut(sd) else {
                continue;
            };
            let before = data.targets.len();
            data.targets.retain(|t| t.uri != geometry_id);
            cleanup.targets_removed += before - data.targets.len();

            if data.targets.is_empty() {
                let appearance = data.appearance;
                arena.remove_surface_data(sd)?;
                cleanup.surface_data_removed += 1;
                prune_appearance(arena, appearance, &mut cleanup)?;
            }
        }
        Ok(cleanup)
    }

    /// [`detach`](Self::detach) for many ids.
    pub fn detach_all<'a>(
        &mut self,
        arena: &mut ModelArena,
        geometry_ids: impl IntoIterator<Item = &'a String>,
    ) -> Result<Cleanup> {
        let mut cleanup = Cleanup::default();
        for id in geometry_ids {
            if self.contains(id) {
                cleanup.merge(self.detach(arena, id)?);
            }
        }
        Ok(cleanup)
    }
}

/// Removes an appearance that has no surface data left. Feature-owned
/// appearances are unlinked right away, global ones are reported.
pub fn prune_appearance(
    arena: &mut ModelArena,
    appearance: AppearanceKey,
    cleanup: &mut Cleanup,
) -> Result<()> {
    let Some(data) = arena.appearance(appearance) else {
        return Ok(());
    };
    if !data.surface_data.is_empty() {
        return Ok(());
    }
    match data.owner {
        AppearanceOwner::Global => {
            if !cleanup.emptied_globals.contains(&appearance) {
                cleanup.emptied_globals.push(appearance);
            }
        }
        AppearanceOwner::Feature(_) => {
            arena.remove_appearance(appearance)?;
            cleanup.appearances_removed += 1;
        }
    }
    Ok(())
}
