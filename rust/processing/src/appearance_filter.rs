// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Appearance removal and conversion of global appearances to local ones.

use city_lite_model::{AppearanceKey, FeatureKey, ModelArena, SurfaceDataKind};
use rustc_hash::{FxHashMap, FxHashSet};

use crate::appearance_index::AppearanceIndex;
use crate::copy::GeometryCopyBuilder;
use crate::error::Result;

/// Selects surface data for removal. An empty filter selects everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppearanceFilter {
    /// Themes to remove; `None` inside the set stands for the unnamed theme.
    pub themes: Option<FxHashSet<Option<String>>>,
    pub only_textures: bool,
    pub only_materials: bool,
}

impl AppearanceFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn with_themes<I>(mut self, themes: I) -> Self
    where
        I: IntoIterator<Item = Option<String>>,
    {
        self.themes = Some(themes.into_iter().collect());
        self
    }

    fn matches_theme(&self, theme: Option<&str>) -> bool {
        self.themes
            .as_ref()
            .map_or(true, |t| t.contains(&theme.map(str::to_string)))
    }

    fn matches_kind(&self, kind: SurfaceDataKind) -> bool {
        match (self.only_textures, self.only_materials) {
            (true, false) => kind.is_texture(),
            (false, true) => !kind.is_texture(),
            _ => true,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AppearanceRemovalStats {
    pub appearances: usize,
    pub surface_data: usize,
}

impl AppearanceRemovalStats {
    pub fn merge(&mut self, other: AppearanceRemovalStats) {
        self.appearances += other.appearances;
        self.surface_data += other.surface_data;
    }
}

/// Removes matching surface data from the appearances of a feature tree and
/// drops appearances left empty.
pub fn remove_appearances(
    arena: &mut ModelArena,
    feature: FeatureKey,
    filter: &AppearanceFilter,
) -> Result<AppearanceRemovalStats> {
    let appearances: Vec<AppearanceKey> = arena
        .feature_tree(feature)
        .into_iter()
        .filter_map(|f| arena.feature(f))
        .flat_map(|f| f.appearances.iter().copied())
        .collect();
    filter_appearances(arena, &appearances, filter)
}

/// Applies a filter to the given appearances, removing matching surface
/// data and appearances left empty, global ones included.
pub fn filter_appearances(
    arena: &mut ModelArena,
    appearances: &[AppearanceKey],
    filter: &AppearanceFilter,
) -> Result<AppearanceRemovalStats> {
    let mut stats = AppearanceRemovalStats::default();
    for &key in appearances {
        let Some(appearance) = arena.appearance(key) else {
            continue;
        };
        if !filter.matches_theme(appearance.theme.as_deref()) {
            continue;
        }
        let doomed: Vec<_> = appearance
            .surface_data
            .iter()
            .copied()
            .filter(|&sd| arena.surface_data(sd).is_some_and(|d| filter.matches_kind(d.kind)))
            .collect();
        for sd in doomed {
            arena.remove_surface_data(sd)?;
            stats.surface_data += 1;
        }
        if arena.appearance(key).is_some_and(|a| a.surface_data.is_empty()) {
            arena.remove_appearance(key)?;
            stats.appearances += 1;
        }
    }
    Ok(stats)
}

/// Moves the global appearance targets pointing into a feature tree into
/// appearances owned by the feature. Global surface data left without
/// targets is removed; emptied global appearances stay until postprocessing.
///
/// Returns the number of targets moved.
pub fn to_local_appearances(
    arena: &mut ModelArena,
    feature: FeatureKey,
    global: &mut AppearanceIndex,
    builder: &mut GeometryCopyBuilder,
) -> Result<usize> {
    let ids: FxHashMap<String, String> = arena
        .tree_geometries(feature)
        .into_iter()
        .filter_map(|g| arena.geometry(g).and_then(|g| g.id.clone()))
        .filter(|id| global.contains(id))
        .map(|id| (id.clone(), id))
        .collect();
    if ids.is_empty() {
        return Ok(0);
    }

    let mut local = AppearanceIndex::new();
    let moved = builder.retarget(arena, &ids, feature, &mut local, Some(global));
    global.detach_all(arena, ids.keys())?;
    tracing::trace!(targets = moved, "converted global appearance targets");
    Ok(moved)
}
