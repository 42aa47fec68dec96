// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-document processing state.
//!
//! A [`DocumentContext`] is created fresh for every document, threaded
//! through every engine entry point, and dropped after postprocessing. It
//! owns the arena in which the current top-level feature, the global
//! appearances and the registered templates live.

use city_lite_model::{DocumentHeader, Envelope, IdPool, ModelArena};
use rustc_hash::FxHashSet;
use serde::Serialize;

use crate::appearance_filter::AppearanceFilter;
use crate::appearance_index::AppearanceIndex;
use crate::bbox::BboxMode;
use crate::implicit::TemplateResolver;
use crate::lod_filter::LodPolicy;
use crate::registry::GlobalObjectRegistry;
use crate::resolver::cross_feature::CrossFeaturePlan;
use crate::resolver::cross_lod::CrossLodMode;

/// What to do to a document. Every field is an independent step; steps run
/// in the order the fields are listed.
#[derive(Debug, Clone, Default)]
pub struct ProcessingOptions {
    /// Resolve geometry references between top-level features.
    pub resolve_cross_feature: bool,
    /// Record `shared` relations between features sharing a geometry.
    pub cross_feature_relations: bool,
    pub cross_lod: Option<CrossLodMode>,
    /// Derive LOD 3 from LOD 4 where present.
    pub use_lod4_as_lod3: bool,
    pub lod_filter: Option<(LodPolicy, bool)>,
    pub bbox: Option<(Envelope, BboxMode)>,
    /// Only keep top-level features of these types.
    pub feature_types: Option<FxHashSet<String>>,
    /// Only keep top-level features with these ids.
    pub feature_ids: Option<FxHashSet<String>>,
    pub remove_appearances: Option<AppearanceFilter>,
    pub local_appearances: bool,
    /// Inline template geometries on first placement, href afterwards.
    pub resolve_templates: bool,
}

impl ProcessingOptions {
    /// `true` when the engine needs global appearances at hand.
    pub fn needs_global_appearances(&self) -> bool {
        self.local_appearances
            || self.remove_appearances.is_some()
            || self.lod_filter.is_some()
            || self.cross_lod.is_some()
            || self.use_lod4_as_lod3
            || self.resolve_cross_feature
            || self.bbox.is_some()
            || self.feature_types.is_some()
            || self.feature_ids.is_some()
    }

    /// `true` when the engine deletes geometry, so that groups and global
    /// appearances must be pruned against what was written.
    pub fn removes_content(&self) -> bool {
        self.lod_filter.is_some()
            || self.bbox.is_some()
            || self.feature_types.is_some()
            || self.feature_ids.is_some()
            || self.use_lod4_as_lod3
            || matches!(self.cross_lod, Some(CrossLodMode::RemoveReferencesTo(_)))
    }
}

/// Counters reported at the end of a document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentStats {
    pub features_read: usize,
    pub features_written: usize,
    pub features_removed: usize,
    pub cross_feature_resolved: usize,
    pub relations_created: usize,
    pub cross_lod_resolved: usize,
    pub lod_mapped: usize,
    pub appearances_removed: usize,
    pub surface_data_removed: usize,
    pub appearances_localized: usize,
    pub templates_inlined: usize,
    pub templates_referenced: usize,
    pub groups_written: usize,
    pub groups_removed: usize,
    pub global_appearances_written: usize,
}

impl std::fmt::Display for DocumentStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} features read, {} written, {} removed",
            self.features_read, self.features_written, self.features_removed
        )
    }
}

/// Everything the engine knows about the document being processed.
#[derive(Debug)]
pub struct DocumentContext {
    pub header: DocumentHeader,
    pub options: ProcessingOptions,
    pub arena: ModelArena,
    pub registry: GlobalObjectRegistry,
    /// Index over the global appearances in the arena.
    pub global_index: AppearanceIndex,
    pub cross_feature: Option<CrossFeaturePlan>,
    pub templates: TemplateResolver,
    /// Ids of features written so far.
    pub written_features: FxHashSet<String>,
    /// Ids of geometries written so far.
    pub written_geometries: FxHashSet<String>,
    pub stats: DocumentStats,
}

impl DocumentContext {
    pub fn new(header: DocumentHeader, options: ProcessingOptions) -> Self {
        Self {
            header,
            options,
            arena: ModelArena::with_ids(IdPool::new()),
            registry: GlobalObjectRegistry::default(),
            global_index: AppearanceIndex::new(),
            cross_feature: None,
            templates: TemplateResolver::new(),
            written_features: FxHashSet::default(),
            written_geometries: FxHashSet::default(),
            stats: DocumentStats::default(),
        }
    }

    /// Rebuilds the global index after the registry imported appearances.
    pub fn index_global_appearances(&mut self) {
        self.global_index = AppearanceIndex::index(&self.arena, &self.registry.appearances);
    }


    /// Reference system declared by the document.
    pub fn srs(&self) -> Option<&str> {
        self.header.srs.as_deref()
    }
}
