// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Document-wide table of global objects, built by a pre-scan.
//!
//! The pre-scan streams the document once and keeps only the kinds of
//! objects a command asked for: global appearances, feature groups and
//! template geometries. Anything else is skipped after a tag peek, so the
//! pass stays cheap on large documents.

use city_lite_model::{
    AppearanceKey, AppearanceOwner, DocumentMember, DocumentSource, FeatureRecord, GeometryKey,
    GeometryOwner, GeometryRecord, MemberFilter, MemberRecord, ModelArena,
};
use rustc_hash::FxHashMap;

use crate::error::Result;

/// Which object kinds a pre-scan retains.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryRequest {
    pub appearances: bool,
    pub groups: bool,
    pub templates: bool,
}

impl RegistryRequest {
    pub fn is_empty(&self) -> bool {
        !(self.appearances || self.groups || self.templates)
    }

    fn filter(&self) -> MemberFilter {
        let mut filter = MemberFilter {
            features: self.groups || self.templates,
            appearances: self.appearances,
            feature_types: None,
        };
        if self.groups && !self.templates {
            filter = filter.with_types(["CityObjectGroup"]);
        }
        filter
    }
}

/// Global appearances, feature groups and templates of one document.
#[derive(Debug, Default)]
pub struct GlobalObjectRegistry {
    /// Global appearances, imported into the document arena.
    pub appearances: Vec<AppearanceKey>,
    /// Top-level feature groups, deferred until all features are written.
    pub groups: Vec<FeatureRecord>,
    /// Template geometries by id, keys into [`template_arena`](Self::template_arena).
    pub templates: FxHashMap<String, GeometryKey>,
    /// Holds the templates apart from the document arena so that their ids
    /// never shadow the geometries of the feature being processed.
    pub template_arena: ModelArena,
}

impl GlobalObjectRegistry {
    /// Runs the pre-scan. Global appearances are imported into `arena`.
    pub fn build(
        source: &dyn DocumentSource,
        request: RegistryRequest,
        arena: &mut ModelArena,
    ) -> Result<Self> {
        let mut registry = Self::default();
        if request.is_empty() {
            return Ok(registry);
        }

        let mut reader = source.open(request.filter())?;
        while let Some(member) = reader.next_member()? {
            match member {
                DocumentMember::Appearance(record) => {
                    if request.appearances {
                        registry
                            .appearances
                            .push(arena.import_appearance(record, AppearanceOwner::Global));
                    }
                }
                DocumentMember::Feature(record) => {
                    if request.templates {
                        registry.collect_templates(&record);
                    }
                    if request.groups && record.is_group() {
                        registry.groups.push(record);
                    }
                }
            }
        }

        tracing::info!(
            document = source.name(),
            appearances = registry.appearances.len(),
            groups = registry.groups.len(),
            templates = registry.templates.len(),
            "pre-scan complete"
        );
        Ok(registry)
    }

    /// Imports inline templates with an id found anywhere in a feature tree.
    fn collect_templates(&mut self, record: &FeatureRecord) {
        for property in &record.geometry {
            let Some(implicit) = &property.implicit else {
                continue;
            };
            let MemberRecord::Inline(template) = &implicit.template else {
                continue;
            };
            let Some(id) = &template.id else {
                tracing::trace!(feature = %record.label(), "skipping anonymous template");
                continue;
            };
            if self.templates.contains_key(id) {
                continue;
            }
            let key = self
                .template_arena
                .import_geometry((**template).clone(), GeometryOwner::Template, None);
            self.templates.insert(id.clone(), key);
        }
        for child in &record.children {
            self.collect_templates(child);
        }
    }

    pub fn template(&self, id: &str) -> Option<GeometryKey> {
        self.templates.get(id).copied()
    }

    /// A fresh record of a registered template, ready for import elsewhere.
    pub fn template_record(&self, id: &str) -> Result<Option<GeometryRecord>> {
        match self.template(id) {
            Some(key) => Ok(Some(self.template_arena.export_geometry(key)?)),
            None => Ok(None),
        }
    }

    pub fn is_group_id(&self, id: &str) -> bool {
        self.groups.iter().any(|g| g.id.as_deref() == Some(id))
    }
}
