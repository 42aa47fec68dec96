// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Normalisation of implicit geometry templates on output.
//!
//! A template must be declared inline exactly once in the written document.
//! The first written feature placing a template carries it inline, every
//! later placement points at it. When the feature that originally declared
//! the template was dropped, the first surviving placement receives a copy
//! from the registry.

use city_lite_model::{FeatureKey, GeometryOwner, Member, ModelArena, PropertyValue, Slot};
use rustc_hash::FxHashSet;

use crate::error::Result;
use crate::registry::GlobalObjectRegistry;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TemplateStats {
    pub inlined: usize,
    pub referenced: usize,
}

/// Tracks which templates were already written inline.
#[derive(Debug, Default)]
pub struct TemplateResolver {
    processed: FxHashSet<String>,
}

impl TemplateResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_processed(&self, id: &str) -> bool {
        self.processed.contains(id)
    }

    /// Rewrites the template slots of a feature tree that is about to be
    /// written.
    pub fn resolve(
        &mut self,
        arena: &mut ModelArena,
        feature: FeatureKey,
        registry: &GlobalObjectRegistry,
    ) -> Result<TemplateStats> {
        let mut stats = TemplateStats::default();
        for f in arena.feature_tree(feature) {
            let placements: Vec<(usize, Member)> = arena
                .feature(f)
                .map(|d| {
                    d.geometry
                        .iter()
                        .enumerate()
                        .filter_map(|(i, p)| match &p.value {
                            PropertyValue::Implicit(implicit) => Some((i, implicit.template.clone())),
                            _ => None,
                        })
                        .collect()
                })
                .unwrap_or_default();

            for (index, template) in placements {
                let slot = Slot::Template { feature: f, index };
                match template {
                    Member::Inline(g) => {
                        let Some(id) = arena.geometry(g).and_then(|g| g.id.clone()) else {
                            continue;
                        };
                        if self.processed.insert(id.clone()) {
                            stats.inlined += 1;
                        } else {
                            arena.set_slot(slot, Member::Reference(id))?;
                            arena.remove_geometry(g);
                            stats.referenced += 1;
                        }
                    }
                    Member::Reference(id) => {
                        if self.processed.contains(&id) {
                            stats.referenced += 1;
                            continue;
                        }
                        let Some(record) = registry.template_record(&id)? else {
                            tracing::debug!(template = %id, "dangling template reference left unresolved");
                            continue;
                        };
                        let copy = arena.import_geometry(record, GeometryOwner::Template, None);
                        arena.set_slot(slot, Member::Inline(copy))?;
                        self.processed.insert(id);
                        stats.inlined += 1;
                    }
                }
            }
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::RegistryRequest;
    use city_lite_model::{
        DocumentHeader, DocumentMember, FeatureRecord, GeometryPropertyRecord, GeometryRecord,
        ImplicitRecord, MemberRecord, MemoryDocument, ShapeRecord,
    };

    const IDENTITY: [f64; 16] = [
        1.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0,
    ];

    fn template() -> GeometryRecord {
        GeometryRecord::new(
            Some("tpl"),
            ShapeRecord::MultiSurface {
                members: Vec::new(),
            },
        )
    }

    fn tree(id: &str, template: MemberRecord) -> FeatureRecord {
        let mut record = FeatureRecord::new("SolitaryVegetationObject", Some(id));
        record.geometry.push(GeometryPropertyRecord {
            name: "lod2ImplicitRepresentation".into(),
            lod: 2,
            geometry: None,
            href: None,
            implicit: Some(ImplicitRecord {
                template,
                transform: IDENTITY,
                reference_point: [1.0, 2.0, 0.0],
                library_object: None,
                mime_type: None,
            }),
        });
        record
    }

    fn template_of(arena: &ModelArena, feature: FeatureKey) -> MemberRecord {
        let record = arena.export_feature(feature).unwrap();
        record.geometry[0].implicit.clone().unwrap().template
    }

    fn registry_for(doc: &MemoryDocument, arena: &mut ModelArena) -> GlobalObjectRegistry {
        let request = RegistryRequest {
            templates: true,
            ..Default::default()
        };
        GlobalObjectRegistry::build(doc, request, arena).unwrap()
    }

    #[test]
    fn first_placement_inline_later_ones_by_reference() {
        let doc = MemoryDocument::new("doc", DocumentHeader::default())
            .with_member(DocumentMember::Feature(tree("t1", MemberRecord::inline(template()))))
            .with_member(DocumentMember::Feature(tree("t2", MemberRecord::inline(template()))));
        let mut arena = ModelArena::new();
        let registry = registry_for(&doc, &mut arena);
        let mut resolver = TemplateResolver::new();

        let mut templates = Vec::new();
        for member in &doc.members {
            let record = member.as_feature().unwrap().clone();
            let key = arena.import_feature(record, None).unwrap();
            resolver.resolve(&mut arena, key, &registry).unwrap();
            templates.push(template_of(&arena, key));
            arena.remove_feature(key).unwrap();
        }

        assert!(matches!(templates[0], MemberRecord::Inline(_)));
        assert_eq!(templates[1], MemberRecord::href("tpl"));
    }

    #[test]
    fn dropped_declaration_is_restored_from_registry() {
        let doc = MemoryDocument::new("doc", DocumentHeader::default())
            .with_member(DocumentMember::Feature(tree("t1", MemberRecord::inline(template()))))
            .with_member(DocumentMember::Feature(tree("t2", MemberRecord::href("tpl"))))
            .with_member(DocumentMember::Feature(tree("t3", MemberRecord::href("tpl"))));
        let mut arena = ModelArena::new();
        let registry = registry_for(&doc, &mut arena);
        let mut resolver = TemplateResolver::new();

        // t1 is filtered out and never resolved.
        let mut templates = Vec::new();
        for member in &doc.members[1..] {
            let record = member.as_feature().unwrap().clone();
            let key = arena.import_feature(record, None).unwrap();
            resolver.resolve(&mut arena, key, &registry).unwrap();
            templates.push(template_of(&arena, key));
            arena.remove_feature(key).unwrap();
        }

        let MemberRecord::Inline(restored) = &templates[0] else {
            panic!("expected inline template");
        };
        assert_eq!(restored.id.as_deref(), Some("tpl"));
        assert_eq!(templates[1], MemberRecord::href("tpl"));
        assert!(resolver.is_processed("tpl"));

        // The registry copy is untouched.
        assert!(registry.template_record("tpl").unwrap().is_some());
        assert_eq!(arena.geometry_count(), 0);
    }

    #[test]
    fn unknown_template_reference_is_left_alone() {
        let mut arena = ModelArena::new();
        let key = arena
            .import_feature(tree("t1", MemberRecord::href("ghost")), None)
            .unwrap();
        let stats = TemplateResolver::new()
            .resolve(&mut arena, key, &GlobalObjectRegistry::default())
            .unwrap();
        assert_eq!(stats, TemplateStats::default());
        assert_eq!(template_of(&arena, key), MemberRecord::href("ghost"));
    }
}
