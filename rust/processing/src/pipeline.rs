// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Document processing driver.
//!
//! [`process_document`] runs the two passes over one document: a pre-scan
//! (global objects and, when requested, the cross-feature reference table)
//! followed by the output pass, which imports one top-level feature at a
//! time, pushes it through the enabled steps and writes it out. Global
//! appearances and feature groups are written last by [`postprocess`],
//! pruned against what was actually written.

use city_lite_model::{
    clip_href, AppearanceRecord, DocumentHeader, DocumentMember, DocumentSource, FeatureKey,
    FeatureRecord, FeatureWriter, Lod, MemberFilter,
};
use rustc_hash::FxHashSet;

use crate::appearance_filter::{filter_appearances, remove_appearances, to_local_appearances};
use crate::appearance_index::AppearanceIndex;
use crate::bbox::BoundingBoxFilter;
use crate::context::{DocumentContext, DocumentStats, ProcessingOptions};
use crate::copy::GeometryCopyBuilder;
use crate::crs::CrsTransformProvider;
use crate::error::Result;
use crate::lod_filter::{use_higher_lod_as, LodFilter};
use crate::registry::{GlobalObjectRegistry, RegistryRequest};
use crate::resolver::cross_feature::resolve_cross_feature_references;
use crate::resolver::cross_lod::resolve_cross_lod_references;
use crate::resources::ResourceCopier;

/// Processes one document from `source` into `writer`.
///
/// Resources referenced by written members are queued on `resources` when
/// given; the caller finishes the copier.
pub fn process_document(
    source: &dyn DocumentSource,
    writer: &mut dyn FeatureWriter,
    options: &ProcessingOptions,
    crs: &dyn CrsTransformProvider,
    resources: Option<&ResourceCopier>,
) -> Result<DocumentStats> {
    match resources {
        Some(copier) => {
            let mut writer = CopyingWriter {
                inner: writer,
                copier,
            };
            run(source, &mut writer, options, crs)
        }
        None => run(source, writer, options, crs),
    }
}

fn run(
    source: &dyn DocumentSource,
    writer: &mut dyn FeatureWriter,
    options: &ProcessingOptions,
    crs: &dyn CrsTransformProvider,
) -> Result<DocumentStats> {
    let header = source.header()?;
    let mut ctx = DocumentContext::new(header, options.clone());
    tracing::info!(document = source.name(), srs = ?ctx.srs(), "processing document");

    // Pass 1
    let request = registry_request(options);
    ctx.registry = GlobalObjectRegistry::build(source, request, &mut ctx.arena)?;
    ctx.index_global_appearances();
    if options.resolve_cross_feature {
        let stats = resolve_cross_feature_references(source, &mut ctx)?;
        ctx.stats.cross_feature_resolved = stats.resolved;
        ctx.stats.relations_created = stats.relations_created;
    }

    // Pass 2
    let bbox = match &options.bbox {
        Some((envelope, mode)) => Some(BoundingBoxFilter::new(envelope, *mode, ctx.srs(), crs)?),
        None => None,
    };
    writer.write_header(&ctx.header)?;

    let filter = MemberFilter {
        features: true,
        appearances: !request.appearances,
        feature_types: None,
    };
    let mut reader = source.open(filter)?;
    let mut builder = GeometryCopyBuilder::new();
    let mut index = 0;
    while let Some(member) = reader.next_member()? {
        let record = match member {
            DocumentMember::Feature(record) => record,
            appearance @ DocumentMember::Appearance(_) => {
                writer.write_member(&appearance)?;
                ctx.stats.global_appearances_written += 1;
                continue;
            }
        };
        let feature_index = index;
        index += 1;
        ctx.stats.features_read += 1;

        if request.groups && record.is_group() {
            continue;
        }
        if !selected(options, &record) {
            tracing::trace!(feature = %record.label(), "feature not selected");
            ctx.stats.features_removed += 1;
            continue;
        }

        let key = ctx.arena.import_feature(record, None)?;
        if process_feature(&mut ctx, key, feature_index, bbox.as_ref(), &mut builder)? {
            write_feature(&mut ctx, key, writer)?;
        }
    }
    drop(reader);

    postprocess(&mut ctx, writer)?;
    writer.finish()?;

    tracing::info!(document = source.name(), "{}", ctx.stats);
    Ok(ctx.stats)
}

fn registry_request(options: &ProcessingOptions) -> RegistryRequest {
    RegistryRequest {
        appearances: options.needs_global_appearances(),
        groups: options.removes_content(),
        templates: options.resolve_templates || options.removes_content(),
    }
}

fn selected(options: &ProcessingOptions, record: &FeatureRecord) -> bool {
    let type_ok = options
        .feature_types
        .as_ref()
        .map_or(true, |types| types.contains(&record.feature_type));
    let id_ok = options.feature_ids.as_ref().map_or(true, |ids| {
        record.id.as_ref().is_some_and(|id| ids.contains(id))
    });
    type_ok && id_ok
}

/// Runs the enabled steps on an imported top-level feature. Returns `false`
/// if the feature was removed.
fn process_feature(
    ctx: &mut DocumentContext,
    key: FeatureKey,
    feature_index: usize,
    bbox: Option<&BoundingBoxFilter<'_>>,
    builder: &mut GeometryCopyBuilder,
) -> Result<bool> {
    let has_globals = !ctx.registry.appearances.is_empty();

    if let Some(plan) = ctx.cross_feature.as_mut() {
        let global = has_globals.then_some(&ctx.global_index);
        plan.apply(&mut ctx.arena, feature_index, key, global)?;
    }

    if let Some(mode) = ctx.options.cross_lod {
        let global = has_globals.then_some(&ctx.global_index);
        ctx.stats.cross_lod_resolved += resolve_cross_lod_references(&mut ctx.arena, key, mode, global)?;
    }

    if ctx.options.use_lod4_as_lod3 {
        if let (Some(lod4), Some(lod3)) = (Lod::new(4), Lod::new(3)) {
            let global = has_globals.then_some(&mut ctx.global_index);
            ctx.stats.lod_mapped += use_higher_lod_as(&mut ctx.arena, key, lod4, lod3, global)?;
        }
    }

    if let Some((policy, keep_empty)) = ctx.options.lod_filter {
        let global = has_globals.then_some(&mut ctx.global_index);
        let outcome = LodFilter::new(policy, keep_empty).apply(&mut ctx.arena, key, global)?;
        ctx.stats.appearances_removed += outcome.cleanup.appearances_removed;
        ctx.stats.surface_data_removed += outcome.cleanup.surface_data_removed;
        if !outcome.survives {
            ctx.stats.features_removed += 1;
            return Ok(false);
        }
    }

    if let Some(filter) = bbox {
        if !filter.accepts(&ctx.arena, key)? {
            ctx.arena.remove_feature(key)?;
            ctx.stats.features_removed += 1;
            return Ok(false);
        }
    }

    if let Some(filter) = &ctx.options.remove_appearances {
        let stats = remove_appearances(&mut ctx.arena, key, filter)?;
        ctx.stats.appearances_removed += stats.appearances;
        ctx.stats.surface_data_removed += stats.surface_data;
    }

    if ctx.options.local_appearances && has_globals {
        ctx.stats.appearances_localized += to_local_appearances(
            &mut ctx.arena,
            key,
            &mut ctx.global_index,
            builder,
        )?;
    }

    if ctx.options.resolve_templates || ctx.options.removes_content() {
        let stats = ctx.templates.resolve(&mut ctx.arena, key, &ctx.registry)?;
        ctx.stats.templates_inlined += stats.inlined;
        ctx.stats.templates_referenced += stats.referenced;
    }

    Ok(true)
}

fn write_feature(ctx: &mut DocumentContext, key: FeatureKey, writer: &mut dyn FeatureWriter) -> Result<()> {
    for f in ctx.arena.feature_tree(key) {
        if let Some(id) = ctx.arena.feature(f).and_then(|d| d.id.clone()) {
            ctx.written_features.insert(id);
        }
    }
    for g in ctx.arena.tree_geometries(key) {
        if let Some(id) = ctx.arena.geometry(g).and_then(|d| d.id.clone()) {
            ctx.written_geometries.insert(id);
        }
    }

    let record = ctx.arena.export_feature(key)?;
    writer.write_member(&DocumentMember::Feature(record))?;
    ctx.arena.remove_feature(key)?;
    ctx.stats.features_written += 1;
    Ok(())
}

/// Writes the buffered global appearances and feature groups once every
/// feature has been written.
///
/// When features or geometries were removed, appearance targets are pruned
/// to written geometry ids and group members to written features; emptied
/// appearances and groups are dropped, groups until nothing changes.
pub fn postprocess(ctx: &mut DocumentContext, writer: &mut dyn FeatureWriter) -> Result<()> {
    let prune = ctx.options.removes_content();

    let appearances = std::mem::take(&mut ctx.registry.appearances);
    if let Some(filter) = &ctx.options.remove_appearances {
        let stats = filter_appearances(&mut ctx.arena, &appearances, filter)?;
        ctx.stats.appearances_removed += stats.appearances;
        ctx.stats.surface_data_removed += stats.surface_data;
    }
    for key in appearances {
        let Some(appearance) = ctx.arena.appearance(key) else {
            continue;
        };
        if prune {
            let surface_data = appearance.surface_data.clone();
            for sd in surface_data {
                let Some(data) = ctx.arena.surface_data_mut(sd) else {
                    continue;
                };
                data.targets.retain(|t| ctx.written_geometries.contains(&t.uri));
                if data.targets.is_empty() {
                    ctx.arena.remove_surface_data(sd)?;
                    ctx.stats.surface_data_removed += 1;
                }
            }
        }
        if ctx.arena.appearance(key).is_some_and(|a| a.surface_data.is_empty()) {
            ctx.arena.remove_appearance(key)?;
            ctx.stats.appearances_removed += 1;
            continue;
        }
        let record: AppearanceRecord = ctx.arena.export_appearance(key)?;
        writer.write_member(&DocumentMember::Appearance(record))?;
        ctx.stats.global_appearances_written += 1;
    }
    ctx.global_index = AppearanceIndex::new();

    let mut groups = std::mem::take(&mut ctx.registry.groups);
    if prune {
        let before = groups.len();
        prune_groups(&mut groups, &ctx.written_features);
        ctx.stats.groups_removed += before - groups.len();
    }
    for group in groups {
        ctx.written_features.extend(group.id.clone());
        writer.write_member(&DocumentMember::Feature(group))?;
        ctx.stats.groups_written += 1;
    }
    Ok(())
}

/// Drops group members and parents that were not written, then groups left
/// with neither, until nothing changes.
fn prune_groups(groups: &mut Vec<FeatureRecord>, written: &FxHashSet<String>) {
    loop {
        let alive: FxHashSet<String> = groups.iter().filter_map(|g| g.id.clone()).collect();
        let known = |href: &str| {
            let id = clip_href(href);
            written.contains(id) || alive.contains(id)
        };

        let mut changed = false;
        for group in groups.iter_mut() {
            let Some(data) = group.group.as_mut() else {
                continue;
            };
            let before = data.members.len();
            data.members.retain(|m| known(&m.href));
            changed |= data.members.len() != before;
            if data.parent.as_deref().is_some_and(|p| !known(p)) {
                data.parent = None;
                changed = true;
            }
        }

        let before = groups.len();
        groups.retain(|g| {
            g.group
                .as_ref()
                .map_or(true, |d| !d.members.is_empty() || d.parent.is_some())
        });
        changed |= groups.len() != before;
        if !changed {
            break;
        }
    }
}

/// Queues the resources referenced by written members.
struct CopyingWriter<'w, 'c> {
    inner: &'w mut dyn FeatureWriter,
    copier: &'c ResourceCopier,
}

impl CopyingWriter<'_, '_> {
    fn submit_feature(&self, record: &FeatureRecord) -> Result<()> {
        for property in &record.geometry {
            if let Some(object) = property.implicit.as_ref().and_then(|i| i.library_object.as_deref()) {
                self.copier.submit(object)?;
            }
        }
        for appearance in &record.appearances {
            self.submit_appearance(appearance)?;
        }
        for child in &record.children {
            self.submit_feature(child)?;
        }
        Ok(())
    }

    fn submit_appearance(&self, record: &AppearanceRecord) -> Result<()> {
        for sd in &record.surface_data {
            if let Some(uri) = sd.image_uri.as_deref() {
                self.copier.submit(uri)?;
            }
        }
        Ok(())
    }
}

impl FeatureWriter for CopyingWriter<'_, '_> {
    fn write_header(&mut self, header: &DocumentHeader) -> city_lite_model::Result<()> {
        self.inner.write_header(header)
    }

    fn write_member(&mut self, member: &DocumentMember) -> city_lite_model::Result<()> {
        let submitted = match member {
            DocumentMember::Feature(f) => self.submit_feature(f),
            DocumentMember::Appearance(a) => self.submit_appearance(a),
        };
        if let Err(e) = submitted {
            tracing::warn!(error = %e, "resource skipped");
        }
        self.inner.write_member(member)
    }

    fn finish(&mut self) -> city_lite_model::Result<()> {
        self.inner.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use city_lite_model::{GroupData, GroupMember};

    fn group(id: &str, members: &[&str], parent: Option<&str>) -> FeatureRecord {
        let mut record = FeatureRecord::new("CityObjectGroup", Some(id));
        record.group = Some(GroupData {
            parent: parent.map(|p| format!("#{p}")),
            members: members
                .iter()
                .map(|m| GroupMember {
                    href: format!("#{m}"),
                    role: None,
                })
                .collect(),
        });
        record
    }

    #[test]
    fn group_pruning_reaches_fixpoint() {
        let written: FxHashSet<String> = ["b1".to_string()].into_iter().collect();
        let mut groups = vec![
            group("g1", &["b1", "b2"], None),
            // Only member is g3, which empties out.
            group("g2", &["g3"], None),
            group("g3", &["b2"], None),
            group("g4", &[], Some("g1")),
        ];
        prune_groups(&mut groups, &written);

        let ids: Vec<_> = groups.iter().filter_map(|g| g.id.as_deref()).collect();
        assert_eq!(ids, vec!["g1", "g4"]);
        assert_eq!(groups[0].group.as_ref().unwrap().members.len(), 1);
    }

    #[test]
    fn selection_by_type_and_id() {
        let options = ProcessingOptions {
            feature_types: Some(["Building".to_string()].into_iter().collect()),
            feature_ids: Some(["b1".to_string()].into_iter().collect()),
            ..Default::default()
        };
        assert!(selected(&options, &FeatureRecord::new("Building", Some("b1"))));
        assert!(!selected(&options, &FeatureRecord::new("Building", Some("b2"))));
        assert!(!selected(&options, &FeatureRecord::new("Bridge", Some("b1"))));
        assert!(!selected(&options, &FeatureRecord::new("Building", None)));
    }
}
