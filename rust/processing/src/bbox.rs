// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Spatial filtering of top-level features against a 2D bounding box.

use city_lite_model::{Envelope, FeatureKey, Member, ModelArena, PropertyValue};

use crate::crs::CrsTransformProvider;
use crate::error::{Error, Result};

/// How a feature extent must relate to the filter box.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BboxMode {
    /// The extents overlap.
    #[default]
    Intersects,
    /// The extent lies completely inside the box.
    Within,
    /// The center of the extent lies inside the box.
    Center,
}

/// A bounding box in the reference system of the document being filtered.
pub struct BoundingBoxFilter<'a> {
    envelope: Envelope,
    mode: BboxMode,
    srs: Option<String>,
    crs: &'a dyn CrsTransformProvider,
}

impl<'a> BoundingBoxFilter<'a> {
    /// Prepares a filter for a document declaring `document_srs`. An
    /// envelope given in another system is transformed into the document's.
    pub fn new(
        envelope: &Envelope,
        mode: BboxMode,
        document_srs: Option<&str>,
        crs: &'a dyn CrsTransformProvider,
    ) -> Result<Self> {
        let envelope = match document_srs {
            Some(target) => transform_envelope(envelope, target, crs, "bounding box filter")?,
            None => envelope.clone(),
        };
        Ok(Self {
            envelope,
            mode,
            srs: document_srs.map(str::to_string),
            crs,
        })
    }

    /// `true` if the feature passes the filter.
    pub fn accepts(&self, arena: &ModelArena, feature: FeatureKey) -> Result<bool> {
        let label = arena.feature(feature).map(|f| f.label()).unwrap_or_default();

        for g in arena.tree_geometries(feature) {
            let Some(srs) = arena.geometry(g).and_then(|g| g.srs.as_deref()) else {
                continue;
            };
            if self.srs.as_deref() != Some(srs) {
                tracing::debug!(feature = %label, %srs, "rejecting feature with foreign reference system");
                return Ok(false);
            }
        }

        let Some(extent) = self.extent(arena, feature, &label)? else {
            tracing::debug!(feature = %label, "rejecting feature without spatial extent");
            return Ok(false);
        };

        let (a, b) = (&extent, &self.envelope);
        Ok(match self.mode {
            BboxMode::Intersects => {
                a.lower[0] <= b.upper[0]
                    && a.upper[0] >= b.lower[0]
                    && a.lower[1] <= b.upper[1]
                    && a.upper[1] >= b.lower[1]
            }
            BboxMode::Within => {
                a.lower[0] >= b.lower[0]
                    && a.upper[0] <= b.upper[0]
                    && a.lower[1] >= b.lower[1]
                    && a.upper[1] <= b.upper[1]
            }
            BboxMode::Center => {
                let c = a.center();
                c[0] >= b.lower[0] && c[0] <= b.upper[0] && c[1] >= b.lower[1] && c[1] <= b.upper[1]
            }
        })
    }

    /// Declared envelope of the feature, or the union of its coordinates.
    fn extent(&self, arena: &ModelArena, feature: FeatureKey, label: &str) -> Result<Option<Envelope>> {
        if let Some(declared) = arena.feature(feature).and_then(|f| f.envelope.as_ref()) {
            if declared.is_valid() {
                return Ok(Some(match &self.srs {
                    Some(target) => transform_envelope(declared, target, self.crs, label)?,
                    None => declared.clone(),
                }));
            }
        }
        Ok(Envelope::from_points(&feature_coordinates(arena, feature)))
    }
}

/// Real-world coordinates of every geometry in a feature tree. Implicit
/// placements contribute their transformed template coordinates when the
/// template is inline, and their reference point otherwise.
fn feature_coordinates(arena: &ModelArena, feature: FeatureKey) -> Vec<[f64; 3]> {
    let mut points = Vec::new();
    for f in arena.feature_tree(feature) {
        let Some(data) = arena.feature(f) else {
            continue;
        };
        for property in &data.geometry {
            match &property.value {
                PropertyValue::Inline(g) => points.extend(arena.geometry_coordinates(*g)),
                PropertyValue::Reference(_) => {}
                PropertyValue::Implicit(implicit) => match &implicit.template {
                    Member::Inline(t) => points.extend(
                        arena
                            .geometry_coordinates(*t)
                            .into_iter()
                            .map(|p| place(&implicit.transform, implicit.reference_point, p)),
                    ),
                    Member::Reference(_) => points.push(implicit.reference_point),
                },
            }
        }
    }
    points
}

/// Applies a row-major 4×4 transform, then offsets by the reference point.
fn place(m: &[f64; 16], reference: [f64; 3], p: [f64; 3]) -> [f64; 3] {
    let mut out = [0.0; 3];
    for (row, o) in out.iter_mut().enumerate() {
        let r = &m[row * 4..row * 4 + 4];
        *o = r[0] * p[0] + r[1] * p[1] + r[2] * p[2] + r[3] + reference[row];
    }
    out
}

fn transform_envelope(
    envelope: &Envelope,
    target: &str,
    crs: &dyn CrsTransformProvider,
    context: &str,
) -> Result<Envelope> {
    let Some(source) = envelope.srs.as_deref().filter(|s| *s != target) else {
        return Ok(envelope.clone());
    };
    let mapper = crs
        .transform(source, target)
        .ok_or_else(|| Error::UnsupportedCrs {
            srs: source.to_string(),
            feature: context.to_string(),
        })?;
    let corners: Vec<[f64; 3]> = envelope.corners().iter().map(|&c| mapper(c)).collect();
    let transformed = Envelope::from_points(&corners).unwrap_or_else(Envelope::empty);
    Ok(transformed.with_srs(target))
}

/// Filters a top-level feature against `envelope`. Returns `true` if the
/// feature is kept.
pub fn filter_by_bounding_box(
    arena: &ModelArena,
    feature: FeatureKey,
    envelope: &Envelope,
    mode: BboxMode,
    document_srs: Option<&str>,
    crs: &dyn CrsTransformProvider,
) -> Result<bool> {
    BoundingBoxFilter::new(envelope, mode, document_srs, crs)?.accepts(arena, feature)
}
