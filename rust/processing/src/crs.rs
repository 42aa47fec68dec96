// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Coordinate reference system hooks.
//!
//! The engine never does projection math itself. It asks a
//! [`CrsTransformProvider`] for a coordinate mapper between two reference
//! systems and applies it to envelope corners. [`MapConversionProvider`] is
//! the shipped default: identity for equal systems plus registered affine
//! map conversions (offset, planar rotation and scale) in either direction.

use rustc_hash::FxHashMap;

/// Maps one coordinate triple to another.
pub type CoordinateMapper = Box<dyn Fn([f64; 3]) -> [f64; 3] + Send + Sync>;

/// Source of coordinate transformations between reference systems.
pub trait CrsTransformProvider {
    /// A mapper from `source` to `target`, or `None` if unsupported.
    fn transform(&self, source: &str, target: &str) -> Option<CoordinateMapper>;
}

/// An affine conversion from a local engineering system to a map system.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MapConversion {
    /// False easting (x offset in the map system)
    pub eastings: f64,
    /// False northing (y offset in the map system)
    pub northings: f64,
    pub orthogonal_height: f64,
    /// Cosine of the rotation angle
    pub x_axis_abscissa: f64,
    /// Sine of the rotation angle
    pub x_axis_ordinate: f64,
    pub scale: f64,
}

impl Default for MapConversion {
    fn default() -> Self {
        Self {
            eastings: 0.0,
            northings: 0.0,
            orthogonal_height: 0.0,
            x_axis_abscissa: 1.0,
            x_axis_ordinate: 0.0,
            scale: 1.0,
        }
    }
}

impl MapConversion {
    /// A pure translation.
    pub fn offset(eastings: f64, northings: f64, orthogonal_height: f64) -> Self {
        Self {
            eastings,
            northings,
            orthogonal_height,
            ..Self::default()
        }
    }

    /// Rotation angle in radians.
    #[inline]
    pub fn rotation(&self) -> f64 {
        self.x_axis_ordinate.atan2(self.x_axis_abscissa)
    }

    #[inline]
    pub fn local_to_map(&self, p: [f64; 3]) -> [f64; 3] {
        let (cos_r, sin_r, s) = (self.x_axis_abscissa, self.x_axis_ordinate, self.scale);
        [
            s * (cos_r * p[0] - sin_r * p[1]) + self.eastings,
            s * (sin_r * p[0] + cos_r * p[1]) + self.northings,
            p[2] + self.orthogonal_height,
        ]
    }

    #[inline]
    pub fn map_to_local(&self, p: [f64; 3]) -> [f64; 3] {
        let (cos_r, sin_r) = (self.x_axis_abscissa, self.x_axis_ordinate);
        let inv_scale = if self.scale.abs() < f64::EPSILON {
            1.0
        } else {
            1.0 / self.scale
        };
        let dx = p[0] - self.eastings;
        let dy = p[1] - self.northings;
        [
            inv_scale * (cos_r * dx + sin_r * dy),
            inv_scale * (-sin_r * dx + cos_r * dy),
            p[2] - self.orthogonal_height,
        ]
    }
}

/// Default provider backed by registered map conversions.
#[derive(Debug, Clone, Default)]
pub struct MapConversionProvider {
    conversions: FxHashMap<(String, String), MapConversion>,
}

impl MapConversionProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the conversion from `local` to `map`; the inverse is
    /// derived automatically.
    pub fn register(&mut self, local: impl Into<String>, map: impl Into<String>, conversion: MapConversion) {
        self.conversions
            .insert((local.into(), map.into()), conversion);
    }

    pub fn with(mut self, local: impl Into<String>, map: impl Into<String>, conversion: MapConversion) -> Self {
        self.register(local, map, conversion);
        self
    }
}

impl CrsTransformProvider for MapConversionProvider {
    fn transform(&self, source: &str, target: &str) -> Option<CoordinateMapper> {
        if source == target {
            return Some(Box::new(|p: [f64; 3]| p));
        }
        if let Some(c) = self.conversions.get(&(source.to_string(), target.to_string())) {
            let c = *c;
            return Some(Box::new(move |p: [f64; 3]| c.local_to_map(p)));
        }
        if let Some(c) = self.conversions.get(&(target.to_string(), source.to_string())) {
            let c = *c;
            return Some(Box::new(move |p: [f64; 3]| c.map_to_local(p)));
        }
        None
    }
}
