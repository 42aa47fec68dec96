// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Axis-aligned bounding envelopes.

use serde::{Deserialize, Serialize};

/// An axis-aligned 3D bounding box with an optional reference system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub lower: [f64; 3],
    pub upper: [f64; 3],
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub srs: Option<String>,
}

impl Envelope {
    pub fn new(lower: [f64; 3], upper: [f64; 3]) -> Self {
        Self {
            lower,
            upper,
            srs: None,
        }
    }

    pub fn with_srs(mut self, srs: impl Into<String>) -> Self {
        self.srs = Some(srs.into());
        self
    }

    /// An envelope that contains nothing; expanding it by a point yields
    /// the degenerate box at that point.
    pub fn empty() -> Self {
        Self::new([f64::INFINITY; 3], [f64::NEG_INFINITY; 3])
    }

    /// Smallest envelope containing all points, or `None` for no points.
    pub fn from_points<'a>(points: impl IntoIterator<Item = &'a [f64; 3]>) -> Option<Self> {
        let mut env = Self::empty();
        for p in points {
            env.expand_point(p);
        }
        env.is_valid().then_some(env)
    }

    /// `true` when lower <= upper on every axis.
    pub fn is_valid(&self) -> bool {
        (0..3).all(|i| self.lower[i] <= self.upper[i])
    }

    pub fn expand_point(&mut self, p: &[f64; 3]) {
        for i in 0..3 {
            self.lower[i] = self.lower[i].min(p[i]);
            self.upper[i] = self.upper[i].max(p[i]);
        }
    }

    pub fn expand(&mut self, other: &Envelope) {
        if other.is_valid() {
            self.expand_point(&other.lower);
            self.expand_point(&other.upper);
        }
    }

    pub fn center(&self) -> [f64; 3] {
        [
            (self.lower[0] + self.upper[0]) / 2.0,
            (self.lower[1] + self.upper[1]) / 2.0,
            (self.lower[2] + self.upper[2]) / 2.0,
        ]
    }

    /// 2D containment test on x/y; heights are ignored as in map queries.
    pub fn contains_point(&self, p: &[f64; 3]) -> bool {
        (0..2).all(|i| self.lower[i] <= p[i] && p[i] <= self.upper[i])
    }

    /// 2D test whether `other` lies completely inside this envelope.
    pub fn contains(&self, other: &Envelope) -> bool {
        self.contains_point(&other.lower) && self.contains_point(&other.upper)
    }

    /// 2D overlap test, touching boundaries count as intersecting.
    pub fn intersects(&self, other: &Envelope) -> bool {
        (0..2).all(|i| self.lower[i] <= other.upper[i] && other.lower[i] <= self.upper[i])
    }

    /// The eight corner points, used when mapping the box to another system.
    pub fn corners(&self) -> [[f64; 3]; 8] {
        let (l, u) = (self.lower, self.upper);
        [
            [l[0], l[1], l[2]],
            [u[0], l[1], l[2]],
            [l[0], u[1], l[2]],
            [u[0], u[1], l[2]],
            [l[0], l[1], u[2]],
            [u[0], l[1], u[2]],
            [l[0], u[1], u[2]],
            [u[0], u[1], u[2]],
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_points_builds_tight_box() {
        let pts = [[1.0, 5.0, 0.0], [-2.0, 3.0, 10.0], [4.0, 4.0, 2.0]];
        let env = Envelope::from_points(pts.iter()).unwrap();
        assert_eq!(env.lower, [-2.0, 3.0, 0.0]);
        assert_eq!(env.upper, [4.0, 5.0, 10.0]);
        assert_eq!(env.center(), [1.0, 4.0, 5.0]);
    }

    #[test]
    fn from_no_points_is_none() {
        assert!(Envelope::from_points(std::iter::empty()).is_none());
        assert!(!Envelope::empty().is_valid());
    }

    #[test]
    fn containment_and_intersection_are_2d() {
        let outer = Envelope::new([0.0, 0.0, 0.0], [10.0, 10.0, 0.0]);
        let inner = Envelope::new([1.0, 1.0, 50.0], [2.0, 2.0, 60.0]);
        let straddling = Envelope::new([9.0, 9.0, 0.0], [11.0, 11.0, 1.0]);
        let outside = Envelope::new([20.0, 20.0, 0.0], [21.0, 21.0, 1.0]);

        assert!(outer.contains(&inner));
        assert!(!outer.contains(&straddling));
        assert!(outer.intersects(&straddling));
        assert!(!outer.intersects(&outside));
    }

    #[test]
    fn touching_boxes_intersect() {
        let a = Envelope::new([0.0, 0.0, 0.0], [1.0, 1.0, 0.0]);
        let b = Envelope::new([1.0, 0.0, 0.0], [2.0, 1.0, 0.0]);
        assert!(a.intersects(&b));
    }
}
