// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Reference resolution across features and across levels of detail.

pub mod cross_feature;
pub mod cross_lod;

pub use cross_feature::{
    resolve_cross_feature_references, CrossFeaturePlan, CrossFeatureStats, SHARED_RELATION,
};
pub use cross_lod::{resolve_cross_lod_references, CrossLodMode};
