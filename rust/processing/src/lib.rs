// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! # City-Lite Processing
//!
//! Transformation engine for 3D city-model documents held in a
//! [`city_lite_model::ModelArena`].
//!
//! A document is processed in two streaming passes. The first pass builds
//! the [`GlobalObjectRegistry`] (global appearances, feature groups,
//! template geometries) and, when requested, the cross-feature reference
//! table. The second pass imports one top-level feature at a time and runs
//! the enabled steps on it before handing it to the writer:
//!
//! - reference resolution across features and across levels of detail
//!   ([`resolver`]);
//! - level-of-detail and bounding-box filtering with cascading removal
//!   ([`lod_filter`], [`bbox`]);
//! - appearance removal and conversion to local appearances
//!   ([`appearance_filter`]);
//! - template normalisation ([`implicit`]).
//!
//! Whenever a reference is turned into an independently owned geometry, a
//! deep copy with fresh identifiers is made by [`GeometryCopyBuilder`].
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use city_lite_model::{JsonLinesSource, JsonLinesWriter};
//! use city_lite_processing::{
//!     process_document, LodPolicy, LodSet, MapConversionProvider, ProcessingOptions,
//! };
//!
//! let source = JsonLinesSource::new("city.jsonl");
//! let mut writer = JsonLinesWriter::create("out/city.jsonl")?;
//! let options = ProcessingOptions {
//!     lod_filter: Some((LodPolicy::Maximum(LodSet::all()), false)),
//!     ..Default::default()
//! };
//! let stats = process_document(&source, &mut writer, &options, &MapConversionProvider::new(), None)?;
//! println!("{stats}");
//! # Ok::<(), city_lite_processing::Error>(())
//! ```

pub mod appearance_filter;
pub mod appearance_index;
pub mod bbox;
pub mod context;
pub mod copy;
pub mod crs;
pub mod error;
pub mod implicit;
pub mod lod_filter;
pub mod pipeline;
pub mod registry;
pub mod resolver;
pub mod resources;

pub use appearance_filter::{
    filter_appearances, remove_appearances, to_local_appearances, AppearanceFilter,
    AppearanceRemovalStats,
};
pub use appearance_index::{AppearanceIndex, Cleanup};
pub use bbox::{filter_by_bounding_box, BboxMode, BoundingBoxFilter};
pub use context::{DocumentContext, DocumentStats, ProcessingOptions};
pub use copy::{GeometryCopy, GeometryCopyBuilder};
pub use crs::{CoordinateMapper, CrsTransformProvider, MapConversion, MapConversionProvider};
pub use error::{Error, Result};
pub use implicit::{TemplateResolver, TemplateStats};
pub use lod_filter::{filter_by_lod, use_higher_lod_as, LodFilter, LodFilterOutcome, LodPolicy, LodSet};
pub use pipeline::{postprocess, process_document};
pub use registry::{GlobalObjectRegistry, RegistryRequest};
pub use resolver::{
    resolve_cross_feature_references, resolve_cross_lod_references, CrossFeaturePlan,
    CrossFeatureStats, CrossLodMode,
};
pub use resources::{CopierConfig, ResourceCopier};
