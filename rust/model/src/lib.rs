// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! # City-Lite Model
//!
//! Arena-based feature graph for 3D city-model documents.
//!
//! Features, geometries, appearances and surface data live in slot maps with
//! stable, generational keys. Parent links and by-reference pointers are
//! lookups into the arena rather than owning pointers, so a feature tree with
//! cross-references (shared geometries, template placements, appearance
//! targets) never forms an ownership cycle.
//!
//! Documents are exchanged as JSON lines: a header line followed by one line
//! per top-level member (feature or global appearance). See [`stream`].

pub mod arena;
pub mod construction;
pub mod envelope;
pub mod error;
pub mod ids;
pub mod keys;
pub mod serialization;
pub mod stream;
pub mod traversal;

pub use arena::{
    clip_href, AppearanceData, AppearanceOwner, Attributes, FeatureClass, FeatureData, FeatureRef,
    GeometryData, GeometryOwner, GeometryProperty, GroupData, GroupMember, ImplicitGeometry,
    Member, ModelArena, PropertyValue, Relation, Shape, ShapeCategory, SlotKind, SurfaceData,
    SurfaceDataKind, Target,
};
pub use construction::FeatureRemoval;
pub use envelope::Envelope;
pub use error::{Error, Result};
pub use ids::IdPool;
pub use keys::{AppearanceKey, FeatureKey, GeometryKey, Lod, Slot, SurfaceDataKey};
pub use serialization::{
    AppearanceRecord, DocumentHeader, FeatureRecord, GeometryPropertyRecord, GeometryRecord,
    ImplicitRecord, MemberRecord, ShapeRecord, SurfaceDataRecord,
};
pub use stream::{
    DocumentMember, DocumentSource, FeatureReader, FeatureWriter, JsonLinesSource,
    JsonLinesWriter, MemberFilter, MemoryDocument, MemoryWriter,
};
