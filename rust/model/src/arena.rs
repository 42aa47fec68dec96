// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Arena-based storage for the feature graph.
//!
//! The [`ModelArena`] is the central owner of all model data. Every feature,
//! geometry, appearance and surface data entry lives inside slot maps with
//! stable, generational keys. Parent links are stored as keys, so walking up
//! from any geometry to its top-level feature is a chain of O(1) lookups.
//!
//! ## References
//!
//! A city model is a tree with cross-links: geometry members and geometry
//! properties may point at another geometry by identifier, surface data
//! targets name the geometries they decorate, and groups name their members.
//! None of these links own anything. They are plain identifiers resolved
//! through the id indices kept by the arena.

use std::collections::BTreeMap;

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use slotmap::SlotMap;

use crate::envelope::Envelope;
use crate::ids::IdPool;
use crate::keys::*;

/// Opaque generic attributes of a feature or surface data entry.
pub type Attributes = BTreeMap<String, serde_json::Value>;

/// Feature types that bound a building space (walls, roofs, ...).
const BOUNDARY_SURFACE_TYPES: &[&str] = &[
    "WallSurface",
    "RoofSurface",
    "GroundSurface",
    "ClosureSurface",
    "FloorSurface",
    "OuterFloorSurface",
    "CeilingSurface",
    "OuterCeilingSurface",
    "InteriorWallSurface",
];

const GROUP_TYPES: &[&str] = &["CityObjectGroup"];

/// The coarse classification of a feature that the engine inspects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FeatureClass {
    /// A space-boundary surface (wall, roof, ...).
    BoundarySurface,
    /// A feature group, which references members by identifier.
    Group,
    Other,
}

/// A by-reference feature property, e.g. a part pointing at its parent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureRef {
    pub property: String,
    pub href: String,
}

/// An explicit relation between two features.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Relation {
    pub related_to: String,
    pub relation_type: String,
}

/// A member of a feature group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupMember {
    pub href: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
}

/// Group data of a feature group: an optional parent and member features,
/// all by identifier.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    #[serde(default)]
    pub members: Vec<GroupMember>,
}

/// Data stored for a feature.
#[derive(Debug, Clone)]
pub struct FeatureData {
    pub id: Option<String>,
    pub feature_type: String,
    pub parent: Option<FeatureKey>,
    pub children: Vec<FeatureKey>,
    pub geometry: Vec<GeometryProperty>,
    pub appearances: Vec<AppearanceKey>,
    pub references: Vec<FeatureRef>,
    pub relations: Vec<Relation>,
    pub group: Option<GroupData>,
    pub envelope: Option<Envelope>,
    pub attributes: Attributes,
}

impl FeatureData {
    pub fn new(feature_type: impl Into<String>) -> Self {
        Self {
            id: None,
            feature_type: feature_type.into(),
            parent: None,
            children: Vec::new(),
            geometry: Vec::new(),
            appearances: Vec::new(),
            references: Vec::new(),
            relations: Vec::new(),
            group: None,
            envelope: None,
            attributes: Attributes::new(),
        }
    }

    pub fn class(&self) -> FeatureClass {
        let ty = self.feature_type.as_str();
        if BOUNDARY_SURFACE_TYPES.contains(&ty) {
            FeatureClass::BoundarySurface
        } else if GROUP_TYPES.contains(&ty) || self.group.is_some() {
            FeatureClass::Group
        } else {
            FeatureClass::Other
        }
    }

    /// Label used in log messages and errors.
    pub fn label(&self) -> String {
        match &self.id {
            Some(id) => format!("{} '{}'", self.feature_type, id),
            None => format!("anonymous {}", self.feature_type),
        }
    }
}

/// A geometry property of a feature.
#[derive(Debug, Clone)]
pub struct GeometryProperty {
    /// Property name on the wire, e.g. `lod2Solid`.
    pub name: String,
    pub lod: Lod,
    pub value: PropertyValue,
}

impl GeometryProperty {
    /// The kind of geometry the property name admits.
    pub fn slot_kind(&self) -> SlotKind {
        SlotKind::from_property_name(&self.name)
    }
}

/// The value of a geometry property. Exactly one variant is populated.
#[derive(Debug, Clone)]
pub enum PropertyValue {
    Inline(GeometryKey),
    /// Identifier of a geometry declared elsewhere.
    Reference(String),
    Implicit(ImplicitGeometry),
}

/// A placement of a template geometry.
#[derive(Debug, Clone)]
pub struct ImplicitGeometry {
    pub template: Member,
    /// Row-major 4x4 transformation matrix.
    pub transform: [f64; 16],
    pub reference_point: [f64; 3],
    pub library_object: Option<String>,
    pub mime_type: Option<String>,
}

/// A member slot of an aggregate geometry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Member {
    Inline(GeometryKey),
    Reference(String),
}

/// Who owns a geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeometryOwner {
    /// Root geometry of a property (or inline template) of a feature.
    Feature(FeatureKey),
    /// Inline member of an aggregate geometry.
    Geometry(GeometryKey),
    /// Template held by the document-wide registry.
    Template,
}

/// The geometry shapes the engine distinguishes.
#[derive(Debug, Clone)]
pub enum Shape {
    Point([f64; 3]),
    LineString(Vec<[f64; 3]>),
    Polygon {
        exterior: Vec<[f64; 3]>,
        interiors: Vec<Vec<[f64; 3]>>,
    },
    MultiCurve(Vec<Member>),
    MultiSurface(Vec<Member>),
    CompositeSurface(Vec<Member>),
    /// A solid bounded by an exterior shell; `None` once the shell is gone.
    Solid(Option<Member>),
    MultiSolid(Vec<Member>),
}

/// Dimension class of a shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShapeCategory {
    Point,
    Curve,
    Surface,
    Solid,
}

impl std::fmt::Display for ShapeCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ShapeCategory::Point => "point",
            ShapeCategory::Curve => "curve",
            ShapeCategory::Surface => "surface",
            ShapeCategory::Solid => "solid",
        };
        f.write_str(s)
    }
}

impl Shape {
    pub fn category(&self) -> ShapeCategory {
        match self {
            Shape::Point(_) => ShapeCategory::Point,
            Shape::LineString(_) | Shape::MultiCurve(_) => ShapeCategory::Curve,
            Shape::Polygon { .. } | Shape::MultiSurface(_) | Shape::CompositeSurface(_) => {
                ShapeCategory::Surface
            }
            Shape::Solid(_) | Shape::MultiSolid(_) => ShapeCategory::Solid,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Shape::Point(_) => "Point",
            Shape::LineString(_) => "LineString",
            Shape::Polygon { .. } => "Polygon",
            Shape::MultiCurve(_) => "MultiCurve",
            Shape::MultiSurface(_) => "MultiSurface",
            Shape::CompositeSurface(_) => "CompositeSurface",
            Shape::Solid(_) => "Solid",
            Shape::MultiSolid(_) => "MultiSolid",
        }
    }

    /// Member slots of an aggregate; empty for primitives.
    pub fn members(&self) -> &[Member] {
        match self {
            Shape::MultiCurve(m)
            | Shape::MultiSurface(m)
            | Shape::CompositeSurface(m)
            | Shape::MultiSolid(m) => m,
            Shape::Solid(exterior) => exterior.as_slice(),
            Shape::Point(_) | Shape::LineString(_) | Shape::Polygon { .. } => &[],
        }
    }

    pub fn members_mut(&mut self) -> &mut [Member] {
        match self {
            Shape::MultiCurve(m)
            | Shape::MultiSurface(m)
            | Shape::CompositeSurface(m)
            | Shape::MultiSolid(m) => m,
            Shape::Solid(exterior) => exterior.as_mut_slice(),
            Shape::Point(_) | Shape::LineString(_) | Shape::Polygon { .. } => &mut [],
        }
    }

    /// Removes the member at `index`, returning it.
    pub fn remove_member(&mut self, index: usize) -> Option<Member> {
        match self {
            Shape::MultiCurve(m)
            | Shape::MultiSurface(m)
            | Shape::CompositeSurface(m)
            | Shape::MultiSolid(m) => (index < m.len()).then(|| m.remove(index)),
            Shape::Solid(exterior) if index == 0 => exterior.take(),
            _ => None,
        }
    }

    /// The kind of geometry the member slots of this aggregate admit.
    pub fn member_kind(&self) -> SlotKind {
        match self {
            Shape::MultiCurve(_) => SlotKind::Curve,
            Shape::MultiSurface(_) | Shape::CompositeSurface(_) | Shape::Solid(_) => {
                SlotKind::Surface
            }
            Shape::MultiSolid(_) => SlotKind::Solid,
            Shape::Point(_) | Shape::LineString(_) | Shape::Polygon { .. } => SlotKind::Any,
        }
    }

    /// Coordinates held directly by a primitive.
    pub fn coordinates(&self) -> Vec<[f64; 3]> {
        match self {
            Shape::Point(p) => vec![*p],
            Shape::LineString(c) => c.clone(),
            Shape::Polygon {
                exterior,
                interiors,
            } => exterior
                .iter()
                .chain(interiors.iter().flatten())
                .copied()
                .collect(),
            _ => Vec::new(),
        }
    }
}

/// The kind of geometry a slot accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlotKind {
    Any,
    Point,
    Curve,
    Surface,
    Solid,
}

impl SlotKind {
    /// Derives the admitted kind from a property name such as
    /// `lod2MultiSurface` or `lod1Solid`.
    pub fn from_property_name(name: &str) -> Self {
        if name.ends_with("Solid") {
            SlotKind::Solid
        } else if name.ends_with("Surface") {
            SlotKind::Surface
        } else if name.ends_with("Curve") {
            SlotKind::Curve
        } else if name.ends_with("Point") {
            SlotKind::Point
        } else {
            SlotKind::Any
        }
    }

    pub fn accepts(self, category: ShapeCategory) -> bool {
        match self {
            SlotKind::Any => true,
            SlotKind::Point => category == ShapeCategory::Point,
            SlotKind::Curve => category == ShapeCategory::Curve,
            SlotKind::Surface => category == ShapeCategory::Surface,
            SlotKind::Solid => category == ShapeCategory::Solid,
        }
    }
}

impl std::fmt::Display for SlotKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SlotKind::Any => "any",
            SlotKind::Point => "point",
            SlotKind::Curve => "curve",
            SlotKind::Surface => "surface",
            SlotKind::Solid => "solid",
        };
        f.write_str(s)
    }
}

/// Data stored for a geometry object.
#[derive(Debug, Clone)]
pub struct GeometryData {
    pub id: Option<String>,
    pub srs: Option<String>,
    /// LOD of the property the geometry belongs to; `None` for registry templates.
    pub lod: Option<Lod>,
    pub owner: GeometryOwner,
    pub shape: Shape,
}

/// Who owns an appearance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppearanceOwner {
    Feature(FeatureKey),
    /// Top-level document member.
    Global,
}

/// Data stored for an appearance.
#[derive(Debug, Clone)]
pub struct AppearanceData {
    pub id: Option<String>,
    pub theme: Option<String>,
    pub owner: AppearanceOwner,
    pub surface_data: Vec<SurfaceDataKey>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SurfaceDataKind {
    X3DMaterial,
    ParameterizedTexture,
    GeoreferencedTexture,
}

impl SurfaceDataKind {
    pub fn is_texture(self) -> bool {
        !matches!(self, SurfaceDataKind::X3DMaterial)
    }
}

/// A surface data target: the geometry it decorates plus optional texture
/// coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Target {
    pub uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coords: Option<serde_json::Value>,
}

/// Data stored for a texture or material.
#[derive(Debug, Clone)]
pub struct SurfaceData {
    pub id: Option<String>,
    pub kind: SurfaceDataKind,
    pub appearance: AppearanceKey,
    pub is_front: bool,
    pub image_uri: Option<String>,
    pub properties: Attributes,
    /// Target uris are stored without the leading `#`.
    pub targets: Vec<Target>,
}

/// The central arena that owns all model objects of a document.
///
/// # Example
///
/// ```
/// use city_lite_model::{FeatureData, ModelArena};
///
/// let mut arena = ModelArena::new();
/// let building = arena.add_feature(FeatureData::new("Building"), None);
/// let wall = arena.add_feature(FeatureData::new("WallSurface"), Some(building));
///
/// assert_eq!(arena.feature_count(), 2);
/// assert_eq!(arena.top_level(wall), building);
/// ```
#[derive(Debug)]
pub struct ModelArena {
    pub(crate) features: SlotMap<FeatureKey, FeatureData>,
    pub(crate) geometries: SlotMap<GeometryKey, GeometryData>,
    pub(crate) appearances: SlotMap<AppearanceKey, AppearanceData>,
    pub(crate) surface_data: SlotMap<SurfaceDataKey, SurfaceData>,

    // Identifier indices over live objects
    pub(crate) feature_ids: FxHashMap<String, FeatureKey>,
    pub(crate) geometry_ids: FxHashMap<String, GeometryKey>,

    pub ids: IdPool,
}

impl ModelArena {
    /// Creates a new, empty arena.
    pub fn new() -> Self {
        Self::with_ids(IdPool::new())
    }

    /// Creates an empty arena that shares knowledge of already issued ids.
    pub fn with_ids(ids: IdPool) -> Self {
        Self {
            features: SlotMap::with_key(),
            geometries: SlotMap::with_key(),
            appearances: SlotMap::with_key(),
            surface_data: SlotMap::with_key(),
            feature_ids: FxHashMap::default(),
            geometry_ids: FxHashMap::default(),
            ids,
        }
    }

    // --- Feature operations ---

    pub fn feature(&self, key: FeatureKey) -> Option<&FeatureData> {
        self.features.get(key)
    }

    pub fn feature_mut(&mut self, key: FeatureKey) -> Option<&mut FeatureData> {
        self.features.get_mut(key)
    }

    pub fn feature_count(&self) -> usize {
        self.features.len()
    }

    pub fn contains_feature(&self, key: FeatureKey) -> bool {
        self.features.contains_key(key)
    }

    /// Looks up a live feature by identifier.
    pub fn feature_by_id(&self, id: &str) -> Option<FeatureKey> {
        self.feature_ids.get(id).copied()
    }

    // --- Geometry operations ---

    pub fn geometry(&self, key: GeometryKey) -> Option<&GeometryData> {
        self.geometries.get(key)
    }

    pub fn geometry_mut(&mut self, key: GeometryKey) -> Option<&mut GeometryData> {
        self.geometries.get_mut(key)
    }

    pub fn geometry_count(&self) -> usize {
        self.geometries.len()
    }

    pub fn contains_geometry(&self, key: GeometryKey) -> bool {
        self.geometries.contains_key(key)
    }

    /// Looks up a live geometry by identifier.
    pub fn geometry_by_id(&self, id: &str) -> Option<GeometryKey> {
        self.geometry_ids.get(id).copied()
    }

    // --- Appearance operations ---

    pub fn appearance(&self, key: AppearanceKey) -> Option<&AppearanceData> {
        self.appearances.get(key)
    }

    pub fn appearance_mut(&mut self, key: AppearanceKey) -> Option<&mut AppearanceData> {
        self.appearances.get_mut(key)
    }

    pub fn appearance_count(&self) -> usize {
        self.appearances.len()
    }

    /// Keys of all appearances owned by the document rather than a feature.
    pub fn global_appearances(&self) -> Vec<AppearanceKey> {
        self.appearances
            .iter()
            .filter(|(_, a)| a.owner == AppearanceOwner::Global)
            .map(|(k, _)| k)
            .collect()
    }

    // --- Surface data operations ---

    pub fn surface_data(&self, key: SurfaceDataKey) -> Option<&SurfaceData> {
        self.surface_data.get(key)
    }

    pub fn surface_data_mut(&mut self, key: SurfaceDataKey) -> Option<&mut SurfaceData> {
        self.surface_data.get_mut(key)
    }

    pub fn surface_data_count(&self) -> usize {
        self.surface_data.len()
    }

    // --- Identifier index helpers ---

    pub(crate) fn index_feature_id(&mut self, id: &str, key: FeatureKey) {
        self.ids.register(id);
        self.feature_ids.entry(id.to_string()).or_insert(key);
    }

    pub(crate) fn index_geometry_id(&mut self, id: &str, key: GeometryKey) {
        self.ids.register(id);
        if let Some(existing) = self.geometry_ids.get(id) {
            if *existing != key {
                tracing::debug!(id, "duplicate geometry id, keeping first occurrence");
            }
            return;
        }
        self.geometry_ids.insert(id.to_string(), key);
    }

    pub(crate) fn unindex_feature_id(&mut self, id: &str, key: FeatureKey) {
        if self.feature_ids.get(id) == Some(&key) {
            self.feature_ids.remove(id);
        }
    }

    pub(crate) fn unindex_geometry_id(&mut self, id: &str, key: GeometryKey) {
        if self.geometry_ids.get(id) == Some(&key) {
            self.geometry_ids.remove(id);
        }
    }
}

impl Default for ModelArena {
    fn default() -> Self {
        Self::new()
    }
}

/// Strips the fragment marker of a local href (`#id` → `id`).
pub fn clip_href(href: &str) -> &str {
    href.strip_prefix('#').unwrap_or(href)
}
