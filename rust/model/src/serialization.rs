// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Wire records for features, geometries and appearances.
//!
//! Records are the owned, tree-shaped form in which members are read from and
//! written to a document. Importing a record moves it into the arena, where
//! parent links and cross-references become keys and identifiers; exporting
//! rebuilds the tree. Hrefs and target uris carry a leading `#` on the wire
//! and are stored without it.

use serde::{Deserialize, Serialize};

use crate::arena::*;
use crate::envelope::Envelope;
use crate::error::{Error, Result};
use crate::keys::*;

fn default_true() -> bool {
    true
}

fn is_true(value: &bool) -> bool {
    *value
}

fn to_href(id: &str) -> String {
    format!("#{id}")
}

/// Document-level metadata carried by the header line.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentHeader {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub srs: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub envelope: Option<Envelope>,
    #[serde(default, skip_serializing_if = "Attributes::is_empty")]
    pub attributes: Attributes,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureRecord {
    #[serde(rename = "type")]
    pub feature_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub envelope: Option<Envelope>,
    #[serde(default, skip_serializing_if = "Attributes::is_empty")]
    pub attributes: Attributes,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub geometry: Vec<GeometryPropertyRecord>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<FeatureRecord>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub references: Vec<FeatureRef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub relations: Vec<Relation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<GroupData>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub appearances: Vec<AppearanceRecord>,
}

impl FeatureRecord {
    pub fn new(feature_type: impl Into<String>, id: Option<&str>) -> Self {
        Self {
            feature_type: feature_type.into(),
            id: id.map(str::to_string),
            envelope: None,
            attributes: Attributes::new(),
            geometry: Vec::new(),
            children: Vec::new(),
            references: Vec::new(),
            relations: Vec::new(),
            group: None,
            appearances: Vec::new(),
        }
    }

    pub fn is_group(&self) -> bool {
        self.group.is_some() || self.feature_type == "CityObjectGroup"
    }

    pub fn label(&self) -> String {
        match &self.id {
            Some(id) => format!("{} '{}'", self.feature_type, id),
            None => format!("anonymous {}", self.feature_type),
        }
    }
}

/// A geometry property on the wire. Exactly one of `geometry`, `href` and
/// `implicit` must be present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeometryPropertyRecord {
    pub name: String,
    pub lod: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub geometry: Option<GeometryRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub href: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub implicit: Option<ImplicitRecord>,
}

impl GeometryPropertyRecord {
    pub fn inline(name: impl Into<String>, lod: u8, geometry: GeometryRecord) -> Self {
        Self {
            name: name.into(),
            lod,
            geometry: Some(geometry),
            href: None,
            implicit: None,
        }
    }

    pub fn href(name: impl Into<String>, lod: u8, target: &str) -> Self {
        Self {
            name: name.into(),
            lod,
            geometry: None,
            href: Some(to_href(target)),
            implicit: None,
        }
    }

    fn value_count(&self) -> usize {
        usize::from(self.geometry.is_some())
            + usize::from(self.href.is_some())
            + usize::from(self.implicit.is_some())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeometryRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub srs: Option<String>,
    #[serde(flatten)]
    pub shape: ShapeRecord,
}

impl GeometryRecord {
    pub fn new(id: Option<&str>, shape: ShapeRecord) -> Self {
        Self {
            id: id.map(str::to_string),
            srs: None,
            shape,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ShapeRecord {
    Point {
        pos: [f64; 3],
    },
    LineString {
        coords: Vec<[f64; 3]>,
    },
    Polygon {
        exterior: Vec<[f64; 3]>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        interiors: Vec<Vec<[f64; 3]>>,
    },
    MultiCurve {
        members: Vec<MemberRecord>,
    },
    MultiSurface {
        members: Vec<MemberRecord>,
    },
    CompositeSurface {
        members: Vec<MemberRecord>,
    },
    Solid {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        exterior: Option<MemberRecord>,
    },
    MultiSolid {
        members: Vec<MemberRecord>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MemberRecord {
    Href { href: String },
    Inline(Box<GeometryRecord>),
}

impl MemberRecord {
    pub fn href(target: &str) -> Self {
        MemberRecord::Href {
            href: to_href(target),
        }
    }

    pub fn inline(geometry: GeometryRecord) -> Self {
        MemberRecord::Inline(Box::new(geometry))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImplicitRecord {
    pub template: MemberRecord,
    pub transform: [f64; 16],
    pub reference_point: [f64; 3],
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub library_object: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppearanceRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub theme: Option<String>,
    #[serde(default)]
    pub surface_data: Vec<SurfaceDataRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SurfaceDataRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub kind: SurfaceDataKind,
    #[serde(default = "default_true", skip_serializing_if = "is_true")]
    pub is_front: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_uri: Option<String>,
    #[serde(default, skip_serializing_if = "Attributes::is_empty")]
    pub properties: Attributes,
    #[serde(default)]
    pub targets: Vec<Target>,
}

// =============================================================================
// Import: records -> arena
// =============================================================================

impl ModelArena {
    /// Moves a feature record (with its children, geometry and appearances)
    /// into the arena.
    ///
    /// Returns [`Error::MalformedProperty`] when a geometry property carries
    /// zero or several values, and [`Error::InvalidLod`] for LODs above 4.
    pub fn import_feature(
        &mut self,
        record: FeatureRecord,
        parent: Option<FeatureKey>,
    ) -> Result<FeatureKey> {
        let FeatureRecord {
            feature_type,
            id,
            envelope,
            attributes,
            geometry,
            children,
            references,
            relations,
            group,
            appearances,
        } = record;

        let mut data = FeatureData::new(feature_type);
        data.id = id;
        data.envelope = envelope;
        data.attributes = attributes;
        data.references = references
            .into_iter()
            .map(|r| FeatureRef {
                property: r.property,
                href: clip_href(&r.href).to_string(),
            })
            .collect();
        data.relations = relations
            .into_iter()
            .map(|r| Relation {
                related_to: clip_href(&r.related_to).to_string(),
                relation_type: r.relation_type,
            })
            .collect();
        data.group = group.map(|g| GroupData {
            parent: g.parent.map(|p| clip_href(&p).to_string()),
            members: g
                .members
                .into_iter()
                .map(|m| GroupMember {
                    href: clip_href(&m.href).to_string(),
                    role: m.role,
                })
                .collect(),
        });
        let label = data.label();
        let key = self.add_feature(data, parent);

        for property in geometry {
            let found = property.value_count();
            if found != 1 {
                return Err(Error::MalformedProperty {
                    feature: label,
                    property: property.name,
                    found,
                });
            }
            let lod = Lod::try_from(property.lod)?;
            let value = if let Some(geometry) = property.geometry {
                PropertyValue::Inline(self.import_geometry(
                    geometry,
                    GeometryOwner::Feature(key),
                    Some(lod),
                ))
            } else if let Some(href) = property.href {
                PropertyValue::Reference(clip_href(&href).to_string())
            } else if let Some(implicit) = property.implicit {
                PropertyValue::Implicit(self.import_implicit(implicit, key, lod))
            } else {
                unreachable!("value count checked above")
            };
            self.features[key].geometry.push(GeometryProperty {
                name: property.name,
                lod,
                value,
            });
        }

        for appearance in appearances {
            self.import_appearance(appearance, AppearanceOwner::Feature(key));
        }

        for child in children {
            self.import_feature(child, Some(key))?;
        }

        Ok(key)
    }

    fn import_implicit(
        &mut self,
        record: ImplicitRecord,
        feature: FeatureKey,
        lod: Lod,
    ) -> ImplicitGeometry {
        let template = match record.template {
            MemberRecord::Href { href } => Member::Reference(clip_href(&href).to_string()),
            MemberRecord::Inline(geometry) => Member::Inline(self.import_geometry(
                *geometry,
                GeometryOwner::Feature(feature),
                Some(lod),
            )),
        };
        ImplicitGeometry {
            template,
            transform: record.transform,
            reference_point: record.reference_point,
            library_object: record.library_object,
            mime_type: record.mime_type,
        }
    }

    /// Moves a geometry record and all inline members into the arena.
    pub fn import_geometry(
        &mut self,
        record: GeometryRecord,
        owner: GeometryOwner,
        lod: Option<Lod>,
    ) -> GeometryKey {
        let key = self.add_geometry(GeometryData {
            id: record.id,
            srs: record.srs,
            lod,
            owner,
            shape: Shape::MultiSurface(Vec::new()),
        });

        let shape = match record.shape {
            ShapeRecord::Point { pos } => Shape::Point(pos),
            ShapeRecord::LineString { coords } => Shape::LineString(coords),
            ShapeRecord::Polygon {
                exterior,
                interiors,
            } => Shape::Polygon {
                exterior,
                interiors,
            },
            ShapeRecord::MultiCurve { members } => {
                Shape::MultiCurve(self.import_members(members, key, lod))
            }
            ShapeRecord::MultiSurface { members } => {
                Shape::MultiSurface(self.import_members(members, key, lod))
            }
            ShapeRecord::CompositeSurface { members } => {
                Shape::CompositeSurface(self.import_members(members, key, lod))
            }
            ShapeRecord::Solid { exterior } => {
                Shape::Solid(exterior.map(|m| self.import_member(m, key, lod)))
            }
            ShapeRecord::MultiSolid { members } => {
                Shape::MultiSolid(self.import_members(members, key, lod))
            }
        };
        self.geometries[key].shape = shape;
        key
    }

    fn import_members(
        &mut self,
        members: Vec<MemberRecord>,
        parent: GeometryKey,
        lod: Option<Lod>,
    ) -> Vec<Member> {
        members
            .into_iter()
            .map(|m| self.import_member(m, parent, lod))
            .collect()
    }

    fn import_member(&mut self, member: MemberRecord, parent: GeometryKey, lod: Option<Lod>) -> Member {
        match member {
            MemberRecord::Href { href } => Member::Reference(clip_href(&href).to_string()),
            MemberRecord::Inline(geometry) => {
                Member::Inline(self.import_geometry(*geometry, GeometryOwner::Geometry(parent), lod))
            }
        }
    }

    /// Moves an appearance record into the arena and links it to its owner.
    pub fn import_appearance(
        &mut self,
        record: AppearanceRecord,
        owner: AppearanceOwner,
    ) -> AppearanceKey {
        let key = self.add_appearance(AppearanceData {
            id: record.id,
            theme: record.theme,
            owner,
            surface_data: Vec::new(),
        });

        for sd in record.surface_data {
            let targets = sd
                .targets
                .into_iter()
                .map(|t| Target {
                    uri: clip_href(&t.uri).to_string(),
                    coords: t.coords,
                })
                .collect();
            self.add_surface_data(SurfaceData {
                id: sd.id,
                kind: sd.kind,
                appearance: key,
                is_front: sd.is_front,
                image_uri: sd.image_uri,
                properties: sd.properties,
                targets,
            });
        }
        key
    }
}

// =============================================================================
// Export: arena -> records
// =============================================================================

impl ModelArena {
    /// Rebuilds the record tree of a feature.
    pub fn export_feature(&self, key: FeatureKey) -> Result<FeatureRecord> {
        let feature = self.features.get(key).ok_or(Error::FeatureNotFound(key))?;

        let mut geometry = Vec::with_capacity(feature.geometry.len());
        for property in &feature.geometry {
            let mut record = GeometryPropertyRecord {
                name: property.name.clone(),
                lod: property.lod.value(),
                geometry: None,
                href: None,
                implicit: None,
            };
            match &property.value {
                PropertyValue::Inline(g) => record.geometry = Some(self.export_geometry(*g)?),
                PropertyValue::Reference(id) => record.href = Some(to_href(id)),
                PropertyValue::Implicit(implicit) => {
                    record.implicit = Some(ImplicitRecord {
                        template: self.export_member(&implicit.template)?,
                        transform: implicit.transform,
                        reference_point: implicit.reference_point,
                        library_object: implicit.library_object.clone(),
                        mime_type: implicit.mime_type.clone(),
                    })
                }
            }
            geometry.push(record);
        }

        let children = feature
            .children
            .iter()
            .map(|&c| self.export_feature(c))
            .collect::<Result<Vec<_>>>()?;
        let appearances = feature
            .appearances
            .iter()
            .map(|&a| self.export_appearance(a))
            .collect::<Result<Vec<_>>>()?;

        Ok(FeatureRecord {
            feature_type: feature.feature_type.clone(),
            id: feature.id.clone(),
            envelope: feature.envelope.clone(),
            attributes: feature.attributes.clone(),
            geometry,
            children,
            references: feature
                .references
                .iter()
                .map(|r| FeatureRef {
                    property: r.property.clone(),
                    href: to_href(&r.href),
                })
                .collect(),
            relations: feature
                .relations
                .iter()
                .map(|r| Relation {
                    related_to: to_href(&r.related_to),
                    relation_type: r.relation_type.clone(),
                })
                .collect(),
            group: feature.group.as_ref().map(|g| GroupData {
                parent: g.parent.as_deref().map(to_href),
                members: g
                    .members
                    .iter()
                    .map(|m| GroupMember {
                        href: to_href(&m.href),
                        role: m.role.clone(),
                    })
                    .collect(),
            }),
            appearances,
        })
    }

    /// Rebuilds the record tree of a geometry.
    pub fn export_geometry(&self, key: GeometryKey) -> Result<GeometryRecord> {
        let geometry = self
            .geometries
            .get(key)
            .ok_or(Error::GeometryNotFound(key))?;

        let shape = match &geometry.shape {
            Shape::Point(pos) => ShapeRecord::Point { pos: *pos },
            Shape::LineString(coords) => ShapeRecord::LineString {
                coords: coords.clone(),
            },
            Shape::Polygon {
                exterior,
                interiors,
            } => ShapeRecord::Polygon {
                exterior: exterior.clone(),
                interiors: interiors.clone(),
            },
            Shape::MultiCurve(m) => ShapeRecord::MultiCurve {
                members: self.export_members(m)?,
            },
            Shape::MultiSurface(m) => ShapeRecord::MultiSurface {
                members: self.export_members(m)?,
            },
            Shape::CompositeSurface(m) => ShapeRecord::CompositeSurface {
                members: self.export_members(m)?,
            },
            Shape::Solid(exterior) => ShapeRecord::Solid {
                exterior: exterior.as_ref().map(|m| self.export_member(m)).transpose()?,
            },
            Shape::MultiSolid(m) => ShapeRecord::MultiSolid {
                members: self.export_members(m)?,
            },
        };

        Ok(GeometryRecord {
            id: geometry.id.clone(),
            srs: geometry.srs.clone(),
            shape,
        })
    }

    fn export_members(&self, members: &[Member]) -> Result<Vec<MemberRecord>> {
        members.iter().map(|m| self.export_member(m)).collect()
    }

    fn export_member(&self, member: &Member) -> Result<MemberRecord> {
        Ok(match member {
            Member::Inline(g) => MemberRecord::inline(self.export_geometry(*g)?),
            Member::Reference(id) => MemberRecord::href(id),
        })
    }

    /// Rebuilds the record of an appearance.
    pub fn export_appearance(&self, key: AppearanceKey) -> Result<AppearanceRecord> {
        let appearance = self
            .appearances
            .get(key)
            .ok_or(Error::AppearanceNotFound(key))?;

        let surface_data = appearance
            .surface_data
            .iter()
            .map(|&sk| {
                let sd = self
                    .surface_data
                    .get(sk)
                    .ok_or(Error::SurfaceDataNotFound(sk))?;
                Ok(SurfaceDataRecord {
                    id: sd.id.clone(),
                    kind: sd.kind,
                    is_front: sd.is_front,
                    image_uri: sd.image_uri.clone(),
                    properties: sd.properties.clone(),
                    targets: sd
                        .targets
                        .iter()
                        .map(|t| Target {
                            uri: to_href(&t.uri),
                            coords: t.coords.clone(),
                        })
                        .collect(),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(AppearanceRecord {
            id: appearance.id.clone(),
            theme: appearance.theme.clone(),
            surface_data,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square(id: &str) -> GeometryRecord {
        GeometryRecord::new(
            Some(id),
            ShapeRecord::Polygon {
                exterior: vec![
                    [0.0, 0.0, 0.0],
                    [1.0, 0.0, 0.0],
                    [1.0, 1.0, 0.0],
                    [0.0, 0.0, 0.0],
                ],
                interiors: Vec::new(),
            },
        )
    }

    fn building() -> FeatureRecord {
        let mut wall = FeatureRecord::new("WallSurface", Some("wall"));
        wall.geometry.push(GeometryPropertyRecord::inline(
            "lod2MultiSurface",
            2,
            GeometryRecord::new(
                Some("ms"),
                ShapeRecord::MultiSurface {
                    members: vec![MemberRecord::inline(square("p1"))],
                },
            ),
        ));

        let mut b = FeatureRecord::new("Building", Some("b1"));
        b.geometry.push(GeometryPropertyRecord::inline(
            "lod3MultiSurface",
            3,
            GeometryRecord::new(
                Some("ms3"),
                ShapeRecord::MultiSurface {
                    members: vec![MemberRecord::href("p1")],
                },
            ),
        ));
        b.children.push(wall);
        b.appearances.push(AppearanceRecord {
            id: None,
            theme: Some("rgb".into()),
            surface_data: vec![SurfaceDataRecord {
                id: Some("mat".into()),
                kind: SurfaceDataKind::X3DMaterial,
                is_front: true,
                image_uri: None,
                properties: Attributes::new(),
                targets: vec![Target {
                    uri: "#p1".into(),
                    coords: None,
                }],
            }],
        });
        b
    }

    #[test]
    fn import_builds_tree_and_indices() {
        let mut arena = ModelArena::new();
        let key = arena.import_feature(building(), None).unwrap();

        assert_eq!(arena.feature_count(), 2);
        assert_eq!(arena.geometry_count(), 3);
        assert!(arena.geometry_by_id("p1").is_some());
        assert_eq!(arena.feature_by_id("wall").map(|w| arena.top_level(w)), Some(key));

        let sd = arena.surface_data.values().next().unwrap();
        assert_eq!(sd.targets[0].uri, "p1");
        assert!(arena.ids.contains("ms3"));
    }

    #[test]
    fn export_restores_wire_form() {
        let mut arena = ModelArena::new();
        let original = building();
        let key = arena.import_feature(original.clone(), None).unwrap();
        let exported = arena.export_feature(key).unwrap();
        assert_eq!(exported, original);
    }

    #[test]
    fn malformed_property_is_rejected() {
        let mut record = FeatureRecord::new("Building", Some("b"));
        record.geometry.push(GeometryPropertyRecord {
            name: "lod2Solid".into(),
            lod: 2,
            geometry: Some(square("x")),
            href: Some("#y".into()),
            implicit: None,
        });
        let mut arena = ModelArena::new();
        let err = arena.import_feature(record, None).unwrap_err();
        assert!(matches!(err, Error::MalformedProperty { found: 2, .. }));
    }

    #[test]
    fn invalid_lod_is_rejected() {
        let mut record = FeatureRecord::new("Building", None);
        record
            .geometry
            .push(GeometryPropertyRecord::inline("lod7Solid", 7, square("x")));
        let mut arena = ModelArena::new();
        assert!(matches!(
            arena.import_feature(record, None),
            Err(Error::InvalidLod(7))
        ));
    }

    #[test]
    fn json_shape_is_tagged_by_type() {
        let json = serde_json::to_value(square("p")).unwrap();
        assert_eq!(json["type"], "Polygon");
        assert_eq!(json["id"], "p");

        let member: MemberRecord = serde_json::from_str(r##"{"href":"#p"}"##).unwrap();
        assert_eq!(member, MemberRecord::href("p"));
    }
}
