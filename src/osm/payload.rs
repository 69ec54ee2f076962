//! OSM API 0.6 XML documents for changesets and element writes.
//!
//! Every write is described by an [`EditRequest`], which can be rendered
//! against any changeset ID. This lets a failed write be replayed inside a
//! fresh changeset without the caller rebuilding it.

use serde::Serialize;
use thiserror::Error;

use super::elements::{ElementId, ElementKind, Tags};

/// Longest key or value the OSM API accepts, in characters.
pub const MAX_TAG_LENGTH: usize = 255;
/// Most node references a single way may hold.
pub const MAX_WAY_NODES: usize = 2000;

pub type ChangesetId = u64;

#[derive(Error, Debug, PartialEq)]
pub enum EditError {
    #[error("latitude {0} is not a valid WGS84 latitude")]
    InvalidLatitude(f64),
    #[error("longitude {0} is not a valid WGS84 longitude")]
    InvalidLongitude(f64),
    #[error("tag keys must not be empty")]
    EmptyTagKey,
    #[error("tag '{0}' is longer than {MAX_TAG_LENGTH} characters")]
    TagTooLong(String),
    #[error("a new element needs at least one tag")]
    NoTags,
    #[error("a way needs between 2 and {MAX_WAY_NODES} nodes, got {0}")]
    WayNodeCount(usize),
}

#[derive(Error, Debug)]
#[error("could not serialise OSM XML: {0}")]
pub struct PayloadError(String);

#[derive(Serialize)]
struct TagXml<'a> {
    #[serde(rename = "@k")]
    key: &'a str,
    #[serde(rename = "@v")]
    value: &'a str,
}

#[derive(Serialize)]
struct NodeRefXml {
    #[serde(rename = "@ref")]
    reference: ElementId,
}

#[derive(Serialize)]
struct ChangesetXml<'a> {
    tag: Vec<TagXml<'a>>,
}

// Attributes have to be declared before child elements for quick-xml.
#[derive(Serialize)]
struct NodeXml<'a> {
    #[serde(rename = "@id", skip_serializing_if = "Option::is_none")]
    id: Option<ElementId>,
    #[serde(rename = "@changeset")]
    changeset: ChangesetId,
    #[serde(rename = "@version", skip_serializing_if = "Option::is_none")]
    version: Option<u64>,
    #[serde(rename = "@lat")]
    lat: f64,
    #[serde(rename = "@lon")]
    lon: f64,
    tag: Vec<TagXml<'a>>,
}

#[derive(Serialize)]
struct WayXml<'a> {
    #[serde(rename = "@id", skip_serializing_if = "Option::is_none")]
    id: Option<ElementId>,
    #[serde(rename = "@changeset")]
    changeset: ChangesetId,
    #[serde(rename = "@version", skip_serializing_if = "Option::is_none")]
    version: Option<u64>,
    nd: Vec<NodeRefXml>,
    tag: Vec<TagXml<'a>>,
}

#[derive(Serialize)]
#[serde(rename = "osm")]
struct OsmXml<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    changeset: Option<ChangesetXml<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    node: Option<NodeXml<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    way: Option<WayXml<'a>>,
}

impl<'a> OsmXml<'a> {
    const fn empty() -> Self {
        Self {
            changeset: None,
            node: None,
            way: None,
        }
    }

    fn render(&self) -> Result<String, PayloadError> {
        quick_xml::se::to_string(self).map_err(|err| PayloadError(err.to_string()))
    }
}

fn tags_xml(tags: &Tags) -> Vec<TagXml<'_>> {
    tags.iter()
        .map(|(key, value)| TagXml { key, value })
        .collect()
}

pub fn changeset_xml(created_by: &str, comment: &str) -> Result<String, PayloadError> {
    OsmXml {
        changeset: Some(ChangesetXml {
            tag: vec![
                TagXml {
                    key: "created_by",
                    value: created_by,
                },
                TagXml {
                    key: "comment",
                    value: comment,
                },
            ],
        }),
        ..OsmXml::empty()
    }
    .render()
}

/// A single element write, independent of the changeset it ends up in.
#[derive(Debug, Clone, PartialEq)]
pub enum EditRequest {
    CreateNode {
        lat: f64,
        lon: f64,
        tags: Tags,
    },
    UpdateNode {
        id: ElementId,
        version: u64,
        lat: f64,
        lon: f64,
        tags: Tags,
    },
    CreateWay {
        nodes: Vec<ElementId>,
        tags: Tags,
    },
    UpdateWay {
        id: ElementId,
        version: u64,
        nodes: Vec<ElementId>,
        tags: Tags,
    },
}

impl EditRequest {
    pub const fn kind(&self) -> ElementKind {
        match self {
            EditRequest::CreateNode { .. } | EditRequest::UpdateNode { .. } => ElementKind::Node,
            EditRequest::CreateWay { .. } | EditRequest::UpdateWay { .. } => ElementKind::Way,
        }
    }

    pub const fn is_create(&self) -> bool {
        matches!(
            self,
            EditRequest::CreateNode { .. } | EditRequest::CreateWay { .. }
        )
    }

    pub const fn tags(&self) -> &Tags {
        match self {
            EditRequest::CreateNode { tags, .. }
            | EditRequest::UpdateNode { tags, .. }
            | EditRequest::CreateWay { tags, .. }
            | EditRequest::UpdateWay { tags, .. } => tags,
        }
    }

    /// API path relative to the 0.6 base, e.g. `node/create` or `way/42`.
    pub fn path(&self) -> String {
        match self {
            EditRequest::CreateNode { .. } | EditRequest::CreateWay { .. } => {
                format!("{}/create", self.kind())
            }
            EditRequest::UpdateNode { id, .. } | EditRequest::UpdateWay { id, .. } => {
                format!("{}/{}", self.kind(), id)
            }
        }
    }

    pub fn validate(&self) -> Result<(), EditError> {
        match self {
            EditRequest::CreateNode { lat, lon, .. } | EditRequest::UpdateNode { lat, lon, .. } => {
                validate_coordinates(*lat, *lon)?
            }
            EditRequest::CreateWay { nodes, .. } | EditRequest::UpdateWay { nodes, .. } => {
                if !(2..=MAX_WAY_NODES).contains(&nodes.len()) {
                    return Err(EditError::WayNodeCount(nodes.len()));
                }
            }
        }
        if self.is_create() && self.tags().is_empty() {
            return Err(EditError::NoTags);
        }
        validate_tags(self.tags())
    }

    pub fn to_xml(&self, changeset: ChangesetId) -> Result<String, PayloadError> {
        let document = match self {
            EditRequest::CreateNode { lat, lon, tags } => OsmXml {
                node: Some(NodeXml {
                    id: None,
                    changeset,
                    version: None,
                    lat: *lat,
                    lon: *lon,
                    tag: tags_xml(tags),
                }),
                ..OsmXml::empty()
            },
            EditRequest::UpdateNode {
                id,
                version,
                lat,
                lon,
                tags,
            } => OsmXml {
                node: Some(NodeXml {
                    id: Some(*id),
                    changeset,
                    version: Some(*version),
                    lat: *lat,
                    lon: *lon,
                    tag: tags_xml(tags),
                }),
                ..OsmXml::empty()
            },
            EditRequest::CreateWay { nodes, tags } => OsmXml {
                way: Some(WayXml {
                    id: None,
                    changeset,
                    version: None,
                    nd: node_refs(nodes),
                    tag: tags_xml(tags),
                }),
                ..OsmXml::empty()
            },
            EditRequest::UpdateWay {
                id,
                version,
                nodes,
                tags,
            } => OsmXml {
                way: Some(WayXml {
                    id: Some(*id),
                    changeset,
                    version: Some(*version),
                    nd: node_refs(nodes),
                    tag: tags_xml(tags),
                }),
                ..OsmXml::empty()
            },
        };
        document.render()
    }
}

fn node_refs(nodes: &[ElementId]) -> Vec<NodeRefXml> {
    nodes
        .iter()
        .map(|reference| NodeRefXml {
            reference: *reference,
        })
        .collect()
}

fn validate_coordinates(lat: f64, lon: f64) -> Result<(), EditError> {
    if !lat.is_finite() || !(-90.0..=90.0).contains(&lat) {
        return Err(EditError::InvalidLatitude(lat));
    }
    if !lon.is_finite() || !(-180.0..=180.0).contains(&lon) {
        return Err(EditError::InvalidLongitude(lon));
    }
    Ok(())
}

pub fn validate_tags(tags: &Tags) -> Result<(), EditError> {
    for (key, value) in tags {
        if key.trim().is_empty() {
            return Err(EditError::EmptyTagKey);
        }
        if key.chars().count() > MAX_TAG_LENGTH || value.chars().count() > MAX_TAG_LENGTH {
            return Err(EditError::TagTooLong(key.clone()));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn tags(pairs: &[(&str, &str)]) -> Tags {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn changeset_document_carries_both_tags() {
        let xml = changeset_xml("osm_poi_editor", "Adding a drinking water node").unwrap();
        assert!(xml.starts_with("<osm><changeset>"));
        assert!(xml.contains(r#"<tag k="created_by" v="osm_poi_editor"/>"#));
        assert!(xml.contains(r#"<tag k="comment" v="Adding a drinking water node"/>"#));
        assert!(xml.ends_with("</changeset></osm>"));
    }

    #[test]
    fn node_create_has_no_id_or_version() {
        let edit = EditRequest::CreateNode {
            lat: 44.5,
            lon: 26.25,
            tags: tags(&[("amenity", "drinking_water")]),
        };
        let xml = edit.to_xml(12).unwrap();
        assert!(xml.contains(r#"changeset="12""#));
        assert!(xml.contains(r#"lat="44.5""#));
        assert!(xml.contains(r#"lon="26.25""#));
        assert!(!xml.contains("id="));
        assert!(!xml.contains("version="));
        assert!(xml.contains(r#"<tag k="amenity" v="drinking_water"/>"#));
        assert_eq!(edit.path(), "node/create");
    }

    #[test]
    fn way_update_keeps_node_refs_before_tags() {
        let edit = EditRequest::UpdateWay {
            id: 99,
            version: 4,
            nodes: vec![10, 11, 12],
            tags: tags(&[("highway", "residential"), ("zoning", "commercial")]),
        };
        let xml = edit.to_xml(7).unwrap();
        assert!(xml.contains(r#"<way id="99" changeset="7" version="4">"#));
        let nd = xml.find(r#"<nd ref="12"/>"#).unwrap();
        let tag = xml.find(r#"<tag k="highway""#).unwrap();
        assert!(nd < tag);
        assert_eq!(edit.path(), "way/99");
    }

    #[test]
    fn replay_in_new_changeset_only_changes_the_changeset() {
        let edit = EditRequest::UpdateNode {
            id: 5,
            version: 2,
            lat: 1.0,
            lon: 2.0,
            tags: tags(&[("name", "Fountain")]),
        };
        let first = edit.to_xml(100).unwrap();
        let second = edit.to_xml(101).unwrap();
        assert_eq!(first.replace(r#"changeset="100""#, r#"changeset="101""#), second);
    }

    #[test]
    fn escapes_markup_in_tag_values() {
        let edit = EditRequest::CreateNode {
            lat: 0.0,
            lon: 0.0,
            tags: tags(&[("name", r#"Tom & Jerry's "<Fountain>""#)]),
        };
        let xml = edit.to_xml(1).unwrap();
        assert!(!xml.contains("<Fountain>"));
        assert!(xml.contains("&amp;"));
        assert!(xml.contains("&quot;"));
    }

    #[rstest]
    #[case(EditRequest::CreateNode { lat: 91.0, lon: 0.0, tags: tags(&[("a", "b")]) }, EditError::InvalidLatitude(91.0))]
    #[case(EditRequest::CreateNode { lat: 0.0, lon: -181.0, tags: tags(&[("a", "b")]) }, EditError::InvalidLongitude(-181.0))]
    #[case(EditRequest::CreateNode { lat: 0.0, lon: 0.0, tags: Tags::new() }, EditError::NoTags)]
    #[case(EditRequest::CreateNode { lat: 0.0, lon: 0.0, tags: tags(&[(" ", "b")]) }, EditError::EmptyTagKey)]
    #[case(EditRequest::CreateWay { nodes: vec![1], tags: tags(&[("a", "b")]) }, EditError::WayNodeCount(1))]
    fn rejects_invalid_edits(#[case] edit: EditRequest, #[case] expected: EditError) {
        assert_eq!(edit.validate().unwrap_err(), expected);
    }

    #[test]
    fn rejects_overlong_values() {
        let long = "x".repeat(MAX_TAG_LENGTH + 1);
        let edit = EditRequest::UpdateWay {
            id: 1,
            version: 1,
            nodes: vec![1, 2],
            tags: tags(&[("note", long.as_str())]),
        };
        assert_eq!(
            edit.validate().unwrap_err(),
            EditError::TagTooLong("note".to_string())
        );
    }

    #[test]
    fn tag_updates_may_clear_all_tags() {
        let edit = EditRequest::UpdateWay {
            id: 1,
            version: 1,
            nodes: vec![1, 2],
            tags: Tags::new(),
        };
        assert!(edit.validate().is_ok());
    }
}
