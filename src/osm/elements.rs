use std::collections::{BTreeMap, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};

pub type ElementId = i64;

/// Tags are kept sorted so generated payloads are stable.
pub type Tags = BTreeMap<String, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElementKind {
    Node,
    Way,
    Relation,
}

impl ElementKind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            ElementKind::Node => "node",
            ElementKind::Way => "way",
            ElementKind::Relation => "relation",
        }
    }
}

impl fmt::Display for ElementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LatLon {
    pub lat: f64,
    pub lon: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: ElementId,
    pub lat: f64,
    pub lon: f64,
    #[serde(default)]
    pub tags: Tags,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
}

/// A way as returned by `out geom` (with `geometry`) or by the OSM API (with `nodes`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Way {
    pub id: ElementId,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nodes: Vec<ElementId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub geometry: Vec<LatLon>,
    #[serde(default)]
    pub tags: Tags,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relation {
    pub id: ElementId,
    #[serde(default)]
    pub tags: Tags,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub members: Vec<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Element {
    Node(Node),
    Way(Way),
    Relation(Relation),
}

impl Element {
    pub const fn kind(&self) -> ElementKind {
        match self {
            Element::Node(_) => ElementKind::Node,
            Element::Way(_) => ElementKind::Way,
            Element::Relation(_) => ElementKind::Relation,
        }
    }

    pub const fn id(&self) -> ElementId {
        match self {
            Element::Node(node) => node.id,
            Element::Way(way) => way.id,
            Element::Relation(relation) => relation.id,
        }
    }

    /// Node and way IDs live in separate namespaces, so both are part of the key.
    pub const fn key(&self) -> (ElementKind, ElementId) {
        (self.kind(), self.id())
    }

    pub fn tags(&self) -> &Tags {
        match self {
            Element::Node(node) => &node.tags,
            Element::Way(way) => &way.tags,
            Element::Relation(relation) => &relation.tags,
        }
    }
}

/// Keeps the first occurrence of every element, in first-seen order.
pub fn dedup_elements(elements: Vec<Element>) -> Vec<Element> {
    let mut seen = HashSet::with_capacity(elements.len());
    elements
        .into_iter()
        .filter(|element| seen.insert(element.key()))
        .collect()
}

/// Body of an Overpass `[out:json]` answer. Everything besides `elements` is ignored.
#[derive(Debug, Deserialize)]
pub struct OverpassResponse {
    #[serde(default)]
    pub elements: Vec<Element>,
    /// Set by Overpass when the query timed out or ran out of memory.
    #[serde(default)]
    pub remark: Option<String>,
}

/// Body of an OSM API 0.6 `GET /{kind}/{id}.json` answer.
#[derive(Debug, Deserialize)]
pub struct ApiElementResponse {
    #[serde(default)]
    pub elements: Vec<Element>,
}

impl ApiElementResponse {
    /// The requested element, if the answer contains it.
    pub fn into_single(self, kind: ElementKind, id: ElementId) -> Option<Element> {
        self.elements
            .into_iter()
            .find(|element| element.key() == (kind, id))
    }
}
