use geojson::{feature::Id, Feature, FeatureCollection, JsonObject};

use super::elements::{Element, Way};

fn way_geometry(way: &Way) -> Option<geo::Geometry> {
    if way.geometry.len() < 2 {
        return None;
    }
    let line: geo::LineString = way
        .geometry
        .iter()
        .map(|point| (point.lon, point.lat))
        .collect::<Vec<_>>()
        .into();
    if line.is_closed() && line.0.len() >= 4 {
        Some(geo::Polygon::new(line, vec![]).into())
    } else {
        Some(line.into())
    }
}

fn element_geometry(element: &Element) -> Option<geo::Geometry> {
    match element {
        Element::Node(node) => Some(geo::Point::new(node.lon, node.lat).into()),
        Element::Way(way) => way_geometry(way),
        Element::Relation(_) => None,
    }
}

/// Tags flattened next to `id` and `type`. Tags with those keys are shadowed.
fn element_properties(element: &Element) -> JsonObject {
    let mut properties: JsonObject = element
        .tags()
        .iter()
        .map(|(key, value)| (key.clone(), value.clone().into()))
        .collect();
    properties.insert("id".to_string(), element.id().into());
    properties.insert("type".to_string(), element.kind().as_str().into());
    properties
}

/// Converts elements to GeoJSON. Ways without `out geom` coordinates and relations
/// have no geometry of their own and are left out.
pub fn elements_to_feature_collection(elements: &[Element]) -> FeatureCollection {
    let features: Vec<Feature> = elements
        .iter()
        .filter_map(|element| {
            let geometry = element_geometry(element)?;
            Some(Feature {
                bbox: None,
                geometry: Some(geojson::Geometry::new(geojson::Value::from(&geometry))),
                id: Some(Id::String(format!("{}/{}", element.kind(), element.id()))),
                properties: Some(element_properties(element)),
                foreign_members: None,
            })
        })
        .collect();
    let skipped = elements.len() - features.len();
    if skipped > 0 {
        log::warn!(
            "Out of {} elements, {} had no geometry and were left out of the GeoJSON output.",
            elements.len(),
            skipped
        )
    }
    FeatureCollection {
        bbox: None,
        features,
        foreign_members: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::osm::elements::{LatLon, Node, Relation, Tags};

    fn way(id: i64, coords: &[(f64, f64)]) -> Element {
        Element::Way(Way {
            id,
            nodes: vec![],
            geometry: coords
                .iter()
                .map(|(lat, lon)| LatLon {
                    lat: *lat,
                    lon: *lon,
                })
                .collect(),
            tags: [("highway".to_string(), "service".to_string())]
                .into_iter()
                .collect(),
            version: None,
        })
    }

    #[test]
    fn converts_nodes_lines_and_areas() {
        let elements = vec![
            Element::Node(Node {
                id: 1,
                lat: 44.0,
                lon: 26.0,
                tags: Tags::new(),
                version: None,
            }),
            way(2, &[(0.0, 0.0), (1.0, 1.0)]),
            way(3, &[(0.0, 0.0), (0.0, 1.0), (1.0, 1.0), (0.0, 0.0)]),
        ];

        let collection = elements_to_feature_collection(&elements);
        let json = serde_json::to_value(&collection).unwrap();
        let kinds: Vec<&str> = json["features"]
            .as_array()
            .unwrap()
            .iter()
            .map(|feature| feature["geometry"]["type"].as_str().unwrap())
            .collect();
        assert_eq!(kinds, vec!["Point", "LineString", "Polygon"]);

        let point = serde_json::to_value(&collection.features[0]).unwrap();
        assert_eq!(point["geometry"]["coordinates"], serde_json::json!([26.0, 44.0]));
        assert_eq!(point["id"], "node/1");
        assert_eq!(point["properties"]["type"], "node");
    }

    #[test]
    fn skips_elements_without_geometry() {
        let elements = vec![
            way(1, &[(0.0, 0.0)]),
            Element::Relation(Relation {
                id: 4,
                tags: Tags::new(),
                members: vec![],
                version: None,
            }),
        ];
        assert!(elements_to_feature_collection(&elements).features.is_empty());
    }

    #[test]
    fn tags_become_properties() {
        let collection = elements_to_feature_collection(&[way(9, &[(0.0, 0.0), (1.0, 0.0)])]);
        let properties = collection.features[0].properties.as_ref().unwrap();
        assert_eq!(properties["highway"], "service");
        assert_eq!(properties["id"], 9);
    }

    #[test]
    fn tags_cannot_overwrite_identity() {
        let mut element = way(9, &[(0.0, 0.0), (1.0, 0.0)]);
        if let Element::Way(way) = &mut element {
            way.tags.insert("type".to_string(), "multipolygon".to_string());
            way.tags.insert("id".to_string(), "abc".to_string());
        }
        let collection = elements_to_feature_collection(&[element]);
        let properties = collection.features[0].properties.as_ref().unwrap();
        assert_eq!(properties["type"], "way");
        assert_eq!(properties["id"], 9);
        assert_eq!(properties["highway"], "service");
    }
}
